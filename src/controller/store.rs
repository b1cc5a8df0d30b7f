//! Access to the resources the controller reads and writes
//!
//! The reconcile engine talks to the API server only through [`WorkloadStore`], so it
//! can be driven against an in-memory store in tests. Production uses [`KubeStore`].

use crate::crd::harvester::Harvester;
use crate::crd::refinery::Refinery;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::ResourceExt;
use thiserror::Error;

/// Store errors, classified by how the engine reacts to them
#[derive(Debug, Error)]
pub enum StoreError {
    /// The object changed since it was read (optimistic concurrency failure)
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The API server refused the request for any other reason
    #[error("request rejected ({code}): {message}")]
    Rejected { code: u16, message: String },

    #[error("Kubernetes client error: {0}")]
    Kube(#[source] kube::Error),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

impl From<kube::Error> for StoreError {
    fn from(err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
                StoreError::AlreadyExists(err.to_string())
            }
            kube::Error::Api(resp) if resp.code == 409 => StoreError::Conflict(err.to_string()),
            kube::Error::Api(resp) if resp.code == 404 => StoreError::NotFound(err.to_string()),
            kube::Error::Api(resp) => StoreError::Rejected {
                code: resp.code,
                message: err.to_string(),
            },
            _ => StoreError::Kube(err),
        }
    }
}

/// Operations the reconcile engine needs from the cluster
///
/// Writes that replace an object carry its `resourceVersion`; a stale version
/// yields [`StoreError::Conflict`].
#[async_trait]
pub trait WorkloadStore: Send + Sync {
    /// List Deployments in `namespace` matching a label selector string (`a=b,c=d`)
    async fn list_deployments(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<Deployment>, StoreError>;

    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>, StoreError>;

    async fn create_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment, StoreError>;

    async fn replace_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment, StoreError>;

    /// Delete a Deployment with background propagation (its ReplicaSets and Pods
    /// are garbage collected after the call returns)
    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<(), StoreError>;

    async fn get_harvester(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Harvester>, StoreError>;

    /// Write `harvester.status`, guarded by `harvester.metadata.resourceVersion`
    async fn update_harvester_status(
        &self,
        harvester: &Harvester,
    ) -> Result<Harvester, StoreError>;

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, StoreError>;

    async fn create_service(&self, namespace: &str, service: &Service) -> Result<Service, StoreError>;

    async fn get_refinery(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Refinery>, StoreError>;

    /// Write `refinery.status`, guarded by `refinery.metadata.resourceVersion`
    async fn update_refinery_status(&self, refinery: &Refinery) -> Result<Refinery, StoreError>;
}

/// [`WorkloadStore`] backed by the Kubernetes API server
pub struct KubeStore {
    client: kube::Client,
}

impl KubeStore {
    pub fn new(client: kube::Client) -> Self {
        KubeStore { client }
    }

    fn deployments(&self, namespace: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn harvesters(&self, namespace: &str) -> Api<Harvester> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn services(&self, namespace: &str) -> Api<Service> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn refineries(&self, namespace: &str) -> Api<Refinery> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// Merge patch for a status subresource; `resourceVersion` makes the API server
/// reject stale writes
fn status_patch<S: serde::Serialize>(resource_version: &Option<String>, status: &S) -> serde_json::Value {
    serde_json::json!({
        "metadata": {
            "resourceVersion": resource_version
        },
        "status": status
    })
}

fn deployment_name(deployment: &Deployment) -> Result<&str, StoreError> {
    deployment
        .metadata
        .name
        .as_deref()
        .ok_or_else(|| StoreError::Rejected {
            code: 422,
            message: "Deployment missing metadata.name".to_string(),
        })
}

#[async_trait]
impl WorkloadStore for KubeStore {
    async fn list_deployments(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<Deployment>, StoreError> {
        let list = self
            .deployments(namespace)
            .list(&ListParams::default().labels(selector))
            .await?;
        Ok(list.items)
    }

    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>, StoreError> {
        Ok(self.deployments(namespace).get_opt(name).await?)
    }

    async fn create_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment, StoreError> {
        Ok(self
            .deployments(namespace)
            .create(&PostParams::default(), deployment)
            .await?)
    }

    async fn replace_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment, StoreError> {
        let name = deployment_name(deployment)?;
        Ok(self
            .deployments(namespace)
            .replace(name, &PostParams::default(), deployment)
            .await?)
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        self.deployments(namespace)
            .delete(name, &DeleteParams::background())
            .await?;
        Ok(())
    }

    async fn get_harvester(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Harvester>, StoreError> {
        Ok(self.harvesters(namespace).get_opt(name).await?)
    }

    async fn update_harvester_status(
        &self,
        harvester: &Harvester,
    ) -> Result<Harvester, StoreError> {
        let namespace = harvester.namespace().unwrap_or_default();
        let name = harvester.name_any();
        let patch = status_patch(&harvester.metadata.resource_version, &harvester.status);

        Ok(self
            .harvesters(&namespace)
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?)
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, StoreError> {
        Ok(self.services(namespace).get_opt(name).await?)
    }

    async fn create_service(&self, namespace: &str, service: &Service) -> Result<Service, StoreError> {
        Ok(self
            .services(namespace)
            .create(&PostParams::default(), service)
            .await?)
    }

    async fn get_refinery(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Refinery>, StoreError> {
        Ok(self.refineries(namespace).get_opt(name).await?)
    }

    async fn update_refinery_status(&self, refinery: &Refinery) -> Result<Refinery, StoreError> {
        let namespace = refinery.namespace().unwrap_or_default();
        let name = refinery.name_any();
        let patch = status_patch(&refinery.metadata.resource_version, &refinery.status);

        Ok(self
            .refineries(&namespace)
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?)
    }
}
