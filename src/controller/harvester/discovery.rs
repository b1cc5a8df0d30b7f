//! Finding the Deployments a Harvester manages and sorting them by role

use crate::controller::harvester::annotations::{
    read_counterpart, read_harvester, read_role, Role,
};
use crate::controller::store::{StoreError, WorkloadStore};
use crate::crd::harvester::Harvester;
use k8s_openapi::api::apps::v1::Deployment;
use kube::runtime::reflector::ObjectRef;
use kube::ResourceExt;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectorError {
    #[error("selector is empty")]
    Empty,

    #[error("invalid selector term {key:?}={value:?}")]
    Invalid { key: String, value: String },
}

fn valid_term(term: &str, allow_empty: bool) -> bool {
    (allow_empty || !term.is_empty())
        && term
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'))
}

/// Render an equality selector as a list-call label selector (`a=b,c=d`)
pub fn label_selector(selector: &BTreeMap<String, String>) -> Result<String, SelectorError> {
    if selector.is_empty() {
        return Err(SelectorError::Empty);
    }

    let mut terms = Vec::with_capacity(selector.len());
    for (key, value) in selector {
        if !valid_term(key, false) || !valid_term(value, true) {
            return Err(SelectorError::Invalid {
                key: key.clone(),
                value: value.clone(),
            });
        }
        terms.push(format!("{}={}", key, value));
    }
    Ok(terms.join(","))
}

/// True when every selector pair is present in `labels`; an empty selector matches nothing
pub fn selector_matches(
    selector: &BTreeMap<String, String>,
    labels: Option<&BTreeMap<String, String>>,
) -> bool {
    if selector.is_empty() {
        return false;
    }
    let Some(labels) = labels else {
        return false;
    };
    selector.iter().all(|(k, v)| labels.get(k) == Some(v))
}

/// Replica count of a Deployment; an absent field means the API default of 1
pub fn live_replicas(deployment: &Deployment) -> i32 {
    deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1)
}

pub async fn find_candidates(
    store: &dyn WorkloadStore,
    namespace: &str,
    selector: &str,
) -> Result<Vec<Deployment>, StoreError> {
    store.list_deployments(namespace, selector).await
}

/// Matched Deployments sorted by role
#[derive(Debug, Default)]
pub struct Discovery {
    /// Green Deployments, bootstrapped or not
    pub primaries: Vec<Deployment>,
    /// Blue Deployments owned by this Harvester
    pub shadows: Vec<Deployment>,
}

impl Discovery {
    pub fn shadow_named(&self, name: &str) -> Option<&Deployment> {
        self.shadows.iter().find(|d| d.name_any() == name)
    }
}

/// Sort candidates by their role annotation
///
/// A shadow is never a primary, even though its labels match the selector.
/// Deployments already claimed by a different Harvester are left alone.
pub fn classify(candidates: Vec<Deployment>, harvester: &str) -> Discovery {
    let mut discovery = Discovery::default();

    for deployment in candidates {
        let owner = read_harvester(&deployment);
        let role = read_role(&deployment);

        if role != Role::Unset && owner.as_deref().is_some_and(|o| o != harvester) {
            continue;
        }

        match role {
            Role::Shadow => discovery.shadows.push(deployment),
            Role::Primary | Role::Unset => discovery.primaries.push(deployment),
        }
    }

    discovery
}

/// Shadows whose counterpart is missing or not a matched primary
pub fn find_orphan_shadows(discovery: &Discovery) -> Vec<&Deployment> {
    let primaries: HashSet<String> = discovery.primaries.iter().map(|d| d.name_any()).collect();

    discovery
        .shadows
        .iter()
        .filter(|shadow| match read_counterpart(shadow) {
            Some(counterpart) => !primaries.contains(&counterpart),
            None => true,
        })
        .collect()
}

/// Map a Deployment event to the Harvesters whose selector matches it
pub fn harvesters_for_deployment(
    harvesters: &[Arc<Harvester>],
    deployment: &Deployment,
) -> Vec<ObjectRef<Harvester>> {
    let namespace = deployment.namespace();

    harvesters
        .iter()
        .filter(|h| h.namespace() == namespace)
        .filter(|h| selector_matches(&h.spec.selector, deployment.metadata.labels.as_ref()))
        .map(|h| ObjectRef::from_obj(h.as_ref()))
        .collect()
}
