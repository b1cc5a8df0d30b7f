//! The goreplay receiver a Refinery runs: its Service, its Deployment and the
//! command line that routes received traffic to the output silos

use crate::controller::ReconcileError;
use crate::crd::refinery::{Refinery, RefinerySpec};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, PodSpec, PodTemplateSpec, ResourceRequirements, Service, ServicePort,
    ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;

/// Port the receiver listens on; shadows forward to it
pub const RECEIVER_PORT: u16 = 28020;
pub const RECEIVER_CONTAINER: &str = "goreplay";
pub const DEFAULT_RECEIVER_IMAGE: &str = "buger/goreplay:latest";
pub const DEFAULT_PULL_POLICY: &str = "Always";
pub const APP_LABEL: &str = "kubereplay-app";

/// Name shared by a Refinery's Service and Deployment
pub fn refinery_service_name(refinery: &str) -> String {
    format!("refinery-{}", refinery)
}

fn app_labels(refinery: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(APP_LABEL.to_string(), refinery.to_string())])
}

/// goreplay arguments for a validated spec
///
/// Input first, then one flag group per enabled silo in a fixed order (file, tcp,
/// stdout, http, elasticsearch, kafka), then the HTTP tuning flags.
pub fn receiver_args(spec: &RefinerySpec) -> Vec<String> {
    let mut args = vec!["-input-tcp".to_string(), format!(":{}", RECEIVER_PORT)];
    let mut flag = |name: &str, value: Option<String>| {
        args.push(name.to_string());
        if let Some(value) = value {
            args.push(value);
        }
    };

    if let Some(storage) = &spec.storage {
        if let Some(file) = storage.file.as_ref().filter(|s| s.enabled) {
            flag("-output-file", Some(file.filename.clone()));
            if file.append {
                flag("-output-file-append", None);
            }
            if let Some(interval) = file.flush_interval.as_ref().filter(|v| !v.is_empty()) {
                flag("-output-file-flush-interval", Some(interval.clone()));
            }
            if file.queue_size > 0 {
                flag("-output-file-queue-limit", Some(file.queue_size.to_string()));
            }
            if let Some(limit) = file.file_limit.as_ref().filter(|v| !v.is_empty()) {
                flag("-output-file-size-limit", Some(limit.clone()));
            }
        }
        if let Some(tcp) = storage.tcp.as_ref().filter(|s| s.enabled) {
            flag("-output-tcp", Some(tcp.uri.clone()));
        }
        if storage.stdout.as_ref().is_some_and(|s| s.enabled) {
            flag("-output-stdout", None);
        }
        if let Some(http) = storage.http.as_ref().filter(|s| s.enabled) {
            flag("-output-http", Some(http.uri.clone()));
            if http.debug {
                flag("-output-http-debug", None);
            }
            if http.response_buffer > 0 {
                flag("-output-http-response-buffer", Some(http.response_buffer.to_string()));
            }
        }
        if let Some(es) = storage.elasticsearch.as_ref().filter(|s| s.enabled) {
            flag("-output-http-elasticsearch", Some(es.uri.clone()));
        }
        if let Some(kafka) = storage.kafka.as_ref().filter(|s| s.enabled) {
            flag("-output-kafka-host", Some(kafka.uri.clone()));
            if kafka.json {
                flag("-output-kafka-json-format", None);
            }
            if let Some(topic) = kafka.topic.as_ref().filter(|v| !v.is_empty()) {
                flag("-output-kafka-topic", Some(topic.clone()));
            }
        }
    }

    if spec.workers > 0 {
        flag("-output-http-workers", Some(spec.workers.to_string()));
    }
    if let Some(timeout) = spec.timeout.as_ref().filter(|v| !v.is_empty()) {
        flag("-output-http-timeout", Some(timeout.clone()));
    }
    args
}

fn default_resources() -> ResourceRequirements {
    let minimal = BTreeMap::from([
        ("cpu".to_string(), Quantity("10m".to_string())),
        ("memory".to_string(), Quantity("64Mi".to_string())),
    ]);
    ResourceRequirements {
        requests: Some(minimal.clone()),
        limits: Some(minimal),
        ..Default::default()
    }
}

fn owner_reference(refinery: &Refinery) -> Result<OwnerReference, ReconcileError> {
    refinery
        .controller_owner_ref(&())
        .ok_or_else(|| ReconcileError::MissingUid(refinery.name_any()))
}

/// True when `candidate` was created for this Refinery
pub fn is_owned_by(candidate: &Deployment, refinery: &Refinery) -> bool {
    let Some(uid) = refinery.metadata.uid.as_deref() else {
        return false;
    };
    candidate.owner_references().iter().any(|o| o.uid == uid)
}

fn metadata(refinery: &Refinery) -> Result<ObjectMeta, ReconcileError> {
    let name = refinery.name_any();
    Ok(ObjectMeta {
        name: Some(refinery_service_name(&name)),
        namespace: refinery.namespace(),
        labels: Some(app_labels(&name)),
        owner_references: Some(vec![owner_reference(refinery)?]),
        ..Default::default()
    })
}

/// ClusterIP Service in front of the receiver pods
pub fn build_service(refinery: &Refinery) -> Result<Service, ReconcileError> {
    let name = refinery.name_any();
    Ok(Service {
        metadata: metadata(refinery)?,
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(app_labels(&name)),
            ports: Some(vec![ServicePort {
                name: Some("goreplay".to_string()),
                protocol: Some("TCP".to_string()),
                port: i32::from(RECEIVER_PORT),
                target_port: Some(IntOrString::Int(i32::from(RECEIVER_PORT))),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn receiver_container(spec: &RefinerySpec) -> Container {
    let goreplay = spec.goreplay.as_ref();
    Container {
        name: RECEIVER_CONTAINER.to_string(),
        image: Some(
            goreplay
                .and_then(|g| g.image.clone())
                .filter(|i| !i.is_empty())
                .unwrap_or_else(|| DEFAULT_RECEIVER_IMAGE.to_string()),
        ),
        image_pull_policy: Some(
            goreplay
                .and_then(|g| g.image_pull_policy.clone())
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| DEFAULT_PULL_POLICY.to_string()),
        ),
        args: Some(receiver_args(spec)),
        ports: Some(vec![ContainerPort {
            name: Some("tcp".to_string()),
            protocol: Some("TCP".to_string()),
            container_port: i32::from(RECEIVER_PORT),
            ..Default::default()
        }]),
        resources: Some(spec.resources.clone().unwrap_or_else(default_resources)),
        ..Default::default()
    }
}

/// Single-replica Deployment running the receiver
pub fn build_receiver(refinery: &Refinery) -> Result<Deployment, ReconcileError> {
    let name = refinery.name_any();
    let pull_secrets = refinery
        .spec
        .goreplay
        .as_ref()
        .map(|g| g.image_pull_secrets.clone())
        .filter(|s| !s.is_empty());

    Ok(Deployment {
        metadata: metadata(refinery)?,
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(app_labels(&name)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(app_labels(&name)),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    image_pull_secrets: pull_secrets,
                    containers: vec![receiver_container(&refinery.spec)],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn pod_spec(deployment: &Deployment) -> Option<&PodSpec> {
    deployment.spec.as_ref()?.template.spec.as_ref()
}

fn find_receiver(pod: &PodSpec) -> Option<&Container> {
    pod.containers.iter().find(|c| c.name == RECEIVER_CONTAINER)
}

/// True when the live receiver no longer runs what `desired` describes
///
/// Only fields this controller sets are compared; server defaults are ignored.
pub fn receiver_drifted(live: &Deployment, desired: &Deployment) -> bool {
    let (Some(live_pod), Some(desired_pod)) = (pod_spec(live), pod_spec(desired)) else {
        return true;
    };
    if live_pod.image_pull_secrets.as_ref().filter(|s| !s.is_empty())
        != desired_pod.image_pull_secrets.as_ref()
    {
        return true;
    }

    match (find_receiver(live_pod), find_receiver(desired_pod)) {
        (Some(live), Some(desired)) => {
            live.image != desired.image
                || live.image_pull_policy != desired.image_pull_policy
                || live.args != desired.args
                || live.ports != desired.ports
                || live.resources != desired.resources
        }
        _ => true,
    }
}

/// Bring `live` to the desired receiver container, keeping everything else,
/// including a replica count someone scaled by hand
pub fn apply_receiver(live: &mut Deployment, desired: &Deployment) {
    let Some(desired_pod) = pod_spec(desired) else {
        return;
    };
    let Some(desired_container) = find_receiver(desired_pod) else {
        return;
    };

    let spec = live.spec.get_or_insert_with(Default::default);
    let pod = spec.template.spec.get_or_insert_with(Default::default);
    pod.image_pull_secrets = desired_pod.image_pull_secrets.clone();
    match pod.containers.iter_mut().find(|c| c.name == RECEIVER_CONTAINER) {
        Some(container) => {
            container.image = desired_container.image.clone();
            container.image_pull_policy = desired_container.image_pull_policy.clone();
            container.args = desired_container.args.clone();
            container.ports = desired_container.ports.clone();
            container.resources = desired_container.resources.clone();
        }
        None => pod.containers.push(desired_container.clone()),
    }
}
