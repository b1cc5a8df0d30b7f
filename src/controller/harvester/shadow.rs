//! Building the blue shadow Deployment from its green primary

use super::annotations::{
    read_counterpart, read_harvester, read_role, strip_markers, write_applied_replicas,
    write_shadow_markers, Role, ROLE_LABEL,
};
use super::ReconcileError;
use crate::controller::refinery::receiver::{refinery_service_name, RECEIVER_PORT};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Container;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;

pub const SIDECAR_NAME: &str = "goreplay";
pub const DEFAULT_SIDECAR_IMAGE: &str = "buger/goreplay:latest";
pub const DEFAULT_REFINERY_PORT: u16 = RECEIVER_PORT;

/// Annotations the API server maintains per Deployment; never copied to the shadow
const SERVER_ANNOTATIONS: &[&str] = &[
    "deployment.kubernetes.io/revision",
    "kubectl.kubernetes.io/last-applied-configuration",
];

/// How the capture sidecar is rendered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SidecarConfig {
    pub image: String,
    pub refinery_port: u16,
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            image: DEFAULT_SIDECAR_IMAGE.to_string(),
            refinery_port: DEFAULT_REFINERY_PORT,
        }
    }
}

impl SidecarConfig {
    /// Read `KUBEREPLAY_GOREPLAY_IMAGE` and `KUBEREPLAY_REFINERY_PORT`
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            image: std::env::var("KUBEREPLAY_GOREPLAY_IMAGE")
                .ok()
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.image),
            refinery_port: std::env::var("KUBEREPLAY_REFINERY_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.refinery_port),
        }
    }
}

/// Name of the shadow for a primary
pub fn shadow_name(primary: &str) -> String {
    format!("{}-blue", primary)
}

/// The goreplay container mirroring `app_port` traffic to the refinery service
pub fn sidecar_container(
    config: &SidecarConfig,
    app_port: i32,
    refinery: &str,
    namespace: &str,
) -> Container {
    Container {
        name: SIDECAR_NAME.to_string(),
        image: Some(config.image.clone()),
        args: Some(vec![
            "--input-raw".to_string(),
            format!(":{}", app_port),
            "--output-tcp".to_string(),
            format!(
                "{}.{}:{}",
                refinery_service_name(refinery),
                namespace,
                config.refinery_port
            ),
        ]),
        ..Default::default()
    }
}

/// True when `candidate` is the shadow this Harvester created for `primary`
pub fn is_shadow_of(candidate: &Deployment, primary: &str, harvester: &str) -> bool {
    read_role(candidate) == Role::Shadow
        && read_counterpart(candidate).as_deref() == Some(primary)
        && read_harvester(candidate).as_deref() == Some(harvester)
}

/// Derive the shadow Deployment for `primary`
///
/// The copy keeps the primary's labels, annotations and pod spec, loses every
/// server-populated field and every marker, gains the role label (on metadata,
/// selector and pod template) and exactly one goreplay sidecar.
pub fn build_shadow(
    primary: &Deployment,
    harvester: &str,
    replicas: i32,
    sidecar: Container,
) -> Result<Deployment, ReconcileError> {
    let primary_name = primary.name_any();
    let malformed = |what: &str| {
        ReconcileError::MalformedDeployment(format!("{}: {}", primary_name, what))
    };

    let mut spec = primary.spec.clone().ok_or_else(|| malformed("missing spec"))?;
    spec.replicas = Some(replicas);
    spec.selector
        .match_labels
        .get_or_insert_with(Default::default)
        .insert(ROLE_LABEL.to_string(), "blue".to_string());

    let template_meta = spec.template.metadata.get_or_insert_with(Default::default);
    template_meta
        .labels
        .get_or_insert_with(Default::default)
        .insert(ROLE_LABEL.to_string(), "blue".to_string());

    let pod = spec
        .template
        .spec
        .as_mut()
        .ok_or_else(|| malformed("missing pod template spec"))?;
    pod.containers.retain(|c| c.name != SIDECAR_NAME);
    pod.containers.push(sidecar);

    let mut labels = primary.metadata.labels.clone().unwrap_or_default();
    labels.insert(ROLE_LABEL.to_string(), "blue".to_string());

    let mut annotations = primary.metadata.annotations.clone().unwrap_or_default();
    strip_markers(&mut annotations);
    for key in SERVER_ANNOTATIONS {
        annotations.remove(*key);
    }

    let mut shadow = Deployment {
        metadata: ObjectMeta {
            name: Some(shadow_name(&primary_name)),
            namespace: primary.metadata.namespace.clone(),
            labels: Some(labels),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(spec),
        status: None,
    };
    write_shadow_markers(&mut shadow, &primary_name, harvester);
    write_applied_replicas(&mut shadow, replicas);

    Ok(shadow)
}
