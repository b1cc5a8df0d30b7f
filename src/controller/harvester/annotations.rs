//! Role markers stored in Deployment annotations
//!
//! The green/blue relationship lives entirely in annotations so it survives controller
//! restarts and can be rebuilt from the object graph on every pass.

use k8s_openapi::api::apps::v1::Deployment;
use std::collections::BTreeMap;

/// Prefix shared by every key this controller owns
pub const PREFIX: &str = "kubereplay.io/";

pub const MODE_ANNOTATION: &str = "kubereplay.io/mode";
pub const COUNTERPART_ANNOTATION: &str = "kubereplay.io/counterpart";
pub const REPLICAS_ANNOTATION: &str = "kubereplay.io/replicas";
pub const HARVESTER_ANNOTATION: &str = "kubereplay.io/harvester";

/// Label added to the shadow's metadata, pod template and selector
pub const ROLE_LABEL: &str = "kubereplay.io/role";

const MODE_GREEN: &str = "green";
const MODE_BLUE: &str = "blue";

/// Role of a Deployment within a green/blue pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Not yet managed (or carrying a mode we don't recognize)
    Unset,
    /// Green: the user's original Deployment
    Primary,
    /// Blue: the copy carrying the capture sidecar
    Shadow,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Unset => "unset",
            Role::Primary => MODE_GREEN,
            Role::Shadow => MODE_BLUE,
        }
    }
}

fn annotation<'a>(deployment: &'a Deployment, key: &str) -> Option<&'a str> {
    deployment
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
}

fn annotations_mut(deployment: &mut Deployment) -> &mut BTreeMap<String, String> {
    deployment.metadata.annotations.get_or_insert_with(BTreeMap::new)
}

pub fn read_role(deployment: &Deployment) -> Role {
    match annotation(deployment, MODE_ANNOTATION) {
        Some(MODE_GREEN) => Role::Primary,
        Some(MODE_BLUE) => Role::Shadow,
        _ => Role::Unset,
    }
}

pub fn read_counterpart(deployment: &Deployment) -> Option<String> {
    annotation(deployment, COUNTERPART_ANNOTATION)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
}

/// Replica count this controller last wrote; `None` if absent or unparsable
pub fn read_applied_replicas(deployment: &Deployment) -> Option<i32> {
    annotation(deployment, REPLICAS_ANNOTATION).and_then(|v| v.trim().parse().ok())
}

pub fn read_harvester(deployment: &Deployment) -> Option<String> {
    annotation(deployment, HARVESTER_ANNOTATION).map(str::to_string)
}

pub fn write_shadow_markers(deployment: &mut Deployment, counterpart: &str, harvester: &str) {
    let annotations = annotations_mut(deployment);
    annotations.insert(MODE_ANNOTATION.to_string(), MODE_BLUE.to_string());
    annotations.insert(COUNTERPART_ANNOTATION.to_string(), counterpart.to_string());
    annotations.insert(HARVESTER_ANNOTATION.to_string(), harvester.to_string());
}

pub fn write_primary_markers(
    deployment: &mut Deployment,
    counterpart: &str,
    harvester: &str,
    applied: i32,
) {
    let annotations = annotations_mut(deployment);
    annotations.insert(MODE_ANNOTATION.to_string(), MODE_GREEN.to_string());
    annotations.insert(COUNTERPART_ANNOTATION.to_string(), counterpart.to_string());
    annotations.insert(HARVESTER_ANNOTATION.to_string(), harvester.to_string());
    write_applied_replicas(deployment, applied);
}

pub fn write_applied_replicas(deployment: &mut Deployment, applied: i32) {
    annotations_mut(deployment).insert(REPLICAS_ANNOTATION.to_string(), applied.to_string());
}

/// Remove every key owned by this controller
pub fn strip_markers(annotations: &mut BTreeMap<String, String>) {
    annotations.retain(|key, _| !key.starts_with(PREFIX));
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn deployment_with(annotations: &[(&str, &str)]) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_read_role() {
        assert_eq!(read_role(&Deployment::default()), Role::Unset);
        assert_eq!(read_role(&deployment_with(&[(MODE_ANNOTATION, "green")])), Role::Primary);
        assert_eq!(read_role(&deployment_with(&[(MODE_ANNOTATION, "blue")])), Role::Shadow);
        assert_eq!(read_role(&deployment_with(&[(MODE_ANNOTATION, "purple")])), Role::Unset);
    }

    #[test]
    fn test_read_applied_replicas_ignores_garbage() {
        assert_eq!(
            read_applied_replicas(&deployment_with(&[(REPLICAS_ANNOTATION, "7")])),
            Some(7)
        );
        assert_eq!(
            read_applied_replicas(&deployment_with(&[(REPLICAS_ANNOTATION, "seven")])),
            None
        );
        assert_eq!(read_applied_replicas(&Deployment::default()), None);
    }

    #[test]
    fn test_empty_counterpart_reads_as_missing() {
        let deployment = deployment_with(&[(COUNTERPART_ANNOTATION, "")]);
        assert_eq!(read_counterpart(&deployment), None);
    }

    #[test]
    fn test_primary_markers_round_trip() {
        let mut deployment = Deployment::default();
        write_primary_markers(&mut deployment, "web-blue", "capture", 7);

        assert_eq!(read_role(&deployment), Role::Primary);
        assert_eq!(read_counterpart(&deployment).as_deref(), Some("web-blue"));
        assert_eq!(read_harvester(&deployment).as_deref(), Some("capture"));
        assert_eq!(read_applied_replicas(&deployment), Some(7));
    }

    #[test]
    fn test_writing_markers_twice_is_idempotent() {
        let mut once = deployment_with(&[("team", "shop")]);
        write_shadow_markers(&mut once, "web", "capture");
        write_applied_replicas(&mut once, 3);

        let mut twice = once.clone();
        write_shadow_markers(&mut twice, "web", "capture");
        write_applied_replicas(&mut twice, 3);

        assert_eq!(once.metadata.annotations, twice.metadata.annotations);
    }

    #[test]
    fn test_strip_markers_keeps_foreign_keys() {
        let mut deployment = deployment_with(&[("team", "shop")]);
        write_primary_markers(&mut deployment, "web-blue", "capture", 7);

        let annotations = deployment.metadata.annotations.as_mut().unwrap();
        strip_markers(annotations);

        assert_eq!(annotations.len(), 1);
        assert_eq!(annotations.get("team").map(String::as_str), Some("shop"));
    }
}
