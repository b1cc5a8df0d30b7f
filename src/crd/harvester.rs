use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Harvester is a Custom Resource declaring which Deployments get a traffic-capturing
/// shadow copy and how much of their capacity the shadow receives
///
/// Every Deployment matched by `selector` is split into a green (original) and a
/// blue (shadow, carrying the goreplay sidecar) Deployment, with `segment`
/// percent of the replicas running blue.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "kubereplay.io",
    version = "v1alpha1",
    kind = "Harvester",
    shortname = "hv",
    namespaced,
    status = "HarvesterStatus",
    printcolumn = r#"{"name":"Segment", "type":"integer", "jsonPath":".spec.segment"}"#,
    printcolumn = r#"{"name":"Applied", "type":"integer", "jsonPath":".status.segment"}"#,
    printcolumn = r#"{"name":"Refinery", "type":"string", "jsonPath":".spec.refinery"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct HarvesterSpec {
    /// Label equality selector for the Deployments to capture traffic from
    #[serde(default)]
    pub selector: BTreeMap<String, String>,

    /// Port the application listens on; the sidecar captures traffic on it
    #[serde(rename = "app_port", alias = "appPort")]
    pub app_port: i32,

    /// Name of the refinery that receives the mirrored traffic
    pub refinery: String,

    /// Percentage (0-100) of replicas that run as the blue shadow
    #[serde(rename = "segment", alias = "segmentSize", default)]
    pub segment_size: i32,
}

/// One green/blue pair managed by a Harvester
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct ControlledDeployment {
    /// Name of the original Deployment
    pub green: String,

    #[serde(rename = "greenReplicas")]
    pub green_replicas: i32,

    /// Name of the shadow Deployment
    pub blue: String,

    #[serde(rename = "blueReplicas")]
    pub blue_replicas: i32,
}

/// Status of the Harvester
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct HarvesterStatus {
    /// Segment size applied by the last fully successful reconcile
    #[serde(rename = "segment", alias = "segmentSize", skip_serializing_if = "Option::is_none")]
    pub segment_size: Option<i32>,

    /// Green/blue pairs observed during the last reconcile
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deployments: Vec<ControlledDeployment>,

    /// Human-readable message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Timestamp of the last reconcile (RFC3339 format)
    #[serde(rename = "lastReconcileTime", skip_serializing_if = "Option::is_none")]
    pub last_reconcile_time: Option<String>,

    /// metadata.generation of the spec this status was computed from
    #[serde(rename = "observedGeneration", skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

#[cfg(test)]
#[path = "harvester_test.rs"]
mod tests;
