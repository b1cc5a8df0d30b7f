use k8s_openapi::api::core::v1::{LocalObjectReference, ResourceRequirements};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Refinery is a Custom Resource describing a goreplay receiver
///
/// Shadows created by Harvesters forward captured traffic to the Service
/// `refinery-<name>`; the receiver behind it writes the traffic to every enabled
/// output silo.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "kubereplay.io",
    version = "v1alpha1",
    kind = "Refinery",
    plural = "refineries",
    shortname = "rf",
    namespaced,
    status = "RefineryStatus",
    printcolumn = r#"{"name":"Deployed", "type":"boolean", "jsonPath":".status.deployed"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct RefinerySpec {
    /// `-output-http-workers`, ignored when zero
    #[serde(default)]
    pub workers: i32,

    /// `-output-http-timeout`, a goreplay duration such as `5s`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,

    /// Where received traffic goes
    #[serde(rename = "output", default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<RefineryStorage>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goreplay: Option<GoreplayImage>,

    /// Receiver container resources; 10m CPU and 64Mi memory when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct GoreplayImage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    #[serde(rename = "image_pull_policy", default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,

    #[serde(rename = "image_pull_secrets", default, skip_serializing_if = "Vec::is_empty")]
    pub image_pull_secrets: Vec<LocalObjectReference>,
}

/// Output silos; every enabled one receives a copy of the traffic
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct RefineryStorage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<FileSilo>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp: Option<TcpSilo>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<StdoutSilo>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpSilo>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elasticsearch: Option<ElasticsearchSilo>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kafka: Option<KafkaSilo>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct FileSilo {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub filename: String,

    #[serde(default)]
    pub append: bool,

    #[serde(rename = "flush_interval", default, skip_serializing_if = "Option::is_none")]
    pub flush_interval: Option<String>,

    /// `-output-file-queue-limit`, ignored when zero
    #[serde(rename = "queuesize", default)]
    pub queue_size: i32,

    /// `-output-file-size-limit`, e.g. `32mb`
    #[serde(rename = "filelimit", default, skip_serializing_if = "Option::is_none")]
    pub file_limit: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct TcpSilo {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub uri: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct StdoutSilo {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct HttpSilo {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub uri: String,

    #[serde(default)]
    pub debug: bool,

    #[serde(rename = "response_buffer", default)]
    pub response_buffer: i32,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct ElasticsearchSilo {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub uri: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct KafkaSilo {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub uri: String,

    /// `-output-kafka-json-format`
    #[serde(default)]
    pub json: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
}

/// Status of the Refinery
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct RefineryStatus {
    /// The receiver Service and Deployment exist and match the spec
    #[serde(default)]
    pub deployed: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(rename = "observedGeneration", skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

#[cfg(test)]
#[path = "refinery_test.rs"]
mod tests;
