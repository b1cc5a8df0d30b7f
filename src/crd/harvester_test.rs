#![allow(clippy::unwrap_used)] // Tests can use unwrap for brevity
#![allow(clippy::expect_used)] // Tests can use expect for better error messages

use super::*;
use kube::CustomResourceExt;

#[test]
fn test_harvester_deserialize_from_yaml() {
    let yaml = r#"
apiVersion: kubereplay.io/v1alpha1
kind: Harvester
metadata:
  name: web-capture
  namespace: shop
spec:
  selector:
    app: web
    tier: frontend
  app_port: 8080
  refinery: shop-refinery
  segment: 30
"#;

    let harvester: Harvester =
        serde_yaml::from_str(yaml).expect("Failed to deserialize Harvester");

    assert_eq!(harvester.metadata.name.as_deref(), Some("web-capture"));
    assert_eq!(harvester.spec.app_port, 8080);
    assert_eq!(harvester.spec.refinery, "shop-refinery");
    assert_eq!(harvester.spec.segment_size, 30);
    assert_eq!(harvester.spec.selector.len(), 2);
    assert_eq!(harvester.spec.selector.get("app").map(String::as_str), Some("web"));
    assert!(harvester.status.is_none());
}

#[test]
fn test_harvester_segment_size_defaults_to_zero() {
    let yaml = r#"
apiVersion: kubereplay.io/v1alpha1
kind: Harvester
metadata:
  name: idle
spec:
  selector:
    app: web
  app_port: 80
  refinery: r
"#;

    let harvester: Harvester = serde_yaml::from_str(yaml).unwrap();
    assert_eq!(harvester.spec.segment_size, 0);
}

#[test]
fn test_harvester_status_deserialize_with_ledger() {
    let yaml = r#"
segment: 30
deployments:
- green: web
  greenReplicas: 7
  blue: web-blue
  blueReplicas: 3
lastReconcileTime: "2026-01-01T00:00:00Z"
observedGeneration: 4
"#;

    let status: HarvesterStatus = serde_yaml::from_str(yaml).unwrap();

    assert_eq!(status.segment_size, Some(30));
    assert_eq!(status.observed_generation, Some(4));
    assert_eq!(
        status.deployments,
        vec![ControlledDeployment {
            green: "web".to_string(),
            green_replicas: 7,
            blue: "web-blue".to_string(),
            blue_replicas: 3,
        }]
    );
}

#[test]
fn test_harvester_spec_wire_names() {
    let spec: HarvesterSpec = serde_json::from_value(serde_json::json!({
        "selector": {"app": "web"},
        "appPort": 9090,
        "refinery": "r",
        "segmentSize": 20
    }))
    .unwrap();
    assert_eq!(spec.app_port, 9090);
    assert_eq!(spec.segment_size, 20);

    let json = serde_json::to_value(&spec).unwrap();
    assert_eq!(json["app_port"], 9090);
    assert_eq!(json["segment"], 20);
    assert!(json.get("segmentSize").is_none());

    let status = serde_json::to_value(HarvesterStatus {
        segment_size: Some(20),
        ..Default::default()
    })
    .unwrap();
    assert_eq!(status, serde_json::json!({"segment": 20}));
}

#[test]
fn test_empty_status_serializes_without_optional_fields() {
    let json = serde_json::to_value(HarvesterStatus::default()).unwrap();
    assert_eq!(json, serde_json::json!({}));
}

#[test]
fn test_harvester_crd_metadata() {
    let crd = Harvester::crd();

    assert_eq!(crd.spec.group, "kubereplay.io");
    assert_eq!(crd.spec.names.kind, "Harvester");
    assert_eq!(crd.spec.names.plural, "harvesters");
    assert_eq!(crd.spec.scope, "Namespaced");
    assert_eq!(crd.spec.versions[0].name, "v1alpha1");
    assert!(crd.spec.versions[0].subresources.is_some());
}
