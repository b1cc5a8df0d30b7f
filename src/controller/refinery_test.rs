use super::receiver::{build_receiver, RECEIVER_CONTAINER};
use super::*;
use crate::controller::store::mock::{MockStore, Write};
use crate::controller::store::WorkloadStore;
use crate::controller::{Context, ReconcileError};
use crate::crd::refinery::{Refinery, RefinerySpec, RefineryStorage, StdoutSilo, TcpSilo};
use crate::server::{create_metrics, LeaderState};
use kube::runtime::controller::Action;
use std::sync::Arc;
use std::time::Duration;

const NS: &str = "replay";

fn spec() -> RefinerySpec {
    RefinerySpec {
        storage: Some(RefineryStorage {
            tcp: Some(TcpSilo {
                enabled: true,
                uri: "collector:4000".to_string(),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn refinery(spec: RefinerySpec) -> Refinery {
    let mut r = Refinery::new("shop", spec);
    r.metadata.namespace = Some(NS.to_string());
    r.metadata.uid = Some("0b6c2d4e".to_string());
    r.metadata.generation = Some(1);
    r
}

fn store_with(spec: RefinerySpec) -> Arc<MockStore> {
    let store = Arc::new(MockStore::new());
    store.insert_refinery(refinery(spec));
    store
}

async fn run_with(store: &Arc<MockStore>, ctx: Context) -> Result<Action, ReconcileError> {
    let r = store
        .refinery(NS, "shop")
        .unwrap_or_else(|| refinery(spec()));
    reconcile_refinery(Arc::new(r), Arc::new(ctx)).await
}

async fn run(store: &Arc<MockStore>) -> Result<Action, ReconcileError> {
    run_with(store, Context::new_mock(store.clone())).await
}

fn receiver_args(store: &MockStore) -> Vec<String> {
    let deployment = store.deployment(NS, "refinery-shop").unwrap();
    let pod = deployment.spec.unwrap().template.spec.unwrap();
    pod.containers
        .into_iter()
        .find(|c| c.name == RECEIVER_CONTAINER)
        .and_then(|c| c.args)
        .unwrap()
}

#[tokio::test]
async fn test_new_refinery_gets_service_and_receiver() {
    let store = store_with(spec());
    let metrics = create_metrics().unwrap();
    let mut ctx = Context::new_mock(store.clone());
    ctx.metrics = Some(metrics.clone());

    let action = run_with(&store, ctx).await.unwrap();

    assert_eq!(action, Action::requeue(Duration::from_secs(30)));
    assert_eq!(
        store.writes(),
        vec![
            Write::CreateService("refinery-shop".to_string()),
            Write::Create("refinery-shop".to_string()),
            Write::Status("shop".to_string()),
        ]
    );

    let service = store.service(NS, "refinery-shop").unwrap();
    assert_eq!(service.metadata.owner_references.unwrap()[0].uid, "0b6c2d4e");
    assert_eq!(
        receiver_args(&store),
        vec!["-input-tcp", ":28020", "-output-tcp", "collector:4000"]
    );

    let status = store.refinery(NS, "shop").unwrap().status.unwrap();
    assert!(status.deployed);
    assert_eq!(status.observed_generation, Some(1));
    assert_eq!(
        status.message.as_deref(),
        Some("receiving on refinery-shop.replay:28020")
    );

    let body = metrics.encode().unwrap();
    assert!(body.contains(r#"kubereplay_refinery_resources_created_total{kind="deployment"} 1"#));
}

#[tokio::test]
async fn test_deployed_refinery_pass_writes_nothing() {
    let store = store_with(spec());
    run(&store).await.unwrap();
    store.clear_writes();

    run(&store).await.unwrap();

    assert!(store.writes().is_empty(), "writes: {:?}", store.writes());
}

#[tokio::test]
async fn test_spec_change_updates_receiver_in_place() {
    let store = store_with(spec());
    run(&store).await.unwrap();

    // scaled by hand; the update must keep it
    let mut receiver = store.deployment(NS, "refinery-shop").unwrap();
    receiver.spec.as_mut().unwrap().replicas = Some(3);
    store.insert_deployment(receiver);

    let mut r = store.refinery(NS, "shop").unwrap();
    r.spec.workers = 8;
    if let Some(storage) = r.spec.storage.as_mut() {
        storage.stdout = Some(StdoutSilo { enabled: true });
    }
    store.insert_refinery(r);
    store.clear_writes();

    run(&store).await.unwrap();

    assert_eq!(
        store.deployment_writes(),
        vec![Write::Replace("refinery-shop".to_string())]
    );
    assert_eq!(
        receiver_args(&store),
        vec![
            "-input-tcp",
            ":28020",
            "-output-tcp",
            "collector:4000",
            "-output-stdout",
            "-output-http-workers",
            "8",
        ]
    );
    assert_eq!(store.replicas(NS, "refinery-shop"), Some(3));
}

#[tokio::test]
async fn test_receiver_update_retries_on_conflict() {
    let store = store_with(spec());
    run(&store).await.unwrap();

    let mut r = store.refinery(NS, "shop").unwrap();
    r.spec.timeout = Some("10s".to_string());
    store.insert_refinery(r);
    store.conflict_once_on_replace("refinery-shop", |d| {
        d.spec.as_mut().unwrap().replicas = Some(2);
    });

    run(&store).await.unwrap();

    let args = receiver_args(&store);
    assert_eq!(&args[args.len() - 2..], ["-output-http-timeout", "10s"]);
    assert_eq!(store.replicas(NS, "refinery-shop"), Some(2));
}

#[tokio::test]
async fn test_existing_service_is_kept() {
    let store = store_with(spec());
    let r = store.refinery(NS, "shop").unwrap();
    let mut service = super::receiver::build_service(&r).unwrap();
    service.metadata.labels = None;
    store.create_service(NS, &service).await.unwrap();
    store.clear_writes();

    run(&store).await.unwrap();

    assert!(!store
        .writes()
        .iter()
        .any(|w| matches!(w, Write::CreateService(_))));
    assert!(store.deployment(NS, "refinery-shop").is_some());
    assert!(store.service(NS, "refinery-shop").unwrap().metadata.labels.is_none());
}

#[tokio::test]
async fn test_foreign_deployment_holding_receiver_name() {
    let store = store_with(spec());
    let mut foreign = build_receiver(&store.refinery(NS, "shop").unwrap()).unwrap();
    foreign.metadata.owner_references = None;
    foreign.spec.as_mut().unwrap().replicas = Some(4);
    store.insert_deployment(foreign);

    let result = run(&store).await;

    assert!(matches!(result, Err(ReconcileError::ReceiverNameTaken(name)) if name == "refinery-shop"));
    assert_eq!(store.replicas(NS, "refinery-shop"), Some(4));
    assert!(store.refinery(NS, "shop").unwrap().status.is_none());
}

#[tokio::test]
async fn test_invalid_output_is_reported_in_status() {
    let mut invalid = spec();
    if let Some(tcp) = invalid.storage.as_mut().and_then(|s| s.tcp.as_mut()) {
        tcp.uri.clear();
    }
    let store = store_with(invalid);

    let result = run(&store).await;

    assert!(matches!(result, Err(ReconcileError::ValidationError(_))));
    assert!(store.deployment_writes().is_empty());
    let status = store.refinery(NS, "shop").unwrap().status.unwrap();
    assert!(!status.deployed);
    assert!(status.message.unwrap().contains("tcp.uri"));
}

#[tokio::test]
async fn test_missing_refinery_awaits_change() {
    let store = Arc::new(MockStore::new());

    let action = run(&store).await.unwrap();

    assert_eq!(action, Action::await_change());
    assert!(store.writes().is_empty());
}

#[tokio::test]
async fn test_not_leader_skips_refinery() {
    let store = store_with(spec());
    let mut ctx = Context::new_mock(store.clone());
    ctx.leader_state = Some(LeaderState::new());

    let action = run_with(&store, ctx).await.unwrap();

    assert_eq!(action, Action::requeue(Duration::from_secs(5)));
    assert!(store.writes().is_empty());
}

#[test]
fn test_refinery_backoff_is_separate_from_harvester() {
    let store = Arc::new(MockStore::new());
    let ctx = Arc::new(Context::new_mock(store));
    let r = Arc::new(refinery(spec()));
    let error = ReconcileError::ValidationError("bad".to_string());

    refinery_error_policy(r.clone(), &error, ctx.clone());
    let second = refinery_error_policy(r, &error, ctx.clone());

    assert_eq!(second, Action::requeue(Duration::from_secs(10)));
    assert_eq!(ctx.failure_backoff.failures("refinery:replay/shop"), 2);
    assert_eq!(ctx.failure_backoff.failures("replay/shop"), 0);
}
