use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use kube::runtime::controller::Error as ControllerError;
use kube::runtime::{watcher, Controller};
use kube::{Api, Client};
use kubereplay::controller::clock::SystemClock;
use kubereplay::controller::harvester::discovery::harvesters_for_deployment;
use kubereplay::controller::harvester::shadow::SidecarConfig;
use kubereplay::controller::store::KubeStore;
use kubereplay::controller::refinery::refinery_key;
use kubereplay::controller::{error_policy, reconcile, reconcile_refinery, refinery_error_policy, Context};
use kubereplay::crd::harvester::Harvester;
use kubereplay::crd::refinery::Refinery;
use kubereplay::server::{
    create_metrics, run_health_server, run_leader_election, shutdown_channel, wait_for_signal,
    LeaderConfig, LeaderState, ReadinessState,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const HEALTH_PORT: u16 = 8080;

/// How long in-flight passes get to finish after a termination signal
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

const DEFAULT_RESYNC_SECONDS: u64 = 30;

fn is_leader_election_enabled() -> bool {
    std::env::var("KUBEREPLAY_LEADER_ELECTION")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false)
}

/// `KUBEREPLAY_RESYNC_SECONDS`; zero or unparsable falls back to the default
fn resync_interval() -> Duration {
    let seconds = std::env::var("KUBEREPLAY_RESYNC_SECONDS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|s| *s > 0)
        .unwrap_or(DEFAULT_RESYNC_SECONDS);
    Duration::from_secs(seconds)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = rustls::crypto::ring::default_provider().install_default();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting kubereplay controllers");

    let (shutdown_controller, shutdown_signal) = shutdown_channel();
    let readiness = ReadinessState::new();
    let metrics = create_metrics()?;

    let client = match Client::try_default().await {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Failed to create Kubernetes client");
            return Err(e.into());
        }
    };
    info!("Connected to Kubernetes cluster");

    let health_readiness = readiness.clone();
    let health_metrics = metrics.clone();
    let health_handle = tokio::spawn(async move {
        if let Err(e) = run_health_server(HEALTH_PORT, health_readiness, health_metrics).await {
            warn!(error = %e, "Health server failed");
        }
    });

    let leader_state = LeaderState::new();
    let leader_handle = if is_leader_election_enabled() {
        let config = LeaderConfig::from_env();
        info!(
            holder_id = %config.holder_id,
            lease = %config.lease_name,
            "Leader election enabled"
        );
        Some(tokio::spawn(run_leader_election(
            client.clone(),
            config,
            leader_state.clone(),
            shutdown_signal.clone(),
        )))
    } else {
        info!("Leader election disabled - running as single instance");
        None
    };

    let sidecar = SidecarConfig::from_env();
    let resync = resync_interval();
    info!(
        image = %sidecar.image,
        refinery_port = sidecar.refinery_port,
        resync_secs = resync.as_secs(),
        "Controller configured"
    );

    let store = Arc::new(KubeStore::new(client.clone()));
    let clock = Arc::new(SystemClock);
    let ctx = if leader_handle.is_some() {
        Context::new_with_leader(store, clock, leader_state, Some(metrics.clone()))
    } else {
        Context::new(store, clock, Some(metrics.clone()))
    };
    let ctx = Arc::new(
        ctx.with_sidecar(sidecar)
            .with_resync(resync)
            .with_shutdown(shutdown_signal.clone()),
    );

    // Readiness means initialized, not leading: any replica may take over the lease
    readiness.set_ready();
    info!("Controller ready, starting reconciliation loop");

    let harvesters = Api::<Harvester>::all(client.clone());
    let deployments = Api::<Deployment>::all(client.clone());
    let harvester_controller = Controller::new(harvesters, watcher::Config::default());
    let cache = harvester_controller.store();
    let mut drain_signal = shutdown_signal.clone();
    let cleanup_ctx = ctx.clone();
    let refinery_ctx = ctx.clone();

    let harvester_controller = harvester_controller
        .watches(deployments, watcher::Config::default(), move |deployment| {
            harvesters_for_deployment(&cache.state(), &deployment)
        })
        .graceful_shutdown_on(async move { drain_signal.wait().await })
        .run(reconcile, error_policy, ctx)
        .for_each(|res| {
            let cleanup_ctx = cleanup_ctx.clone();
            async move {
                match res {
                    Ok((harvester, action)) => debug!(harvester = %harvester, ?action, "Reconciled"),
                    // logged by error_policy
                    Err(ControllerError::ReconcilerFailed(..)) => {}
                    // a scheduled requeue of a deleted Harvester
                    Err(ControllerError::ObjectNotFound(obj)) => {
                        debug!(harvester = %obj.name, "Harvester deleted, dropping its state");
                        cleanup_ctx.forget_harvester(obj.namespace.as_deref().unwrap_or_default(), &obj.name);
                    }
                    Err(e) => warn!(error = %e, "Controller stream error"),
                }
            }
        });

    let mut refinery_drain = shutdown_signal.clone();
    let refinery_controller = Controller::new(Api::<Refinery>::all(client.clone()), watcher::Config::default())
        .owns(Api::<Deployment>::all(client.clone()), watcher::Config::default())
        .owns(Api::<Service>::all(client), watcher::Config::default())
        .graceful_shutdown_on(async move { refinery_drain.wait().await })
        .run(reconcile_refinery, refinery_error_policy, refinery_ctx.clone())
        .for_each(|res| {
            let refinery_ctx = refinery_ctx.clone();
            async move {
                match res {
                    Ok((refinery, action)) => debug!(refinery = %refinery, ?action, "Reconciled"),
                    Err(ControllerError::ReconcilerFailed(..)) => {}
                    Err(ControllerError::ObjectNotFound(obj)) => {
                        let key = refinery_key(obj.namespace.as_deref().unwrap_or_default(), &obj.name);
                        refinery_ctx.failure_backoff.reset(&key);
                    }
                    Err(e) => warn!(error = %e, "Refinery controller stream error"),
                }
            }
        });

    let controller = futures::future::join(harvester_controller, refinery_controller);
    tokio::pin!(controller);

    tokio::select! {
        _ = &mut controller => {
            info!("Controller streams ended");
        }
        signal = wait_for_signal() => {
            match signal {
                Ok(name) => info!(signal = name, "Initiating graceful shutdown"),
                Err(e) => error!(error = %e, "Cannot listen for termination signals, shutting down"),
            }
            readiness.set_not_ready();
            shutdown_controller.shutdown();
            if tokio::time::timeout(DRAIN_TIMEOUT, &mut controller).await.is_err() {
                warn!("In-flight reconciliations did not finish before the drain timeout");
            }
        }
    }

    shutdown_controller.shutdown();

    if let Some(handle) = leader_handle {
        // the election loop releases the lease on its way out
        if tokio::time::timeout(Duration::from_secs(5), handle).await.is_err() {
            warn!("Leader election loop did not stop in time");
        }
    }
    health_handle.abort();

    info!("kubereplay controller shut down gracefully");
    Ok(())
}

#[cfg(test)]
#[path = "main_test.rs"]
mod tests;
