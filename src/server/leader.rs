//! Lease-based leader election
//!
//! With several controller replicas running, only the holder of a
//! `coordination.k8s.io/v1` Lease reconciles Harvesters. The others keep their
//! watches warm and take over once the lease expires.

use crate::server::shutdown::ShutdownSignal;
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_LEASE_NAME: &str = "kubereplay-controller-leader";
pub const DEFAULT_LEASE_NAMESPACE: &str = "kubereplay-system";
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(15);
pub const DEFAULT_RENEW_INTERVAL: Duration = Duration::from_secs(5);

/// Whether this instance currently holds the lease; clones share the flag
#[derive(Debug, Clone, Default)]
pub struct LeaderState {
    is_leader: Arc<AtomicBool>,
}

impl LeaderState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    pub fn set_leader(&self, leader: bool) {
        self.is_leader.store(leader, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone)]
pub struct LeaderConfig {
    pub holder_id: String,
    pub lease_name: String,
    pub lease_namespace: String,
    pub lease_duration_seconds: i32,
    pub renew_interval: Duration,
}

impl LeaderConfig {
    /// Identity from `POD_NAME`, then `HOSTNAME`, then a random id;
    /// lease namespace from `POD_NAMESPACE`
    pub fn from_env() -> Self {
        let holder_id = std::env::var("POD_NAME")
            .or_else(|_| std::env::var("HOSTNAME"))
            .unwrap_or_else(|_| format!("kubereplay-{}", uuid::Uuid::new_v4()));
        let lease_namespace = std::env::var("POD_NAMESPACE")
            .unwrap_or_else(|_| DEFAULT_LEASE_NAMESPACE.to_string());

        Self {
            holder_id,
            lease_name: DEFAULT_LEASE_NAME.to_string(),
            lease_namespace,
            lease_duration_seconds: DEFAULT_LEASE_TTL.as_secs() as i32,
            renew_interval: DEFAULT_RENEW_INTERVAL,
        }
    }
}

/// A lease missing either its renew time or its duration counts as expired
pub fn is_lease_expired(
    renew_time: Option<&MicroTime>,
    lease_duration_seconds: Option<i32>,
    now: DateTime<Utc>,
) -> bool {
    match (renew_time, lease_duration_seconds) {
        (Some(MicroTime(renewed)), Some(seconds)) => {
            now > *renewed + chrono::Duration::seconds(i64::from(seconds))
        }
        _ => true,
    }
}

fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 409)
}

fn holder(lease: &Lease) -> Option<&str> {
    lease.spec.as_ref().and_then(|s| s.holder_identity.as_deref())
}

/// One election round; returns whether we hold the lease afterwards
async fn try_acquire_or_renew(api: &Api<Lease>, config: &LeaderConfig) -> Result<bool, kube::Error> {
    let now = MicroTime(Utc::now());

    let Some(existing) = api.get_opt(&config.lease_name).await? else {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(config.lease_name.clone()),
                namespace: Some(config.lease_namespace.clone()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(config.holder_id.clone()),
                lease_duration_seconds: Some(config.lease_duration_seconds),
                acquire_time: Some(now.clone()),
                renew_time: Some(now),
                lease_transitions: Some(0),
                ..Default::default()
            }),
        };
        return match api.create(&PostParams::default(), &lease).await {
            Ok(_) => Ok(true),
            Err(e) if is_conflict(&e) => Ok(false),
            Err(e) => Err(e),
        };
    };

    let ours = holder(&existing) == Some(config.holder_id.as_str());
    let spec = existing.spec.clone().unwrap_or_default();
    if !ours && !is_lease_expired(spec.renew_time.as_ref(), spec.lease_duration_seconds, now.0) {
        debug!(holder = ?holder(&existing), "Lease held by another instance");
        return Ok(false);
    }

    let mut updated = existing.clone();
    let updated_spec = updated.spec.get_or_insert_with(Default::default);
    if !ours {
        updated_spec.holder_identity = Some(config.holder_id.clone());
        updated_spec.acquire_time = Some(now.clone());
        updated_spec.lease_transitions = Some(spec.lease_transitions.unwrap_or(0) + 1);
    }
    updated_spec.lease_duration_seconds = Some(config.lease_duration_seconds);
    updated_spec.renew_time = Some(now);

    match api
        .replace(&config.lease_name, &PostParams::default(), &updated)
        .await
    {
        Ok(_) => Ok(true),
        Err(e) if is_conflict(&e) => Ok(false),
        Err(e) => Err(e),
    }
}

async fn release(api: &Api<Lease>, config: &LeaderConfig) {
    let lease = match api.get_opt(&config.lease_name).await {
        Ok(Some(lease)) => lease,
        Ok(None) => return,
        Err(e) => {
            warn!(error = %e, "Failed to read lease for release");
            return;
        }
    };
    if holder(&lease) != Some(config.holder_id.as_str()) {
        return;
    }

    let mut updated = lease;
    if let Some(ref mut spec) = updated.spec {
        spec.holder_identity = None;
    }
    match api
        .replace(&config.lease_name, &PostParams::default(), &updated)
        .await
    {
        Ok(_) => info!("Released leader lease"),
        Err(e) => warn!(error = %e, "Failed to release leader lease"),
    }
}

/// Keep competing for the lease until shutdown, updating `state` each round
///
/// Errors talking to the API server drop leadership until the next successful
/// round, so two instances never reconcile at once.
pub async fn run_leader_election(
    client: Client,
    config: LeaderConfig,
    state: LeaderState,
    mut shutdown: ShutdownSignal,
) {
    let api: Api<Lease> = Api::namespaced(client, &config.lease_namespace);

    loop {
        let leader = match try_acquire_or_renew(&api, &config).await {
            Ok(leader) => leader,
            Err(e) => {
                warn!(error = %e, "Leader election round failed");
                false
            }
        };

        if leader != state.is_leader() {
            if leader {
                info!(holder_id = %config.holder_id, "Acquired leadership");
            } else {
                warn!(holder_id = %config.holder_id, "Lost leadership");
            }
        }
        state.set_leader(leader);

        tokio::select! {
            _ = tokio::time::sleep(config.renew_interval) => {}
            _ = shutdown.wait() => break,
        }
    }

    if state.is_leader() {
        release(&api, &config).await;
        state.set_leader(false);
    }
}
