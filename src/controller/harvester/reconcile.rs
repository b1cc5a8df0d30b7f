use crate::controller::clock::Clock;
use crate::controller::retry::{with_conflict_retry, ConflictBackoff};
use crate::controller::store::{StoreError, WorkloadStore};
use crate::crd::harvester::{ControlledDeployment, Harvester};
use crate::server::{LeaderState, SharedMetrics, ShutdownSignal};
use futures::stream::{self, StreamExt};
use k8s_openapi::api::apps::v1::Deployment;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::annotations::{
    read_applied_replicas, read_counterpart, read_role, write_applied_replicas,
    write_primary_markers, Role,
};
use super::discovery::{
    classify, find_candidates, find_orphan_shadows, label_selector, live_replicas, Discovery,
};
use super::requeue::FailureBackoff;
use super::shadow::{build_shadow, is_shadow_of, shadow_name, sidecar_container, SidecarConfig};
use super::split::blue_green_replicas;
use super::status::{desired_status, persist_status, segment_changed, PassSummary};
use super::validation::validate_harvester;

pub const DEFAULT_RESYNC: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_CONCURRENT_PAIRS: usize = 8;

/// Requeue delay while another replica holds the lease
pub const NOT_LEADER_REQUEUE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("store error: {0}")]
    StoreError(#[from] StoreError),

    #[error("Harvester missing namespace")]
    MissingNamespace,

    #[error("Invalid Harvester spec: {0}")]
    ValidationError(String),

    #[error("Malformed Deployment {0}")]
    MalformedDeployment(String),

    #[error("Deployment {0} exists but is not a shadow of this Harvester")]
    ShadowNameTaken(String),

    #[error("{0} missing metadata.uid")]
    MissingUid(String),

    #[error("Deployment {0} exists but is not owned by this Refinery")]
    ReceiverNameTaken(String),

    #[error("{failed} of {total} deployments failed to reconcile")]
    PartialFailure { failed: usize, total: usize },
}

pub struct Context {
    pub store: Arc<dyn WorkloadStore>,
    pub clock: Arc<dyn Clock>,
    pub sidecar: SidecarConfig,
    pub conflict_backoff: ConflictBackoff,
    pub failure_backoff: FailureBackoff,
    /// Requeue interval after a successful pass
    pub resync: Duration,
    pub max_concurrent_pairs: usize,
    /// When Some, reconciliation is skipped unless this instance holds the lease
    pub leader_state: Option<LeaderState>,
    pub metrics: Option<SharedMetrics>,
    /// When Some and signalled, pairs not yet started are abandoned
    pub shutdown: Option<ShutdownSignal>,
}

impl Context {
    /// Create a new Context without leader election (single instance mode)
    pub fn new(
        store: Arc<dyn WorkloadStore>,
        clock: Arc<dyn Clock>,
        metrics: Option<SharedMetrics>,
    ) -> Self {
        Context {
            store,
            clock,
            sidecar: SidecarConfig::default(),
            conflict_backoff: ConflictBackoff::default(),
            failure_backoff: FailureBackoff::default(),
            resync: DEFAULT_RESYNC,
            max_concurrent_pairs: DEFAULT_MAX_CONCURRENT_PAIRS,
            leader_state: None,
            metrics,
            shutdown: None,
        }
    }

    /// Create a new Context that only reconciles while holding the lease
    pub fn new_with_leader(
        store: Arc<dyn WorkloadStore>,
        clock: Arc<dyn Clock>,
        leader_state: LeaderState,
        metrics: Option<SharedMetrics>,
    ) -> Self {
        Context {
            leader_state: Some(leader_state),
            ..Self::new(store, clock, metrics)
        }
    }

    pub fn with_sidecar(mut self, sidecar: SidecarConfig) -> Self {
        self.sidecar = sidecar;
        self
    }

    pub fn with_resync(mut self, resync: Duration) -> Self {
        self.resync = resync;
        self
    }

    pub fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn should_reconcile(&self) -> bool {
        match &self.leader_state {
            None => true,
            Some(state) => state.is_leader(),
        }
    }

    /// Drop per-Harvester state once the Harvester is deleted
    pub fn forget_harvester(&self, namespace: &str, name: &str) {
        self.failure_backoff.reset(&format!("{}/{}", namespace, name));
        if let Some(ref metrics) = self.metrics {
            metrics.forget_harvester(namespace, name);
        }
    }

    fn is_shutting_down(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|s| s.is_shutdown())
    }

    #[cfg(test)]
    pub fn new_mock(store: Arc<crate::controller::store::mock::MockStore>) -> Self {
        let clock = crate::controller::clock::MockClock::new(
            chrono::DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
                .map(|t| t.with_timezone(&chrono::Utc))
                .unwrap_or_default(),
        );
        let mut ctx = Self::new(store, Arc::new(clock), None);
        ctx.conflict_backoff = ConflictBackoff::immediate(5);
        ctx
    }
}

/// Reconcile a Harvester
///
/// One pass re-reads the Harvester, deletes orphan shadows, brings every matched
/// primary and its shadow to the split declared by `spec.segment` and records
/// the result in status. A pair that fails does not stop its siblings; the pass
/// then returns [`ReconcileError::PartialFailure`] so the key is retried.
pub async fn reconcile(harvester: Arc<Harvester>, ctx: Arc<Context>) -> Result<Action, ReconcileError> {
    if !ctx.should_reconcile() {
        debug!(harvester = ?harvester.name_any(), "Skipping reconciliation - not leader");
        if let Some(ref metrics) = ctx.metrics {
            metrics.record_reconciliation_skipped();
        }
        return Ok(Action::requeue(NOT_LEADER_REQUEUE));
    }

    let start_time = std::time::Instant::now();
    let namespace = harvester
        .namespace()
        .ok_or(ReconcileError::MissingNamespace)?;
    let name = harvester.name_any();

    let result = reconcile_harvester(&namespace, &name, &ctx).await;

    let duration_secs = start_time.elapsed().as_secs_f64();
    match &result {
        Ok(_) => {
            ctx.failure_backoff.reset(&format!("{}/{}", namespace, name));
            if let Some(ref metrics) = ctx.metrics {
                metrics.record_reconciliation_success(duration_secs);
            }
        }
        Err(e) => {
            error!(harvester = ?name, namespace = ?namespace, error = %e, "Reconcile failed");
            if let Some(ref metrics) = ctx.metrics {
                metrics.record_reconciliation_error(duration_secs);
            }
        }
    }

    result
}

/// Requeue a failed key after its next backoff delay (5s doubling up to 60s)
pub fn error_policy(harvester: Arc<Harvester>, error: &ReconcileError, ctx: Arc<Context>) -> Action {
    let key = format!(
        "{}/{}",
        harvester.namespace().unwrap_or_default(),
        harvester.name_any()
    );
    let delay = ctx.failure_backoff.next_delay(&key);
    warn!(harvester = %key, retry_in = ?delay, "Reconcile error (will retry): {:?}", error);
    Action::requeue(delay)
}

async fn reconcile_harvester(
    namespace: &str,
    name: &str,
    ctx: &Context,
) -> Result<Action, ReconcileError> {
    // The event payload may be stale; decisions are made on a fresh read
    let Some(harvester) = ctx.store.get_harvester(namespace, name).await? else {
        info!(harvester = ?name, namespace = ?namespace, "Harvester no longer exists");
        ctx.forget_harvester(namespace, name);
        return Ok(Action::await_change());
    };

    if let Err(validation_error) = validate_harvester(&harvester.spec) {
        error!(harvester = ?name, error = ?validation_error, "Harvester spec validation failed");
        return Err(ReconcileError::ValidationError(validation_error));
    }

    let selector = match label_selector(&harvester.spec.selector) {
        Ok(selector) => selector,
        Err(e) => {
            warn!(harvester = ?name, error = %e, "Unusable selector, nothing to do");
            return Ok(Action::requeue(ctx.resync));
        }
    };

    let candidates = find_candidates(ctx.store.as_ref(), namespace, &selector).await?;
    if candidates.is_empty() {
        info!(harvester = ?name, selector = %selector, "No Deployments match selector");
        return Ok(Action::requeue(ctx.resync));
    }

    info!(
        harvester = ?name,
        namespace = ?namespace,
        segment_size = harvester.spec.segment_size,
        candidates = candidates.len(),
        "Reconciling Harvester"
    );

    let discovery = classify(candidates, name);
    let mut summary = PassSummary::default();

    // Orphans go first so a re-created primary never sees a stale shadow
    for orphan in find_orphan_shadows(&discovery) {
        summary.total += 1;
        let orphan_name = orphan.name_any();
        match ctx.store.delete_deployment(namespace, &orphan_name).await {
            Ok(()) | Err(StoreError::NotFound(_)) => {
                info!(harvester = ?name, deployment = ?orphan_name, "Deleted orphan shadow");
                if let Some(ref metrics) = ctx.metrics {
                    metrics.record_orphan_deleted();
                }
            }
            Err(e) => {
                warn!(harvester = ?name, deployment = ?orphan_name, error = %e, "Failed to delete orphan shadow");
                summary.failed += 1;
            }
        }
    }

    let force = segment_changed(&harvester);
    let pair_ctx = PairContext {
        ctx,
        harvester: &harvester,
        namespace,
        discovery: &discovery,
        force,
    };

    let pending: Vec<_> = discovery
        .primaries
        .iter()
        .map(|primary| pair_ctx.converge(primary))
        .collect();
    let outcomes: Vec<PairOutcome> = stream::iter(pending)
        .buffer_unordered(ctx.max_concurrent_pairs.max(1))
        .collect()
        .await;

    for outcome in outcomes {
        summary.total += 1;
        match outcome {
            PairOutcome::Converged(pair) => summary.ledger.push(pair),
            PairOutcome::Failed { primary, error } => {
                warn!(harvester = ?name, deployment = ?primary, error = %error, "Pair failed to converge");
                if let Some(ref metrics) = ctx.metrics {
                    metrics.record_pair_failure();
                }
                summary.failed += 1;
            }
            PairOutcome::Abandoned(primary) => {
                debug!(harvester = ?name, deployment = ?primary, "Pair abandoned on shutdown");
                summary.abandoned += 1;
            }
        }
    }
    summary.ledger.sort_by(|a, b| a.green.cmp(&b.green));
    if let Some(ref metrics) = ctx.metrics {
        metrics.set_pairs(namespace, name, &summary.ledger);
    }

    let now = ctx.clock.now();
    let written = persist_status(
        ctx.store.as_ref(),
        &ctx.conflict_backoff,
        namespace,
        name,
        |latest| desired_status(latest, &summary, now),
    )
    .await?;
    debug!(harvester = ?name, status_written = ?written, "Status persisted");

    if summary.failed > 0 {
        return Err(ReconcileError::PartialFailure {
            failed: summary.failed,
            total: summary.total,
        });
    }

    info!(
        harvester = ?name,
        pairs = summary.ledger.len(),
        "Harvester reconciled"
    );
    Ok(Action::requeue(ctx.resync))
}

enum PairOutcome {
    Converged(ControlledDeployment),
    Failed {
        primary: String,
        error: ReconcileError,
    },
    Abandoned(String),
}

/// Everything a single pair needs, shared across the concurrent pair tasks
struct PairContext<'a> {
    ctx: &'a Context,
    harvester: &'a Harvester,
    namespace: &'a str,
    discovery: &'a Discovery,
    force: bool,
}

impl PairContext<'_> {
    fn harvester_name(&self) -> String {
        self.harvester.name_any()
    }

    async fn converge(&self, primary: &Deployment) -> PairOutcome {
        let primary_name = primary.name_any();
        if self.ctx.is_shutting_down() {
            return PairOutcome::Abandoned(primary_name);
        }

        let result = match read_role(primary) {
            Role::Unset => self.bootstrap(primary).await,
            Role::Primary | Role::Shadow => match self.find_shadow(primary).await {
                Ok(Some(shadow)) => self.converge_pair(&primary_name, &shadow).await,
                Ok(None) => {
                    info!(
                        harvester = ?self.harvester_name(),
                        deployment = ?primary_name,
                        "Shadow missing, bootstrapping again"
                    );
                    self.bootstrap(primary).await
                }
                Err(e) => Err(e),
            },
        };

        match result {
            Ok(pair) => PairOutcome::Converged(pair),
            Err(error) => PairOutcome::Failed {
                primary: primary_name,
                error,
            },
        }
    }

    /// Resolve the counterpart shadow among the matched ones, then directly
    async fn find_shadow(&self, primary: &Deployment) -> Result<Option<String>, ReconcileError> {
        let primary_name = primary.name_any();
        let shadow = read_counterpart(primary).unwrap_or_else(|| shadow_name(&primary_name));

        if self.discovery.shadow_named(&shadow).is_some() {
            return Ok(Some(shadow));
        }

        let harvester_name = self.harvester_name();
        match self.ctx.store.get_deployment(self.namespace, &shadow).await? {
            Some(found) if is_shadow_of(&found, &primary_name, &harvester_name) => Ok(Some(shadow)),
            _ => Ok(None),
        }
    }

    /// Create the shadow and mark the primary, preserving the primary's total
    async fn bootstrap(&self, primary: &Deployment) -> Result<ControlledDeployment, ReconcileError> {
        let spec = &self.harvester.spec;
        let harvester_name = self.harvester_name();
        let primary_name = primary.name_any();
        let shadow = shadow_name(&primary_name);

        let sized_from = live_replicas(primary);
        let (blue, green) = blue_green_replicas(sized_from, spec.segment_size);
        let sidecar = sidecar_container(&self.ctx.sidecar, spec.app_port, &spec.refinery, self.namespace);
        let desired = build_shadow(primary, &harvester_name, blue, sidecar)?;

        match self.ctx.store.create_deployment(self.namespace, &desired).await {
            Ok(_) => {
                info!(
                    harvester = ?harvester_name,
                    deployment = ?primary_name,
                    shadow = ?shadow,
                    blue,
                    green,
                    "Created shadow"
                );
                if let Some(ref metrics) = self.ctx.metrics {
                    metrics.record_shadow_created();
                }
            }
            Err(StoreError::AlreadyExists(_)) => {
                // Left behind by a pass that died before marking the primary
                self.adopt_shadow(&primary_name, &shadow, blue).await?;
            }
            Err(e) => return Err(e.into()),
        }

        // Until it is marked the primary still carries the whole workload, so its
        // freshest count is the total to split
        let (total, green) = with_conflict_retry(&self.ctx.conflict_backoff, "mark primary", || async {
            let mut latest = self.get_required(&primary_name).await?;
            let total = live_replicas(&latest);
            let (_, green) = blue_green_replicas(total, spec.segment_size);
            write_primary_markers(&mut latest, &shadow, &harvester_name, green);
            set_replicas(&mut latest, green);
            self.ctx.store.replace_deployment(self.namespace, &latest).await?;
            Ok((total, green))
        })
        .await?;

        if total == sized_from {
            return Ok(ControlledDeployment {
                green: primary_name,
                green_replicas: green,
                blue: shadow,
                blue_replicas: blue,
            });
        }

        info!(
            harvester = ?harvester_name,
            deployment = ?primary_name,
            from = sized_from,
            to = total,
            "Primary rescaled during bootstrap, resizing shadow"
        );
        self.rebalance(&primary_name, &shadow, total, (green, blue)).await
    }

    async fn adopt_shadow(&self, primary: &str, shadow: &str, blue: i32) -> Result<(), ReconcileError> {
        let harvester_name = self.harvester_name();

        let adopted = with_conflict_retry(&self.ctx.conflict_backoff, "adopt shadow", || async {
            let mut latest = self.get_required(shadow).await?;
            if !is_shadow_of(&latest, primary, &harvester_name) {
                return Ok(false);
            }
            if live_replicas(&latest) != blue || read_applied_replicas(&latest) != Some(blue) {
                set_replicas(&mut latest, blue);
                write_applied_replicas(&mut latest, blue);
                self.ctx.store.replace_deployment(self.namespace, &latest).await?;
            }
            Ok(true)
        })
        .await?;
        if !adopted {
            return Err(ReconcileError::ShadowNameTaken(shadow.to_string()));
        }

        info!(harvester = ?harvester_name, deployment = ?primary, shadow = ?shadow, "Adopted existing shadow");
        Ok(())
    }

    /// Bring an existing pair to the desired split
    ///
    /// A pair is left alone when both sides still run the count last applied to
    /// them and the segment has not changed. Otherwise the live sum is split again.
    async fn converge_pair(&self, primary: &str, shadow: &str) -> Result<ControlledDeployment, ReconcileError> {
        let green_side = self.get_required(primary).await?;
        let blue_side = self.get_required(shadow).await?;
        let live_green = live_replicas(&green_side);
        let live_blue = live_replicas(&blue_side);

        let settled = read_applied_replicas(&green_side) == Some(live_green)
            && read_applied_replicas(&blue_side) == Some(live_blue);
        if settled && !self.force {
            debug!(harvester = ?self.harvester_name(), deployment = ?primary, "Pair already converged");
            return Ok(ControlledDeployment {
                green: primary.to_string(),
                green_replicas: live_green,
                blue: shadow.to_string(),
                blue_replicas: live_blue,
            });
        }

        let pair = self
            .rebalance(primary, shadow, live_green + live_blue, (live_green, live_blue))
            .await?;
        info!(
            harvester = ?self.harvester_name(),
            deployment = ?primary,
            green = pair.green_replicas,
            blue = pair.blue_replicas,
            "Pair scaled"
        );
        Ok(pair)
    }

    /// Split `total` across the pair, one side at a time
    ///
    /// `expected` holds the (green, blue) counts each side is believed to run. A side
    /// found at another count was scaled by someone else: the difference is added
    /// to `total` and the split is recomputed before anything more is written, so
    /// replicas written by this pass are never counted twice.
    async fn rebalance(
        &self,
        primary: &str,
        shadow: &str,
        mut total: i32,
        mut expected: (i32, i32),
    ) -> Result<ControlledDeployment, ReconcileError> {
        let segment_size = self.harvester.spec.segment_size;

        for _ in 0..self.ctx.conflict_backoff.max_attempts.max(1) {
            let (blue, green) = blue_green_replicas(total, segment_size);

            match self.scale_side(primary, expected.0, green).await? {
                SideScale::Scaled => expected.0 = green,
                SideScale::Drifted(live) => {
                    total += live - expected.0;
                    expected.0 = live;
                    continue;
                }
            }
            match self.scale_side(shadow, expected.1, blue).await? {
                SideScale::Scaled => expected.1 = blue,
                SideScale::Drifted(live) => {
                    total += live - expected.1;
                    expected.1 = live;
                    continue;
                }
            }

            return Ok(ControlledDeployment {
                green: primary.to_string(),
                green_replicas: green,
                blue: shadow.to_string(),
                blue_replicas: blue,
            });
        }

        Err(StoreError::Conflict(format!(
            "pair {}/{} kept being rescaled while rebalancing",
            primary, shadow
        ))
        .into())
    }

    /// Set `name` to `target` replicas, provided it still runs `expected`
    async fn scale_side(&self, name: &str, expected: i32, target: i32) -> Result<SideScale, StoreError> {
        with_conflict_retry(&self.ctx.conflict_backoff, "scale deployment", || async {
            let mut latest = self.get_required(name).await?;
            let live = live_replicas(&latest);
            if live != expected {
                return Ok(SideScale::Drifted(live));
            }
            if live == target && read_applied_replicas(&latest) == Some(target) {
                return Ok(SideScale::Scaled);
            }

            set_replicas(&mut latest, target);
            write_applied_replicas(&mut latest, target);
            self.ctx.store.replace_deployment(self.namespace, &latest).await?;
            Ok(SideScale::Scaled)
        })
        .await
    }

    async fn get_required(&self, name: &str) -> Result<Deployment, StoreError> {
        self.ctx
            .store
            .get_deployment(self.namespace, name)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("deployment {}/{}", self.namespace, name)))
    }
}

/// Outcome of a guarded write to one side of a pair
enum SideScale {
    Scaled,
    /// The side was found at this count instead of the expected one
    Drifted(i32),
}

fn set_replicas(deployment: &mut Deployment, replicas: i32) {
    deployment.spec.get_or_insert_with(Default::default).replicas = Some(replicas);
}
