//! Harvester status computation and persistence

use crate::controller::retry::{with_conflict_retry, ConflictBackoff};
use crate::controller::store::{StoreError, WorkloadStore};
use crate::crd::harvester::{ControlledDeployment, Harvester, HarvesterStatus};
use chrono::{DateTime, Utc};

/// Outcome of one pass, as far as status is concerned
#[derive(Debug, Clone, Default)]
pub struct PassSummary {
    /// Pairs that reached their desired split, sorted by green name
    pub ledger: Vec<ControlledDeployment>,
    /// Pairs plus orphan deletions attempted
    pub total: usize,
    /// Items that failed
    pub failed: usize,
    /// Pairs skipped because the controller is shutting down
    pub abandoned: usize,
}

impl PassSummary {
    pub fn is_complete(&self) -> bool {
        self.failed == 0 && self.abandoned == 0
    }
}

/// True when `spec.segment` differs from the last applied one
pub fn segment_changed(harvester: &Harvester) -> bool {
    let applied = harvester.status.as_ref().and_then(|s| s.segment_size);
    applied != Some(harvester.spec.segment_size)
}

/// Status to write after a pass
///
/// `segment` only advances when every item of the pass succeeded. A failure
/// clears it: a pair may have been left with one side written, and only a forced
/// pass re-splits pairs whose sides still match their applied counts. Pairs
/// abandoned on shutdown were never touched, so the previous value is kept.
pub fn desired_status(
    harvester: &Harvester,
    summary: &PassSummary,
    now: DateTime<Utc>,
) -> HarvesterStatus {
    let current = harvester.status.as_ref();
    let segment_size = if summary.is_complete() {
        Some(harvester.spec.segment_size)
    } else if summary.failed > 0 {
        None
    } else {
        current.and_then(|s| s.segment_size)
    };

    let message = if summary.failed > 0 {
        format!(
            "{} of {} deployments failed to reconcile",
            summary.failed, summary.total
        )
    } else if summary.abandoned > 0 {
        format!("{} deployment pairs pending (shutdown)", summary.abandoned)
    } else {
        format!(
            "{} deployment pairs at segment {}%",
            summary.ledger.len(),
            harvester.spec.segment_size
        )
    };

    HarvesterStatus {
        segment_size,
        deployments: summary.ledger.clone(),
        message: Some(message),
        last_reconcile_time: Some(now.to_rfc3339()),
        observed_generation: harvester.metadata.generation,
    }
}

/// True when `desired` differs from `current` in anything but the timestamp
pub fn status_changed(current: Option<&HarvesterStatus>, desired: &HarvesterStatus) -> bool {
    match current {
        None => true,
        Some(current) => {
            let mut current = current.clone();
            current.last_reconcile_time = desired.last_reconcile_time.clone();
            &current != desired
        }
    }
}

/// Write the status computed by `compute` against the freshest Harvester
///
/// Returns `Ok(None)` if the Harvester is gone, `Ok(Some(false))` if the status
/// was already up to date and no write was needed.
pub async fn persist_status<F>(
    store: &dyn WorkloadStore,
    backoff: &ConflictBackoff,
    namespace: &str,
    name: &str,
    compute: F,
) -> Result<Option<bool>, StoreError>
where
    F: Fn(&Harvester) -> HarvesterStatus,
{
    with_conflict_retry(backoff, "update harvester status", || async {
        let Some(mut latest) = store.get_harvester(namespace, name).await? else {
            return Ok(None);
        };

        let desired = compute(&latest);
        if !status_changed(latest.status.as_ref(), &desired) {
            return Ok(Some(false));
        }

        latest.status = Some(desired);
        store.update_harvester_status(&latest).await?;
        Ok(Some(true))
    })
    .await
}
