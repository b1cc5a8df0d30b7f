//! Read-modify-write retries for optimistic concurrency conflicts
//!
//! Only [`StoreError::Conflict`] is retried. Each attempt must re-read the object it
//! is about to write, so a retry always starts from the freshest server state.

use crate::controller::store::StoreError;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Bounded backoff used between conflicting writes
#[derive(Clone, Debug)]
pub struct ConflictBackoff {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ConflictBackoff {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(200),
        }
    }
}

impl ConflictBackoff {
    /// No sleeping between attempts
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }
}

/// Run `attempt` until it succeeds, fails with a non-conflict error, or the
/// attempt budget runs out (the last conflict is returned)
pub async fn with_conflict_retry<F, Fut, T>(
    backoff: &ConflictBackoff,
    operation_name: &str,
    mut attempt: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut tries = 0u32;
    let mut delay = backoff.initial_delay;

    loop {
        tries += 1;

        match attempt().await {
            Err(e) if e.is_conflict() && tries < backoff.max_attempts.max(1) => {
                warn!(
                    operation = %operation_name,
                    attempt = tries,
                    error = %e,
                    "Write conflicted, retrying with fresh read"
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                delay = (delay * 2).min(backoff.max_delay);
            }
            other => return other,
        }
    }
}
