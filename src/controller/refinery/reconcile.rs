use crate::controller::harvester::NOT_LEADER_REQUEUE;
use crate::controller::retry::with_conflict_retry;
use crate::controller::store::StoreError;
use crate::controller::{Context, ReconcileError};
use crate::crd::refinery::{Refinery, RefineryStatus};
use kube::runtime::controller::Action;
use kube::ResourceExt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::receiver::{
    apply_receiver, build_receiver, build_service, is_owned_by, receiver_drifted,
    refinery_service_name, RECEIVER_PORT,
};
use super::validation::validate_refinery;

/// Failure backoff key; kept apart from Harvester keys of the same name
pub fn refinery_key(namespace: &str, name: &str) -> String {
    format!("refinery:{}/{}", namespace, name)
}

/// Reconcile a Refinery
///
/// Ensures the receiver Service and Deployment exist and run the spec's command
/// line, then marks the Refinery deployed. Runs on every change, not only once.
pub async fn reconcile_refinery(refinery: Arc<Refinery>, ctx: Arc<Context>) -> Result<Action, ReconcileError> {
    if !ctx.should_reconcile() {
        debug!(refinery = ?refinery.name_any(), "Skipping reconciliation - not leader");
        return Ok(Action::requeue(NOT_LEADER_REQUEUE));
    }

    let namespace = refinery
        .namespace()
        .ok_or(ReconcileError::MissingNamespace)?;
    let name = refinery.name_any();

    let result = deploy_refinery(&namespace, &name, &ctx).await;
    match &result {
        Ok(_) => ctx.failure_backoff.reset(&refinery_key(&namespace, &name)),
        Err(e) => error!(refinery = ?name, namespace = ?namespace, error = %e, "Refinery reconcile failed"),
    }
    result
}

pub fn refinery_error_policy(refinery: Arc<Refinery>, error: &ReconcileError, ctx: Arc<Context>) -> Action {
    let key = refinery_key(&refinery.namespace().unwrap_or_default(), &refinery.name_any());
    let delay = ctx.failure_backoff.next_delay(&key);
    warn!(refinery = %key, retry_in = ?delay, "Reconcile error (will retry): {:?}", error);
    Action::requeue(delay)
}

async fn deploy_refinery(namespace: &str, name: &str, ctx: &Context) -> Result<Action, ReconcileError> {
    let Some(refinery) = ctx.store.get_refinery(namespace, name).await? else {
        info!(refinery = ?name, namespace = ?namespace, "Refinery no longer exists");
        ctx.failure_backoff.reset(&refinery_key(namespace, name));
        return Ok(Action::await_change());
    };

    if let Err(validation_error) = validate_refinery(&refinery.spec) {
        error!(refinery = ?name, error = ?validation_error, "Refinery spec validation failed");
        persist_refinery_status(ctx, namespace, name, false, &validation_error).await?;
        return Err(ReconcileError::ValidationError(validation_error));
    }

    ensure_service(ctx, namespace, &refinery).await?;
    ensure_receiver(ctx, namespace, &refinery).await?;

    let message = format!(
        "receiving on {}.{}:{}",
        refinery_service_name(name),
        namespace,
        RECEIVER_PORT
    );
    persist_refinery_status(ctx, namespace, name, true, &message).await?;

    Ok(Action::requeue(ctx.resync))
}

async fn ensure_service(ctx: &Context, namespace: &str, refinery: &Refinery) -> Result<(), ReconcileError> {
    let service_name = refinery_service_name(&refinery.name_any());
    if ctx.store.get_service(namespace, &service_name).await?.is_some() {
        return Ok(());
    }

    let service = build_service(refinery)?;
    match ctx.store.create_service(namespace, &service).await {
        Ok(_) => {
            info!(refinery = ?refinery.name_any(), service = ?service_name, "Created receiver service");
            if let Some(ref metrics) = ctx.metrics {
                metrics.record_refinery_resource_created("service");
            }
            Ok(())
        }
        Err(StoreError::AlreadyExists(_)) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

enum ReceiverUpdate {
    Unchanged,
    Updated,
    Foreign,
}

async fn ensure_receiver(ctx: &Context, namespace: &str, refinery: &Refinery) -> Result<(), ReconcileError> {
    let desired = build_receiver(refinery)?;
    let deployment_name = desired.name_any();

    if ctx.store.get_deployment(namespace, &deployment_name).await?.is_none() {
        match ctx.store.create_deployment(namespace, &desired).await {
            Ok(_) => {
                info!(refinery = ?refinery.name_any(), deployment = ?deployment_name, "Created receiver deployment");
                if let Some(ref metrics) = ctx.metrics {
                    metrics.record_refinery_resource_created("deployment");
                }
                return Ok(());
            }
            // created since the read, compare it below
            Err(StoreError::AlreadyExists(_)) => {}
            Err(e) => return Err(e.into()),
        }
    }

    let update = with_conflict_retry(&ctx.conflict_backoff, "update receiver", || async {
        let mut latest = ctx
            .store
            .get_deployment(namespace, &deployment_name)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("deployment {}/{}", namespace, deployment_name)))?;
        if !is_owned_by(&latest, refinery) {
            return Ok(ReceiverUpdate::Foreign);
        }
        if !receiver_drifted(&latest, &desired) {
            return Ok(ReceiverUpdate::Unchanged);
        }

        apply_receiver(&mut latest, &desired);
        ctx.store.replace_deployment(namespace, &latest).await?;
        Ok(ReceiverUpdate::Updated)
    })
    .await?;

    match update {
        ReceiverUpdate::Unchanged => {
            debug!(refinery = ?refinery.name_any(), "Receiver up to date");
            Ok(())
        }
        ReceiverUpdate::Updated => {
            info!(refinery = ?refinery.name_any(), deployment = ?deployment_name, "Updated receiver");
            Ok(())
        }
        ReceiverUpdate::Foreign => Err(ReconcileError::ReceiverNameTaken(deployment_name)),
    }
}

/// Write `deployed` and `message` against the freshest Refinery; no write when
/// nothing changed
async fn persist_refinery_status(
    ctx: &Context,
    namespace: &str,
    name: &str,
    deployed: bool,
    message: &str,
) -> Result<(), StoreError> {
    with_conflict_retry(&ctx.conflict_backoff, "update refinery status", || async {
        let Some(mut latest) = ctx.store.get_refinery(namespace, name).await? else {
            return Ok(());
        };

        let desired = RefineryStatus {
            deployed,
            message: Some(message.to_string()),
            observed_generation: latest.metadata.generation,
        };
        if latest.status.as_ref() == Some(&desired) {
            return Ok(());
        }

        latest.status = Some(desired);
        ctx.store.update_refinery_status(&latest).await?;
        Ok(())
    })
    .await
}
