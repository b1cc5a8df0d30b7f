//! Prometheus metrics for the Harvester controller
//!
//! Exposed on `/metrics` by the health server.

use crate::controller::harvester::annotations::Role;
use crate::crd::harvester::ControlledDeployment;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub type SharedMetrics = Arc<ControllerMetrics>;

pub struct ControllerMetrics {
    registry: Registry,
    reconciliations_total: IntCounterVec,
    reconcile_duration_seconds: HistogramVec,
    shadows_created_total: IntCounter,
    orphans_deleted_total: IntCounter,
    pair_failures_total: IntCounter,
    refinery_resources_created_total: IntCounterVec,
    pair_replicas: IntGaugeVec,
    /// Pairs exported per (namespace, harvester), so vanished ones can be removed
    exported_pairs: Mutex<HashMap<(String, String), Vec<ControlledDeployment>>>,
}

impl ControllerMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("kubereplay".to_string()), None)?;

        let reconciliations_total = IntCounterVec::new(
            Opts::new("reconciliations_total", "Harvester reconcile passes by result"),
            &["result"],
        )?;
        let reconcile_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "reconcile_duration_seconds",
                "Duration of Harvester reconcile passes",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &["result"],
        )?;
        let shadows_created_total = IntCounter::new(
            "shadows_created_total",
            "Shadow Deployments created",
        )?;
        let orphans_deleted_total = IntCounter::new(
            "orphans_deleted_total",
            "Orphan shadow Deployments deleted",
        )?;
        let pair_failures_total = IntCounter::new(
            "pair_failures_total",
            "Green/blue pairs that failed to converge",
        )?;
        let refinery_resources_created_total = IntCounterVec::new(
            Opts::new(
                "refinery_resources_created_total",
                "Receiver Services and Deployments created for Refineries",
            ),
            &["kind"],
        )?;
        let pair_replicas = IntGaugeVec::new(
            Opts::new("pair_replicas", "Replicas applied per side of a pair"),
            &["namespace", "harvester", "deployment", "role"],
        )?;

        registry.register(Box::new(reconciliations_total.clone()))?;
        registry.register(Box::new(reconcile_duration_seconds.clone()))?;
        registry.register(Box::new(shadows_created_total.clone()))?;
        registry.register(Box::new(orphans_deleted_total.clone()))?;
        registry.register(Box::new(pair_failures_total.clone()))?;
        registry.register(Box::new(refinery_resources_created_total.clone()))?;
        registry.register(Box::new(pair_replicas.clone()))?;

        Ok(Self {
            registry,
            reconciliations_total,
            reconcile_duration_seconds,
            shadows_created_total,
            orphans_deleted_total,
            pair_failures_total,
            refinery_resources_created_total,
            pair_replicas,
            exported_pairs: Mutex::new(HashMap::new()),
        })
    }

    pub fn record_reconciliation_success(&self, duration_secs: f64) {
        self.record_reconciliation("success", duration_secs);
    }

    pub fn record_reconciliation_error(&self, duration_secs: f64) {
        self.record_reconciliation("error", duration_secs);
    }

    /// Not the leader; no duration is recorded
    pub fn record_reconciliation_skipped(&self) {
        self.reconciliations_total
            .with_label_values(&["skipped"])
            .inc();
    }

    fn record_reconciliation(&self, result: &str, duration_secs: f64) {
        self.reconciliations_total.with_label_values(&[result]).inc();
        self.reconcile_duration_seconds
            .with_label_values(&[result])
            .observe(duration_secs);
    }

    pub fn record_shadow_created(&self) {
        self.shadows_created_total.inc();
    }

    pub fn record_orphan_deleted(&self) {
        self.orphans_deleted_total.inc();
    }

    pub fn record_pair_failure(&self) {
        self.pair_failures_total.inc();
    }

    /// `kind` is `service` or `deployment`
    pub fn record_refinery_resource_created(&self, kind: &str) {
        self.refinery_resources_created_total
            .with_label_values(&[kind])
            .inc();
    }

    /// Export the pairs a Harvester converged in its last pass
    ///
    /// Series of pairs that are no longer listed are removed.
    pub fn set_pairs(&self, namespace: &str, harvester: &str, pairs: &[ControlledDeployment]) {
        let mut exported = self.exported_pairs.lock().unwrap_or_else(|e| e.into_inner());
        let key = (namespace.to_string(), harvester.to_string());

        if let Some(previous) = exported.get(&key) {
            for stale in previous {
                if !pairs.iter().any(|p| p.green == stale.green && p.blue == stale.blue) {
                    self.remove_pair(namespace, harvester, stale);
                }
            }
        }

        for pair in pairs {
            self.pair_replicas
                .with_label_values(&[namespace, harvester, pair.green.as_str(), Role::Primary.as_str()])
                .set(i64::from(pair.green_replicas));
            self.pair_replicas
                .with_label_values(&[namespace, harvester, pair.blue.as_str(), Role::Shadow.as_str()])
                .set(i64::from(pair.blue_replicas));
        }
        exported.insert(key, pairs.to_vec());
    }

    /// Drop every series exported for a deleted Harvester
    pub fn forget_harvester(&self, namespace: &str, harvester: &str) {
        let mut exported = self.exported_pairs.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = exported.remove(&(namespace.to_string(), harvester.to_string())) {
            for pair in &previous {
                self.remove_pair(namespace, harvester, pair);
            }
        }
    }

    fn remove_pair(&self, namespace: &str, harvester: &str, pair: &ControlledDeployment) {
        // a missing series is already what we want
        let _ = self.pair_replicas.remove_label_values(&[
            namespace,
            harvester,
            pair.green.as_str(),
            Role::Primary.as_str(),
        ]);
        let _ = self.pair_replicas.remove_label_values(&[
            namespace,
            harvester,
            pair.blue.as_str(),
            Role::Shadow.as_str(),
        ]);
    }

    /// Render every registered metric in the Prometheus text format
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

pub fn create_metrics() -> Result<SharedMetrics, prometheus::Error> {
    Ok(Arc::new(ControllerMetrics::new()?))
}
