//! Prometheus metrics for reconciles and pool usage.

use crds::NetworkPoolStatus;
use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};

const PREFIX: &str = "butler_ipam";

/// Counters and gauges exported on `/metrics`
#[derive(Clone)]
pub struct IpamMetrics {
    registry: Registry,
    reconciles: IntCounterVec,
    reconcile_errors: IntCounterVec,
    pool_allocated: IntGaugeVec,
    pool_available: IntGaugeVec,
    pool_fragmentation: IntGaugeVec,
}

impl std::fmt::Debug for IpamMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpamMetrics").finish_non_exhaustive()
    }
}

impl IpamMetrics {
    /// Create and register every metric on a fresh registry
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let reconciles = IntCounterVec::new(
            Opts::new(format!("{PREFIX}_reconciles_total"), "Reconciles by resource kind and outcome"),
            &["kind", "outcome"],
        )?;
        registry.register(Box::new(reconciles.clone()))?;

        let reconcile_errors = IntCounterVec::new(
            Opts::new(format!("{PREFIX}_reconcile_errors_total"), "Reconciles that returned an error"),
            &["kind"],
        )?;
        registry.register(Box::new(reconcile_errors.clone()))?;

        let pool_allocated = IntGaugeVec::new(
            Opts::new(format!("{PREFIX}_pool_allocated_ips"), "Addresses held by allocations"),
            &["namespace", "pool"],
        )?;
        registry.register(Box::new(pool_allocated.clone()))?;

        let pool_available = IntGaugeVec::new(
            Opts::new(format!("{PREFIX}_pool_available_ips"), "Free addresses"),
            &["namespace", "pool"],
        )?;
        registry.register(Box::new(pool_available.clone()))?;

        let pool_fragmentation = IntGaugeVec::new(
            Opts::new(
                format!("{PREFIX}_pool_fragmentation_percent"),
                "Share of free addresses outside the largest free block",
            ),
            &["namespace", "pool"],
        )?;
        registry.register(Box::new(pool_fragmentation.clone()))?;

        Ok(Self {
            registry,
            reconciles,
            reconcile_errors,
            pool_allocated,
            pool_available,
            pool_fragmentation,
        })
    }

    /// Count one reconcile of `kind` ending in `outcome`
    pub fn record_reconcile(&self, kind: &str, outcome: &str) {
        self.reconciles.with_label_values(&[kind, outcome]).inc();
    }

    /// Count one failed reconcile of `kind`
    pub fn record_error(&self, kind: &str) {
        self.reconcile_errors.with_label_values(&[kind]).inc();
    }

    /// Publish a pool's usage gauges
    pub fn observe_pool(&self, namespace: &str, pool: &str, status: &NetworkPoolStatus) {
        let labels = [namespace, pool];
        self.pool_allocated
            .with_label_values(&labels)
            .set(i64::try_from(status.allocated_ips).unwrap_or(i64::MAX));
        self.pool_available
            .with_label_values(&labels)
            .set(i64::try_from(status.available_ips).unwrap_or(i64::MAX));
        self.pool_fragmentation
            .with_label_values(&labels)
            .set(i64::from(status.fragmentation_percent.unwrap_or(0)));
    }

    /// Drop the gauges of a pool that no longer exists
    pub fn forget_pool(&self, namespace: &str, pool: &str) {
        let labels = [namespace, pool];
        for gauge in [&self.pool_allocated, &self.pool_available, &self.pool_fragmentation] {
            let _ = gauge.remove_label_values(&labels);
        }
    }

    /// Text exposition of every registered metric
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
