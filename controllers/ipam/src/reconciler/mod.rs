//! Reconciliation logic for IPAllocation and NetworkPool.
//!
//! - `ip_allocation`: drives the allocation lifecycle behind a finalizer
//! - `network_pool`: keeps pool status and usage metrics current

pub mod ip_allocation;
pub mod network_pool;

use crate::backoff::FibonacciBackoff;
use crate::config::ControllerConfig;
use crate::metrics::IpamMetrics;
use ipam::{LifecycleController, ReconcileOutcome};
use kube::Client;
use kube_runtime::controller::Action;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Backoff state for a resource
#[derive(Debug, Clone)]
struct BackoffState {
    backoff: FibonacciBackoff,
    error_count: u32,
}

impl BackoffState {
    fn new(min_seconds: u64, max_seconds: u64) -> Self {
        Self {
            backoff: FibonacciBackoff::new(min_seconds, max_seconds),
            error_count: 0,
        }
    }

    fn reset(&mut self) {
        self.error_count = 0;
        self.backoff.reset();
    }
}

/// Requeue decisions with per-resource Fibonacci backoff
#[derive(Debug)]
pub struct RequeuePolicy {
    min_seconds: u64,
    max_seconds: u64,
    resync: Duration,
    /// namespace/name -> BackoffState
    states: Mutex<HashMap<String, BackoffState>>,
}

impl RequeuePolicy {
    /// Policy using the configured backoff bounds and resync interval
    pub fn new(config: &ControllerConfig) -> Self {
        Self {
            min_seconds: config.backoff_min_seconds,
            max_seconds: config.backoff_max_seconds,
            resync: config.resync,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Resync interval for settled resources
    pub fn resync(&self) -> Duration {
        self.resync
    }

    /// Next backoff delay for `key`, counting one more failure
    ///
    /// Returns (delay, consecutive failures including this one)
    pub fn backoff(&self, key: &str) -> (Duration, u32) {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        let state = states
            .entry(key.to_string())
            .or_insert_with(|| BackoffState::new(self.min_seconds, self.max_seconds));
        state.error_count += 1;
        (state.backoff.next_backoff(), state.error_count)
    }

    /// Forget failures of `key` after a success
    pub fn reset(&self, key: &str) {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(state) = states.get_mut(key) {
            state.reset();
        }
    }

    /// Drop all state for `key` once the resource is gone
    pub fn forget(&self, key: &str) {
        self.states.lock().unwrap_or_else(PoisonError::into_inner).remove(key);
    }

    /// Requeue action for a completed allocation reconcile
    pub fn action_for(&self, key: &str, outcome: &ReconcileOutcome) -> Action {
        match outcome {
            ReconcileOutcome::Waiting { .. } => Action::requeue(self.backoff(key).0),
            ReconcileOutcome::Cancelled | ReconcileOutcome::Released { .. } => {
                self.forget(key);
                Action::await_change()
            }
            _ => {
                self.reset(key);
                Action::requeue(self.resync)
            }
        }
    }
}

/// Shared state handed to every reconcile
pub struct Reconciler {
    client: Client,
    pub(crate) lifecycle: Arc<LifecycleController>,
    pub(crate) metrics: Arc<IpamMetrics>,
    pub(crate) policy: RequeuePolicy,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("lifecycle", &self.lifecycle)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Creates a new reconciler instance.
    pub fn new(
        client: Client,
        lifecycle: Arc<LifecycleController>,
        metrics: Arc<IpamMetrics>,
        config: &ControllerConfig,
    ) -> Self {
        Self {
            client,
            lifecycle,
            metrics,
            policy: RequeuePolicy::new(config),
        }
    }

    /// Kubernetes client for finalizer patches
    pub(crate) fn client(&self) -> &Client {
        &self.client
    }
}
