//! IPAllocation reconciliation.
//!
//! A finalizer guarantees the range is returned to its pool before the
//! object can disappear. Apply events run the lifecycle; Cleanup events
//! release.

use crate::error::ControllerError;
use crate::reconciler::Reconciler;
use crds::{IP_ALLOCATION_FINALIZER, IPAllocation};
use ipam::ReconcileOutcome;
use kube::{Api, ResourceExt};
use kube_runtime::controller::Action;
use kube_runtime::finalizer::{Event, finalizer};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const KIND: &str = "IPAllocation";

impl Reconciler {
    /// Reconcile one IPAllocation behind the release finalizer
    pub async fn reconcile_ip_allocation(&self, allocation: Arc<IPAllocation>) -> Result<Action, ControllerError> {
        let namespace = allocation.namespace().unwrap_or_else(|| "default".to_string());
        let api: Api<IPAllocation> = Api::namespaced(self.client().clone(), &namespace);

        finalizer(&api, IP_ALLOCATION_FINALIZER, allocation, |event| async move {
            match event {
                Event::Apply(allocation) => self.apply_ip_allocation(&allocation).await,
                Event::Cleanup(allocation) => self.cleanup_ip_allocation(&allocation).await,
            }
        })
        .await
        .map_err(|e| ControllerError::Finalizer(Box::new(e)))
    }

    /// Drive the allocation towards Allocated (or a recorded failure)
    pub async fn apply_ip_allocation(&self, allocation: &IPAllocation) -> Result<Action, ControllerError> {
        let key = allocation.key();
        let outcome = match self.lifecycle.reconcile(allocation).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.metrics.record_error(KIND);
                error!(allocation = %key, error = %e, "IPAllocation reconcile failed");
                return Err(e.into());
            }
        };
        self.metrics.record_reconcile(KIND, outcome.as_str());

        match &outcome {
            ReconcileOutcome::Allocated { pool, range } => {
                info!(allocation = %key, %pool, %range, "Allocated addresses");
            }
            ReconcileOutcome::Resized { added, removed } => {
                info!(allocation = %key, added, removed, "Resized load-balancer holding");
            }
            ReconcileOutcome::Waiting { reason, message } => {
                warn!(allocation = %key, %reason, %message, "Allocation waiting");
            }
            ReconcileOutcome::Failed { reason, message } => {
                error!(allocation = %key, %reason, %message, "Allocation failed");
            }
            ReconcileOutcome::Released { freed } => {
                info!(allocation = %key, freed, "Released addresses");
            }
            ReconcileOutcome::Cancelled => {
                info!(allocation = %key, "Allocation disappeared before commit, reservation undone");
            }
            ReconcileOutcome::AlreadyAllocated | ReconcileOutcome::Unchanged => {
                debug!(allocation = %key, outcome = outcome.as_str(), "Nothing to do");
            }
        }

        Ok(self.policy.action_for(&key, &outcome))
    }

    /// Return the allocation's range before the finalizer is removed
    pub async fn cleanup_ip_allocation(&self, allocation: &IPAllocation) -> Result<Action, ControllerError> {
        let key = allocation.key();
        match self.lifecycle.release(allocation).await {
            Ok(outcome) => {
                self.metrics.record_reconcile(KIND, outcome.as_str());
                if let ReconcileOutcome::Released { freed } = outcome {
                    info!(allocation = %key, freed, "Released addresses before deletion");
                }
                self.policy.forget(&key);
                Ok(Action::await_change())
            }
            Err(e) => {
                self.metrics.record_error(KIND);
                error!(allocation = %key, error = %e, "Release failed, deletion stays blocked");
                Err(e.into())
            }
        }
    }
}
