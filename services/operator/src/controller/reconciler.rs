//! Rollout reconciler.
//!
//! One invocation is one cycle for one desired-state object:
//! - Fetch the object; a missing object needs nothing further
//! - Count eligible (non-control-plane) nodes and derive the ceiling
//! - Compute the budget for the operation kind and run its assigner
//! - Ask to be invoked again after the requeue interval
//!
//! Nothing is carried across cycles. Every count is re-read from the store.

use kos_model::{ObjectKey, OpsType, Os};
use kos_reconcile::{Action, Budget, RequeuePolicy};
use kos_store::{SharedStore, StoreError};
use tracing::{debug, error, info, instrument};

use super::admission;
use super::assigner::{self, Assignment};
use super::selector::NodeSelector;

/// Result type for reconcile operations.
pub type ReconcileResult<T> = Result<T, ReconcileError>;

/// Errors that abort a cycle.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Summary of a cycle that ran an assigner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub ops: OpsType,
    pub eligible: usize,
    pub budget: Budget,
    pub assigned: usize,
    pub budget_reached: bool,
}

/// The rollout reconciler.
#[derive(Clone)]
pub struct OsReconciler {
    store: SharedStore,
    policy: RequeuePolicy,
}

impl OsReconciler {
    /// Create a new reconciler.
    pub fn new(store: SharedStore, policy: RequeuePolicy) -> Self {
        Self { store, policy }
    }

    /// Run one cycle, mapping failures onto an immediate retry.
    pub async fn reconcile(&self, key: &ObjectKey) -> Action {
        match self.try_reconcile(key).await {
            Ok(action) => action,
            Err(e) => {
                error!(os = %key, error = %e, "Reconcile failed");
                Action::RequeueNow
            }
        }
    }

    /// Run one cycle.
    #[instrument(skip(self, key), fields(os = %key))]
    pub async fn try_reconcile(&self, key: &ObjectKey) -> ReconcileResult<Action> {
        let os = match self.store.get_os(key).await {
            Ok(os) => os,
            Err(e) if e.is_not_found() => {
                debug!("Desired state not found, nothing to do");
                return Ok(Action::AwaitChange);
            }
            Err(e) => return Err(e.into()),
        };

        let ops = match os.spec.ops() {
            Ok(ops) => ops,
            Err(e) => {
                error!(error = %e, "Operation kind cannot be recognized");
                return Ok(self.policy.requeue());
            }
        };

        let report = self.run_cycle(&os, ops).await?;
        info!(
            ops = %report.ops,
            eligible = report.eligible,
            budget = %report.budget,
            assigned = report.assigned,
            budget_reached = report.budget_reached,
            "Reconcile cycle complete"
        );
        if report.budget.is_exhausted() {
            debug!(budget = %report.budget, "No budget left, waiting for nodes to finish");
        }

        Ok(self.policy.requeue())
    }

    /// Admission and assignment for an already-fetched object.
    pub async fn run_cycle(&self, os: &Os, ops: OpsType) -> ReconcileResult<CycleReport> {
        let store = self.store.as_ref();
        let selector = NodeSelector::new(store);
        let eligible = selector.worker_count().await?;
        let ceiling = Budget::ceiling(os.spec.max_unavailable, eligible);

        let (budget, Assignment { assigned, budget_reached }) = match ops {
            OpsType::Upgrade | OpsType::Rollback => {
                let budget = admission::upgrade_budget(&selector, ceiling).await?;
                (budget, assigner::assign_upgrade(store, os, budget).await?)
            }
            OpsType::Config => {
                let budget = admission::config_budget(&selector, ceiling).await?;
                let assignment =
                    assigner::assign_config(store, &os.spec.sys_configs, budget).await?;
                (budget, assignment)
            }
        };

        Ok(CycleReport {
            ops,
            eligible,
            budget,
            assigned,
            budget_reached,
        })
    }
}
