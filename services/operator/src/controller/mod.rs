//! Rollout controller.
//!
//! Converges per-node state toward the desired-state objects while keeping
//! at most `maxunavailable` nodes busy at a time.
//!
//! - `selector`: node and per-node state queries
//! - `admission`: per-cycle budget
//! - `assigner`: upgrade and config assignment
//! - `reconciler`: one cycle for one desired-state object
//! - `worker`: turns store notifications and requeues into cycles

pub mod admission;
pub mod assigner;
mod reconciler;
mod selector;
mod worker;

pub use assigner::Assignment;
pub use reconciler::{CycleReport, OsReconciler, ReconcileError, ReconcileResult};
pub use selector::NodeSelector;
pub use worker::{ControllerWorker, RequeueQueue};
