//! Reconciliation loop primitives.
//!
//! This library provides helpers for implementing reconciliation loops
//! that converge observed per-node state toward a desired state. Key concepts:
//!
//! - **Action**: what the caller asks the trigger mechanism to do next.
//! - **Budget**: how many additional nodes may start work this cycle.
//! - **Requeue policy**: how actions map onto delays.
//!
//! # Invariants
//!
//! - Budgets are recomputed from observed state every cycle, never carried
//!   across invocations
//! - A cycle never assigns more work than the budget it started with
//! - No retry with backoff happens inside a cycle; all temporal retry is
//!   expressed as an [`Action`]

use std::time::Duration;

/// What the trigger mechanism should do after a reconcile cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Nothing to do until the object changes again.
    AwaitChange,

    /// A transient failure happened; retry after the short error delay.
    RequeueNow,

    /// Work remains or the budget was exhausted; check again later.
    RequeueAfter(Duration),
}

/// Maps actions onto concrete delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequeuePolicy {
    /// Delay used for scheduled retries.
    pub interval: Duration,

    /// Delay used after a transient failure.
    pub error_delay: Duration,
}

impl Default for RequeuePolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_REQUEUE_INTERVAL,
            error_delay: DEFAULT_ERROR_REQUEUE,
        }
    }
}

impl RequeuePolicy {
    /// Scheduled retry with the configured interval.
    pub fn requeue(&self) -> Action {
        Action::RequeueAfter(self.interval)
    }

    /// Delay before the next cycle, or `None` when the object should only be
    /// reconciled again on change.
    pub fn delay_for(&self, action: Action) -> Option<Duration> {
        match action {
            Action::AwaitChange => None,
            Action::RequeueNow => Some(self.error_delay),
            Action::RequeueAfter(delay) => Some(delay),
        }
    }
}

/// Admission budget for a single cycle.
///
/// `remaining` may be negative when more nodes are busy than the ceiling
/// allows (the ceiling shrank, or a previous cycle overshot). Negative and
/// zero budgets assign nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Budget {
    remaining: i64,
}

impl Budget {
    /// Budget left once `in_flight` busy nodes are subtracted from `ceiling`.
    pub fn admit(ceiling: i64, in_flight: usize) -> Self {
        let in_flight = i64::try_from(in_flight).unwrap_or(i64::MAX);
        Self {
            remaining: ceiling.saturating_sub(in_flight),
        }
    }

    /// Effective ceiling: the configured max-unavailable, capped by the
    /// number of eligible nodes.
    pub fn ceiling(max_unavailable: i64, eligible: usize) -> i64 {
        let eligible = i64::try_from(eligible).unwrap_or(i64::MAX);
        max_unavailable.min(eligible)
    }

    pub fn remaining(&self) -> i64 {
        self.remaining
    }

    /// Number of nodes that may be assigned this cycle.
    pub fn slots(&self) -> usize {
        usize::try_from(self.remaining).unwrap_or(0)
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining <= 0
    }

    /// Result cap for the candidate query: one more than the budget, so the
    /// caller can tell "saturated" from "ran out of candidates" in a single
    /// round trip. A non-positive budget still issues a one-result
    /// observation query.
    pub fn query_limit(&self) -> usize {
        self.slots().saturating_add(1)
    }

    /// Returns true if `assigned` used up the budget.
    pub fn is_reached(&self, assigned: usize) -> bool {
        i64::try_from(assigned).unwrap_or(i64::MAX) >= self.remaining
    }
}

impl std::fmt::Display for Budget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.remaining)
    }
}

/// Returns true if an observed version already matches the desired one.
///
/// Versions are opaque; only equality is meaningful.
pub fn is_current(observed: &str, desired: &str) -> bool {
    observed == desired
}

/// Default interval between scheduled cycles.
pub const DEFAULT_REQUEUE_INTERVAL: Duration = Duration::from_secs(15);

/// Default delay before retrying after a transient failure.
pub const DEFAULT_ERROR_REQUEUE: Duration = Duration::from_secs(1);
