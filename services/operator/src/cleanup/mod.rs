//! Cleanup of per-node state for nodes that left the cluster.
//!
//! Triggered by node deletion notifications. Best effort: failures are
//! logged and retried only when the next notification for the node arrives.

mod handler;

pub use handler::{CleanupHandler, CleanupReport};
