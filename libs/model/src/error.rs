//! Error types for the object model.

use thiserror::Error;

/// Errors raised while interpreting object fields.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModelError {
    /// The operation kind of a desired-state object is not recognized.
    #[error("operation {0} cannot be recognized")]
    UnknownOpsType(String),

    /// A per-node status string is not recognized.
    #[error("unknown node status: {0}")]
    UnknownNodeStatus(String),
}
