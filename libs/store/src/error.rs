//! Store error types.

use kos_model::ObjectKey;
use thiserror::Error;

use crate::ObjectKind;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Store operation errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The object does not exist.
    #[error("{kind} {key} not found")]
    NotFound { kind: ObjectKind, key: ObjectKey },

    /// The object changed since it was read (optimistic concurrency).
    #[error("{kind} {key} was modified concurrently")]
    Conflict { kind: ObjectKind, key: ObjectKey },

    /// An object with the same key already exists.
    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: ObjectKind, key: ObjectKey },

    /// Failed to reach or query the backend.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Failed to run migrations.
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Migration directory not found in the current environment.
    #[error("migration directory not found; tried {tried}. Last error: {last_error}")]
    MigrationDirNotFound { tried: String, last_error: String },

    /// A stored body could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Backend failure injected or reported without a richer source.
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn not_found(kind: ObjectKind, key: ObjectKey) -> Self {
        Self::NotFound { kind, key }
    }

    pub fn conflict(kind: ObjectKind, key: ObjectKey) -> Self {
        Self::Conflict { kind, key }
    }

    /// Returns true if the object does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true if the write lost an optimistic-concurrency race.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}
