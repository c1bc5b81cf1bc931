//! # kos-store
//!
//! The cluster state store consumed by the rollout controller.
//!
//! The controller needs very little from its store: get an object by name,
//! list objects matching a predicate with a result cap, update an object
//! failing if it changed since it was read, delete an object, and a stream of
//! change notifications to trigger cycles. [`ClusterStore`] captures exactly
//! that surface.
//!
//! Two backends ship:
//!
//! - [`MemoryStore`]: in-process, used by tests and development mode
//! - [`PgStore`]: Postgres-backed, with `resource_version` compare-and-update
//!   and `LISTEN/NOTIFY` change events
//!
//! Neither backend orders list results in any way callers may rely on, and
//! both enforce the result cap themselves.

mod error;
mod memory;
mod postgres;
mod selector;

pub use error::{StoreError, StoreResult};
pub use memory::{Fault, MemoryStore};
pub use postgres::{DbConfig, PgStore, NOTIFY_CHANNEL};
pub use selector::{LabelSelector, Requirement};

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use kos_model::{Node, NodeStatus, ObjectKey, Os, OsInstance};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Object kinds held by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    Os,
    Node,
    OsInstance,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Os => "os",
            ObjectKind::Node => "node",
            ObjectKind::OsInstance => "os_instance",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of change reported by a [`StoreEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOp {
    /// Object created or updated.
    Applied,
    /// Object removed.
    Deleted,
}

/// Change notification emitted by a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEvent {
    pub kind: ObjectKind,
    pub op: EventOp,
    pub key: ObjectKey,
}

impl StoreEvent {
    pub fn applied(kind: ObjectKind, key: ObjectKey) -> Self {
        Self {
            kind,
            op: EventOp::Applied,
            key,
        }
    }

    pub fn deleted(kind: ObjectKind, key: ObjectKey) -> Self {
        Self {
            kind,
            op: EventOp::Deleted,
            key,
        }
    }
}

/// Predicate for per-node state queries.
///
/// `status` is served from the store's secondary index on the status field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceQuery {
    pub status: Option<NodeStatus>,
    pub selector: LabelSelector,
}

impl InstanceQuery {
    /// All per-node objects in every namespace.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: NodeStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_selector(mut self, selector: LabelSelector) -> Self {
        self.selector = selector;
        self
    }

    /// Returns true if the object satisfies every part of the predicate.
    pub fn matches(&self, instance: &OsInstance) -> bool {
        if let Some(status) = self.status {
            if instance.spec.node_status != status {
                return false;
            }
        }
        self.selector.matches(&instance.metadata.labels)
    }
}

/// Cluster state store.
///
/// Every update is compare-and-update: the object's
/// `metadata.resource_version` must equal the stored one or the call fails
/// with [`StoreError::Conflict`]. Successful writes return the stored object
/// with its new version.
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Fetch a desired-state object.
    async fn get_os(&self, key: &ObjectKey) -> StoreResult<Os>;

    /// List every desired-state object.
    async fn list_os(&self) -> StoreResult<Vec<Os>>;

    /// Create a desired-state object.
    async fn create_os(&self, os: &Os) -> StoreResult<Os>;

    /// Fetch a node by name.
    async fn get_node(&self, name: &str) -> StoreResult<Node>;

    /// List nodes matching `selector`, returning at most `limit` of them.
    async fn list_nodes(
        &self,
        selector: &LabelSelector,
        limit: Option<usize>,
    ) -> StoreResult<Vec<Node>>;

    async fn create_node(&self, node: &Node) -> StoreResult<Node>;

    async fn update_node(&self, node: &Node) -> StoreResult<Node>;

    /// Remove a node. Emits a deletion event.
    async fn delete_node(&self, name: &str) -> StoreResult<()>;

    async fn get_os_instance(&self, key: &ObjectKey) -> StoreResult<OsInstance>;

    /// List per-node objects matching `query`, returning at most `limit`.
    async fn list_os_instances(
        &self,
        query: &InstanceQuery,
        limit: Option<usize>,
    ) -> StoreResult<Vec<OsInstance>>;

    async fn create_os_instance(&self, instance: &OsInstance) -> StoreResult<OsInstance>;

    async fn update_os_instance(&self, instance: &OsInstance) -> StoreResult<OsInstance>;

    async fn delete_os_instance(&self, key: &ObjectKey) -> StoreResult<()>;

    /// Subscribe to change notifications.
    fn subscribe(&self) -> broadcast::Receiver<StoreEvent>;

    /// Check that the backend is reachable.
    async fn health_check(&self) -> StoreResult<()>;
}

/// Shared handle to a store backend.
pub type SharedStore = Arc<dyn ClusterStore>;

/// Capacity of the change-notification channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;
