//! Node and per-node state queries.
//!
//! Every cap is passed to the store; results are never truncated here and no
//! ordering is assumed.

use kos_model::{labels, Node, NodeStatus, OsInstance};
use kos_store::{ClusterStore, InstanceQuery, LabelSelector, StoreResult};

/// Query layer used by admission and assignment.
pub struct NodeSelector<'a> {
    store: &'a dyn ClusterStore,
}

impl<'a> NodeSelector<'a> {
    pub fn new(store: &'a dyn ClusterStore) -> Self {
        Self { store }
    }

    /// Number of nodes that are not control-plane nodes.
    pub async fn worker_count(&self) -> StoreResult<usize> {
        let selector = LabelSelector::new().does_not_exist(labels::CONTROL_PLANE);
        Ok(self.store.list_nodes(&selector, None).await?.len())
    }

    /// Number of nodes carrying the busy marker.
    pub async fn upgrading_count(&self) -> StoreResult<usize> {
        let selector = LabelSelector::new().exists(labels::UPGRADING);
        Ok(self.store.list_nodes(&selector, None).await?.len())
    }

    /// Nodes eligible for an upgrade: neither busy nor control-plane.
    pub async fn rollout_candidates(&self, limit: usize) -> StoreResult<Vec<Node>> {
        let selector = LabelSelector::new()
            .does_not_exist(labels::UPGRADING)
            .does_not_exist(labels::CONTROL_PLANE);
        self.store.list_nodes(&selector, Some(limit)).await
    }

    /// Per-node objects with the given status, in any namespace.
    pub async fn instances_with_status(
        &self,
        status: NodeStatus,
        limit: Option<usize>,
    ) -> StoreResult<Vec<OsInstance>> {
        let query = InstanceQuery::all().with_status(status);
        self.store.list_os_instances(&query, limit).await
    }

    /// Per-node objects owned by `node`, in any namespace.
    pub async fn instances_of_node(&self, node: &str) -> StoreResult<Vec<OsInstance>> {
        let query = InstanceQuery::all()
            .with_selector(LabelSelector::new().equals(labels::OSINSTANCE_NODE, node));
        self.store.list_os_instances(&query, None).await
    }
}
