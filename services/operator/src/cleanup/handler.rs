//! Deletion of the per-node objects a removed node leaves behind.

use kos_store::{SharedStore, StoreResult};
use tracing::{error, info, instrument};

use crate::controller::NodeSelector;

/// Outcome of cleaning up after one removed node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub found: usize,
    pub deleted: usize,
    /// Objects that disappeared between the list and the delete.
    pub already_gone: usize,
    pub failed: usize,
}

/// Removes per-node state left behind by deleted nodes.
#[derive(Clone)]
pub struct CleanupHandler {
    store: SharedStore,
}

impl CleanupHandler {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    /// Delete every per-node object owned by `node`, in any namespace.
    ///
    /// Only a failure to list is returned. Individual delete failures are
    /// logged and counted; the remaining objects are still attempted.
    #[instrument(skip(self))]
    pub async fn handle_node_deleted(&self, node: &str) -> StoreResult<CleanupReport> {
        let instances = NodeSelector::new(self.store.as_ref())
            .instances_of_node(node)
            .await?;

        let mut report = CleanupReport {
            found: instances.len(),
            ..Default::default()
        };

        for instance in instances {
            let key = instance.metadata.key();
            match self.store.delete_os_instance(&key).await {
                Ok(()) => report.deleted += 1,
                Err(e) if e.is_not_found() => report.already_gone += 1,
                Err(e) => {
                    error!(osinstance = %key, error = %e, "Failed to delete per-node object");
                    report.failed += 1;
                }
            }
        }

        if report.found > 0 {
            info!(
                found = report.found,
                deleted = report.deleted,
                failed = report.failed,
                "Cleaned up per-node objects"
            );
        }

        Ok(report)
    }
}
