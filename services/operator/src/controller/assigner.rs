//! Rollout assignment: picks nodes within the budget and writes their work
//! orders.
//!
//! Only failures of the candidate query propagate. A failed write for one
//! node is logged and that node is skipped until the next cycle.

use kos_model::{Configs, Node, NodeStatus, ObjectKey, Os, OsInstance};
use kos_reconcile::{is_current, Budget};
use kos_store::{ClusterStore, StoreError, StoreResult};
use tracing::{debug, error, info, warn};

use super::selector::NodeSelector;

/// Outcome of one assignment pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assignment {
    /// Nodes that received a work order this pass.
    pub assigned: usize,

    /// Whether `assigned` used up the budget.
    pub budget_reached: bool,
}

impl Assignment {
    fn new(budget: Budget, assigned: usize) -> Self {
        Self {
            assigned,
            budget_reached: budget.is_reached(assigned),
        }
    }
}

/// Upgrade (or rollback) path.
///
/// A node counts only once both its per-node object and its busy label have
/// been written.
pub async fn assign_upgrade(
    store: &dyn ClusterStore,
    os: &Os,
    budget: Budget,
) -> StoreResult<Assignment> {
    let candidates = NodeSelector::new(store)
        .rollout_candidates(budget.query_limit())
        .await?;
    debug!(candidates = candidates.len(), budget = %budget, "Upgrade candidates");

    let mut assigned = 0;
    for node in candidates {
        if assigned >= budget.slots() {
            break;
        }
        if is_current(&node.os_image, &os.spec.os_version) {
            continue;
        }

        let key = ObjectKey {
            namespace: os.metadata.namespace.clone(),
            name: node.name().to_string(),
        };
        let instance = match store.get_os_instance(&key).await {
            Ok(instance) => instance,
            Err(e) if e.is_not_found() => {
                debug!(node = %node.name(), "No per-node object yet, skipping node");
                continue;
            }
            Err(e) => {
                error!(node = %node.name(), error = %e, "Failed to get per-node object");
                continue;
            }
        };

        if start_upgrade(store, os, node, instance).await.is_ok() {
            assigned += 1;
        }
    }

    Ok(Assignment::new(budget, assigned))
}

async fn start_upgrade(
    store: &dyn ClusterStore,
    os: &Os,
    mut node: Node,
    mut instance: OsInstance,
) -> Result<(), StoreError> {
    if instance.spec.upgrade_configs.version != os.spec.upgrade_configs.version {
        instance.spec.upgrade_configs = os.spec.upgrade_configs.clone();
    }
    if instance.spec.sys_configs.version != os.spec.sys_configs.version {
        instance.spec.sys_configs = os.spec.sys_configs.clone();
        for model in instance.spec.sys_configs.stage() {
            error!(node = %node.name(), model = %model, "Config model cannot be recognized");
        }
    }
    instance.spec.node_status = NodeStatus::Upgrading;

    if let Err(e) = store.update_os_instance(&instance).await {
        log_write_failure(node.name(), "per-node object", &e);
        return Err(e);
    }

    node.mark_upgrading();
    if let Err(e) = store.update_node(&node).await {
        log_write_failure(node.name(), "node", &e);
        return Err(e);
    }

    info!(
        node = %node.name(),
        os_version = %os.spec.os_version,
        "Node assigned for upgrade"
    );
    Ok(())
}

/// Config path.
///
/// A node is counted before its write is attempted, so a failed write still
/// uses a slot this cycle.
pub async fn assign_config(
    store: &dyn ClusterStore,
    desired: &Configs,
    budget: Budget,
) -> StoreResult<Assignment> {
    let candidates = NodeSelector::new(store)
        .instances_with_status(NodeStatus::Idle, Some(budget.query_limit()))
        .await?;
    debug!(candidates = candidates.len(), budget = %budget, "Config candidates");

    let mut assigned = 0;
    for mut instance in candidates {
        if assigned >= budget.slots() {
            break;
        }
        if is_current(&instance.spec.sys_configs.version, &desired.version) {
            continue;
        }

        assigned += 1;
        instance.spec.sys_configs = desired.clone();
        instance.spec.node_status = NodeStatus::Configuring;
        match store.update_os_instance(&instance).await {
            Ok(_) => info!(
                node = %instance.name(),
                version = %desired.version,
                "Node assigned for configuration"
            ),
            Err(e) => log_write_failure(instance.name(), "per-node object", &e),
        }
    }

    Ok(Assignment::new(budget, assigned))
}

fn log_write_failure(node: &str, object: &str, e: &StoreError) {
    if e.is_conflict() {
        warn!(node = %node, object, "Object changed concurrently, skipping node");
    } else {
        error!(node = %node, object, error = %e, "Failed to write work order");
    }
}
