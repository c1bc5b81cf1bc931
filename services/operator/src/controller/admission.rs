//! Admission control: how many more nodes may start work this cycle.

use kos_model::NodeStatus;
use kos_reconcile::Budget;
use kos_store::StoreResult;
use tracing::debug;

use super::selector::NodeSelector;

/// Budget for the upgrade path. Busy nodes are those carrying the busy
/// marker.
pub async fn upgrade_budget(selector: &NodeSelector<'_>, ceiling: i64) -> StoreResult<Budget> {
    let busy = selector.upgrading_count().await?;
    let budget = Budget::admit(ceiling, busy);
    debug!(ceiling, busy, remaining = budget.remaining(), "Upgrade budget");
    Ok(budget)
}

/// Budget for the config path. Busy nodes are per-node objects in any
/// namespace with status `configuring`.
pub async fn config_budget(selector: &NodeSelector<'_>, ceiling: i64) -> StoreResult<Budget> {
    let busy = selector
        .instances_with_status(NodeStatus::Configuring, None)
        .await?
        .len();
    let budget = Budget::admit(ceiling, busy);
    debug!(ceiling, busy, remaining = budget.remaining(), "Config budget");
    Ok(budget)
}
