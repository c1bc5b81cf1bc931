//! Rollout controller behavior against the in-memory store.

use std::sync::Arc;

use kos_model::{
    labels, Configs, Node, NodeStatus, ObjectKey, ObjectMeta, OpsType, Os, OsInstance, OsSpec,
    SysConfig,
};
use kos_operator::controller::OsReconciler;
use kos_reconcile::{Action, RequeuePolicy};
use kos_store::{ClusterStore, Fault, InstanceQuery, LabelSelector, MemoryStore, ObjectKind};
use rstest::rstest;

const NS: &str = "default";

/// A store with one control-plane node and `workers` worker nodes, each with
/// an idle per-node object.
async fn fleet(workers: usize, os_image: &str) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());

    let mut control = Node::new("master-0", os_image);
    control.metadata = control.metadata.with_label(labels::CONTROL_PLANE, "");
    store.create_node(&control).await.unwrap();
    store
        .create_os_instance(&OsInstance::idle(NS, "master-0"))
        .await
        .unwrap();

    for i in 0..workers {
        let name = format!("node-{i}");
        store.create_node(&Node::new(&name, os_image)).await.unwrap();
        store
            .create_os_instance(&OsInstance::idle(NS, &name))
            .await
            .unwrap();
    }
    store
}

fn desired(ops_type: &str, max_unavailable: i64) -> Os {
    Os::new(
        ObjectMeta::namespaced(NS, "os-1"),
        OsSpec {
            ops_type: ops_type.to_string(),
            os_version: "v2".to_string(),
            max_unavailable,
            upgrade_configs: Configs::new("u2")
                .with_config(SysConfig::new("kernel.sysctl").with_content("vm.swappiness", "10")),
            sys_configs: Configs::new("s2").with_config(
                SysConfig::new("grub.cmdline.current").with_content("quiet", ""),
            ),
            ..Default::default()
        },
    )
}

fn reconciler(store: &Arc<MemoryStore>) -> OsReconciler {
    OsReconciler::new(store.clone(), RequeuePolicy::default())
}

async fn upgrading_nodes(store: &MemoryStore) -> Vec<String> {
    store
        .list_nodes(&LabelSelector::new().exists(labels::UPGRADING), None)
        .await
        .unwrap()
        .into_iter()
        .map(|n| n.name().to_string())
        .collect()
}

async fn instance(store: &MemoryStore, node: &str) -> OsInstance {
    store
        .get_os_instance(&ObjectKey::namespaced(NS, node))
        .await
        .unwrap()
}

async fn mark_busy(store: &MemoryStore, node: &str) {
    let mut node = store.get_node(node).await.unwrap();
    node.mark_upgrading();
    store.update_node(&node).await.unwrap();
}

#[tokio::test]
async fn upgrade_assigns_exactly_max_unavailable_nodes() {
    let store = fleet(5, "v1").await;
    let os = desired("upgrade", 2);

    let report = reconciler(&store)
        .run_cycle(&os, OpsType::Upgrade)
        .await
        .unwrap();
    assert_eq!(report.eligible, 5);
    assert_eq!(report.budget.remaining(), 2);
    assert_eq!(report.assigned, 2);
    assert!(report.budget_reached);

    let busy = upgrading_nodes(&store).await;
    assert_eq!(busy.len(), 2);
    for name in &busy {
        assert_eq!(instance(&store, name).await.status(), NodeStatus::Upgrading);
    }

    let idle = store
        .list_os_instances(&InstanceQuery::all().with_status(NodeStatus::Idle), None)
        .await
        .unwrap();
    // Three workers plus the control-plane node.
    assert_eq!(idle.len(), 4);
}

#[tokio::test]
async fn upgrade_work_order_is_a_staged_copy() {
    let store = fleet(1, "v1").await;
    store.create_os(&desired("upgrade", 1)).await.unwrap();

    let action = reconciler(&store)
        .try_reconcile(&ObjectKey::namespaced(NS, "os-1"))
        .await
        .unwrap();
    assert_eq!(action, RequeuePolicy::default().requeue());

    let osi = instance(&store, "node-0").await;
    assert_eq!(osi.spec.upgrade_configs.version, "u2");
    assert_eq!(osi.spec.sys_configs.version, "s2");
    assert_eq!(osi.spec.sys_configs.configs[0].model, "grub.cmdline.next");
    assert_eq!(
        osi.spec.sys_configs.configs[0].contents.get("quiet"),
        Some(&String::new())
    );

    // The desired bundle keeps its own tags.
    let os = store
        .get_os(&ObjectKey::namespaced(NS, "os-1"))
        .await
        .unwrap();
    assert_eq!(os.spec.sys_configs.configs[0].model, "grub.cmdline.current");
}

#[tokio::test]
async fn upgrade_keeps_current_bundles() {
    let store = fleet(1, "v1").await;
    let mut osi = instance(&store, "node-0").await;
    osi.spec.sys_configs = Configs::new("s2").with_config(SysConfig::new("kernel.sysctl"));
    store.update_os_instance(&osi).await.unwrap();

    reconciler(&store)
        .run_cycle(&desired("upgrade", 1), OpsType::Upgrade)
        .await
        .unwrap();

    let osi = instance(&store, "node-0").await;
    assert_eq!(osi.status(), NodeStatus::Upgrading);
    assert_eq!(osi.spec.upgrade_configs.version, "u2");
    assert_eq!(osi.spec.sys_configs.configs[0].model, "kernel.sysctl");
}

/// What the node agent does once an upgrade is applied, minus the image
/// bump: the node is back to idle and unmarked.
async fn reset_node(store: &MemoryStore, node: &str) {
    let mut osi = instance(store, node).await;
    osi.spec.node_status = NodeStatus::Idle;
    store.update_os_instance(&osi).await.unwrap();

    let mut n = store.get_node(node).await.unwrap();
    n.metadata.labels.remove(labels::UPGRADING);
    store.update_node(&n).await.unwrap();
}

#[tokio::test]
async fn assigned_bundle_does_not_follow_later_desired_changes() {
    let store = fleet(1, "v1").await;
    let mut os = desired("upgrade", 1);

    reconciler(&store)
        .run_cycle(&os, OpsType::Upgrade)
        .await
        .unwrap();
    let assigned = instance(&store, "node-0").await;

    os.spec.sys_configs.version = "s9".to_string();
    os.spec.sys_configs.configs[0]
        .contents
        .insert("quiet".to_string(), "changed".to_string());
    os.spec.upgrade_configs.configs[0]
        .contents
        .insert("vm.swappiness".to_string(), "60".to_string());

    let osi = instance(&store, "node-0").await;
    assert_eq!(osi.spec, assigned.spec);
    assert_eq!(osi.spec.sys_configs.version, "s2");
    assert_eq!(
        osi.spec.sys_configs.configs[0].contents.get("quiet"),
        Some(&String::new())
    );
    assert_eq!(
        osi.spec.upgrade_configs.configs[0].contents.get("vm.swappiness"),
        Some(&"10".to_string())
    );

    // Edits on the node side stay on the node side too.
    let mut edited = osi.clone();
    edited.spec.sys_configs.configs[0].model = "kernel.sysctl".to_string();
    store.update_os_instance(&edited).await.unwrap();
    assert_eq!(os.spec.sys_configs.configs[0].model, "grub.cmdline.current");
}

#[tokio::test]
async fn staged_tags_return_to_desired_arrangement_across_cycles() {
    let store = fleet(1, "v1").await;
    let mut os = desired("upgrade", 1);
    os.spec.sys_configs = Configs::new("s2")
        .with_config(SysConfig::new("grub.cmdline.current").with_content("quiet", ""))
        .with_config(SysConfig::new("kernel.sysctl").with_content("vm.swappiness", "10"))
        .with_config(SysConfig::new("grub.cmdline.next").with_content("debug", ""));
    let reconciler = reconciler(&store);

    reconciler.run_cycle(&os, OpsType::Upgrade).await.unwrap();
    let first = instance(&store, "node-0").await;
    let models: Vec<&str> = first
        .spec
        .sys_configs
        .configs
        .iter()
        .map(|c| c.model.as_str())
        .collect();
    assert_eq!(
        models,
        ["grub.cmdline.next", "kernel.sysctl", "grub.cmdline.current"]
    );

    // The node stays on v1, so the next cycle picks it again with the new
    // bundle version.
    reset_node(&store, "node-0").await;
    os.spec.sys_configs.version = "s3".to_string();
    os.spec.sys_configs.configs[1]
        .contents
        .insert("vm.swappiness".to_string(), "30".to_string());

    let report = reconciler.run_cycle(&os, OpsType::Upgrade).await.unwrap();
    assert_eq!(report.assigned, 1);

    let second = instance(&store, "node-0").await;
    assert_eq!(second.status(), NodeStatus::Upgrading);
    assert_eq!(second.spec.sys_configs.version, "s3");
    let models: Vec<&str> = second
        .spec
        .sys_configs
        .configs
        .iter()
        .map(|c| c.model.as_str())
        .collect();
    assert_eq!(
        models,
        ["grub.cmdline.next", "kernel.sysctl", "grub.cmdline.current"]
    );
    assert_eq!(
        second.spec.sys_configs.configs[1].contents.get("vm.swappiness"),
        Some(&"30".to_string())
    );

    // Staging the node's copy again gives back exactly the desired bundle.
    let mut restaged = second.spec.sys_configs.clone();
    assert!(restaged.stage().is_empty());
    assert_eq!(restaged, os.spec.sys_configs);
}

#[tokio::test]
async fn busy_nodes_use_up_the_budget() {
    let store = fleet(5, "v1").await;
    mark_busy(&store, "node-0").await;
    mark_busy(&store, "node-1").await;
    let writes = store.update_count();

    let report = reconciler(&store)
        .run_cycle(&desired("upgrade", 2), OpsType::Upgrade)
        .await
        .unwrap();
    assert_eq!(report.budget.remaining(), 0);
    assert_eq!(report.assigned, 0);
    assert!(report.budget_reached);
    assert_eq!(store.update_count(), writes);
}

#[rstest]
#[case(0)]
#[case(-3)]
#[tokio::test]
async fn non_positive_budget_writes_nothing(#[case] max_unavailable: i64) {
    let store = fleet(3, "v1").await;

    let report = reconciler(&store)
        .run_cycle(&desired("upgrade", max_unavailable), OpsType::Upgrade)
        .await
        .unwrap();
    assert_eq!(report.assigned, 0);
    assert_eq!(store.update_count(), 0);
    assert!(upgrading_nodes(&store).await.is_empty());
}

#[rstest]
#[case(5, 2, 0)]
#[case(5, 2, 1)]
#[case(3, 5, 0)]
#[case(4, 4, 3)]
#[case(6, 1, 0)]
#[tokio::test]
async fn assignments_never_exceed_starting_budget(
    #[case] workers: usize,
    #[case] max_unavailable: i64,
    #[case] busy: usize,
) {
    let store = fleet(workers, "v1").await;
    for i in 0..busy {
        mark_busy(&store, &format!("node-{i}")).await;
    }

    let report = reconciler(&store)
        .run_cycle(&desired("upgrade", max_unavailable), OpsType::Upgrade)
        .await
        .unwrap();
    assert!(report.assigned <= report.budget.slots());

    let ceiling = max_unavailable.min(workers as i64);
    let now_busy = upgrading_nodes(&store).await.len();
    assert_eq!(now_busy, busy + report.assigned);
    assert!(now_busy as i64 <= ceiling.max(busy as i64));
}

#[tokio::test]
async fn up_to_date_fleet_is_left_alone() {
    let store = fleet(3, "v2").await;

    let report = reconciler(&store)
        .run_cycle(&desired("upgrade", 2), OpsType::Upgrade)
        .await
        .unwrap();
    assert_eq!(report.assigned, 0);
    assert!(!report.budget_reached);
    assert_eq!(store.update_count(), 0);
}

#[tokio::test]
async fn control_plane_nodes_are_never_assigned() {
    let store = fleet(1, "v1").await;

    let report = reconciler(&store)
        .run_cycle(&desired("upgrade", 5), OpsType::Upgrade)
        .await
        .unwrap();
    assert_eq!(report.eligible, 1);
    assert_eq!(report.assigned, 1);
    assert_eq!(upgrading_nodes(&store).await, vec!["node-0".to_string()]);
    assert_eq!(instance(&store, "master-0").await.status(), NodeStatus::Idle);
}

#[tokio::test]
async fn node_without_per_node_object_is_skipped() {
    let store = fleet(3, "v1").await;
    store
        .delete_os_instance(&ObjectKey::namespaced(NS, "node-0"))
        .await
        .unwrap();

    let report = reconciler(&store)
        .run_cycle(&desired("upgrade", 1), OpsType::Upgrade)
        .await
        .unwrap();
    assert_eq!(report.assigned, 1);
    assert_eq!(upgrading_nodes(&store).await, vec!["node-1".to_string()]);
}

#[tokio::test]
async fn unreadable_per_node_object_is_skipped() {
    let store = fleet(3, "v1").await;
    store
        .inject(Fault::FailGet(ObjectKind::OsInstance, "node-0".to_string()))
        .await;

    let report = reconciler(&store)
        .run_cycle(&desired("upgrade", 1), OpsType::Upgrade)
        .await
        .unwrap();
    assert_eq!(report.assigned, 1);
    assert_eq!(upgrading_nodes(&store).await, vec!["node-1".to_string()]);
}

#[tokio::test]
async fn conflicting_work_order_write_skips_node() {
    let store = fleet(3, "v1").await;
    store
        .inject(Fault::ConflictOnUpdate(ObjectKind::OsInstance, "node-0".to_string()))
        .await;

    let report = reconciler(&store)
        .run_cycle(&desired("upgrade", 1), OpsType::Upgrade)
        .await
        .unwrap();
    assert_eq!(report.assigned, 1);
    assert_eq!(upgrading_nodes(&store).await, vec!["node-1".to_string()]);
    assert_eq!(instance(&store, "node-0").await.status(), NodeStatus::Idle);
}

#[tokio::test]
async fn failed_node_label_write_is_not_counted_or_rolled_back() {
    let store = fleet(3, "v1").await;
    store
        .inject(Fault::ConflictOnUpdate(ObjectKind::Node, "node-0".to_string()))
        .await;

    let report = reconciler(&store)
        .run_cycle(&desired("upgrade", 1), OpsType::Upgrade)
        .await
        .unwrap();
    assert_eq!(report.assigned, 1);
    assert_eq!(upgrading_nodes(&store).await, vec!["node-1".to_string()]);
    // The per-node write already landed and stays.
    assert_eq!(instance(&store, "node-0").await.status(), NodeStatus::Upgrading);
}

#[tokio::test]
async fn config_updates_only_stale_idle_nodes() {
    let store = fleet(2, "v2").await;
    let mut current = instance(&store, "node-0").await;
    current.spec.sys_configs = Configs::new("cfgA");
    store.update_os_instance(&current).await.unwrap();
    let mut stale = instance(&store, "node-1").await;
    stale.spec.sys_configs = Configs::new("cfgOld");
    store.update_os_instance(&stale).await.unwrap();
    let mut master = instance(&store, "master-0").await;
    master.spec.sys_configs = Configs::new("cfgA");
    store.update_os_instance(&master).await.unwrap();

    let mut os = desired("config", 2);
    os.spec.sys_configs = Configs::new("cfgA")
        .with_config(SysConfig::new("kernel.sysctl").with_content("net.ipv4.ip_forward", "1"));

    let report = reconciler(&store)
        .run_cycle(&os, OpsType::Config)
        .await
        .unwrap();
    assert_eq!(report.assigned, 1);
    assert!(!report.budget_reached);

    let updated = instance(&store, "node-1").await;
    assert_eq!(updated.status(), NodeStatus::Configuring);
    assert_eq!(updated.spec.sys_configs, os.spec.sys_configs);

    let untouched = instance(&store, "node-0").await;
    assert_eq!(untouched.status(), NodeStatus::Idle);
    assert_eq!(untouched.spec.sys_configs.version, "cfgA");
}

#[tokio::test]
async fn configuring_nodes_use_up_the_config_budget() {
    let store = fleet(3, "v2").await;
    for name in ["node-0", "node-1"] {
        let mut osi = instance(&store, name).await;
        osi.spec.node_status = NodeStatus::Configuring;
        store.update_os_instance(&osi).await.unwrap();
    }
    let writes = store.update_count();

    let report = reconciler(&store)
        .run_cycle(&desired("config", 2), OpsType::Config)
        .await
        .unwrap();
    assert_eq!(report.assigned, 0);
    assert!(report.budget_reached);
    assert_eq!(store.update_count(), writes);
}

#[tokio::test]
async fn config_counts_node_before_its_write() {
    let store = fleet(2, "v2").await;
    store
        .inject(Fault::ConflictOnUpdate(ObjectKind::OsInstance, "master-0".to_string()))
        .await;
    store
        .inject(Fault::ConflictOnUpdate(ObjectKind::OsInstance, "node-0".to_string()))
        .await;

    let report = reconciler(&store)
        .run_cycle(&desired("config", 1), OpsType::Config)
        .await
        .unwrap();
    assert_eq!(report.assigned, 1);
    assert!(report.budget_reached);
    assert_eq!(store.update_count(), 0);
}

#[tokio::test]
async fn config_path_spans_every_namespace() {
    let store = fleet(1, "v2").await;
    let mut elsewhere = OsInstance::idle("staging", "node-0");
    elsewhere.spec.sys_configs = Configs::new("cfgOld");
    store.create_os_instance(&elsewhere).await.unwrap();

    // Two workers' worth of ceiling, one already taken in another namespace.
    store.create_node(&Node::new("node-1", "v2")).await.unwrap();
    let mut configuring = OsInstance::idle("staging", "node-1");
    configuring.spec.node_status = NodeStatus::Configuring;
    store.create_os_instance(&configuring).await.unwrap();

    let report = reconciler(&store)
        .run_cycle(&desired("config", 2), OpsType::Config)
        .await
        .unwrap();
    assert_eq!(report.eligible, 2);
    assert_eq!(report.budget.remaining(), 1);
    assert_eq!(report.assigned, 1);
    assert!(report.budget_reached);

    let configuring = store
        .list_os_instances(
            &InstanceQuery::all().with_status(NodeStatus::Configuring),
            None,
        )
        .await
        .unwrap();
    assert_eq!(configuring.len(), 2);
}

#[tokio::test]
async fn unknown_operation_requeues_without_writes() {
    let store = fleet(3, "v1").await;
    store.create_os(&desired("reboot", 2)).await.unwrap();

    let action = reconciler(&store)
        .try_reconcile(&ObjectKey::namespaced(NS, "os-1"))
        .await
        .unwrap();
    assert_eq!(action, RequeuePolicy::default().requeue());
    assert_eq!(store.update_count(), 0);
}

#[tokio::test]
async fn missing_desired_state_awaits_change() {
    let store = fleet(3, "v1").await;

    let action = reconciler(&store)
        .reconcile(&ObjectKey::namespaced(NS, "absent"))
        .await;
    assert_eq!(action, Action::AwaitChange);
}

#[tokio::test]
async fn store_failure_requeues_immediately() {
    let store = fleet(3, "v1").await;
    store.create_os(&desired("upgrade", 2)).await.unwrap();
    store.inject(Fault::FailList(ObjectKind::Node)).await;

    let key = ObjectKey::namespaced(NS, "os-1");
    let reconciler = reconciler(&store);
    assert!(reconciler.try_reconcile(&key).await.is_err());
    assert_eq!(reconciler.reconcile(&key).await, Action::RequeueNow);

    store.clear_faults().await;
    assert_eq!(
        reconciler.reconcile(&key).await,
        RequeuePolicy::default().requeue()
    );
    assert_eq!(upgrading_nodes(&store).await.len(), 2);
}

#[tokio::test]
async fn rollback_follows_the_upgrade_path() {
    let store = fleet(2, "v3").await;
    store.create_os(&desired("rollback", 1)).await.unwrap();

    reconciler(&store)
        .reconcile(&ObjectKey::namespaced(NS, "os-1"))
        .await;
    assert_eq!(upgrading_nodes(&store).await, vec!["node-0".to_string()]);
}
