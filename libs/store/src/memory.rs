//! In-memory store implementation.
//!
//! Used by tests and by the operator's development mode. Objects live in
//! ordered maps behind a single lock; every write bumps a store-wide version
//! counter, so resource versions behave like the Postgres backend's.
//!
//! Faults can be injected to exercise the controller's error policies.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use kos_model::{Node, ObjectKey, Os, OsInstance};
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use crate::{
    ClusterStore, InstanceQuery, LabelSelector, ObjectKind, StoreError, StoreEvent, StoreResult,
    EVENT_CHANNEL_CAPACITY,
};

/// Injectable failure.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Fault {
    /// Updates of the named object fail as if it changed concurrently.
    ConflictOnUpdate(ObjectKind, String),

    /// Reads of the named object fail with a backend error.
    FailGet(ObjectKind, String),

    /// Every list of the kind fails with a backend error.
    FailList(ObjectKind),

    /// Deletes of the named object fail with a backend error.
    FailDelete(ObjectKind, String),
}

#[derive(Default)]
struct Objects {
    os: BTreeMap<ObjectKey, Os>,
    nodes: BTreeMap<String, Node>,
    instances: BTreeMap<ObjectKey, OsInstance>,
    version: u64,
    faults: HashSet<Fault>,
}

impl Objects {
    fn next_version(&mut self) -> u64 {
        self.version += 1;
        self.version
    }

    fn check(&self, fault: Fault) -> StoreResult<()> {
        if self.faults.contains(&fault) {
            return Err(StoreError::Unavailable(format!("injected fault: {fault:?}")));
        }
        Ok(())
    }
}

/// In-memory cluster store.
pub struct MemoryStore {
    objects: RwLock<Objects>,
    events: broadcast::Sender<StoreEvent>,
    updates: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            objects: RwLock::new(Objects::default()),
            events,
            updates: AtomicU64::new(0),
        }
    }

    /// Inject a fault. It stays active until cleared.
    pub async fn inject(&self, fault: Fault) {
        self.objects.write().await.faults.insert(fault);
    }

    /// Clear every injected fault.
    pub async fn clear_faults(&self) {
        self.objects.write().await.faults.clear();
    }

    /// Number of successful updates since creation.
    pub fn update_count(&self) -> u64 {
        self.updates.load(Ordering::SeqCst)
    }

    fn emit(&self, event: StoreEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn record_update(&self, kind: ObjectKind, key: ObjectKey) {
        self.updates.fetch_add(1, Ordering::SeqCst);
        self.emit(StoreEvent::applied(kind, key));
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_limit<T>(items: impl Iterator<Item = T>, limit: Option<usize>) -> Vec<T> {
    match limit {
        Some(limit) => items.take(limit).collect(),
        None => items.collect(),
    }
}

#[async_trait]
impl ClusterStore for MemoryStore {
    async fn get_os(&self, key: &ObjectKey) -> StoreResult<Os> {
        let objects = self.objects.read().await;
        objects.check(Fault::FailGet(ObjectKind::Os, key.name.clone()))?;
        objects
            .os
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::not_found(ObjectKind::Os, key.clone()))
    }

    async fn list_os(&self) -> StoreResult<Vec<Os>> {
        let objects = self.objects.read().await;
        objects.check(Fault::FailList(ObjectKind::Os))?;
        Ok(objects.os.values().cloned().collect())
    }

    async fn create_os(&self, os: &Os) -> StoreResult<Os> {
        let key = os.metadata.key();
        let stored = {
            let mut objects = self.objects.write().await;
            if objects.os.contains_key(&key) {
                return Err(StoreError::AlreadyExists {
                    kind: ObjectKind::Os,
                    key,
                });
            }
            let mut stored = os.clone();
            stored.metadata.resource_version = Some(objects.next_version());
            objects.os.insert(key.clone(), stored.clone());
            stored
        };
        self.emit(StoreEvent::applied(ObjectKind::Os, key));
        Ok(stored)
    }

    async fn get_node(&self, name: &str) -> StoreResult<Node> {
        let objects = self.objects.read().await;
        objects.check(Fault::FailGet(ObjectKind::Node, name.to_string()))?;
        objects
            .nodes
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::not_found(ObjectKind::Node, ObjectKey::cluster_scoped(name)))
    }

    async fn list_nodes(
        &self,
        selector: &LabelSelector,
        limit: Option<usize>,
    ) -> StoreResult<Vec<Node>> {
        let objects = self.objects.read().await;
        objects.check(Fault::FailList(ObjectKind::Node))?;
        let matching = objects
            .nodes
            .values()
            .filter(|n| selector.matches(&n.metadata.labels))
            .cloned();
        Ok(apply_limit(matching, limit))
    }

    async fn create_node(&self, node: &Node) -> StoreResult<Node> {
        let key = ObjectKey::cluster_scoped(node.name());
        let stored = {
            let mut objects = self.objects.write().await;
            if objects.nodes.contains_key(node.name()) {
                return Err(StoreError::AlreadyExists {
                    kind: ObjectKind::Node,
                    key,
                });
            }
            let mut stored = node.clone();
            stored.metadata.namespace = None;
            stored.metadata.resource_version = Some(objects.next_version());
            objects.nodes.insert(node.name().to_string(), stored.clone());
            stored
        };
        self.emit(StoreEvent::applied(ObjectKind::Node, key));
        Ok(stored)
    }

    async fn update_node(&self, node: &Node) -> StoreResult<Node> {
        let key = ObjectKey::cluster_scoped(node.name());
        let stored = {
            let mut objects = self.objects.write().await;
            if objects
                .faults
                .contains(&Fault::ConflictOnUpdate(ObjectKind::Node, node.name().to_string()))
            {
                return Err(StoreError::conflict(ObjectKind::Node, key));
            }
            let current = objects
                .nodes
                .get(node.name())
                .ok_or_else(|| StoreError::not_found(ObjectKind::Node, key.clone()))?;
            if current.metadata.resource_version != node.metadata.resource_version {
                return Err(StoreError::conflict(ObjectKind::Node, key));
            }
            let mut stored = node.clone();
            stored.metadata.resource_version = Some(objects.next_version());
            objects.nodes.insert(node.name().to_string(), stored.clone());
            stored
        };
        debug!(node = %key, "Node updated");
        self.record_update(ObjectKind::Node, key);
        Ok(stored)
    }

    async fn delete_node(&self, name: &str) -> StoreResult<()> {
        let key = ObjectKey::cluster_scoped(name);
        {
            let mut objects = self.objects.write().await;
            objects.check(Fault::FailDelete(ObjectKind::Node, name.to_string()))?;
            if objects.nodes.remove(name).is_none() {
                return Err(StoreError::not_found(ObjectKind::Node, key));
            }
        }
        self.emit(StoreEvent::deleted(ObjectKind::Node, key));
        Ok(())
    }

    async fn get_os_instance(&self, key: &ObjectKey) -> StoreResult<OsInstance> {
        let objects = self.objects.read().await;
        objects.check(Fault::FailGet(ObjectKind::OsInstance, key.name.clone()))?;
        objects
            .instances
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::not_found(ObjectKind::OsInstance, key.clone()))
    }

    async fn list_os_instances(
        &self,
        query: &InstanceQuery,
        limit: Option<usize>,
    ) -> StoreResult<Vec<OsInstance>> {
        let objects = self.objects.read().await;
        objects.check(Fault::FailList(ObjectKind::OsInstance))?;
        let matching = objects
            .instances
            .values()
            .filter(|osi| query.matches(osi))
            .cloned();
        Ok(apply_limit(matching, limit))
    }

    async fn create_os_instance(&self, instance: &OsInstance) -> StoreResult<OsInstance> {
        let key = instance.metadata.key();
        let stored = {
            let mut objects = self.objects.write().await;
            if objects.instances.contains_key(&key) {
                return Err(StoreError::AlreadyExists {
                    kind: ObjectKind::OsInstance,
                    key,
                });
            }
            let mut stored = instance.clone();
            stored.metadata.resource_version = Some(objects.next_version());
            objects.instances.insert(key.clone(), stored.clone());
            stored
        };
        self.emit(StoreEvent::applied(ObjectKind::OsInstance, key));
        Ok(stored)
    }

    async fn update_os_instance(&self, instance: &OsInstance) -> StoreResult<OsInstance> {
        let key = instance.metadata.key();
        let stored = {
            let mut objects = self.objects.write().await;
            if objects.faults.contains(&Fault::ConflictOnUpdate(
                ObjectKind::OsInstance,
                instance.name().to_string(),
            )) {
                return Err(StoreError::conflict(ObjectKind::OsInstance, key));
            }
            let current = objects
                .instances
                .get(&key)
                .ok_or_else(|| StoreError::not_found(ObjectKind::OsInstance, key.clone()))?;
            if current.metadata.resource_version != instance.metadata.resource_version {
                return Err(StoreError::conflict(ObjectKind::OsInstance, key));
            }
            let mut stored = instance.clone();
            stored.metadata.resource_version = Some(objects.next_version());
            objects.instances.insert(key.clone(), stored.clone());
            stored
        };
        debug!(osinstance = %key, status = %stored.status(), "OSInstance updated");
        self.record_update(ObjectKind::OsInstance, key);
        Ok(stored)
    }

    async fn delete_os_instance(&self, key: &ObjectKey) -> StoreResult<()> {
        {
            let mut objects = self.objects.write().await;
            objects.check(Fault::FailDelete(ObjectKind::OsInstance, key.name.clone()))?;
            if objects.instances.remove(key).is_none() {
                return Err(StoreError::not_found(ObjectKind::OsInstance, key.clone()));
            }
        }
        self.emit(StoreEvent::deleted(ObjectKind::OsInstance, key.clone()));
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    async fn health_check(&self) -> StoreResult<()> {
        Ok(())
    }
}
