//! Controller background worker.
//!
//! Drives reconcile cycles from store notifications and requeue deadlines:
//! - An applied desired-state object is reconciled right away
//! - A deleted desired-state object is dropped from the queue
//! - A deleted node triggers cleanup of its per-node objects
//! - Each cycle's [`Action`] decides when the object is visited again
//!
//! On startup, and whenever notifications were missed, every desired-state
//! object is listed and queued.

use std::collections::BTreeMap;

use kos_model::ObjectKey;
use kos_reconcile::{Action, RequeuePolicy};
use kos_store::{EventOp, ObjectKind, SharedStore, StoreEvent};
use tokio::sync::{broadcast::error::RecvError, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use super::reconciler::OsReconciler;
use crate::cleanup::CleanupHandler;

/// Pending reconcile deadlines, one per desired-state object.
#[derive(Debug, Default)]
pub struct RequeueQueue {
    deadlines: BTreeMap<ObjectKey, Instant>,
}

impl RequeueQueue {
    /// Schedule `key` at `at`. An earlier pending deadline wins.
    pub fn schedule(&mut self, key: ObjectKey, at: Instant) {
        self.deadlines
            .entry(key)
            .and_modify(|current| *current = (*current).min(at))
            .or_insert(at);
    }

    pub fn remove(&mut self, key: &ObjectKey) {
        self.deadlines.remove(key);
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.values().min().copied()
    }

    /// Remove and return every key due at `now`.
    pub fn take_due(&mut self, now: Instant) -> Vec<ObjectKey> {
        let due: Vec<ObjectKey> = self
            .deadlines
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &due {
            self.deadlines.remove(key);
        }
        due
    }
}

/// Controller worker that turns notifications into reconcile cycles.
pub struct ControllerWorker {
    store: SharedStore,
    reconciler: OsReconciler,
    cleanup: CleanupHandler,
    policy: RequeuePolicy,
}

impl ControllerWorker {
    /// Create a new controller worker.
    pub fn new(store: SharedStore, policy: RequeuePolicy) -> Self {
        Self {
            reconciler: OsReconciler::new(store.clone(), policy),
            cleanup: CleanupHandler::new(store.clone()),
            store,
            policy,
        }
    }

    /// Run the controller until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let error_requeue_ms =
            u64::try_from(self.policy.error_delay.as_millis()).unwrap_or(u64::MAX);
        info!(
            requeue_interval_secs = self.policy.interval.as_secs(),
            error_requeue_ms,
            "Starting controller worker"
        );

        // Subscribe before the first listing so nothing falls in between.
        let mut events = self.store.subscribe();
        let mut queue = RequeueQueue::default();
        let mut resync_at = Some(Instant::now());

        loop {
            let wake = match (queue.next_deadline(), resync_at) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };

            tokio::select! {
                _ = sleep_until(wake) => {
                    let now = Instant::now();
                    if resync_at.is_some_and(|at| at <= now) {
                        resync_at = self.resync(&mut queue).await;
                    }
                    self.run_due(&mut queue).await;
                }
                event = events.recv() => match event {
                    Ok(event) => self.handle_event(event, &mut queue).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Missed store notifications, resyncing");
                        resync_at = Some(Instant::now());
                    }
                    Err(RecvError::Closed) => {
                        warn!("Store notification stream closed, stopping controller");
                        break;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Controller worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Queue every desired-state object. Returns when to try again if the
    /// listing failed.
    async fn resync(&self, queue: &mut RequeueQueue) -> Option<Instant> {
        match self.store.list_os().await {
            Ok(objects) => {
                let now = Instant::now();
                debug!(count = objects.len(), "Queued desired-state objects");
                for os in objects {
                    queue.schedule(os.metadata.key(), now);
                }
                None
            }
            Err(e) => {
                error!(error = %e, "Failed to list desired-state objects");
                Some(Instant::now() + self.policy.error_delay)
            }
        }
    }

    async fn run_due(&self, queue: &mut RequeueQueue) {
        for key in queue.take_due(Instant::now()) {
            let action = self.reconciler.reconcile(&key).await;
            self.requeue(queue, key, action);
        }
    }

    fn requeue(&self, queue: &mut RequeueQueue, key: ObjectKey, action: Action) {
        if let Some(delay) = self.policy.delay_for(action) {
            queue.schedule(key, Instant::now() + delay);
        }
    }

    async fn handle_event(&self, event: StoreEvent, queue: &mut RequeueQueue) {
        match (event.kind, event.op) {
            (ObjectKind::Os, EventOp::Applied) => {
                debug!(os = %event.key, "Desired state applied");
                queue.schedule(event.key, Instant::now());
            }
            (ObjectKind::Os, EventOp::Deleted) => {
                debug!(os = %event.key, "Desired state deleted");
                queue.remove(&event.key);
            }
            (ObjectKind::Node, EventOp::Deleted) => {
                if let Err(e) = self.cleanup.handle_node_deleted(&event.key.name).await {
                    error!(node = %event.key.name, error = %e, "Failed to clean up after node");
                }
            }
            _ => {}
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
