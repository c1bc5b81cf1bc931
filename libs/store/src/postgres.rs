//! Postgres-backed store.
//!
//! All kinds share one `cluster_objects` table keyed by
//! `(kind, namespace, name)`. The full object is kept as JSONB in `body`;
//! labels and the per-node status are mirrored into their own columns so the
//! GIN index on labels and the btree index on status serve list queries.
//!
//! Compare-and-update is a conditional `UPDATE ... WHERE resource_version =
//! $n`. A trigger publishes every change on [`NOTIFY_CHANNEL`], which
//! [`PgStore::spawn_listener`] forwards to subscribers.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use kos_model::{Node, ObjectKey, ObjectMeta, Os, OsInstance};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgListener, PgPool, PgPoolOptions, PgRow, Postgres};
use sqlx::{QueryBuilder, Row};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::{
    ClusterStore, EventOp, InstanceQuery, LabelSelector, ObjectKind, Requirement, StoreError,
    StoreEvent, StoreResult, EVENT_CHANNEL_CAPACITY,
};

/// Channel the change trigger publishes on.
pub const NOTIFY_CHANNEL: &str = "kos_object_events";

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Database connection URL.
    pub database_url: String,

    /// Maximum number of connections in the pool.
    pub max_connections: u32,

    /// Minimum number of idle connections.
    pub min_connections: u32,

    /// Connection acquire timeout.
    pub acquire_timeout: Duration,

    /// Idle connection timeout.
    pub idle_timeout: Duration,

    /// Maximum lifetime of a connection.
    pub max_lifetime: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/kos".to_string(),
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
        }
    }
}

impl DbConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgres://localhost/kos".to_string());

        let max_connections = std::env::var("DB_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10);

        let min_connections = std::env::var("DB_MIN_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(1);

        Self {
            database_url,
            max_connections,
            min_connections,
            ..Default::default()
        }
    }
}

/// Payload published by the change trigger.
#[derive(Debug, Deserialize)]
struct ChangeNotification {
    kind: ObjectKind,
    op: EventOp,
    namespace: String,
    name: String,
}

impl From<ChangeNotification> for StoreEvent {
    fn from(n: ChangeNotification) -> Self {
        let key = ObjectKey {
            namespace: (!n.namespace.is_empty()).then_some(n.namespace),
            name: n.name,
        };
        StoreEvent {
            kind: n.kind,
            op: n.op,
            key,
        }
    }
}

/// Stored representation shared by every kind.
trait StoredObject: Serialize + DeserializeOwned + Clone {
    const KIND: ObjectKind;

    fn meta(&self) -> &ObjectMeta;
    fn meta_mut(&mut self) -> &mut ObjectMeta;

    /// Value mirrored into the `node_status` column.
    fn status_column(&self) -> Option<&'static str> {
        None
    }

    fn key(&self) -> ObjectKey {
        self.meta().key()
    }
}

impl StoredObject for Os {
    const KIND: ObjectKind = ObjectKind::Os;

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

impl StoredObject for Node {
    const KIND: ObjectKind = ObjectKind::Node;

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn key(&self) -> ObjectKey {
        ObjectKey::cluster_scoped(self.name())
    }
}

impl StoredObject for OsInstance {
    const KIND: ObjectKind = ObjectKind::OsInstance;

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn status_column(&self) -> Option<&'static str> {
        Some(self.spec.node_status.as_str())
    }
}

fn decode<T: StoredObject>(row: &PgRow) -> StoreResult<T> {
    let version: i64 = row.try_get("resource_version")?;
    let body: serde_json::Value = row.try_get("body")?;
    let mut object: T = serde_json::from_value(body)?;
    object.meta_mut().resource_version = u64::try_from(version).ok();
    Ok(object)
}

/// Body as persisted: the version lives in its own column only.
fn encode<T: StoredObject>(object: &T) -> StoreResult<(serde_json::Value, serde_json::Value)> {
    let mut body = object.clone();
    body.meta_mut().resource_version = None;
    let labels = serde_json::to_value(&object.meta().labels)?;
    Ok((serde_json::to_value(body)?, labels))
}

fn push_selector(qb: &mut QueryBuilder<'_, Postgres>, selector: &LabelSelector) {
    for requirement in selector.requirements() {
        match requirement {
            Requirement::Exists(key) => {
                qb.push(" AND labels ? ").push_bind(key.clone());
            }
            Requirement::DoesNotExist(key) => {
                qb.push(" AND NOT (labels ? ").push_bind(key.clone()).push(")");
            }
            Requirement::Equals(key, value) => {
                qb.push(" AND labels ->> ")
                    .push_bind(key.clone())
                    .push(" = ")
                    .push_bind(value.clone());
            }
        }
    }
}

fn push_limit(qb: &mut QueryBuilder<'_, Postgres>, limit: Option<usize>) {
    qb.push(" ORDER BY namespace, name");
    if let Some(limit) = limit {
        qb.push(" LIMIT ")
            .push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
    }
}

/// Postgres-backed cluster store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    events: broadcast::Sender<StoreEvent>,
}

impl PgStore {
    /// Connect a new pool.
    pub async fn connect(config: &DbConfig) -> StoreResult<Self> {
        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Connecting to database"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(Some(config.idle_timeout))
            .max_lifetime(Some(config.max_lifetime))
            .connect(&config.database_url)
            .await?;

        info!("Database connection pool established");

        Ok(Self::from_pool(pool))
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { pool, events }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run pending migrations.
    ///
    /// Migrations are loaded at runtime from the first directory that exists.
    pub async fn run_migrations(&self) -> StoreResult<()> {
        info!("Running database migrations");

        let candidates = vec![
            PathBuf::from("./migrations"),
            PathBuf::from("libs/store/migrations"),
            PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("migrations"),
        ];
        let mut last_error: Option<sqlx::migrate::MigrateError> = None;

        for dir in &candidates {
            match sqlx::migrate::Migrator::new(dir.clone()).await {
                Ok(migrator) => {
                    info!(migrations_dir = %dir.display(), "Loaded migrations");
                    migrator.run(&self.pool).await?;
                    info!("Database migrations complete");
                    return Ok(());
                }
                Err(e) => {
                    last_error = Some(e);
                }
            }
        }

        let tried = candidates
            .iter()
            .map(|dir| dir.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");

        Err(StoreError::MigrationDirNotFound {
            tried,
            last_error: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown error".to_string()),
        })
    }

    /// Forward change notifications to subscribers until shutdown.
    ///
    /// The listener connection reconnects on its own; a failed `recv` is
    /// logged and retried after a short pause.
    pub fn spawn_listener(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let pool = self.pool.clone();
        let events = self.events.clone();

        tokio::spawn(async move {
            let mut listener = loop {
                match PgListener::connect_with(&pool).await {
                    Ok(mut listener) => match listener.listen(NOTIFY_CHANNEL).await {
                        Ok(()) => break listener,
                        Err(e) => error!(error = %e, "Failed to LISTEN for object changes"),
                    },
                    Err(e) => error!(error = %e, "Failed to connect change listener"),
                }
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    _ = shutdown.changed() => return,
                }
            };
            info!(channel = NOTIFY_CHANNEL, "Listening for object changes");

            loop {
                tokio::select! {
                    received = listener.recv() => match received {
                        Ok(notification) => {
                            match serde_json::from_str::<ChangeNotification>(notification.payload()) {
                                Ok(change) => {
                                    let _ = events.send(change.into());
                                }
                                Err(e) => warn!(
                                    error = %e,
                                    payload = notification.payload(),
                                    "Ignoring malformed change notification"
                                ),
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "Change listener failed, retrying");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    },
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!("Change listener shutting down");
                            return;
                        }
                    }
                }
            }
        })
    }

    async fn get<T: StoredObject>(&self, key: &ObjectKey) -> StoreResult<T> {
        let row = sqlx::query(
            r#"
            SELECT resource_version, body
            FROM cluster_objects
            WHERE kind = $1 AND namespace = $2 AND name = $3
            "#,
        )
        .bind(T::KIND.as_str())
        .bind(key.namespace_or_empty())
        .bind(&key.name)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => decode(&row),
            None => Err(StoreError::not_found(T::KIND, key.clone())),
        }
    }

    async fn fetch_all<T: StoredObject>(
        &self,
        mut qb: QueryBuilder<'_, Postgres>,
    ) -> StoreResult<Vec<T>> {
        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(|row| decode::<T>(row)).collect()
    }

    async fn create<T: StoredObject>(&self, object: &T) -> StoreResult<T> {
        let key = object.key();
        let (body, labels) = encode(object)?;

        let row = sqlx::query(
            r#"
            INSERT INTO cluster_objects (kind, namespace, name, labels, node_status, body)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING resource_version
            "#,
        )
        .bind(T::KIND.as_str())
        .bind(key.namespace_or_empty())
        .bind(&key.name)
        .bind(&labels)
        .bind(object.status_column())
        .bind(&body)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e {
                if db_err.code().as_deref() == Some("23505") {
                    return StoreError::AlreadyExists {
                        kind: T::KIND,
                        key: key.clone(),
                    };
                }
            }
            StoreError::Database(e)
        })?;

        let version: i64 = row.try_get("resource_version")?;
        let mut stored = object.clone();
        stored.meta_mut().resource_version = u64::try_from(version).ok();
        Ok(stored)
    }

    async fn update<T: StoredObject>(&self, object: &T) -> StoreResult<T> {
        let key = object.key();
        let Some(expected) = object
            .meta()
            .resource_version
            .and_then(|v| i64::try_from(v).ok())
        else {
            return Err(StoreError::conflict(T::KIND, key));
        };
        let (body, labels) = encode(object)?;

        let row = sqlx::query(
            r#"
            UPDATE cluster_objects
            SET body = $1,
                labels = $2,
                node_status = $3,
                resource_version = resource_version + 1,
                updated_at = now()
            WHERE kind = $4 AND namespace = $5 AND name = $6 AND resource_version = $7
            RETURNING resource_version
            "#,
        )
        .bind(&body)
        .bind(&labels)
        .bind(object.status_column())
        .bind(T::KIND.as_str())
        .bind(key.namespace_or_empty())
        .bind(&key.name)
        .bind(expected)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            // Either gone or changed since it was read.
            let exists: Option<i64> = sqlx::query_scalar(
                "SELECT resource_version FROM cluster_objects WHERE kind = $1 AND namespace = $2 AND name = $3",
            )
            .bind(T::KIND.as_str())
            .bind(key.namespace_or_empty())
            .bind(&key.name)
            .fetch_optional(&self.pool)
            .await?;
            return Err(match exists {
                Some(_) => StoreError::conflict(T::KIND, key),
                None => StoreError::not_found(T::KIND, key),
            });
        };

        let version: i64 = row.try_get("resource_version")?;
        let mut stored = object.clone();
        stored.meta_mut().resource_version = u64::try_from(version).ok();
        let kind = T::KIND;
        debug!(kind = %kind, key = %key, version, "Object updated");
        Ok(stored)
    }

    async fn delete(&self, kind: ObjectKind, key: &ObjectKey) -> StoreResult<()> {
        let result = sqlx::query(
            "DELETE FROM cluster_objects WHERE kind = $1 AND namespace = $2 AND name = $3",
        )
        .bind(kind.as_str())
        .bind(key.namespace_or_empty())
        .bind(&key.name)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found(kind, key.clone()));
        }
        Ok(())
    }
}

fn select(kind: ObjectKind) -> QueryBuilder<'static, Postgres> {
    let mut qb =
        QueryBuilder::new("SELECT resource_version, body FROM cluster_objects WHERE kind = ");
    qb.push_bind(kind.as_str());
    qb
}

#[async_trait]
impl ClusterStore for PgStore {
    async fn get_os(&self, key: &ObjectKey) -> StoreResult<Os> {
        self.get(key).await
    }

    async fn list_os(&self) -> StoreResult<Vec<Os>> {
        let mut qb = select(ObjectKind::Os);
        push_limit(&mut qb, None);
        self.fetch_all(qb).await
    }

    async fn create_os(&self, os: &Os) -> StoreResult<Os> {
        self.create(os).await
    }

    async fn get_node(&self, name: &str) -> StoreResult<Node> {
        self.get(&ObjectKey::cluster_scoped(name)).await
    }

    async fn list_nodes(
        &self,
        selector: &LabelSelector,
        limit: Option<usize>,
    ) -> StoreResult<Vec<Node>> {
        let mut qb = select(ObjectKind::Node);
        push_selector(&mut qb, selector);
        push_limit(&mut qb, limit);
        self.fetch_all(qb).await
    }

    async fn create_node(&self, node: &Node) -> StoreResult<Node> {
        self.create(node).await
    }

    async fn update_node(&self, node: &Node) -> StoreResult<Node> {
        self.update(node).await
    }

    async fn delete_node(&self, name: &str) -> StoreResult<()> {
        self.delete(ObjectKind::Node, &ObjectKey::cluster_scoped(name))
            .await
    }

    async fn get_os_instance(&self, key: &ObjectKey) -> StoreResult<OsInstance> {
        self.get(key).await
    }

    async fn list_os_instances(
        &self,
        query: &InstanceQuery,
        limit: Option<usize>,
    ) -> StoreResult<Vec<OsInstance>> {
        let mut qb = select(ObjectKind::OsInstance);
        if let Some(status) = query.status {
            qb.push(" AND node_status = ").push_bind(status.as_str());
        }
        push_selector(&mut qb, &query.selector);
        push_limit(&mut qb, limit);
        self.fetch_all(qb).await
    }

    async fn create_os_instance(&self, instance: &OsInstance) -> StoreResult<OsInstance> {
        self.create(instance).await
    }

    async fn update_os_instance(&self, instance: &OsInstance) -> StoreResult<OsInstance> {
        self.update(instance).await
    }

    async fn delete_os_instance(&self, key: &ObjectKey) -> StoreResult<()> {
        self.delete(ObjectKind::OsInstance, key).await
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    async fn health_check(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_config_defaults() {
        let config = DbConfig::default();
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.min_connections, 1);
    }

    #[test]
    fn test_change_notification_decodes() {
        let payload = r#"{"kind":"node","op":"deleted","namespace":"","name":"node-1"}"#;
        let event: StoreEvent = serde_json::from_str::<ChangeNotification>(payload)
            .unwrap()
            .into();
        assert_eq!(
            event,
            StoreEvent::deleted(ObjectKind::Node, ObjectKey::cluster_scoped("node-1"))
        );
    }

    #[test]
    fn test_selector_sql() {
        let mut qb = select(ObjectKind::Node);
        push_selector(
            &mut qb,
            &LabelSelector::new()
                .exists("busy")
                .does_not_exist("control-plane")
                .equals("pool", "a"),
        );
        push_limit(&mut qb, Some(3));
        assert_eq!(
            qb.sql(),
            "SELECT resource_version, body FROM cluster_objects WHERE kind = $1 \
             AND labels ? $2 AND NOT (labels ? $3) AND labels ->> $4 = $5 \
             ORDER BY namespace, name LIMIT $6"
        );
    }
}
