//! Initial objects loaded into the store at startup.
//!
//! Used with the in-memory backend so the operator can run without a
//! database. Objects that already exist are left alone.

use std::path::Path;

use kos_model::{Node, Os, OsInstance};
use kos_store::{ClusterStore, StoreError};
use serde::Deserialize;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum SeedError {
    #[error("failed to read seed file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid seed file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Seed document.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Seed {
    #[serde(default)]
    pub os: Vec<Os>,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub os_instances: Vec<OsInstance>,
}

/// Number of objects created by [`Seed::apply`].
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SeedCounts {
    pub os: usize,
    pub nodes: usize,
    pub os_instances: usize,
}

impl Seed {
    pub fn from_json(json: &str) -> Result<Self, SeedError> {
        Ok(serde_json::from_str(json)?)
    }

    pub async fn load(path: &Path) -> Result<Self, SeedError> {
        let json = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| SeedError::Io {
                path: path.display().to_string(),
                source,
            })?;
        Self::from_json(&json)
    }

    /// Create every object. Nodes and per-node objects go in before the
    /// desired state so the first cycle sees the whole fleet.
    pub async fn apply(&self, store: &dyn ClusterStore) -> Result<SeedCounts, SeedError> {
        let mut counts = SeedCounts::default();

        for node in &self.nodes {
            if created(store.create_node(node).await, node.name())? {
                counts.nodes += 1;
            }
        }
        for instance in &self.os_instances {
            if created(store.create_os_instance(instance).await, instance.name())? {
                counts.os_instances += 1;
            }
        }
        for os in &self.os {
            if created(store.create_os(os).await, os.name())? {
                counts.os += 1;
            }
        }

        info!(
            os = counts.os,
            nodes = counts.nodes,
            os_instances = counts.os_instances,
            "Seeded store"
        );
        Ok(counts)
    }
}

fn created<T>(result: Result<T, StoreError>, name: &str) -> Result<bool, SeedError> {
    match result {
        Ok(_) => Ok(true),
        Err(StoreError::AlreadyExists { kind, .. }) => {
            debug!(kind = %kind, name, "Seed object already exists");
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}
