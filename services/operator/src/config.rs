use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Result};
use kos_reconcile::{RequeuePolicy, DEFAULT_ERROR_REQUEUE, DEFAULT_REQUEUE_INTERVAL};
use kos_store::DbConfig;

/// Which store backend the operator runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "postgres" | "pg" => Ok(Self::Postgres),
            "memory" | "mem" => Ok(Self::Memory),
            other => bail!("unknown store backend {other:?}, expected postgres or memory"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub health_listen_addr: SocketAddr,
    pub log_level: String,
    pub store: StoreBackend,
    pub seed_path: Option<PathBuf>,
    pub requeue: RequeuePolicy,
    pub run_migrations: bool,
    pub database: DbConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let health_listen_addr = std::env::var("KOS_HEALTH_LISTEN_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8081".to_string())
            .parse()?;

        let log_level = std::env::var("KOS_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let store = std::env::var("KOS_STORE")
            .map(|v| v.parse::<StoreBackend>())
            .unwrap_or(Ok(StoreBackend::Postgres))?;

        let seed_path = std::env::var("KOS_SEED_PATH").ok().map(PathBuf::from);

        let requeue = RequeuePolicy {
            interval: secs_from_env("KOS_REQUEUE_INTERVAL_SECS", DEFAULT_REQUEUE_INTERVAL)?,
            error_delay: secs_from_env("KOS_ERROR_REQUEUE_SECS", DEFAULT_ERROR_REQUEUE)?,
        };

        let run_migrations = std::env::var("KOS_RUN_MIGRATIONS")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let database = DbConfig::from_env();

        Ok(Self {
            health_listen_addr,
            log_level,
            store,
            seed_path,
            requeue,
            run_migrations,
            database,
        })
    }
}

fn secs_from_env(name: &str, default: Duration) -> Result<Duration> {
    match std::env::var(name) {
        Ok(v) => Ok(Duration::from_secs(v.parse()?)),
        Err(_) => Ok(default),
    }
}
