//! kos rollout operator
//!
//! Watches desired-state objects and rolls OS upgrades and configuration
//! changes across the fleet, a bounded number of nodes at a time.

use std::sync::Arc;

use anyhow::Result;
use kos_operator::{
    config::{self, StoreBackend},
    controller::ControllerWorker,
    health,
    seed::Seed,
    state::AppState,
};
use kos_store::{MemoryStore, PgStore, SharedStore};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Prefer RUST_LOG, fall back to KOS_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting kos operator");
    info!(
        health_listen_addr = %config.health_listen_addr,
        store = ?config.store,
        "Configuration loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut listener_handle = None;
    let store: SharedStore = match config.store {
        StoreBackend::Postgres => {
            let pg = match PgStore::connect(&config.database).await {
                Ok(pg) => {
                    info!("Database connection established");
                    pg
                }
                Err(e) => {
                    error!(error = %e, "Failed to connect to database");
                    return Err(e.into());
                }
            };
            if config.run_migrations {
                info!("Running database migrations");
                if let Err(e) = pg.run_migrations().await {
                    error!(error = %e, "Failed to run migrations");
                    return Err(e.into());
                }
            }
            listener_handle = Some(pg.spawn_listener(shutdown_rx.clone()));
            Arc::new(pg)
        }
        StoreBackend::Memory => {
            warn!("Using in-memory store; state is lost on exit");
            Arc::new(MemoryStore::new())
        }
    };

    if let Some(path) = &config.seed_path {
        let seed = Seed::load(path).await?;
        seed.apply(store.as_ref()).await?;
    }

    // Start controller worker in background
    let controller = ControllerWorker::new(store.clone(), config.requeue);
    let controller_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            controller.run(shutdown_rx).await;
        }
    });

    let app = health::router(AppState::new(store));
    let listener = tokio::net::TcpListener::bind(&config.health_listen_addr).await?;
    info!(addr = %config.health_listen_addr, "Health endpoints listening");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("Health server shutting down");
            })
            .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Health server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Health server error"),
                Err(e) => error!(error = %e, "Health server task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    let shutdown_timeout = std::time::Duration::from_secs(10);

    if let Err(e) = tokio::time::timeout(shutdown_timeout, controller_handle).await {
        warn!(error = %e, "Controller worker did not shut down in time");
    }

    if let Some(handle) = listener_handle {
        if let Err(e) = tokio::time::timeout(shutdown_timeout, handle).await {
            warn!(error = %e, "Store listener did not shut down in time");
        }
    }

    info!("Operator shutdown complete");
    Ok(())
}
