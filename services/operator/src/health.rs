//! Health check endpoints for orchestration probes.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

use crate::state::AppState;

const SERVICE: &str = "kos-operator";

/// Health check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    /// "ok" or "degraded".
    pub status: String,
    pub service: String,
    pub version: String,
    /// RFC 3339 timestamp.
    pub timestamp: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub store: Option<ComponentStatus>,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ComponentStatus {
    /// "ok" or "unavailable".
    pub status: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Build the health router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/livez", get(livez))
        .with_state(state)
}

fn response(status: &str, store: Option<ComponentStatus>) -> HealthResponse {
    HealthResponse {
        status: status.to_string(),
        service: SERVICE.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
        store,
    }
}

/// The process is up. Dependencies are not checked.
async fn healthz() -> impl IntoResponse {
    Json(response("ok", None))
}

/// The store is reachable. Returns 503 otherwise.
async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    match state.store().health_check().await {
        Ok(()) => {
            let store = ComponentStatus {
                status: "ok".to_string(),
                message: None,
            };
            (StatusCode::OK, Json(response("ok", Some(store))))
        }
        Err(e) => {
            let store = ComponentStatus {
                status: "unavailable".to_string(),
                message: Some(e.to_string()),
            };
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(response("degraded", Some(store))),
            )
        }
    }
}

async fn livez() -> impl IntoResponse {
    StatusCode::OK
}
