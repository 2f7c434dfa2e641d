use axum::extract::State;
use axum::{routing::get, Json, Router};
use flowgate_core::mode::QueueMode;
use serde::Serialize;

use crate::state::AppState;

/// Health check response payload.
#[derive(Serialize)]
pub struct HealthResponse {
    /// Overall service status.
    pub status: &'static str,
    /// Crate version from Cargo.toml.
    pub version: &'static str,
    pub queue_mode: QueueMode,
    /// Whether the queue answered a depth query.
    pub queue_healthy: bool,
}

/// GET /health -- returns service and queue health.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let queue_healthy = state
        .transport
        .depth(flowgate_core::job::FLOW_QUEUE)
        .await
        .is_ok();

    let status = if queue_healthy { "ok" } else { "degraded" };

    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION"),
        queue_mode: state.transport.mode(),
        queue_healthy,
    })
}

/// Mount health check routes (intended for root-level, NOT under `/api/v1`).
pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
