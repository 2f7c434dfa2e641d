pub mod health;
pub mod webhooks;
pub mod workers;

use axum::routing::get;
use axum::Router;

use crate::state::AppState;
use crate::ws;

/// Build the `/api/v1` route tree.
///
/// ```text
/// /ws                                    real-time events (GET upgrade, worker token)
///
/// /webhooks/{flow_id}                    trigger a run (POST)
/// /webhooks/{flow_id}/sync               trigger and wait for its response (POST)
///
/// /workers/poll                          long-poll the next job (POST, worker token)
/// /workers/jobs/{job_id}/complete        report a finished job (POST, worker token)
/// ```
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .nest("/webhooks", webhooks::router())
        .nest("/workers", workers::router())
}
