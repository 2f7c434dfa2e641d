//! Route definitions for the `/workers` resource.
//!
//! All endpoints require a worker token.

use axum::routing::post;
use axum::Router;

use crate::handlers::workers;
use crate::state::AppState;

/// Routes mounted at `/workers`.
///
/// ```text
/// POST   /poll                     -> poll
/// POST   /jobs/{job_id}/complete   -> complete
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/poll", post(workers::poll))
        .route("/jobs/{job_id}/complete", post(workers::complete))
}
