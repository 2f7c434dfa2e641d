use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use flowgate_core::error::CoreError;
use flowgate_queue::{QueueError, WatchError};
use serde_json::json;

/// Application-level error type for HTTP handlers.
///
/// Wraps [`CoreError`] for domain errors and the queue layer's errors, and
/// adds HTTP-specific variants. Implements [`IntoResponse`] to produce
/// consistent JSON error responses.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Watch(#[from] WatchError),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Convenience type alias for handler return values.
pub type AppResult<T> = Result<T, AppError>;

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            // --- CoreError variants ---
            AppError::Core(core) => match core {
                CoreError::NotFound { entity, id } => (
                    StatusCode::NOT_FOUND,
                    "NOT_FOUND",
                    format!("{entity} with id {id} not found"),
                ),
                CoreError::Validation(msg) => {
                    (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone())
                }
                CoreError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),
                CoreError::Unauthorized(msg) => {
                    (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg.clone())
                }
                CoreError::Forbidden(msg) => (StatusCode::FORBIDDEN, "FORBIDDEN", msg.clone()),
                CoreError::Config(msg) | CoreError::Internal(msg) => {
                    tracing::error!(error = %msg, "Internal core error");
                    internal()
                }
            },

            // --- Webhook waits ---
            AppError::Watch(watch) => match watch {
                WatchError::Timeout { .. } => (
                    StatusCode::REQUEST_TIMEOUT,
                    "WEBHOOK_TIMEOUT",
                    "The flow did not respond in time".to_string(),
                ),
                WatchError::Conflict(run_id) => (
                    StatusCode::CONFLICT,
                    "CONFLICT",
                    format!("Run {run_id} already has a pending response"),
                ),
                WatchError::Shutdown => unavailable("Server is shutting down"),
                WatchError::Queue(err) => classify_queue_error(err),
            },

            // --- Queue transport ---
            AppError::Queue(err) => classify_queue_error(err),

            // --- HTTP-specific errors ---
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            AppError::InternalError(msg) => {
                tracing::error!(error = %msg, "Internal error");
                internal()
            }
        };

        let body = json!({
            "error": message,
            "code": code,
        });

        (status, axum::Json(body)).into_response()
    }
}

/// Broker outages are 503 so callers retry; anything else is a 500.
fn classify_queue_error(err: &QueueError) -> (StatusCode, &'static str, String) {
    match err {
        QueueError::Connection(_) | QueueError::Broker(_) => {
            tracing::error!(error = %err, "Queue unavailable");
            unavailable("Queue is unavailable")
        }
        other => {
            tracing::error!(error = %other, "Queue error");
            internal()
        }
    }
}

fn unavailable(message: &str) -> (StatusCode, &'static str, String) {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        "SERVICE_UNAVAILABLE",
        message.to_string(),
    )
}

fn internal() -> (StatusCode, &'static str, String) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "INTERNAL_ERROR",
        "An internal error occurred".to_string(),
    )
}
