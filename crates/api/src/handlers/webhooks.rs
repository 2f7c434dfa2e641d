//! Inbound webhook triggers.
//!
//! The asynchronous trigger enqueues a run and answers immediately. The
//! synchronous trigger blocks the caller until the run publishes its
//! response, which may happen on any node.

use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use flowgate_core::job::{FlowRunJob, WebhookResponse, FLOW_QUEUE};
use flowgate_core::types::RunId;
use serde::Serialize;

use crate::error::{AppError, AppResult};
use crate::response::DataResponse;
use crate::state::AppState;
use crate::ws::{notify, RealtimeEvent};

#[derive(Debug, Serialize)]
pub struct TriggeredRun {
    pub run_id: RunId,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// POST /api/v1/webhooks/{flow_id}
///
/// Enqueue a run and return its id without waiting for it.
pub async fn trigger_async(
    State(state): State<AppState>,
    Path(flow_id): Path<String>,
    body: Bytes,
) -> AppResult<impl IntoResponse> {
    let job = FlowRunJob::new(RunId::generate(), validate_flow_id(flow_id)?, parse_payload(&body));
    let job_id = state.transport.enqueue(FLOW_QUEUE, &job).await?;

    tracing::info!(run_id = %job.run_id, flow_id = %job.flow_id, job_id = %job_id, "Webhook run enqueued");
    notify(
        state.transport.as_ref(),
        RealtimeEvent::run_queued(&job.run_id, &job.flow_id, false),
    )
    .await;

    Ok(Json(DataResponse {
        data: TriggeredRun { run_id: job.run_id },
    }))
}

/// POST /api/v1/webhooks/{flow_id}/sync
///
/// Enqueue a run and reply with the response the flow produces, or 408
/// when it does not answer within the configured webhook timeout.
pub async fn trigger_sync(
    State(state): State<AppState>,
    Path(flow_id): Path<String>,
    body: Bytes,
) -> AppResult<Response> {
    let job = FlowRunJob::new(RunId::generate(), validate_flow_id(flow_id)?, parse_payload(&body))
        .synchronous();

    // Register before enqueuing so a fast run cannot complete unobserved.
    let wait = state.watcher.register(job.run_id.clone())?;
    state.transport.enqueue(FLOW_QUEUE, &job).await?;
    tracing::info!(run_id = %job.run_id, flow_id = %job.flow_id, "Synchronous webhook run enqueued");
    notify(
        state.transport.as_ref(),
        RealtimeEvent::run_queued(&job.run_id, &job.flow_id, true),
    )
    .await;

    let response = wait.wait(state.config.webhook_timeout).await?;
    Ok(into_http_response(response))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn validate_flow_id(flow_id: String) -> AppResult<String> {
    let trimmed = flow_id.trim();
    if trimmed.is_empty() {
        return Err(AppError::BadRequest("flow id must not be empty".into()));
    }
    Ok(trimmed.to_string())
}

/// Webhook bodies are JSON when they parse as JSON, otherwise text.
fn parse_payload(body: &Bytes) -> serde_json::Value {
    if body.is_empty() {
        return serde_json::Value::Null;
    }
    serde_json::from_slice(body)
        .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(body).into_owned()))
}

/// Render the flow's reply: a null body is empty, a string body is text,
/// anything else is JSON.
pub fn into_http_response(reply: WebhookResponse) -> Response {
    let status = StatusCode::from_u16(reply.status).unwrap_or_else(|_| {
        tracing::warn!(status = reply.status, "Flow returned an invalid status code");
        StatusCode::INTERNAL_SERVER_ERROR
    });

    let (default_type, body) = match reply.body {
        serde_json::Value::Null => (None, Body::empty()),
        serde_json::Value::String(text) => (Some("text/plain; charset=utf-8"), Body::from(text)),
        other => (Some("application/json"), Body::from(other.to_string())),
    };

    let mut response = Response::new(body);
    *response.status_mut() = status;

    let headers = response.headers_mut();
    for (name, value) in &reply.headers {
        match (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => tracing::warn!(header = %name, "Dropping invalid response header from flow"),
        }
    }
    if let Some(content_type) = default_type {
        if !headers.contains_key(CONTENT_TYPE) {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        }
    }
    response
}
