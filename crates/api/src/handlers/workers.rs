//! Worker pull and completion endpoints.
//!
//! Both require a worker token via [`WorkerAuth`].

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use flowgate_core::job::{JobCompletion, PollRequest, FLOW_QUEUE};
use flowgate_core::types::JobId;

use crate::error::{AppError, AppResult};
use crate::middleware::auth::WorkerAuth;
use crate::response::DataResponse;
use crate::state::AppState;
use crate::ws::{notify, RealtimeEvent};

/// POST /api/v1/workers/poll
///
/// Long-poll the flow queue. Returns the next job, or 204 when none arrived
/// within the configured poll wait.
pub async fn poll(
    worker: WorkerAuth,
    State(state): State<AppState>,
    Json(input): Json<PollRequest>,
) -> AppResult<Response> {
    let consumer = input.consumer.trim();
    if consumer.is_empty() {
        return Err(AppError::BadRequest("consumer must not be empty".into()));
    }

    let job = state
        .transport
        .dequeue(FLOW_QUEUE, consumer, state.config.worker_poll_wait)
        .await?;

    match job {
        Some(job) => {
            tracing::debug!(
                consumer,
                worker = %worker.identity.subject(),
                job_id = %job.id,
                run_id = %job.job.run_id,
                "Job handed to worker"
            );
            Ok(Json(DataResponse { data: job }).into_response())
        }
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

/// POST /api/v1/workers/jobs/{job_id}/complete
///
/// Publish the run's webhook response, if any, acknowledge the job, then
/// announce the finished run to WebSocket clients.
pub async fn complete(
    worker: WorkerAuth,
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Json(input): Json<JobCompletion>,
) -> AppResult<StatusCode> {
    let job_id = JobId::new(job_id);

    if let Some(response) = input.response {
        state.watcher.publish(input.run_id.clone(), response).await?;
    }
    state.transport.ack(FLOW_QUEUE, &job_id).await?;

    tracing::info!(
        worker = %worker.identity.subject(),
        token_id = %worker.token_id,
        job_id = %job_id,
        run_id = %input.run_id,
        status = ?input.status,
        "Job completed"
    );
    notify(
        state.transport.as_ref(),
        RealtimeEvent::run_finished(&input.run_id, input.status),
    )
    .await;
    Ok(StatusCode::NO_CONTENT)
}
