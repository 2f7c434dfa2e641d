//! HTTP client a worker uses to pull jobs from the API and report results.

use std::time::Duration;

use async_trait::async_trait;
use flowgate_core::job::{JobCompletion, PollRequest, QueuedJob};
use flowgate_core::types::JobId;
use serde::Deserialize;

/// Upper bound on one poll round-trip; must exceed the server's long-poll wait.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(90);

/// Errors from talking to the API.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The HTTP request itself failed (network, DNS, TLS, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The API returned a non-2xx status code.
    #[error("API error ({status}): {body}")]
    Api { status: u16, body: String },
}

/// Where a worker gets its jobs from and reports them done.
#[async_trait]
pub trait JobSource: Send + Sync {
    /// Wait for the next job; `None` when none arrived within the server's wait.
    async fn poll(&self, consumer: &str) -> Result<Option<QueuedJob>, ClientError>;

    async fn complete(&self, job_id: &JobId, completion: &JobCompletion) -> Result<(), ClientError>;
}

#[derive(Deserialize)]
struct DataEnvelope<T> {
    data: T,
}

/// [`JobSource`] backed by the API's worker endpoints.
pub struct WorkerClient {
    client: reqwest::Client,
    api_url: String,
    token: String,
}

impl WorkerClient {
    /// * `api_url` - Base HTTP URL, e.g. `http://127.0.0.1:3000`.
    pub fn new(api_url: impl Into<String>, token: impl Into<String>) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            api_url: api_url.into(),
            token: token.into(),
        })
    }

    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<unreadable body>".to_string());
        Err(ClientError::Api {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl JobSource for WorkerClient {
    async fn poll(&self, consumer: &str) -> Result<Option<QueuedJob>, ClientError> {
        let response = self
            .client
            .post(format!("{}/api/v1/workers/poll", self.api_url))
            .bearer_auth(&self.token)
            .json(&PollRequest {
                consumer: consumer.to_string(),
            })
            .send()
            .await?;

        let response = Self::ensure_success(response).await?;
        if response.status() == reqwest::StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let envelope: DataEnvelope<QueuedJob> = response.json().await?;
        Ok(Some(envelope.data))
    }

    async fn complete(&self, job_id: &JobId, completion: &JobCompletion) -> Result<(), ClientError> {
        let response = self
            .client
            .post(format!(
                "{}/api/v1/workers/jobs/{}/complete",
                self.api_url, job_id
            ))
            .bearer_auth(&self.token)
            .json(completion)
            .send()
            .await?;

        Self::ensure_success(response).await?;
        Ok(())
    }
}
