//! Payloads that travel through the queue and the pub/sub fabric.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{JobId, RunId, Timestamp};

/// Name of the queue carrying flow-run requests.
pub const FLOW_QUEUE: &str = "flow-runs";

/// A request to execute one flow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowRunJob {
    pub run_id: RunId,
    pub flow_id: String,
    /// Trigger payload handed to the engine untouched.
    pub payload: serde_json::Value,
    /// Whether an HTTP caller is blocked waiting for this run's response.
    pub synchronous: bool,
    pub created_at: Timestamp,
}

impl FlowRunJob {
    pub fn new(run_id: RunId, flow_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            run_id,
            flow_id: flow_id.into(),
            payload,
            synchronous: false,
            created_at: chrono::Utc::now(),
        }
    }

    pub fn synchronous(mut self) -> Self {
        self.synchronous = true;
        self
    }
}

/// A job as handed to a consumer, tagged with the transport's id for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedJob {
    pub id: JobId,
    pub job: FlowRunJob,
}

/// The externally visible reply an inbound webhook caller receives.
///
/// Opaque to the dispatch layer; only the flow engine decides its content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: serde_json::Value,
}

impl WebhookResponse {
    pub fn new(status: u16, body: serde_json::Value) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Terminal state of a run as reported by a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Succeeded,
    Failed,
}

/// Body of a worker's poll request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollRequest {
    /// Stable consumer name, unique per worker slot.
    pub consumer: String,
}

/// What a worker reports when it finishes a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobCompletion {
    pub run_id: RunId,
    pub status: RunStatus,
    /// Reply for the blocked webhook caller; only meaningful for
    /// synchronous runs.
    #[serde(default)]
    pub response: Option<WebhookResponse>,
}
