//! The polymorphic transport capability shared by API and workers.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use flowgate_core::job::{FlowRunJob, QueuedJob};
use flowgate_core::mode::QueueMode;
use flowgate_core::types::JobId;

use crate::error::QueueError;

/// Default time a dequeued job may stay unacknowledged before it is handed
/// to another consumer. Longer than the default engine run timeout.
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(900);

/// Stream of raw event payloads published on one topic.
pub type EventStream = BoxStream<'static, Vec<u8>>;

/// Job queue plus topic-based publish/subscribe.
///
/// Each job is delivered to one consumer at a time; a job not acked within
/// the visibility timeout is redelivered, so delivery is at-least-once. Each
/// published event is
/// delivered to every subscriber of its topic that exists at publish time;
/// subscribers must tolerate duplicates.
#[async_trait]
pub trait QueueTransport: Send + Sync {
    fn mode(&self) -> QueueMode;

    /// Append a job to `queue`, returning the transport-assigned id.
    async fn enqueue(&self, queue: &str, job: &FlowRunJob) -> Result<JobId, QueueError>;

    /// Take the next job from `queue`, waiting up to `wait` for one to arrive.
    /// Jobs left unacknowledged past the visibility timeout come first.
    async fn dequeue(
        &self,
        queue: &str,
        consumer: &str,
        wait: Duration,
    ) -> Result<Option<QueuedJob>, QueueError>;

    /// Mark a dequeued job as done. Unknown ids are ignored.
    async fn ack(&self, queue: &str, job_id: &JobId) -> Result<(), QueueError>;

    /// Number of jobs waiting in `queue`.
    async fn depth(&self, queue: &str) -> Result<u64, QueueError>;

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), QueueError>;

    async fn subscribe(&self, topic: &str) -> Result<EventStream, QueueError>;
}
