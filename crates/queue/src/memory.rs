//! Single-process transport for development and single-node deployments.
//!
//! Jobs live in per-queue `VecDeque`s; pub/sub goes through a [`TopicBus`].
//! Nothing crosses the process boundary. A dequeued job that is not acked
//! within the visibility timeout goes back to the front of its queue.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use flowgate_core::job::{FlowRunJob, QueuedJob};
use flowgate_core::mode::QueueMode;
use flowgate_core::types::JobId;

use crate::bus::TopicBus;
use crate::error::QueueError;
use crate::transport::{EventStream, QueueTransport, DEFAULT_VISIBILITY_TIMEOUT};

struct InFlight {
    queue: String,
    job: QueuedJob,
    delivered_at: Instant,
}

#[derive(Default)]
struct Queues {
    pending: HashMap<String, VecDeque<QueuedJob>>,
    in_flight: HashMap<JobId, InFlight>,
}

/// [`QueueTransport`] that never leaves the process.
pub struct InMemoryTransport {
    queues: Mutex<Queues>,
    work_notify: Notify,
    bus: TopicBus,
    visibility_timeout: Duration,
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self {
            queues: Mutex::new(Queues::default()),
            work_notify: Notify::new(),
            bus: TopicBus::default(),
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
        }
    }
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// How long a dequeued job may stay unacknowledged before redelivery.
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    /// Number of dequeued jobs not yet acknowledged.
    pub fn in_flight_count(&self) -> usize {
        self.lock_queues().in_flight.len()
    }

    fn lock_queues(&self) -> std::sync::MutexGuard<'_, Queues> {
        self.queues.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn pop(&self, queue: &str) -> Option<QueuedJob> {
        let mut queues = self.lock_queues();
        self.reclaim_expired(&mut queues, queue);
        let job = queues.pending.get_mut(queue)?.pop_front()?;
        queues.in_flight.insert(
            job.id.clone(),
            InFlight {
                queue: queue.to_string(),
                job: job.clone(),
                delivered_at: Instant::now(),
            },
        );
        Some(job)
    }

    /// Move jobs of `queue` whose consumer never acked back to its front.
    fn reclaim_expired(&self, queues: &mut Queues, queue: &str) {
        let now = Instant::now();
        let expired: Vec<JobId> = queues
            .in_flight
            .iter()
            .filter(|(_, f)| f.queue == queue && now - f.delivered_at >= self.visibility_timeout)
            .map(|(id, _)| id.clone())
            .collect();

        for id in expired {
            if let Some(stale) = queues.in_flight.remove(&id) {
                tracing::warn!(queue, job_id = %id, run_id = %stale.job.job.run_id, "Redelivering unacknowledged job");
                queues
                    .pending
                    .entry(queue.to_string())
                    .or_default()
                    .push_front(stale.job);
            }
        }
    }

    /// When the oldest unacknowledged job of `queue` becomes reclaimable.
    fn next_reclaim_at(&self, queue: &str) -> Option<Instant> {
        self.lock_queues()
            .in_flight
            .values()
            .filter(|f| f.queue == queue)
            .map(|f| f.delivered_at + self.visibility_timeout)
            .min()
    }
}

#[async_trait]
impl QueueTransport for InMemoryTransport {
    fn mode(&self) -> QueueMode {
        QueueMode::Memory
    }

    async fn enqueue(&self, queue: &str, job: &FlowRunJob) -> Result<JobId, QueueError> {
        let id = JobId::new(uuid::Uuid::new_v4().to_string());
        self.lock_queues()
            .pending
            .entry(queue.to_string())
            .or_default()
            .push_back(QueuedJob {
                id: id.clone(),
                job: job.clone(),
            });
        // notify_one stores a permit when nobody is waiting yet.
        self.work_notify.notify_one();
        tracing::debug!(queue, job_id = %id, run_id = %job.run_id, "Job enqueued in memory");
        Ok(id)
    }

    async fn dequeue(
        &self,
        queue: &str,
        consumer: &str,
        wait: Duration,
    ) -> Result<Option<QueuedJob>, QueueError> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.work_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(job) = self.pop(queue) {
                tracing::debug!(queue, consumer, job_id = %job.id, "Job dequeued");
                // Pass any leftover wake-up on to another waiting consumer.
                self.work_notify.notify_one();
                return Ok(Some(job));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            // Wake for a reclaim even when nothing new is enqueued.
            let wake_at = self
                .next_reclaim_at(queue)
                .map_or(deadline, |at| at.min(deadline))
                .max(now + Duration::from_millis(1));
            let _ = tokio::time::timeout(wake_at - now, notified).await;
        }
    }

    async fn ack(&self, queue: &str, job_id: &JobId) -> Result<(), QueueError> {
        if self.lock_queues().in_flight.remove(job_id).is_none() {
            tracing::debug!(queue, job_id = %job_id, "Ack for unknown job ignored");
        }
        Ok(())
    }

    async fn depth(&self, queue: &str) -> Result<u64, QueueError> {
        Ok(self
            .lock_queues()
            .pending
            .get(queue)
            .map_or(0, |q| q.len() as u64))
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), QueueError> {
        let receivers = self.bus.publish(topic, payload);
        tracing::trace!(topic, receivers, "Event published in memory");
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<EventStream, QueueError> {
        let topic_name = topic.to_string();
        let stream = BroadcastStream::new(self.bus.subscribe(topic)).filter_map(move |item| {
            let topic = topic_name.clone();
            async move {
                match item {
                    Ok(payload) => Some(payload),
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        tracing::warn!(topic = %topic, skipped, "Subscriber lagged, events dropped");
                        None
                    }
                }
            }
        });
        Ok(stream.boxed())
    }
}
