//! Redis-backed transport for multi-node deployments.
//!
//! # Data Structures
//!
//! - `flowgate:queue:{queue}` (STREAM): one entry per job, field `job`
//!   holding the JSON-encoded [`FlowRunJob`]. Consumed through the consumer
//!   group `workers`, so every entry is claimed by one consumer at a time.
//!   Entries left pending longer than the visibility timeout (a consumer
//!   crashed before acking) are taken over with `XAUTOCLAIM` before new
//!   entries are read.
//! - `flowgate:events:{topic}` (PUB/SUB channel): fleet-wide events.
//!
//! Commands (enqueue, dequeue, ack, publish) go through a pooled connection;
//! every subscription opens its own dedicated pub/sub connection from the
//! same client. Redis forbids regular commands on a connection in subscribe
//! mode, so the two roles never share a socket.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Config, Pool, Runtime};
use futures::StreamExt;
use redis::streams::{StreamAutoClaimReply, StreamId, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use flowgate_core::job::{FlowRunJob, QueuedJob};
use flowgate_core::mode::QueueMode;
use flowgate_core::types::JobId;

use crate::error::QueueError;
use crate::transport::{EventStream, QueueTransport, DEFAULT_VISIBILITY_TIMEOUT};

/// Consumer group shared by all workers.
const CONSUMER_GROUP: &str = "workers";

/// Stream field carrying the encoded job.
const JOB_FIELD: &str = "job";

/// Max stream length (approximate trimming).
const MAX_STREAM_LEN: usize = 100_000;

/// Longest single XREADGROUP block; longer waits are split into several reads.
const MAX_BLOCK: Duration = Duration::from_secs(5);

pub(crate) fn queue_key(queue: &str) -> String {
    format!("flowgate:queue:{queue}")
}

pub(crate) fn channel_name(topic: &str) -> String {
    format!("flowgate:events:{topic}")
}

/// [`QueueTransport`] backed by Redis streams and Redis pub/sub.
pub struct BrokerTransport {
    pool: Pool,
    client: redis::Client,
    groups_ready: Mutex<HashSet<String>>,
    visibility_timeout: Duration,
}

impl BrokerTransport {
    /// Connect to the broker and verify it answers.
    ///
    /// Fails immediately when the URL is invalid or the broker is down, so a
    /// misconfigured node never finishes startup.
    pub async fn connect(redis_url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)?;
        let pool = Config::from_url(redis_url)
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| QueueError::Connection(e.to_string()))?;

        let transport = Self {
            pool,
            client,
            groups_ready: Mutex::new(HashSet::new()),
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
        };

        let mut conn = transport.get_connection().await?;
        let pong: String = redis::cmd("PING").query_async(&mut *conn).await?;
        tracing::info!(reply = %pong, "Connected to Redis broker");

        Ok(transport)
    }

    /// How long an entry may stay pending before another consumer claims it.
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    pub(crate) fn pool(&self) -> &Pool {
        &self.pool
    }

    async fn get_connection(&self) -> Result<deadpool_redis::Connection, QueueError> {
        self.pool
            .get()
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))
    }

    /// Ensure the consumer group for `queue` exists, creating it if necessary.
    async fn ensure_group(
        &self,
        conn: &mut deadpool_redis::Connection,
        queue: &str,
    ) -> Result<(), QueueError> {
        if self
            .groups_ready
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(queue)
        {
            return Ok(());
        }

        let result: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(queue_key(queue))
            .arg(CONSUMER_GROUP)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut **conn)
            .await;

        match result {
            Ok(()) => tracing::debug!(queue, "Created consumer group"),
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                tracing::debug!(queue, "Consumer group already exists");
            }
            Err(e) => return Err(e.into()),
        }

        self.groups_ready
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(queue.to_string());
        Ok(())
    }

    /// Take over one entry another consumer left pending too long.
    async fn claim_stale(
        &self,
        conn: &mut deadpool_redis::Connection,
        queue: &str,
        consumer: &str,
    ) -> Result<Option<StreamId>, QueueError> {
        let reply: StreamAutoClaimReply = redis::cmd("XAUTOCLAIM")
            .arg(queue_key(queue))
            .arg(CONSUMER_GROUP)
            .arg(consumer)
            .arg(self.visibility_timeout.as_millis() as u64)
            .arg("0-0")
            .arg("COUNT")
            .arg(1)
            .query_async(&mut **conn)
            .await?;

        let claimed = reply.claimed.into_iter().next();
        if let Some(entry) = &claimed {
            tracing::warn!(queue, consumer, job_id = %entry.id, "Redelivering unacknowledged job");
        }
        Ok(claimed)
    }

    async fn read_group(
        &self,
        conn: &mut deadpool_redis::Connection,
        queue: &str,
        consumer: &str,
        block: Duration,
    ) -> Result<Option<StreamId>, QueueError> {
        let opts = StreamReadOptions::default()
            .group(CONSUMER_GROUP, consumer)
            .count(1)
            .block(block.as_millis().max(1) as usize);

        let key = queue_key(queue);
        let reply: StreamReadReply = match conn.xread_options(&[&key], &[">"], &opts).await {
            Ok(reply) => reply,
            Err(e) if e.to_string().contains("NOGROUP") => {
                tracing::warn!(queue, "Consumer group missing, recreating");
                self.groups_ready
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(queue);
                self.ensure_group(conn, queue).await?;
                conn.xread_options(&[&key], &[">"], &opts).await?
            }
            Err(e) => return Err(e.into()),
        };

        Ok(reply
            .keys
            .into_iter()
            .next()
            .and_then(|stream| stream.ids.into_iter().next()))
    }
}

/// Decode a stream entry into a [`QueuedJob`].
pub(crate) fn parse_entry(entry: &StreamId) -> Result<QueuedJob, QueueError> {
    let raw: String = entry.get(JOB_FIELD).ok_or_else(|| QueueError::Malformed {
        id: entry.id.clone(),
        reason: format!("missing '{JOB_FIELD}' field"),
    })?;
    let job: FlowRunJob = serde_json::from_str(&raw)?;
    Ok(QueuedJob {
        id: JobId::new(entry.id.clone()),
        job,
    })
}

#[async_trait]
impl QueueTransport for BrokerTransport {
    fn mode(&self) -> QueueMode {
        QueueMode::Redis
    }

    async fn enqueue(&self, queue: &str, job: &FlowRunJob) -> Result<JobId, QueueError> {
        let payload = serde_json::to_string(job)?;
        let mut conn = self.get_connection().await?;
        self.ensure_group(&mut conn, queue).await?;

        let entry_id: String = redis::cmd("XADD")
            .arg(queue_key(queue))
            .arg("MAXLEN")
            .arg("~")
            .arg(MAX_STREAM_LEN)
            .arg("*")
            .arg(JOB_FIELD)
            .arg(payload)
            .query_async(&mut *conn)
            .await?;

        tracing::debug!(queue, job_id = %entry_id, run_id = %job.run_id, "Job enqueued on broker");
        Ok(JobId::new(entry_id))
    }

    async fn dequeue(
        &self,
        queue: &str,
        consumer: &str,
        wait: Duration,
    ) -> Result<Option<QueuedJob>, QueueError> {
        let mut conn = self.get_connection().await?;
        self.ensure_group(&mut conn, queue).await?;

        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let block = remaining.min(MAX_BLOCK);

            let entry = match self.claim_stale(&mut conn, queue, consumer).await? {
                Some(entry) => Some(entry),
                None => self.read_group(&mut conn, queue, consumer, block).await?,
            };
            if let Some(entry) = entry {
                match parse_entry(&entry) {
                    Ok(job) => {
                        tracing::debug!(queue, consumer, job_id = %job.id, "Job dequeued from broker");
                        return Ok(Some(job));
                    }
                    Err(e) => {
                        // Acknowledge to drop it from the pending list.
                        tracing::warn!(queue, entry_id = %entry.id, error = %e, "Skipping malformed queue entry");
                        let _: u64 = conn
                            .xack(queue_key(queue), CONSUMER_GROUP, &[&entry.id])
                            .await?;
                        continue;
                    }
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, queue: &str, job_id: &JobId) -> Result<(), QueueError> {
        let mut conn = self.get_connection().await?;
        let key = queue_key(queue);
        let _: () = redis::pipe()
            .atomic()
            .xack(&key, CONSUMER_GROUP, &[job_id.as_str()])
            .ignore()
            .xdel(&key, &[job_id.as_str()])
            .ignore()
            .query_async(&mut *conn)
            .await?;
        Ok(())
    }

    /// Counts delivered but unacknowledged entries too; acked entries are deleted.
    async fn depth(&self, queue: &str) -> Result<u64, QueueError> {
        let mut conn = self.get_connection().await?;
        let len: u64 = conn.xlen(queue_key(queue)).await?;
        Ok(len)
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), QueueError> {
        let mut conn = self.get_connection().await?;
        let receivers: i64 = conn.publish(channel_name(topic), payload).await?;
        tracing::trace!(topic, receivers, "Event published on broker");
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<EventStream, QueueError> {
        let channel = channel_name(topic);
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(&channel).await?;
        tracing::info!(channel = %channel, "Subscribed to broker channel");

        let stream = pubsub
            .into_on_message()
            .map(|msg| msg.get_payload_bytes().to_vec());
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;
    use flowgate_core::types::RunId;

    use super::*;

    fn entry(fields: Vec<(&str, &str)>) -> StreamId {
        let map: HashMap<String, redis::Value> = fields
            .into_iter()
            .map(|(k, v)| {
                (
                    k.to_string(),
                    redis::Value::BulkString(v.as_bytes().to_vec()),
                )
            })
            .collect();
        StreamId {
            id: "1700000000000-0".to_string(),
            map,
        }
    }

    #[test]
    fn keys_are_namespaced() {
        assert_eq!(queue_key("flow-runs"), "flowgate:queue:flow-runs");
        assert_eq!(channel_name("webhook-responses"), "flowgate:events:webhook-responses");
    }

    #[test]
    fn parse_entry_decodes_job_and_uses_entry_id() {
        let job = FlowRunJob::new(RunId::from("r1"), "flow-1", serde_json::json!({"a": 1}));
        let encoded = serde_json::to_string(&job).unwrap();

        let parsed = parse_entry(&entry(vec![(JOB_FIELD, &encoded)])).unwrap();

        assert_eq!(parsed.id.as_str(), "1700000000000-0");
        assert_eq!(parsed.job, job);
    }

    #[test]
    fn parse_entry_without_job_field_is_malformed() {
        assert_matches!(
            parse_entry(&entry(vec![("other", "x")])),
            Err(QueueError::Malformed { .. })
        );
    }

    #[test]
    fn parse_entry_with_bad_json_is_serialization_error() {
        assert_matches!(
            parse_entry(&entry(vec![(JOB_FIELD, "{not json")])),
            Err(QueueError::Serialization(_))
        );
    }
}
