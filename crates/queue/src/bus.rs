//! In-process topic multiplexer backed by `tokio::sync::broadcast` channels.
//!
//! [`TopicBus`] is the local publish/subscribe hub used by the in-memory
//! transport. One broadcast channel is created lazily per topic.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::broadcast;

/// Default buffer capacity for each topic's broadcast channel.
const DEFAULT_CAPACITY: usize = 1024;

/// In-process fan-out bus keyed by topic name.
///
/// Every subscriber of a topic independently receives every payload
/// published on it after it subscribed.
pub struct TopicBus {
    capacity: usize,
    topics: Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>,
}

impl TopicBus {
    /// Create a bus whose topics buffer up to `capacity` payloads.
    ///
    /// When a topic's buffer is full, the oldest un-consumed payloads are
    /// dropped and slow receivers observe `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            topics: Mutex::new(HashMap::new()),
        }
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<Vec<u8>> {
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Publish a payload to all current subscribers of `topic`.
    ///
    /// Returns the number of subscribers reached; zero is not an error.
    pub fn publish(&self, topic: &str, payload: Vec<u8>) -> usize {
        self.sender(topic).send(payload).unwrap_or(0)
    }

    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<Vec<u8>> {
        self.sender(topic).subscribe()
    }
}

impl Default for TopicBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
