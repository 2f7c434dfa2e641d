//! Queue and pub/sub fabric for flowgate.
//!
//! This crate provides:
//!
//! - [`QueueTransport`] -- enqueue/consume flow-run jobs and publish/subscribe
//!   fleet events, with two variants selected once at startup:
//!   [`InMemoryTransport`] (single process) and [`BrokerTransport`] (Redis).
//! - [`RedisLock`] -- the fleet-wide [`LockService`](flowgate_core::lock::LockService).
//! - [`WebhookResponseWatcher`] -- blocks an inbound webhook until the run it
//!   triggered publishes its response, whichever node executed it.
//! - [`connect`] -- builds the transport and lock for a [`QueueMode`](flowgate_core::mode::QueueMode).

pub mod broker;
pub mod bus;
pub mod error;
pub mod fabric;
pub mod memory;
pub mod redis_lock;
pub mod subscription;
pub mod transport;
pub mod watcher;

pub use broker::BrokerTransport;
pub use bus::TopicBus;
pub use error::QueueError;
pub use fabric::{connect, Fabric, FabricOptions};
pub use memory::InMemoryTransport;
pub use redis_lock::RedisLock;
pub use subscription::resubscribing;
pub use transport::{EventStream, QueueTransport, DEFAULT_VISIBILITY_TIMEOUT};
pub use watcher::{PendingWait, WatchError, WebhookResponseWatcher, WEBHOOK_RESPONSE_TOPIC};
