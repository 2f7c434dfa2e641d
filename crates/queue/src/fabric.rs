//! Startup-time selection of the transport and lock backends.

use std::sync::Arc;
use std::time::Duration;

use flowgate_core::lock::{LockService, MemoryLock, DEFAULT_ACQUIRE_TIMEOUT, DEFAULT_LOCK_TTL};
use flowgate_core::mode::QueueMode;

use crate::broker::BrokerTransport;
use crate::error::QueueError;
use crate::memory::InMemoryTransport;
use crate::redis_lock::RedisLock;
use crate::transport::{QueueTransport, DEFAULT_VISIBILITY_TIMEOUT};

/// Inputs needed to build a [`Fabric`].
#[derive(Debug, Clone)]
pub struct FabricOptions {
    pub mode: QueueMode,
    /// Required when `mode` is [`QueueMode::Redis`].
    pub redis_url: Option<String>,
    pub lock_ttl: Duration,
    pub lock_acquire_timeout: Duration,
    /// Unacknowledged jobs are redelivered after this long.
    pub visibility_timeout: Duration,
}

impl FabricOptions {
    pub fn memory() -> Self {
        Self {
            mode: QueueMode::Memory,
            redis_url: None,
            lock_ttl: DEFAULT_LOCK_TTL,
            lock_acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
        }
    }
}

/// The transport and lock service a process uses for its whole lifetime.
#[derive(Clone)]
pub struct Fabric {
    pub transport: Arc<dyn QueueTransport>,
    pub lock: Arc<dyn LockService>,
}

impl std::fmt::Debug for Fabric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fabric")
            .field("mode", &self.transport.mode())
            .finish_non_exhaustive()
    }
}

/// Build the fabric for the configured queue mode.
///
/// Broker mode without a URL is an error, never a silent fall back to the
/// in-memory variant.
pub async fn connect(options: &FabricOptions) -> Result<Fabric, QueueError> {
    match options.mode {
        QueueMode::Memory => {
            tracing::info!("Using in-memory queue transport");
            Ok(Fabric {
                transport: Arc::new(
                    InMemoryTransport::new().with_visibility_timeout(options.visibility_timeout),
                ),
                lock: Arc::new(MemoryLock::new(
                    options.lock_ttl,
                    options.lock_acquire_timeout,
                )),
            })
        }
        QueueMode::Redis => {
            let url = options
                .redis_url
                .as_deref()
                .filter(|url| !url.trim().is_empty())
                .ok_or_else(|| {
                    QueueError::Config("REDIS queue mode requires REDIS_URL".to_string())
                })?;

            let broker = BrokerTransport::connect(url)
                .await?
                .with_visibility_timeout(options.visibility_timeout);
            let lock = RedisLock::new(
                broker.pool().clone(),
                options.lock_ttl,
                options.lock_acquire_timeout,
            );
            tracing::info!("Using Redis queue transport");
            Ok(Fabric {
                transport: Arc::new(broker),
                lock: Arc::new(lock),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[tokio::test]
    async fn memory_mode_needs_no_broker() {
        let fabric = connect(&FabricOptions::memory()).await.unwrap();
        assert_eq!(fabric.transport.mode(), QueueMode::Memory);
        assert_eq!(format!("{fabric:?}"), "Fabric { mode: Memory, .. }");
    }

    #[tokio::test]
    async fn redis_mode_without_url_fails_fast() {
        let options = FabricOptions {
            mode: QueueMode::Redis,
            ..FabricOptions::memory()
        };
        assert_matches!(connect(&options).await, Err(QueueError::Config(_)));
    }

    #[tokio::test]
    async fn redis_mode_with_blank_url_fails_fast() {
        let options = FabricOptions {
            mode: QueueMode::Redis,
            redis_url: Some("  ".to_string()),
            ..FabricOptions::memory()
        };
        assert_matches!(connect(&options).await, Err(QueueError::Config(_)));
    }
}
