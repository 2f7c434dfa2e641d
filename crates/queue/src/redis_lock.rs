//! Fleet-wide [`LockService`] on top of Redis.
//!
//! A lease is a key `flowgate:lock:{name}` set with `SET NX PX` to a random
//! owner token. Release is a compare-and-delete script so a holder whose
//! lease already expired cannot free someone else's. Leases from `acquire`
//! are extended with a compare-and-`PEXPIRE` heartbeat while held.

use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::Pool;
use flowgate_core::lock::{renew_interval, LockError, LockHandle, LockLease, LockService};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

/// Delay between attempts while waiting for a held lock.
const RETRY_INTERVAL: Duration = Duration::from_millis(100);

const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

const RENEW_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

pub(crate) fn lock_key(name: &str) -> String {
    format!("flowgate:lock:{name}")
}

/// Distributed lock sharing the broker's connection pool.
#[derive(Clone)]
pub struct RedisLock {
    pool: Pool,
    ttl: Duration,
    acquire_timeout: Duration,
}

impl RedisLock {
    pub fn new(pool: Pool, ttl: Duration, acquire_timeout: Duration) -> Self {
        Self {
            pool,
            ttl,
            acquire_timeout,
        }
    }

    async fn try_set(&self, name: &str, token: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| LockError::Backend(e.to_string()))?;

        let reply: Option<String> = redis::cmd("SET")
            .arg(lock_key(name))
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64)
            .query_async(&mut *conn)
            .await
            .map_err(|e| LockError::Backend(e.to_string()))?;

        Ok(reply.is_some())
    }

    fn handle(&self, name: &str, token: String, heartbeat: Option<JoinHandle<()>>) -> LockHandle {
        LockHandle::new(
            name,
            Box::new(RedisLease {
                pool: self.pool.clone(),
                key: lock_key(name),
                token,
                armed: true,
                heartbeat,
            }),
        )
    }

    fn start_heartbeat(&self, name: &str, token: &str) -> JoinHandle<()> {
        let pool = self.pool.clone();
        let key = lock_key(name);
        let token = token.to_string();
        let ttl_ms = self.ttl.as_millis().max(1) as u64;
        let every = renew_interval(self.ttl);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                match extend_if_owner(&pool, &key, &token, ttl_ms).await {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::warn!(lock = %key, "Lost lock lease before release");
                        break;
                    }
                    // Transient; the next tick retries before the TTL runs out.
                    Err(e) => tracing::warn!(lock = %key, error = %e, "Failed to renew lock lease"),
                }
            }
        })
    }
}

#[async_trait]
impl LockService for RedisLock {
    async fn acquire(&self, name: &str) -> Result<LockHandle, LockError> {
        let started = Instant::now();
        let deadline = started + self.acquire_timeout;
        let token = Uuid::new_v4().to_string();

        loop {
            if self.try_set(name, &token, self.ttl).await? {
                tracing::trace!(lock = name, "Acquired distributed lock");
                let heartbeat = self.start_heartbeat(name, &token);
                return Ok(self.handle(name, token, Some(heartbeat)));
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(LockError::Timeout {
                    name: name.to_string(),
                    waited: now - started,
                });
            }
            tokio::time::sleep((deadline - now).min(RETRY_INTERVAL)).await;
        }
    }

    async fn try_acquire(
        &self,
        name: &str,
        ttl: Duration,
    ) -> Result<Option<LockHandle>, LockError> {
        let token = Uuid::new_v4().to_string();
        if self.try_set(name, &token, ttl).await? {
            Ok(Some(self.handle(name, token, None)))
        } else {
            Ok(None)
        }
    }
}

struct RedisLease {
    pool: Pool,
    key: String,
    token: String,
    armed: bool,
    heartbeat: Option<JoinHandle<()>>,
}

impl RedisLease {
    fn stop_heartbeat(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
    }
}

async fn extend_if_owner(pool: &Pool, key: &str, token: &str, ttl_ms: u64) -> Result<bool, LockError> {
    let mut conn = pool
        .get()
        .await
        .map_err(|e| LockError::Backend(e.to_string()))?;
    let extended: i64 = redis::Script::new(RENEW_SCRIPT)
        .key(key)
        .arg(token)
        .arg(ttl_ms)
        .invoke_async(&mut *conn)
        .await
        .map_err(|e| LockError::Backend(e.to_string()))?;
    Ok(extended == 1)
}

async fn delete_if_owner(pool: &Pool, key: &str, token: &str) -> Result<(), LockError> {
    let mut conn = pool
        .get()
        .await
        .map_err(|e| LockError::Backend(e.to_string()))?;
    let _: i64 = redis::Script::new(RELEASE_SCRIPT)
        .key(key)
        .arg(token)
        .invoke_async(&mut *conn)
        .await
        .map_err(|e| LockError::Backend(e.to_string()))?;
    Ok(())
}

#[async_trait]
impl LockLease for RedisLease {
    async fn release(mut self: Box<Self>) -> Result<(), LockError> {
        self.armed = false;
        self.stop_heartbeat();
        delete_if_owner(&self.pool, &self.key, &self.token).await
    }

    fn keep_until_expiry(mut self: Box<Self>) {
        self.armed = false;
        self.stop_heartbeat();
    }
}

impl Drop for RedisLease {
    fn drop(&mut self) {
        self.stop_heartbeat();
        if !self.armed {
            return;
        }
        // Dropped without release (e.g. the holder was cancelled): free the
        // key in the background; the TTL covers the case with no runtime.
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let pool = self.pool.clone();
            let key = std::mem::take(&mut self.key);
            let token = std::mem::take(&mut self.token);
            runtime.spawn(async move {
                if let Err(e) = delete_if_owner(&pool, &key, &token).await {
                    tracing::warn!(lock = %key, error = %e, "Failed to release abandoned lock");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_keys_are_namespaced() {
        assert_eq!(
            lock_key("engine-installer#/work/w1"),
            "flowgate:lock:engine-installer#/work/w1"
        );
    }

    #[test]
    fn lease_is_renewed_well_before_expiry() {
        let ttl = Duration::from_secs(60);
        assert_eq!(renew_interval(ttl), Duration::from_secs(20));
        assert!(renew_interval(Duration::ZERO) > Duration::ZERO);
    }
}
