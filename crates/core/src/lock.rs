//! Named mutual exclusion shared by the installer and the system-job scheduler.
//!
//! [`LockService`] is an injected capability: [`MemoryLock`] serves a single
//! process, the Redis implementation in `flowgate-queue` serves a fleet. Both
//! hand out leases with a TTL so a crashed holder cannot block a name forever,
//! and both release by owner token (a stale holder never frees a newer lease).
//!
//! Leases taken with [`LockService::acquire`] are renewed by a heartbeat while
//! the handle is alive, so a critical section longer than the TTL keeps its
//! exclusivity. Slot claims from [`LockService::try_acquire`] are never renewed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

/// Default lease lifetime.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(60);

/// Default time [`LockService::acquire`] waits before giving up.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound between re-checks while waiting, so expired leases are noticed
/// even when nobody releases.
const RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// How often a held lease is extended, relative to its TTL.
pub fn renew_interval(ttl: Duration) -> Duration {
    (ttl / 3).max(Duration::from_millis(1))
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("Timed out after {waited:?} waiting for lock '{name}'")]
    Timeout { name: String, waited: Duration },

    #[error("Lock backend error: {0}")]
    Backend(String),
}

/// Acquire named locks.
#[async_trait]
pub trait LockService: Send + Sync {
    /// Wait until `name` is free, then hold it until the handle is released
    /// or dropped. The lease is renewed in the background while held.
    async fn acquire(&self, name: &str) -> Result<LockHandle, LockError>;

    /// Claim `name` for `ttl` only if nobody holds it right now.
    async fn try_acquire(&self, name: &str, ttl: Duration)
        -> Result<Option<LockHandle>, LockError>;
}

/// Backend-specific half of a [`LockHandle`].
///
/// Implementations must release the lease when dropped unless
/// [`keep_until_expiry`](LockLease::keep_until_expiry) was called, so a
/// cancelled holder does not keep the name until the TTL runs out.
#[async_trait]
pub trait LockLease: Send {
    async fn release(self: Box<Self>) -> Result<(), LockError>;

    fn keep_until_expiry(self: Box<Self>);
}

/// Ownership of one named lock.
pub struct LockHandle {
    name: String,
    lease: Box<dyn LockLease>,
}

impl LockHandle {
    pub fn new(name: impl Into<String>, lease: Box<dyn LockLease>) -> Self {
        Self {
            name: name.into(),
            lease,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn release(self) -> Result<(), LockError> {
        tracing::trace!(lock = %self.name, "Releasing lock");
        self.lease.release().await
    }

    /// Leave the lease in place until its TTL elapses.
    ///
    /// Used to mark a time slot as claimed without blocking the next one.
    pub fn keep_until_expiry(self) {
        self.lease.keep_until_expiry();
    }
}

impl std::fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockHandle").field("name", &self.name).finish()
    }
}

// ---------------------------------------------------------------------------
// MemoryLock
// ---------------------------------------------------------------------------

struct Lease {
    token: Uuid,
    expires_at: Instant,
}

#[derive(Default)]
struct MemoryLockState {
    leases: Mutex<HashMap<String, Lease>>,
    released: Notify,
}

impl MemoryLockState {
    fn try_claim(&self, name: &str, ttl: Duration) -> Option<Uuid> {
        let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        // Slot claims use a fresh name every cadence; drop the dead ones.
        leases.retain(|_, lease| lease.expires_at > now);
        if leases.contains_key(name) {
            return None;
        }
        let token = Uuid::new_v4();
        leases.insert(
            name.to_string(),
            Lease {
                token,
                expires_at: now + ttl,
            },
        );
        Some(token)
    }

    /// Push the expiry of `name` out by `ttl` if `token` still owns it.
    fn renew(&self, name: &str, token: Uuid, ttl: Duration) -> bool {
        let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        match leases.get_mut(name) {
            Some(lease) if lease.token == token && lease.expires_at > now => {
                lease.expires_at = now + ttl;
                true
            }
            _ => false,
        }
    }

    fn remove_if_owner(&self, name: &str, token: Uuid) {
        let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        if leases.get(name).is_some_and(|lease| lease.token == token) {
            leases.remove(name);
        }
        drop(leases);
        self.released.notify_waiters();
    }

    #[cfg(test)]
    fn table_len(&self) -> usize {
        self.leases.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn held_count(&self) -> usize {
        let now = Instant::now();
        self.leases
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|lease| lease.expires_at > now)
            .count()
    }
}

/// In-process [`LockService`] for single-node deployments and tests.
///
/// Cheap to clone; clones share the same lease table.
#[derive(Clone)]
pub struct MemoryLock {
    state: Arc<MemoryLockState>,
    ttl: Duration,
    acquire_timeout: Duration,
}

impl MemoryLock {
    pub fn new(ttl: Duration, acquire_timeout: Duration) -> Self {
        Self {
            state: Arc::new(MemoryLockState::default()),
            ttl,
            acquire_timeout,
        }
    }

    /// Number of names currently held by an unexpired lease.
    pub fn held_count(&self) -> usize {
        self.state.held_count()
    }

    fn handle(&self, name: &str, token: Uuid, heartbeat: Option<JoinHandle<()>>) -> LockHandle {
        LockHandle::new(
            name,
            Box::new(MemoryLease {
                state: Arc::clone(&self.state),
                name: name.to_string(),
                token,
                armed: true,
                heartbeat,
            }),
        )
    }

    fn start_heartbeat(&self, name: &str, token: Uuid) -> JoinHandle<()> {
        let state = Arc::clone(&self.state);
        let name = name.to_string();
        let ttl = self.ttl;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(renew_interval(ttl));
            interval.tick().await;
            loop {
                interval.tick().await;
                if !state.renew(&name, token, ttl) {
                    tracing::warn!(lock = %name, "Lost lock lease before release");
                    break;
                }
            }
        })
    }
}

impl Default for MemoryLock {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TTL, DEFAULT_ACQUIRE_TIMEOUT)
    }
}

#[async_trait]
impl LockService for MemoryLock {
    async fn acquire(&self, name: &str) -> Result<LockHandle, LockError> {
        let started = Instant::now();
        let deadline = started + self.acquire_timeout;

        loop {
            // Register interest before checking so a release between the
            // check and the wait is not missed.
            let notified = self.state.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(token) = self.state.try_claim(name, self.ttl) {
                let heartbeat = self.start_heartbeat(name, token);
                return Ok(self.handle(name, token, Some(heartbeat)));
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(LockError::Timeout {
                    name: name.to_string(),
                    waited: now - started,
                });
            }
            let wait = (deadline - now).min(RETRY_INTERVAL);
            let _ = tokio::time::timeout(wait, notified).await;
        }
    }

    async fn try_acquire(
        &self,
        name: &str,
        ttl: Duration,
    ) -> Result<Option<LockHandle>, LockError> {
        Ok(self
            .state
            .try_claim(name, ttl)
            .map(|token| self.handle(name, token, None)))
    }
}

struct MemoryLease {
    state: Arc<MemoryLockState>,
    name: String,
    token: Uuid,
    armed: bool,
    heartbeat: Option<JoinHandle<()>>,
}

impl MemoryLease {
    fn stop_heartbeat(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
    }
}

#[async_trait]
impl LockLease for MemoryLease {
    async fn release(mut self: Box<Self>) -> Result<(), LockError> {
        self.armed = false;
        self.stop_heartbeat();
        self.state.remove_if_owner(&self.name, self.token);
        Ok(())
    }

    fn keep_until_expiry(mut self: Box<Self>) {
        self.armed = false;
        self.stop_heartbeat();
    }
}

impl Drop for MemoryLease {
    fn drop(&mut self) {
        self.stop_heartbeat();
        if self.armed {
            self.state.remove_if_owner(&self.name, self.token);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use assert_matches::assert_matches;

    use super::*;

    fn lock() -> MemoryLock {
        MemoryLock::new(Duration::from_secs(5), Duration::from_secs(2))
    }

    #[tokio::test]
    async fn acquire_then_release_frees_the_name() {
        let lock = lock();
        let handle = lock.acquire("a").await.unwrap();
        assert_eq!(handle.name(), "a");
        assert_eq!(lock.held_count(), 1);

        handle.release().await.unwrap();
        assert_eq!(lock.held_count(), 0);
    }

    #[tokio::test]
    async fn different_names_do_not_contend() {
        let lock = lock();
        let _a = lock.acquire("a").await.unwrap();
        let _b = lock.acquire("b").await.unwrap();
        assert_eq!(lock.held_count(), 2);
    }

    #[tokio::test]
    async fn try_acquire_fails_while_held() {
        let lock = lock();
        let _held = lock.acquire("a").await.unwrap();
        let second = lock
            .try_acquire("a", Duration::from_secs(1))
            .await
            .unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn dropping_a_handle_releases_it() {
        let lock = lock();
        drop(lock.acquire("a").await.unwrap());
        assert_eq!(lock.held_count(), 0);
    }

    #[tokio::test]
    async fn kept_lease_survives_until_ttl() {
        let lock = lock();
        let handle = lock
            .try_acquire("slot", Duration::from_millis(30))
            .await
            .unwrap()
            .expect("free slot");
        handle.keep_until_expiry();
        assert!(lock
            .try_acquire("slot", Duration::from_millis(30))
            .await
            .unwrap()
            .is_none());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(lock
            .try_acquire("slot", Duration::from_millis(30))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn acquire_times_out_when_held() {
        let lock = MemoryLock::new(Duration::from_secs(5), Duration::from_millis(30));
        let _held = lock.acquire("a").await.unwrap();
        assert_matches!(lock.acquire("a").await, Err(LockError::Timeout { .. }));
    }

    #[tokio::test]
    async fn waiter_acquires_after_release() {
        let lock = lock();
        let held = lock.acquire("a").await.unwrap();

        let waiter = {
            let lock = lock.clone();
            tokio::spawn(async move { lock.acquire("a").await.map(|h| h.name().to_string()) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        held.release().await.unwrap();

        assert_eq!(waiter.await.unwrap().unwrap(), "a");
    }

    #[tokio::test]
    async fn holders_never_overlap() {
        let lock = lock();
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let lock = lock.clone();
                let inside = Arc::clone(&inside);
                let max_inside = Arc::clone(&max_inside);
                tokio::spawn(async move {
                    let handle = lock.acquire("shared").await.unwrap();
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                    handle.release().await.unwrap();
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stale_release_does_not_free_newer_lease() {
        let lock = lock();
        let stale = lock
            .try_acquire("a", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let _fresh = lock.acquire("a").await.unwrap();
        stale.release().await.unwrap();
        assert_eq!(lock.held_count(), 1);
    }

    #[tokio::test]
    async fn held_lease_outlives_its_ttl() {
        let lock = MemoryLock::new(Duration::from_millis(30), Duration::from_millis(200));
        let first = lock.acquire("engine-installer#/work/w1").await.unwrap();

        // Several TTLs pass while the first holder is still inside.
        assert_matches!(
            lock.acquire("engine-installer#/work/w1").await,
            Err(LockError::Timeout { .. })
        );
        assert_eq!(lock.held_count(), 1);

        first.release().await.unwrap();
        assert!(lock.acquire("engine-installer#/work/w1").await.is_ok());
    }

    #[tokio::test]
    async fn kept_lease_stops_renewing() {
        let lock = MemoryLock::new(Duration::from_millis(30), Duration::from_millis(200));
        lock.acquire("a").await.unwrap().keep_until_expiry();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(lock.held_count(), 0);
    }

    #[tokio::test]
    async fn expired_slot_claims_are_pruned() {
        let lock = lock();
        for slot in 0..500 {
            lock.try_acquire(&format!("system-job:pieces-sync:{slot}"), Duration::from_millis(1))
                .await
                .unwrap()
                .expect("fresh slot")
                .keep_until_expiry();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        lock.try_acquire("system-job:pieces-sync:500", Duration::from_secs(1))
            .await
            .unwrap()
            .expect("fresh slot")
            .keep_until_expiry();
        assert_eq!(lock.held_count(), 1);
        assert_eq!(lock.state.table_len(), 1);
    }
}
