//! Concurrency tests for `EngineInstaller` sharing one lock service.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use flowgate_core::lock::{LockError, LockHandle, LockLease, LockService, MemoryLock};
use flowgate_worker::installer::{ENGINE_FILE, ENGINE_INSTALLED, ENGINE_MAP_FILE};
use flowgate_worker::{CacheHandler, EngineFingerprint, EngineInstaller, InstallerConfig};

/// Wraps a lock service and records how many holders overlap, plus the
/// order in which tagged callers entered.
#[derive(Clone, Default)]
struct TrackingLock {
    inner: MemoryLock,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
    entries: Arc<Mutex<Vec<usize>>>,
    tag: usize,
}

impl TrackingLock {
    fn tagged(&self, tag: usize) -> Self {
        Self {
            tag,
            ..self.clone()
        }
    }
}

struct TrackingLease {
    inner: Option<LockHandle>,
    active: Arc<AtomicUsize>,
}

#[async_trait]
impl LockLease for TrackingLease {
    async fn release(mut self: Box<Self>) -> Result<(), LockError> {
        self.active.fetch_sub(1, Ordering::SeqCst);
        match self.inner.take() {
            Some(handle) => handle.release().await,
            None => Ok(()),
        }
    }

    fn keep_until_expiry(mut self: Box<Self>) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        if let Some(handle) = self.inner.take() {
            handle.keep_until_expiry();
        }
    }
}

#[async_trait]
impl LockService for TrackingLock {
    async fn acquire(&self, name: &str) -> Result<LockHandle, LockError> {
        let inner = self.inner.acquire(name).await?;
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        self.entries.lock().unwrap().push(self.tag);
        Ok(LockHandle::new(
            name,
            Box::new(TrackingLease {
                inner: Some(inner),
                active: Arc::clone(&self.active),
            }),
        ))
    }

    async fn try_acquire(&self, name: &str, ttl: Duration) -> Result<Option<LockHandle>, LockError> {
        self.inner.try_acquire(name, ttl).await
    }
}

fn write_engine(dir: &Path, size: usize) -> PathBuf {
    let engine = dir.join("engine");
    std::fs::write(&engine, vec![b'x'; size]).unwrap();
    std::fs::write(dir.join("engine.map"), vec![b'm'; 10]).unwrap();
    engine
}

fn installer(engine: &Path, lock: Arc<dyn LockService>, dev_mode: bool) -> EngineInstaller {
    EngineInstaller::new(
        InstallerConfig {
            fingerprint: EngineFingerprint::generate(),
            executable_path: engine.to_path_buf(),
            dev_mode,
        },
        lock,
    )
}

// ---------------------------------------------------------------------------
// Test: concurrent installs to one path never overlap
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_installs_to_same_path_are_serialized() {
    let dir = tempfile::tempdir().unwrap();
    let engine = write_engine(dir.path(), 42);
    let target = dir.path().join("work").join("w1");
    let lock = TrackingLock::default();

    let installers: Vec<Arc<EngineInstaller>> = (0..8)
        .map(|tag| Arc::new(installer(&engine, Arc::new(lock.tagged(tag)), false)))
        .collect();

    let mut tasks = Vec::new();
    for inst in &installers {
        let inst = Arc::clone(inst);
        let target = target.clone();
        tasks.push(tokio::spawn(async move { inst.install(&target).await }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(lock.max_active.load(Ordering::SeqCst), 1);
    assert_eq!(lock.active.load(Ordering::SeqCst), 0);
    assert_eq!(std::fs::metadata(target.join(ENGINE_FILE)).unwrap().len(), 42);
    assert_eq!(std::fs::metadata(target.join(ENGINE_MAP_FILE)).unwrap().len(), 10);

    let cached = CacheHandler::new(&target)
        .get(ENGINE_INSTALLED)
        .await
        .unwrap()
        .expect("fingerprint recorded");
    // Sections never overlap, so the last one in is the last one to finish.
    let entries = lock.entries.lock().unwrap().clone();
    assert_eq!(entries.len(), 8);
    let last = *entries.last().unwrap();
    assert_eq!(cached, installers[last].config().fingerprint.as_str());
}

// ---------------------------------------------------------------------------
// Test: different paths install independently
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn installs_to_different_paths_all_succeed() {
    let dir = tempfile::tempdir().unwrap();
    let engine = write_engine(dir.path(), 42);
    let inst = Arc::new(installer(&engine, Arc::new(MemoryLock::default()), false));

    let mut tasks = Vec::new();
    for slot in 0..4 {
        let inst = Arc::clone(&inst);
        let target = dir.path().join("work").join(slot.to_string());
        tasks.push(tokio::spawn(async move { inst.install(&target).await }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    for slot in 0..4 {
        let target = dir.path().join("work").join(slot.to_string());
        assert!(target.join(ENGINE_FILE).is_file());
        assert!(target.join(ENGINE_MAP_FILE).is_file());
    }
    assert_eq!(inst.copy_count(), 8);
}

// ---------------------------------------------------------------------------
// Test: readers never see a partial engine
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reader_sees_whole_file_or_nothing() {
    const SIZE: usize = 4 * 1024 * 1024;

    let dir = tempfile::tempdir().unwrap();
    let engine = write_engine(dir.path(), SIZE);
    let target = dir.path().join("w1");
    let inst = installer(&engine, Arc::new(MemoryLock::default()), true);

    let stop = Arc::new(AtomicBool::new(false));
    let reader = {
        let stop = Arc::clone(&stop);
        let path = target.join(ENGINE_FILE);
        tokio::task::spawn_blocking(move || {
            let mut observed = 0usize;
            while !stop.load(Ordering::SeqCst) {
                match std::fs::read(&path) {
                    Ok(bytes) => {
                        assert_eq!(bytes.len(), SIZE, "reader saw a partial engine");
                        observed += 1;
                    }
                    Err(e) => assert_eq!(e.kind(), std::io::ErrorKind::NotFound),
                }
            }
            observed
        })
    };

    for _ in 0..10 {
        inst.install(&target).await.unwrap();
    }
    stop.store(true, Ordering::SeqCst);

    let observed = reader.await.unwrap();
    assert!(observed > 0 || target.join(ENGINE_FILE).is_file());
}
