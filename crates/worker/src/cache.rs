//! Per-worker-root key/value store that survives restarts.
//!
//! Entries live in `<root>/cache.json`. Every read goes to disk so separate
//! processes sharing the root observe each other's writes; every write goes
//! through a temporary file and a rename so the file is never half-written.
//! Callers serialize writers with the lock service.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// File name of the cache inside its root.
pub const CACHE_FILE: &str = "cache.json";

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("failed to {action} install cache at {}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode install cache")]
    Encode(#[from] serde_json::Error),
}

/// Cache scoped to one filesystem root.
#[derive(Debug, Clone)]
pub struct CacheHandler {
    root: PathBuf,
}

impl CacheHandler {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn file(&self) -> PathBuf {
        self.root.join(CACHE_FILE)
    }

    /// Read the value stored under `key`, if any.
    pub async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        Ok(self.load().await?.remove(key))
    }

    /// Store `value` under `key`, replacing any previous value.
    pub async fn set(&self, key: &str, value: &str) -> Result<(), CacheError> {
        let mut entries = self.load().await?;
        entries.insert(key.to_string(), value.to_string());
        self.store(&entries).await
    }

    async fn load(&self) -> Result<BTreeMap<String, String>, CacheError> {
        let path = self.file();
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(source) => {
                return Err(CacheError::Io {
                    action: "read",
                    path,
                    source,
                })
            }
        };

        match serde_json::from_slice(&raw) {
            Ok(entries) => Ok(entries),
            Err(e) => {
                // An unreadable cache only costs a reinstall.
                tracing::warn!(path = %path.display(), error = %e, "Ignoring corrupt install cache");
                Ok(BTreeMap::new())
            }
        }
    }

    async fn store(&self, entries: &BTreeMap<String, String>) -> Result<(), CacheError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|source| io_error("create", &self.root, source))?;

        let encoded = serde_json::to_vec_pretty(entries)?;
        let target = self.file();
        let temp = self
            .root
            .join(format!(".{CACHE_FILE}.{}.tmp", uuid::Uuid::new_v4().simple()));

        if let Err(source) = tokio::fs::write(&temp, &encoded).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(io_error("write", &temp, source));
        }
        if let Err(source) = tokio::fs::rename(&temp, &target).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(io_error("replace", &target, source));
        }
        Ok(())
    }
}

fn io_error(action: &'static str, path: &Path, source: std::io::Error) -> CacheError {
    CacheError::Io {
        action,
        path: path.to_path_buf(),
        source,
    }
}
