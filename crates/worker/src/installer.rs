//! Provisions the flow engine into a worker's directory.
//!
//! [`EngineInstaller::install`] copies the engine executable and its source
//! map into the target directory once per [`EngineFingerprint`], holding a
//! lock named after the target so concurrent installs to the same directory
//! are totally ordered while different directories proceed in parallel.
//!
//! Copies never write the final file name directly: the source is copied to
//! a temporary file next to the destination and renamed over it, so a reader
//! sees either the previous engine or the complete new one.

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use flowgate_core::lock::{LockError, LockService};

use crate::cache::{CacheError, CacheHandler};

/// Cache key recording which engine build a directory holds.
pub const ENGINE_INSTALLED: &str = "ENGINE_INSTALLED";

/// File name of the installed engine inside a worker directory.
pub const ENGINE_FILE: &str = "main.js";

/// File name of the installed source map inside a worker directory.
pub const ENGINE_MAP_FILE: &str = "main.js.map";

/// Identifies the engine build this process serves.
///
/// Random per process run: a restarted server re-provisions every worker
/// directory on the next install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineFingerprint(String);

impl EngineFingerprint {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EngineFingerprint {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for EngineFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything the installer needs, fixed for the owning service's lifetime.
#[derive(Debug, Clone)]
pub struct InstallerConfig {
    pub fingerprint: EngineFingerprint,
    /// Canonical engine executable; its source map is the sibling
    /// `<executable>.map`.
    pub executable_path: PathBuf,
    /// Reinstall on every call to pick up local rebuilds.
    pub dev_mode: bool,
}

impl InstallerConfig {
    pub fn map_path(&self) -> PathBuf {
        let mut name = OsString::from(self.executable_path.as_os_str());
        name.push(".map");
        PathBuf::from(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error("failed to {action} {}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("could not lock install target")]
    Lock(#[from] LockError),
}

/// What an [`EngineInstaller::install`] call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    /// Files were copied and the cache updated.
    Installed,
    /// The target already held this build; nothing was written.
    AlreadyCurrent,
}

pub struct EngineInstaller {
    config: InstallerConfig,
    lock: Arc<dyn LockService>,
    copies: AtomicU64,
}

impl EngineInstaller {
    pub fn new(config: InstallerConfig, lock: Arc<dyn LockService>) -> Self {
        Self {
            config,
            lock,
            copies: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &InstallerConfig {
        &self.config
    }

    /// Number of file copies performed by this installer so far.
    pub fn copy_count(&self) -> u64 {
        self.copies.load(Ordering::Relaxed)
    }

    /// Ensure `target` holds the current engine build.
    ///
    /// Errors propagate after the lock is released; the cache is only
    /// updated once both files were copied and renamed into place.
    pub async fn install(&self, target: &Path) -> Result<InstallOutcome, InstallError> {
        let lock_name = format!("engine-installer#{}", target.display());
        let lock = self.lock.acquire(&lock_name).await?;

        let result = self.install_locked(target).await;

        if let Err(e) = lock.release().await {
            tracing::warn!(lock = %lock_name, error = %e, "Failed to release installer lock");
        }
        result
    }

    async fn install_locked(&self, target: &Path) -> Result<InstallOutcome, InstallError> {
        tracing::debug!(path = %target.display(), "Installing engine");

        let engine_dest = target.join(ENGINE_FILE);
        let map_dest = target.join(ENGINE_MAP_FILE);
        let cache = CacheHandler::new(target);

        let cached = cache.get(ENGINE_INSTALLED).await?;
        let is_current = cached.as_deref() == Some(self.config.fingerprint.as_str())
            && file_exists(&engine_dest).await
            && file_exists(&map_dest).await;

        if is_current && !self.config.dev_mode {
            tracing::debug!(path = %target.display(), "Engine already installed");
            return Ok(InstallOutcome::AlreadyCurrent);
        }

        tokio::fs::create_dir_all(target)
            .await
            .map_err(|source| InstallError::Io {
                action: "create",
                path: target.to_path_buf(),
                source,
            })?;

        self.atomic_copy(&self.config.executable_path, &engine_dest)
            .await?;
        self.atomic_copy(&self.config.map_path(), &map_dest).await?;

        cache
            .set(ENGINE_INSTALLED, self.config.fingerprint.as_str())
            .await?;

        tracing::info!(
            path = %target.display(),
            fingerprint = %self.config.fingerprint,
            dev_mode = self.config.dev_mode,
            "Engine installed"
        );
        Ok(InstallOutcome::Installed)
    }

    /// Copy `src` to a temporary file beside `dest`, then rename it over `dest`.
    async fn atomic_copy(&self, src: &Path, dest: &Path) -> Result<(), InstallError> {
        let file_name = dest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp = dest.with_file_name(format!(
            ".{file_name}.{}.tmp",
            uuid::Uuid::new_v4().simple()
        ));

        self.copies.fetch_add(1, Ordering::Relaxed);
        if let Err(source) = tokio::fs::copy(src, &temp).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(InstallError::Io {
                action: "copy",
                path: src.to_path_buf(),
                source,
            });
        }

        if let Err(source) = tokio::fs::rename(&temp, dest).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(InstallError::Io {
                action: "rename into",
                path: dest.to_path_buf(),
                source,
            });
        }
        Ok(())
    }
}

async fn file_exists(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}
