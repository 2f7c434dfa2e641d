//! Flowgate worker library.
//!
//! Exposes the worker building blocks (engine installer, install cache,
//! engine executor, job client, poll runtime) so the API server can embed a
//! worker in single-node mode and integration tests can drive them directly.

pub mod cache;
pub mod client;
pub mod config;
pub mod executor;
pub mod installer;
pub mod runtime;

pub use cache::CacheHandler;
pub use client::{JobSource, WorkerClient};
pub use config::WorkerConfig;
pub use executor::{EngineOutput, ProcessExecutor, RunExecutor};
pub use installer::{EngineFingerprint, EngineInstaller, InstallError, InstallOutcome, InstallerConfig};
pub use runtime::WorkerRuntime;
