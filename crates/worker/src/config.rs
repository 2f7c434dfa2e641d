use std::path::PathBuf;
use std::time::Duration;

use flowgate_core::config::{optional, parse_or, required, ConfigError};
use flowgate_core::lock::{DEFAULT_ACQUIRE_TIMEOUT, DEFAULT_LOCK_TTL};
use flowgate_core::mode::{Environment, QueueMode};
use flowgate_queue::{FabricOptions, DEFAULT_VISIBILITY_TIMEOUT};

/// Default API base URL for a worker running next to the server.
const DEFAULT_API_URL: &str = "http://127.0.0.1:3000";

/// Default root under which each worker slot gets its own directory.
pub const DEFAULT_WORKER_ROOT: &str = "/tmp/flowgate/workers";

/// Worker process configuration loaded from environment variables.
///
/// | Variable                 | Default                  |
/// |--------------------------|--------------------------|
/// | `API_URL`                | `http://127.0.0.1:3000`  |
/// | `WORKER_TOKEN`           | required                 |
/// | `ENGINE_EXECUTABLE_PATH` | required                 |
/// | `WORKER_ROOT`            | `/tmp/flowgate/workers`  |
/// | `ENVIRONMENT`            | `production`             |
/// | `ENGINE_RUNTIME`         | `node`                   |
/// | `WORKER_CONCURRENCY`     | `1`                      |
/// | `POLL_BACKOFF_MS`        | `1000`                   |
/// | `RUN_TIMEOUT_SECS`       | `600`                    |
/// | `QUEUE_MODE`             | `MEMORY`                 |
/// | `REDIS_URL`              | required when `REDIS`    |
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub api_url: String,
    pub worker_token: String,
    pub executable_path: PathBuf,
    pub worker_root: PathBuf,
    pub environment: Environment,
    /// Program that runs the installed engine file.
    pub engine_runtime: String,
    /// Number of concurrent poll loops.
    pub concurrency: usize,
    /// Pause after a failed poll before retrying.
    pub poll_backoff: Duration,
    /// Engine processes running longer than this are killed.
    pub run_timeout: Duration,
    /// Selects the lock backend shared with other workers.
    pub queue_mode: QueueMode,
    pub redis_url: Option<String>,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let concurrency: usize = parse_or(&lookup, "WORKER_CONCURRENCY", 1)?;
        if concurrency == 0 {
            return Err(ConfigError::Invalid {
                key: "WORKER_CONCURRENCY",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        let queue_mode = parse_or(&lookup, "QUEUE_MODE", QueueMode::Memory)?;
        let redis_url = optional(&lookup, "REDIS_URL");
        if queue_mode == QueueMode::Redis && redis_url.is_none() {
            return Err(ConfigError::Missing("REDIS_URL"));
        }

        Ok(Self {
            api_url: optional(&lookup, "API_URL")
                .unwrap_or_else(|| DEFAULT_API_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            worker_token: required(&lookup, "WORKER_TOKEN")?,
            executable_path: PathBuf::from(required(&lookup, "ENGINE_EXECUTABLE_PATH")?),
            worker_root: optional(&lookup, "WORKER_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_WORKER_ROOT)),
            environment: parse_or(&lookup, "ENVIRONMENT", Environment::Production)?,
            engine_runtime: optional(&lookup, "ENGINE_RUNTIME").unwrap_or_else(|| "node".to_string()),
            concurrency,
            poll_backoff: Duration::from_millis(parse_or(&lookup, "POLL_BACKOFF_MS", 1000)?),
            run_timeout: Duration::from_secs(parse_or(&lookup, "RUN_TIMEOUT_SECS", 600)?),
            queue_mode,
            redis_url,
        })
    }

    /// Lock backend options for this worker's queue mode.
    pub fn fabric_options(&self) -> FabricOptions {
        FabricOptions {
            mode: self.queue_mode,
            redis_url: self.redis_url.clone(),
            lock_ttl: DEFAULT_LOCK_TTL,
            lock_acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
        }
    }
}
