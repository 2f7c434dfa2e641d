use std::path::PathBuf;
use std::time::Duration;

use flowgate_core::config::{optional, parse_or, required, ConfigError};
use flowgate_core::mode::{Environment, QueueMode};
use flowgate_queue::FabricOptions;

use crate::auth::jwt::JwtConfig;

/// Default root under which the embedded worker's slots live.
const DEFAULT_WORKER_ROOT: &str = "/tmp/flowgate/workers";

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: `0.0.0.0`).
    pub host: String,
    /// Bind port (default: `3000`).
    pub port: u16,
    /// HTTP request timeout in seconds (default: `60`).
    pub request_timeout_secs: u64,
    /// Graceful shutdown timeout in seconds (default: `30`).
    pub shutdown_timeout_secs: u64,
    pub queue_mode: QueueMode,
    /// Broker URL; always present when `queue_mode` is `REDIS`.
    pub redis_url: Option<String>,
    pub environment: Environment,
    /// Canonical engine executable; its map is `<path>.map`.
    pub engine_executable_path: PathBuf,
    /// Program that runs the installed engine (default: `node`).
    pub engine_runtime: String,
    pub worker_root: PathBuf,
    /// How long a synchronous webhook caller waits for its run.
    pub webhook_timeout: Duration,
    /// How long a worker poll blocks before answering 204.
    pub worker_poll_wait: Duration,
    pub lock_ttl: Duration,
    pub lock_acquire_timeout: Duration,
    /// A polled job not completed within this is handed to another worker.
    pub job_visibility_timeout: Duration,
    /// Run a worker inside the server process.
    pub run_embedded_worker: bool,
    /// JWT token configuration (secret, expiry).
    pub jwt: JwtConfig,
}

impl ServerConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an environment lookup with defaults.
    ///
    /// | Env Var                       | Default                  |
    /// |-------------------------------|--------------------------|
    /// | `HOST`                        | `0.0.0.0`                |
    /// | `PORT`                        | `3000`                   |
    /// | `REQUEST_TIMEOUT_SECS`        | `60`                     |
    /// | `SHUTDOWN_TIMEOUT_SECS`       | `30`                     |
    /// | `QUEUE_MODE`                  | `MEMORY`                 |
    /// | `REDIS_URL`                   | required when `REDIS`    |
    /// | `ENVIRONMENT`                 | `production`             |
    /// | `ENGINE_EXECUTABLE_PATH`      | required                 |
    /// | `ENGINE_RUNTIME`              | `node`                   |
    /// | `WORKER_ROOT`                 | `/tmp/flowgate/workers`  |
    /// | `WEBHOOK_TIMEOUT_SECS`        | `30`                     |
    /// | `WORKER_POLL_WAIT_SECS`       | `10`                     |
    /// | `LOCK_TTL_SECS`               | `60`                     |
    /// | `LOCK_ACQUIRE_TIMEOUT_SECS`   | `30`                     |
    /// | `JOB_VISIBILITY_TIMEOUT_SECS` | `900`                    |
    /// | `RUN_EMBEDDED_WORKER`         | `true` in `MEMORY` mode  |
    /// | `JWT_SECRET`                  | required                 |
    /// | `WORKER_TOKEN_EXPIRY_DAYS`    | `7`                      |
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let queue_mode = parse_or(&lookup, "QUEUE_MODE", QueueMode::Memory)?;
        let redis_url = optional(&lookup, "REDIS_URL");
        if queue_mode == QueueMode::Redis && redis_url.is_none() {
            return Err(ConfigError::Missing("REDIS_URL"));
        }

        let webhook_timeout_secs: u64 = parse_or(&lookup, "WEBHOOK_TIMEOUT_SECS", 30)?;
        let request_timeout_secs: u64 = parse_or(&lookup, "REQUEST_TIMEOUT_SECS", 60)?;
        if webhook_timeout_secs >= request_timeout_secs {
            return Err(ConfigError::Invalid {
                key: "WEBHOOK_TIMEOUT_SECS",
                value: webhook_timeout_secs.to_string(),
                reason: "must be shorter than REQUEST_TIMEOUT_SECS".to_string(),
            });
        }

        let job_visibility_timeout_secs: u64 = parse_or(&lookup, "JOB_VISIBILITY_TIMEOUT_SECS", 900)?;
        if job_visibility_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "JOB_VISIBILITY_TIMEOUT_SECS",
                value: job_visibility_timeout_secs.to_string(),
                reason: "must be positive".to_string(),
            });
        }

        Ok(Self {
            host: optional(&lookup, "HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_or(&lookup, "PORT", 3000)?,
            request_timeout_secs,
            shutdown_timeout_secs: parse_or(&lookup, "SHUTDOWN_TIMEOUT_SECS", 30)?,
            queue_mode,
            redis_url,
            environment: parse_or(&lookup, "ENVIRONMENT", Environment::Production)?,
            engine_executable_path: PathBuf::from(required(&lookup, "ENGINE_EXECUTABLE_PATH")?),
            engine_runtime: optional(&lookup, "ENGINE_RUNTIME").unwrap_or_else(|| "node".into()),
            worker_root: optional(&lookup, "WORKER_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_WORKER_ROOT)),
            webhook_timeout: Duration::from_secs(webhook_timeout_secs),
            worker_poll_wait: Duration::from_secs(parse_or(&lookup, "WORKER_POLL_WAIT_SECS", 10)?),
            lock_ttl: Duration::from_secs(parse_or(&lookup, "LOCK_TTL_SECS", 60)?),
            lock_acquire_timeout: Duration::from_secs(parse_or(
                &lookup,
                "LOCK_ACQUIRE_TIMEOUT_SECS",
                30,
            )?),
            job_visibility_timeout: Duration::from_secs(job_visibility_timeout_secs),
            run_embedded_worker: parse_or(
                &lookup,
                "RUN_EMBEDDED_WORKER",
                queue_mode == QueueMode::Memory,
            )?,
            jwt: JwtConfig::from_lookup(&lookup)?,
        })
    }

    pub fn fabric_options(&self) -> FabricOptions {
        FabricOptions {
            mode: self.queue_mode,
            redis_url: self.redis_url.clone(),
            lock_ttl: self.lock_ttl,
            lock_acquire_timeout: self.lock_acquire_timeout,
            visibility_timeout: self.job_visibility_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    fn with_base(extra: &[(&'static str, &'static str)]) -> Vec<(&'static str, &'static str)> {
        let mut pairs = vec![
            ("JWT_SECRET", "secret"),
            ("ENGINE_EXECUTABLE_PATH", "/opt/engine/main.js"),
        ];
        pairs.extend_from_slice(extra);
        pairs
    }

    #[test]
    fn defaults_apply() {
        let config = ServerConfig::from_lookup(lookup(&with_base(&[]))).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3000);
        assert_eq!(config.queue_mode, QueueMode::Memory);
        assert_eq!(config.environment, Environment::Production);
        assert_eq!(config.webhook_timeout, Duration::from_secs(30));
        assert_eq!(config.worker_poll_wait, Duration::from_secs(10));
        assert_eq!(config.jwt.worker_token_expiry_days, 7);
        assert_eq!(config.job_visibility_timeout, Duration::from_secs(900));
        assert_eq!(config.fabric_options().visibility_timeout, Duration::from_secs(900));
        assert!(config.run_embedded_worker);
    }

    #[test]
    fn missing_jwt_secret_fails_startup() {
        let result =
            ServerConfig::from_lookup(lookup(&[("ENGINE_EXECUTABLE_PATH", "/opt/engine")]));
        assert_matches!(result, Err(ConfigError::Missing("JWT_SECRET")));
    }

    #[test]
    fn redis_mode_requires_url() {
        let result = ServerConfig::from_lookup(lookup(&with_base(&[("QUEUE_MODE", "REDIS")])));
        assert_matches!(result, Err(ConfigError::Missing("REDIS_URL")));
    }

    #[test]
    fn redis_mode_disables_embedded_worker_by_default() {
        let config = ServerConfig::from_lookup(lookup(&with_base(&[
            ("QUEUE_MODE", "REDIS"),
            ("REDIS_URL", "redis://localhost:6379"),
        ])))
        .unwrap();
        assert!(!config.run_embedded_worker);
        assert_eq!(config.fabric_options().redis_url.as_deref(), Some("redis://localhost:6379"));
    }

    #[test]
    fn unknown_queue_mode_is_rejected() {
        let result = ServerConfig::from_lookup(lookup(&with_base(&[("QUEUE_MODE", "kafka")])));
        assert_matches!(result, Err(ConfigError::Invalid { key: "QUEUE_MODE", .. }));
    }

    #[test]
    fn zero_visibility_timeout_is_rejected() {
        let result =
            ServerConfig::from_lookup(lookup(&with_base(&[("JOB_VISIBILITY_TIMEOUT_SECS", "0")])));
        assert_matches!(
            result,
            Err(ConfigError::Invalid { key: "JOB_VISIBILITY_TIMEOUT_SECS", .. })
        );
    }

    #[test]
    fn webhook_timeout_must_fit_in_request_timeout() {
        let result = ServerConfig::from_lookup(lookup(&with_base(&[
            ("WEBHOOK_TIMEOUT_SECS", "90"),
            ("REQUEST_TIMEOUT_SECS", "60"),
        ])));
        assert_matches!(
            result,
            Err(ConfigError::Invalid { key: "WEBHOOK_TIMEOUT_SECS", .. })
        );
    }
}
