//! Deployment-wide switches read once at startup.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Which transport backs the job queue and the pub/sub fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueMode {
    /// Single process, no cross-process fan-out.
    Memory,
    /// Shared Redis broker; every node sees every published event.
    Redis,
}

impl QueueMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "MEMORY",
            Self::Redis => "REDIS",
        }
    }
}

impl FromStr for QueueMode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "MEMORY" => Ok(Self::Memory),
            "REDIS" => Ok(Self::Redis),
            other => Err(CoreError::Config(format!(
                "Unknown queue mode '{other}', expected MEMORY or REDIS"
            ))),
        }
    }
}

impl fmt::Display for QueueMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runtime environment of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn is_dev(&self) -> bool {
        matches!(self, Self::Development)
    }
}

impl FromStr for Environment {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dev" | "development" => Ok(Self::Development),
            "prod" | "production" => Ok(Self::Production),
            other => Err(CoreError::Config(format!(
                "Unknown environment '{other}', expected development or production"
            ))),
        }
    }
}
