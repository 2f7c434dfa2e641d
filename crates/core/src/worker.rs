//! Worker identity, the subject of worker tokens.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Kind of machine a worker runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMachineType {
    /// Serves every platform.
    Shared,
    /// Reserved for a single platform.
    Dedicated,
}

impl fmt::Display for WorkerMachineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shared => f.write_str("SHARED"),
            Self::Dedicated => f.write_str("DEDICATED"),
        }
    }
}

/// Immutable description of who a worker is, embedded in its token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerIdentity {
    pub machine_type: WorkerMachineType,
    pub platform_id: Option<String>,
}

impl WorkerIdentity {
    /// The fleet-wide worker identity minted by the server at startup.
    pub fn shared() -> Self {
        Self {
            machine_type: WorkerMachineType::Shared,
            platform_id: None,
        }
    }

    pub fn dedicated(platform_id: impl Into<String>) -> Self {
        Self {
            machine_type: WorkerMachineType::Dedicated,
            platform_id: Some(platform_id.into()),
        }
    }

    /// Token subject, e.g. `worker:SHARED` or `worker:DEDICATED:plat_1`.
    pub fn subject(&self) -> String {
        match &self.platform_id {
            Some(platform) => format!("worker:{}:{platform}", self.machine_type),
            None => format!("worker:{}", self.machine_type),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_identity_has_no_platform() {
        let identity = WorkerIdentity::shared();
        assert_eq!(identity.machine_type, WorkerMachineType::Shared);
        assert!(identity.platform_id.is_none());
        assert_eq!(identity.subject(), "worker:SHARED");
    }

    #[test]
    fn dedicated_subject_includes_platform() {
        let identity = WorkerIdentity::dedicated("plat_1");
        assert_eq!(identity.subject(), "worker:DEDICATED:plat_1");
    }
}
