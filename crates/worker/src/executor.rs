//! Runs one flow job against the installed engine.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use flowgate_core::job::{FlowRunJob, RunStatus, WebhookResponse};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::installer::ENGINE_FILE;

/// How much of the engine's stderr is kept in an error.
const STDERR_TAIL: usize = 2048;

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("failed to start engine runtime '{runtime}'")]
    Spawn {
        runtime: String,
        #[source]
        source: std::io::Error,
    },

    #[error("engine I/O failed")]
    Io(#[from] std::io::Error),

    #[error("engine exited with {code:?}: {stderr}")]
    Exit { code: Option<i32>, stderr: String },

    #[error("engine produced no result line")]
    NoOutput,

    #[error("engine result is not valid JSON")]
    Decode(#[from] serde_json::Error),

    #[error("engine run exceeded {0:?}")]
    Timeout(Duration),
}

/// The engine's verdict on a run, printed as its last stdout line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineOutput {
    pub status: RunStatus,
    /// Reply for a blocked webhook caller, when the flow produced one.
    #[serde(default)]
    pub response: Option<WebhookResponse>,
}

/// Executes a job inside a provisioned work directory.
#[async_trait]
pub trait RunExecutor: Send + Sync {
    async fn execute(&self, work_dir: &Path, job: &FlowRunJob) -> Result<EngineOutput, ExecutorError>;
}

/// Runs `<runtime> <work_dir>/main.js` as a child process.
///
/// The job is written to the child's stdin as JSON. The child is killed if
/// the run exceeds the configured timeout or the caller is cancelled.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    runtime: String,
    timeout: Duration,
}

impl ProcessExecutor {
    pub fn new(runtime: impl Into<String>, timeout: Duration) -> Self {
        Self {
            runtime: runtime.into(),
            timeout,
        }
    }

    async fn run(&self, work_dir: &Path, job: &FlowRunJob) -> Result<EngineOutput, ExecutorError> {
        let input = serde_json::to_vec(job)?;

        let mut child = Command::new(&self.runtime)
            .arg(work_dir.join(ENGINE_FILE))
            .current_dir(work_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ExecutorError::Spawn {
                runtime: self.runtime.clone(),
                source,
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            match stdin.write_all(&input).await {
                Ok(()) => {}
                // The engine may exit without reading its input.
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
                Err(e) => return Err(e.into()),
            }
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let start = stderr.len().saturating_sub(STDERR_TAIL);
            let start = (start..stderr.len())
                .find(|i| stderr.is_char_boundary(*i))
                .unwrap_or(stderr.len());
            return Err(ExecutorError::Exit {
                code: output.status.code(),
                stderr: stderr[start..].trim().to_string(),
            });
        }

        parse_output(&output.stdout)
    }
}

#[async_trait]
impl RunExecutor for ProcessExecutor {
    async fn execute(&self, work_dir: &Path, job: &FlowRunJob) -> Result<EngineOutput, ExecutorError> {
        tracing::debug!(run_id = %job.run_id, dir = %work_dir.display(), "Starting engine");
        tokio::time::timeout(self.timeout, self.run(work_dir, job))
            .await
            .map_err(|_| ExecutorError::Timeout(self.timeout))?
    }
}

/// Parse the last non-empty stdout line; earlier lines are engine logs.
fn parse_output(stdout: &[u8]) -> Result<EngineOutput, ExecutorError> {
    let text = String::from_utf8_lossy(stdout);
    let line = text
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .ok_or(ExecutorError::NoOutput)?;
    Ok(serde_json::from_str(line.trim())?)
}
