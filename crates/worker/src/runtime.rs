//! The worker's poll → install → execute → complete loop.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use flowgate_core::job::{JobCompletion, QueuedJob, RunStatus, WebhookResponse};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::client::JobSource;
use crate::executor::RunExecutor;
use crate::installer::EngineInstaller;

/// Runs `concurrency` independent poll loops, one per slot.
///
/// Each slot owns the work directory `<worker_root>/<slot>`, so slots never
/// share an installed engine while it is being replaced.
pub struct WorkerRuntime {
    source: Arc<dyn JobSource>,
    installer: Arc<EngineInstaller>,
    executor: Arc<dyn RunExecutor>,
    worker_root: PathBuf,
    concurrency: usize,
    poll_backoff: Duration,
    name: String,
}

impl WorkerRuntime {
    pub fn new(
        source: Arc<dyn JobSource>,
        installer: Arc<EngineInstaller>,
        executor: Arc<dyn RunExecutor>,
        worker_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            source,
            installer,
            executor,
            worker_root: worker_root.into(),
            concurrency: 1,
            poll_backoff: Duration::from_secs(1),
            name: format!("worker-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_poll_backoff(mut self, backoff: Duration) -> Self {
        self.poll_backoff = backoff;
        self
    }

    pub fn slot_dir(&self, slot: usize) -> PathBuf {
        self.worker_root.join(slot.to_string())
    }

    /// Run every slot until `cancel` fires, then wait for in-progress jobs.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        tracing::info!(
            worker = %self.name,
            slots = self.concurrency,
            root = %self.worker_root.display(),
            "Worker started"
        );

        let mut slots = JoinSet::new();
        for slot in 0..self.concurrency {
            let runtime = Arc::clone(&self);
            let cancel = cancel.clone();
            slots.spawn(async move { runtime.run_slot(slot, cancel).await });
        }
        while let Some(joined) = slots.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Worker slot panicked");
            }
        }

        tracing::info!(worker = %self.name, "Worker stopped");
    }

    async fn run_slot(&self, slot: usize, cancel: CancellationToken) {
        let consumer = format!("{}-{slot}", self.name);

        loop {
            let polled = tokio::select! {
                _ = cancel.cancelled() => break,
                polled = self.source.poll(&consumer) => polled,
            };

            match polled {
                Ok(Some(job)) => {
                    self.process_one(slot, job).await;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(slot, error = %e, "Poll failed, backing off");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.poll_backoff) => {}
                    }
                }
            }
        }
    }

    /// Install, execute and report one job. Returns what was reported.
    pub async fn process_one(&self, slot: usize, queued: QueuedJob) -> JobCompletion {
        let job = &queued.job;
        let work_dir = self.slot_dir(slot);
        tracing::info!(slot, run_id = %job.run_id, flow_id = %job.flow_id, "Executing run");

        let (status, response) = match self.installer.install(&work_dir).await {
            Err(e) => {
                tracing::error!(slot, run_id = %job.run_id, error = %e, "Engine install failed");
                (RunStatus::Failed, None)
            }
            Ok(_) => match self.executor.execute(&work_dir, job).await {
                Ok(output) => (output.status, output.response),
                Err(e) => {
                    tracing::error!(slot, run_id = %job.run_id, error = %e, "Engine run failed");
                    (RunStatus::Failed, None)
                }
            },
        };

        let completion = JobCompletion {
            run_id: job.run_id.clone(),
            status,
            response: job
                .synchronous
                .then(|| response.unwrap_or_else(|| fallback_response(status))),
        };

        if let Err(e) = self.source.complete(&queued.id, &completion).await {
            tracing::error!(slot, run_id = %job.run_id, error = %e, "Failed to report run completion");
        } else {
            tracing::info!(slot, run_id = %job.run_id, status = ?status, "Run completed");
        }
        completion
    }
}

/// Reply for a synchronous caller when the flow produced none.
fn fallback_response(status: RunStatus) -> WebhookResponse {
    match status {
        RunStatus::Succeeded => WebhookResponse::new(204, serde_json::Value::Null),
        RunStatus::Failed => WebhookResponse::new(
            500,
            serde_json::json!({ "message": "Flow run failed" }),
        ),
    }
}
