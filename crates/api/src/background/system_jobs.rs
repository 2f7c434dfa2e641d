//! Periodic maintenance jobs run once per time slot across the fleet.
//!
//! Handlers are registered into a [`SystemJobRegistry`] at startup; a second
//! registration under the same name is a startup error. [`SystemJobScheduler`]
//! then runs one ticker per job. On every tick each replica tries to claim the
//! lock `system-job:<name>:<slot>` (slot = wall-clock time divided by the
//! cadence) for one cadence; only the winner runs the handler.
//!
//! Execution is at-least-once, not exactly-once: a replica that crashes after
//! claiming a slot leaves it claimed until the lease expires, and a lock
//! backend failover can let two replicas win the same slot. Handlers must be
//! idempotent.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flowgate_core::error::CoreError;
use flowgate_core::job::FLOW_QUEUE;
use flowgate_core::lock::LockService;
use flowgate_queue::QueueTransport;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Stable identifiers of the system jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SystemJobName {
    /// Refresh the piece catalog from the marketplace.
    PiecesSync,
    /// Email owners about unresolved run issues.
    IssuesReminder,
    /// Log how many runs are waiting for a worker.
    QueueDepthReport,
}

impl SystemJobName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PiecesSync => "pieces-sync",
            Self::IssuesReminder => "issues-reminder",
            Self::QueueDepthReport => "queue-depth-report",
        }
    }
}

impl fmt::Display for SystemJobName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A zero-argument asynchronous maintenance operation.
#[async_trait]
pub trait SystemJobHandler: Send + Sync {
    async fn run(&self) -> Result<(), CoreError>;
}

struct ScheduledJob {
    name: SystemJobName,
    cadence: Duration,
    handler: Arc<dyn SystemJobHandler>,
}

/// Process-wide set of system jobs, filled once at startup.
#[derive(Default)]
pub struct SystemJobRegistry {
    jobs: BTreeMap<SystemJobName, ScheduledJob>,
}

impl SystemJobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` to run every `cadence`.
    ///
    /// Rejects a second registration for the same name instead of replacing
    /// the first.
    pub fn register(
        &mut self,
        name: SystemJobName,
        cadence: Duration,
        handler: Arc<dyn SystemJobHandler>,
    ) -> Result<(), CoreError> {
        if cadence.is_zero() {
            return Err(CoreError::Validation(format!(
                "System job '{name}' needs a non-zero cadence"
            )));
        }
        if self.jobs.contains_key(&name) {
            return Err(CoreError::Conflict(format!(
                "System job '{name}' is already registered"
            )));
        }

        self.jobs.insert(
            name,
            ScheduledJob {
                name,
                cadence,
                handler,
            },
        );
        Ok(())
    }

    pub fn names(&self) -> Vec<SystemJobName> {
        self.jobs.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// Running tickers for every registered job.
pub struct SystemJobScheduler {
    cancel: CancellationToken,
    tickers: JoinSet<()>,
}

impl SystemJobScheduler {
    /// Start one ticker per registered job. Each ticks immediately, then
    /// once per cadence.
    pub fn init(registry: SystemJobRegistry, lock: Arc<dyn LockService>) -> Self {
        let cancel = CancellationToken::new();
        let mut tickers = JoinSet::new();

        for job in registry.jobs.into_values() {
            tracing::info!(
                job = %job.name,
                cadence_secs = job.cadence.as_secs_f64(),
                "System job scheduled"
            );
            tickers.spawn(run_ticker(job, Arc::clone(&lock), cancel.clone()));
        }

        Self { cancel, tickers }
    }

    /// Stop every ticker and wait for in-progress handlers to finish.
    pub async fn close(mut self) {
        self.cancel.cancel();
        while let Some(joined) = self.tickers.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "System job ticker panicked");
            }
        }
        tracing::info!("System job scheduler stopped");
    }
}

async fn run_ticker(job: ScheduledJob, lock: Arc<dyn LockService>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(job.cadence);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => run_once(&job, lock.as_ref()).await,
        }
    }
}

/// Claim the current slot and run the handler if this replica won it.
async fn run_once(job: &ScheduledJob, lock: &dyn LockService) {
    let cadence_ms = job.cadence.as_millis().max(1);
    let now_ms = u128::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default();
    let slot = now_ms / cadence_ms;
    let lock_name = format!("system-job:{}:{slot}", job.name);

    let claim = match lock.try_acquire(&lock_name, job.cadence).await {
        Ok(Some(claim)) => claim,
        Ok(None) => {
            tracing::debug!(job = %job.name, slot, "System job slot claimed elsewhere");
            return;
        }
        Err(e) => {
            tracing::warn!(job = %job.name, error = %e, "Could not claim system job slot");
            return;
        }
    };

    let started = tokio::time::Instant::now();
    let result = job.handler.run().await;
    // The slot stays claimed until it expires so no replica reruns it.
    claim.keep_until_expiry();

    match result {
        Ok(()) => tracing::debug!(
            job = %job.name,
            slot,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "System job finished"
        ),
        Err(e) => tracing::error!(job = %job.name, slot, error = %e, "System job failed"),
    }
}

// ---------------------------------------------------------------------------
// Built-in jobs
// ---------------------------------------------------------------------------

/// Logs the flow queue depth.
pub struct QueueDepthReport {
    transport: Arc<dyn QueueTransport>,
}

impl QueueDepthReport {
    pub const CADENCE: Duration = Duration::from_secs(60);

    pub fn new(transport: Arc<dyn QueueTransport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl SystemJobHandler for QueueDepthReport {
    async fn run(&self) -> Result<(), CoreError> {
        let depth = self
            .transport
            .depth(FLOW_QUEUE)
            .await
            .map_err(|e| CoreError::Internal(format!("queue depth unavailable: {e}")))?;
        tracing::info!(queue = FLOW_QUEUE, depth, "Queue depth");
        Ok(())
    }
}
