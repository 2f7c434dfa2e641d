//! Background tasks and scheduled jobs.
//!
//! Long-running tasks accept a [`CancellationToken`](tokio_util::sync::CancellationToken)
//! or expose a `close` for graceful shutdown.

pub mod system_jobs;
