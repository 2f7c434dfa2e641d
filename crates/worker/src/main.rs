use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use flowgate_worker::{
    EngineFingerprint, EngineInstaller, InstallerConfig, ProcessExecutor, WorkerClient,
    WorkerConfig, WorkerRuntime,
};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "flowgate_worker=debug".into());
    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    // --- Configuration ---
    let config = WorkerConfig::from_env().expect("Invalid worker configuration");
    tracing::info!(
        api_url = %config.api_url,
        queue_mode = %config.queue_mode,
        concurrency = config.concurrency,
        "Loaded worker configuration"
    );

    // --- Lock backend ---
    let fabric = flowgate_queue::connect(&config.fabric_options())
        .await
        .expect("Failed to connect queue fabric");

    // --- Runtime ---
    let installer = EngineInstaller::new(
        InstallerConfig {
            fingerprint: EngineFingerprint::generate(),
            executable_path: config.executable_path.clone(),
            dev_mode: config.environment.is_dev(),
        },
        Arc::clone(&fabric.lock),
    );
    let client = WorkerClient::new(config.api_url.clone(), config.worker_token.clone())
        .expect("Failed to build HTTP client");
    let executor = ProcessExecutor::new(config.engine_runtime.clone(), config.run_timeout);

    let runtime = Arc::new(
        WorkerRuntime::new(
            Arc::new(client),
            Arc::new(installer),
            Arc::new(executor),
            config.worker_root.clone(),
        )
        .with_concurrency(config.concurrency)
        .with_poll_backoff(config.poll_backoff),
    );

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(runtime.run(cancel.clone()));

    shutdown_signal().await;
    cancel.cancel();
    if tokio::time::timeout(Duration::from_secs(30), handle).await.is_err() {
        tracing::warn!("Worker did not stop within 30s, exiting anyway");
    }
    tracing::info!("Worker shutdown complete");
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received SIGINT, stopping worker"),
        () = terminate => tracing::info!("Received SIGTERM, stopping worker"),
    }
}
