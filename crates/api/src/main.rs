use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use flowgate_api::auth::jwt::issue_worker_token;
use flowgate_api::background::system_jobs::{
    QueueDepthReport, SystemJobName, SystemJobRegistry, SystemJobScheduler,
};
use flowgate_api::config::ServerConfig;
use flowgate_api::router::build_app_router;
use flowgate_api::state::AppState;
use flowgate_api::ws;
use flowgate_core::worker::WorkerIdentity;
use flowgate_queue::WebhookResponseWatcher;
use flowgate_worker::{
    EngineFingerprint, EngineInstaller, InstallerConfig, ProcessExecutor, WorkerClient,
    WorkerRuntime,
};

/// Engine runs in the embedded worker are killed after this long.
const EMBEDDED_RUN_TIMEOUT: Duration = Duration::from_secs(600);

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "flowgate_api=debug,flowgate_queue=debug,tower_http=debug".into());
    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    // --- Configuration ---
    let config = ServerConfig::from_env().expect("Invalid server configuration");
    tracing::info!(
        host = %config.host,
        port = config.port,
        queue_mode = %config.queue_mode,
        environment = ?config.environment,
        "Loaded server configuration"
    );

    // --- Queue fabric ---
    let fabric = flowgate_queue::connect(&config.fabric_options())
        .await
        .expect("Failed to connect queue fabric");

    let watcher = WebhookResponseWatcher::start(Arc::clone(&fabric.transport))
        .await
        .expect("Failed to start webhook response watcher");

    // --- WebSocket ---
    let ws_manager = Arc::new(ws::WsManager::new());
    let relay_handle = ws::start_relay(Arc::clone(&fabric.transport), Arc::clone(&ws_manager))
        .await
        .expect("Failed to start realtime event relay");
    let heartbeat_handle = ws::start_heartbeat(Arc::clone(&ws_manager));

    // --- Worker token ---
    let worker_token = issue_worker_token(&WorkerIdentity::shared(), &config.jwt)
        .expect("Failed to issue worker token");
    tracing::info!("Shared worker token issued");

    // --- System jobs ---
    let mut jobs = SystemJobRegistry::new();
    jobs.register(
        SystemJobName::QueueDepthReport,
        QueueDepthReport::CADENCE,
        Arc::new(QueueDepthReport::new(Arc::clone(&fabric.transport))),
    )
    .expect("Duplicate system job registration");
    let scheduler = SystemJobScheduler::init(jobs, Arc::clone(&fabric.lock));

    // --- App state ---
    let state = AppState {
        config: Arc::new(config.clone()),
        transport: Arc::clone(&fabric.transport),
        watcher: Arc::clone(&watcher),
        lock: Arc::clone(&fabric.lock),
        ws_manager: Arc::clone(&ws_manager),
    };
    let app = build_app_router(state);

    // --- Start server ---
    let addr = SocketAddr::new(
        config.host.parse().expect("Invalid HOST address"),
        config.port,
    );
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind to address");
    let local_addr = listener.local_addr().expect("Listener has no local address");
    tracing::info!(%local_addr, "Starting server");

    // --- Embedded worker ---
    let worker_cancel = CancellationToken::new();
    let worker_handle = if config.run_embedded_worker {
        let loopback = match local_addr.ip() {
            ip if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            ip => ip,
        };
        let api_url = format!("http://{}", SocketAddr::new(loopback, local_addr.port()));

        let installer = EngineInstaller::new(
            InstallerConfig {
                fingerprint: EngineFingerprint::generate(),
                executable_path: config.engine_executable_path.clone(),
                dev_mode: config.environment.is_dev(),
            },
            Arc::clone(&fabric.lock),
        );
        let client = WorkerClient::new(api_url, worker_token)
            .expect("Failed to build embedded worker HTTP client");
        let runtime = Arc::new(WorkerRuntime::new(
            Arc::new(client),
            Arc::new(installer),
            Arc::new(ProcessExecutor::new(
                config.engine_runtime.clone(),
                EMBEDDED_RUN_TIMEOUT,
            )),
            config.worker_root.clone(),
        ));
        tracing::info!("Embedded worker started");
        Some(tokio::spawn(runtime.run(worker_cancel.clone())))
    } else {
        None
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(worker_cancel.clone()))
        .await
        .expect("Server error");

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, cleaning up");
    let grace = Duration::from_secs(config.shutdown_timeout_secs);

    if let Some(handle) = worker_handle {
        worker_cancel.cancel();
        if tokio::time::timeout(grace, handle).await.is_err() {
            tracing::warn!("Embedded worker did not stop in time");
        }
    }

    if tokio::time::timeout(grace, scheduler.close()).await.is_err() {
        tracing::warn!("System job scheduler did not stop in time");
    }

    watcher.shutdown();
    relay_handle.abort();

    let ws_count = ws_manager.connection_count().await;
    tracing::info!(ws_count, "Closing remaining WebSocket connections");
    ws_manager.shutdown_all().await;

    heartbeat_handle.abort();
    tracing::info!("Heartbeat task stopped");

    tracing::info!("Graceful shutdown complete");
}

/// Wait for a termination signal to initiate graceful shutdown.
///
/// Cancels the embedded worker first: its long-poll would otherwise hold a
/// connection open through the drain.
async fn shutdown_signal(worker_cancel: CancellationToken) {
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
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
    worker_cancel.cancel();
}
