//! Shared helpers for API integration tests.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, Response};
use axum::Router;
use flowgate_api::auth::jwt::{issue_worker_token, JwtConfig};
use flowgate_api::config::ServerConfig;
use flowgate_api::router::build_app_router;
use flowgate_api::state::AppState;
use flowgate_api::ws::{start_relay, WsManager};
use flowgate_core::lock::MemoryLock;
use flowgate_core::mode::{Environment, QueueMode};
use flowgate_core::worker::WorkerIdentity;
use flowgate_queue::{InMemoryTransport, QueueTransport, WebhookResponseWatcher};
use http_body_util::BodyExt;
use tower::ServiceExt;

/// Build a test `ServerConfig` with short timeouts.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        request_timeout_secs: 30,
        shutdown_timeout_secs: 5,
        queue_mode: QueueMode::Memory,
        redis_url: None,
        environment: Environment::Development,
        engine_executable_path: PathBuf::from("/nonexistent/engine.js"),
        engine_runtime: "node".to_string(),
        worker_root: PathBuf::from("/tmp/flowgate-test/workers"),
        webhook_timeout: Duration::from_millis(200),
        worker_poll_wait: Duration::from_millis(100),
        lock_ttl: Duration::from_secs(5),
        lock_acquire_timeout: Duration::from_secs(5),
        job_visibility_timeout: Duration::from_secs(60),
        run_embedded_worker: false,
        jwt: JwtConfig {
            secret: "test-secret-that-is-long-enough-for-hmac".to_string(),
            worker_token_expiry_days: 7,
        },
    }
}

/// A router plus handles on the pieces behind it.
pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub transport: Arc<InMemoryTransport>,
}

impl TestApp {
    /// A valid shared worker token for this app's secret.
    pub fn worker_token(&self) -> String {
        issue_worker_token(&WorkerIdentity::shared(), &self.state.config.jwt)
            .expect("token issuance")
    }
}

/// Build the full application router over an in-memory fabric.
pub async fn build_test_app() -> TestApp {
    build_test_app_with(test_config()).await
}

pub async fn build_test_app_with(config: ServerConfig) -> TestApp {
    build_test_node(config, Arc::new(InMemoryTransport::new())).await
}

/// Build one node over `transport`; nodes sharing a transport form a fleet.
pub async fn build_test_node(config: ServerConfig, transport: Arc<InMemoryTransport>) -> TestApp {
    let dyn_transport: Arc<dyn QueueTransport> = transport.clone();
    let watcher = WebhookResponseWatcher::start(Arc::clone(&dyn_transport))
        .await
        .expect("watcher start");
    let ws_manager = Arc::new(WsManager::new());
    start_relay(Arc::clone(&dyn_transport), Arc::clone(&ws_manager))
        .await
        .expect("relay start");

    let state = AppState {
        config: Arc::new(config),
        transport: dyn_transport,
        watcher,
        lock: Arc::new(MemoryLock::default()),
        ws_manager,
    };

    TestApp {
        router: build_app_router(state.clone()),
        state,
        transport,
    }
}

pub async fn get(app: &Router, uri: &str) -> Response<Body> {
    send(app, Method::GET, uri, None, Body::empty()).await
}

pub async fn post_json(
    app: &Router,
    uri: &str,
    token: Option<&str>,
    body: serde_json::Value,
) -> Response<Body> {
    send(app, Method::POST, uri, token, Body::from(body.to_string())).await
}

pub async fn send(
    app: &Router,
    method: Method,
    uri: &str,
    token: Option<&str>,
    body: Body,
) -> Response<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    app.clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap()
}

pub async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .unwrap()
        .to_bytes()
        .to_vec()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}
