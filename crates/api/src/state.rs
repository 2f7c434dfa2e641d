use std::sync::Arc;

use flowgate_core::lock::LockService;
use flowgate_queue::{QueueTransport, WebhookResponseWatcher};

use crate::config::ServerConfig;
use crate::ws::WsManager;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// Cheaply cloneable; every field is behind an `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    /// Job queue and pub/sub fabric selected at startup.
    pub transport: Arc<dyn QueueTransport>,
    /// Resolves blocked synchronous webhook callers.
    pub watcher: Arc<WebhookResponseWatcher>,
    pub lock: Arc<dyn LockService>,
    /// WebSocket connections held by this node.
    pub ws_manager: Arc<WsManager>,
}
