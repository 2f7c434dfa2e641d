//! Fleet-wide fan-out of real-time events to local sockets.

use std::sync::Arc;

use axum::extract::ws::Message;
use flowgate_core::job::RunStatus;
use flowgate_core::types::RunId;
use flowgate_queue::{resubscribing, QueueError, QueueTransport};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::ws::manager::WsManager;

/// Topic carrying events for WebSocket clients.
pub const REALTIME_TOPIC: &str = "realtime-events";

/// An event pushed to every connected WebSocket client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeEvent {
    pub event: String,
    pub data: serde_json::Value,
}

impl RealtimeEvent {
    pub const FLOW_RUN_QUEUED: &'static str = "FLOW_RUN_QUEUED";
    pub const FLOW_RUN_FINISHED: &'static str = "FLOW_RUN_FINISHED";

    pub fn run_queued(run_id: &RunId, flow_id: &str, synchronous: bool) -> Self {
        Self {
            event: Self::FLOW_RUN_QUEUED.to_string(),
            data: serde_json::json!({
                "run_id": run_id,
                "flow_id": flow_id,
                "synchronous": synchronous,
            }),
        }
    }

    pub fn run_finished(run_id: &RunId, status: RunStatus) -> Self {
        Self {
            event: Self::FLOW_RUN_FINISHED.to_string(),
            data: serde_json::json!({ "run_id": run_id, "status": status }),
        }
    }
}

/// Publish `event` to the sockets of every node.
pub async fn publish_event(
    transport: &dyn QueueTransport,
    event: &RealtimeEvent,
) -> Result<(), QueueError> {
    let payload = serde_json::to_vec(event)?;
    transport.publish(REALTIME_TOPIC, payload).await
}

/// Publish `event`, logging instead of failing when the fabric rejects it.
///
/// Request handlers use this: a lost notification must not fail the request.
pub async fn notify(transport: &dyn QueueTransport, event: RealtimeEvent) {
    if let Err(e) = publish_event(transport, &event).await {
        tracing::warn!(event = %event.event, error = %e, "Failed to publish realtime event");
    }
}

/// Subscribe to [`REALTIME_TOPIC`] and forward every event to this node's
/// sockets as a JSON text frame.
///
/// The subscription is made before returning so startup fails on a broken
/// fabric; afterwards it resubscribes on its own.
pub async fn start_relay(
    transport: Arc<dyn QueueTransport>,
    ws_manager: Arc<WsManager>,
) -> Result<JoinHandle<()>, QueueError> {
    let initial = transport.subscribe(REALTIME_TOPIC).await?;
    let mut events = resubscribing(transport, REALTIME_TOPIC, initial);

    Ok(tokio::spawn(async move {
        while let Some(payload) = events.next().await {
            let event = match serde_json::from_slice::<RealtimeEvent>(&payload) {
                Ok(event) => event,
                Err(e) => {
                    tracing::warn!(error = %e, "Discarding undecodable realtime event");
                    continue;
                }
            };
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to encode realtime event");
                    continue;
                }
            };
            let delivered = ws_manager.broadcast(Message::Text(text.into())).await;
            tracing::trace!(event = %event.event, delivered, "Realtime event relayed");
        }
    }))
}
