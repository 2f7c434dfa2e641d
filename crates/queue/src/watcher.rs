//! Bridges a blocked inbound webhook caller to the asynchronous run it started.
//!
//! The node that received the HTTP request registers a waiter keyed by run id.
//! Whichever node finishes the run publishes a [`CompletionEvent`] on the
//! fleet-wide [`WEBHOOK_RESPONSE_TOPIC`]; every node's listener sees it and
//! the one holding the waiter resolves it. Removal from the pending map is the
//! single arbitration point, so exactly one of {event, timeout} wins.
//!
//! The listener resubscribes when the completion stream ends (e.g. the broker
//! connection dropped); only [`WebhookResponseWatcher::shutdown`] stops it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use flowgate_core::job::WebhookResponse;
use flowgate_core::types::RunId;

use crate::error::QueueError;
use crate::subscription::resubscribing;
use crate::transport::{EventStream, QueueTransport};

/// Topic carrying run completion events for synchronous webhooks.
pub const WEBHOOK_RESPONSE_TOPIC: &str = "webhook-responses";

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    /// No completion arrived in time. An expected outcome, not a fault.
    #[error("no response for run {run_id} within {after:?}")]
    Timeout { run_id: RunId, after: Duration },

    #[error("run {0} already has a pending webhook wait")]
    Conflict(RunId),

    #[error("webhook response watcher is shut down")]
    Shutdown,

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Wire format of a completion event.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CompletionEvent {
    run_id: RunId,
    response: WebhookResponse,
}

struct Waiter {
    registration: u64,
    sender: oneshot::Sender<WebhookResponse>,
}

type PendingMap = Arc<Mutex<HashMap<RunId, Waiter>>>;

fn lock_pending(pending: &PendingMap) -> std::sync::MutexGuard<'_, HashMap<RunId, Waiter>> {
    pending.lock().unwrap_or_else(|e| e.into_inner())
}

/// Per-node registry of blocked webhook callers plus the listener feeding it.
pub struct WebhookResponseWatcher {
    transport: Arc<dyn QueueTransport>,
    pending: PendingMap,
    next_registration: AtomicU64,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl WebhookResponseWatcher {
    /// Subscribe to the completion topic and start the listener task.
    pub async fn start(transport: Arc<dyn QueueTransport>) -> Result<Arc<Self>, QueueError> {
        let initial = transport.subscribe(WEBHOOK_RESPONSE_TOPIC).await?;
        let events = resubscribing(Arc::clone(&transport), WEBHOOK_RESPONSE_TOPIC, initial);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let listener = tokio::spawn(listen(events, Arc::clone(&pending)));

        tracing::info!(mode = %transport.mode(), "Webhook response watcher started");
        Ok(Arc::new(Self {
            transport,
            pending,
            next_registration: AtomicU64::new(1),
            listener: Mutex::new(Some(listener)),
        }))
    }

    /// Register interest in `run_id` without blocking yet.
    ///
    /// Register before enqueuing the run so its completion cannot be missed.
    /// A second registration for the same run id is rejected.
    pub fn register(&self, run_id: RunId) -> Result<PendingWait, WatchError> {
        if self.listener_stopped() {
            return Err(WatchError::Shutdown);
        }

        let (sender, receiver) = oneshot::channel();
        let registration = self.next_registration.fetch_add(1, Ordering::Relaxed);

        let mut pending = lock_pending(&self.pending);
        if pending.contains_key(&run_id) {
            return Err(WatchError::Conflict(run_id));
        }
        pending.insert(
            run_id.clone(),
            Waiter {
                registration,
                sender,
            },
        );
        drop(pending);

        tracing::debug!(run_id = %run_id, "Registered webhook wait");
        Ok(PendingWait {
            run_id,
            registration,
            receiver,
            pending: Arc::clone(&self.pending),
        })
    }

    /// Block until `run_id` publishes its response or `timeout` elapses.
    pub async fn await_response(
        &self,
        run_id: RunId,
        timeout: Duration,
    ) -> Result<WebhookResponse, WatchError> {
        self.register(run_id)?.wait(timeout).await
    }

    /// Broadcast a run's response to every node.
    pub async fn publish(&self, run_id: RunId, response: WebhookResponse) -> Result<(), WatchError> {
        let payload = serde_json::to_vec(&CompletionEvent { run_id, response })
            .map_err(QueueError::from)?;
        self.transport
            .publish(WEBHOOK_RESPONSE_TOPIC, payload)
            .await?;
        Ok(())
    }

    pub fn is_pending(&self, run_id: &RunId) -> bool {
        lock_pending(&self.pending).contains_key(run_id)
    }

    pub fn pending_count(&self) -> usize {
        lock_pending(&self.pending).len()
    }

    /// Stop listening and fail every outstanding wait with [`WatchError::Shutdown`].
    pub fn shutdown(&self) {
        if let Some(listener) = self
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            listener.abort();
        }
        let dropped = {
            let mut pending = lock_pending(&self.pending);
            let count = pending.len();
            pending.clear();
            count
        };
        tracing::info!(dropped, "Webhook response watcher shut down");
    }

    fn listener_stopped(&self) -> bool {
        self.listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map_or(true, |handle| handle.is_finished())
    }
}

impl Drop for WebhookResponseWatcher {
    fn drop(&mut self) {
        if let Some(listener) = self
            .listener
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            listener.abort();
        }
    }
}

async fn listen(mut events: EventStream, pending: PendingMap) {
    while let Some(payload) = events.next().await {
        match serde_json::from_slice::<CompletionEvent>(&payload) {
            Ok(event) => resolve(&pending, event),
            Err(e) => {
                tracing::warn!(error = %e, "Discarding undecodable webhook completion event");
            }
        }
    }
    tracing::warn!("Webhook completion stream closed");
}

fn resolve(pending: &PendingMap, event: CompletionEvent) {
    // Send while holding the map lock: a waiter that times out concurrently
    // either still finds its entry or finds the response already delivered.
    let mut pending = lock_pending(pending);
    match pending.remove(&event.run_id) {
        Some(waiter) => {
            if waiter.sender.send(event.response).is_err() {
                tracing::debug!(run_id = %event.run_id, "Webhook waiter went away before resolution");
            } else {
                tracing::debug!(run_id = %event.run_id, "Webhook wait resolved");
            }
        }
        None => {
            // Another node's waiter, a duplicate delivery, or a run whose wait
            // already timed out.
            tracing::debug!(run_id = %event.run_id, "No local webhook waiter for completion event");
        }
    }
}

/// A registered wait for one run's response.
///
/// Dropping it (e.g. the HTTP caller disconnected) withdraws the registration.
pub struct PendingWait {
    run_id: RunId,
    registration: u64,
    receiver: oneshot::Receiver<WebhookResponse>,
    pending: PendingMap,
}

impl std::fmt::Debug for PendingWait {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingWait")
            .field("run_id", &self.run_id)
            .field("registration", &self.registration)
            .finish_non_exhaustive()
    }
}

impl PendingWait {
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Block until the response arrives or `timeout` elapses.
    ///
    /// On timeout the registration is removed before returning, so a late
    /// event for this run becomes a no-op.
    pub async fn wait(mut self, timeout: Duration) -> Result<WebhookResponse, WatchError> {
        match tokio::time::timeout(timeout, &mut self.receiver).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(WatchError::Shutdown),
            Err(_) => {
                if self.withdraw() {
                    tracing::info!(run_id = %self.run_id, timeout_ms = timeout.as_millis() as u64, "Webhook wait timed out");
                    return Err(WatchError::Timeout {
                        run_id: self.run_id.clone(),
                        after: timeout,
                    });
                }
                // The listener removed the entry first, so the response is
                // already sitting in the channel.
                self.receiver.try_recv().map_err(|_| WatchError::Timeout {
                    run_id: self.run_id.clone(),
                    after: timeout,
                })
            }
        }
    }

    /// Remove this wait's entry. Returns `false` if it was already gone.
    fn withdraw(&self) -> bool {
        let mut pending = lock_pending(&self.pending);
        match pending.get(&self.run_id) {
            Some(waiter) if waiter.registration == self.registration => {
                pending.remove(&self.run_id);
                true
            }
            _ => false,
        }
    }
}

impl Drop for PendingWait {
    fn drop(&mut self) {
        self.withdraw();
    }
}
