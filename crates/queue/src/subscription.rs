//! Topic subscriptions that survive a dropped broker connection.
//!
//! A Redis pub/sub stream simply ends when its connection goes away.
//! [`resubscribing`] wraps such a stream and subscribes again with
//! exponential backoff, so long-lived listeners keep running. Events
//! published while no subscription exists are lost.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;

use crate::transport::{EventStream, QueueTransport};

/// First delay before resubscribing after a stream ends.
pub const INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// Upper bound on the resubscribe delay.
pub const MAX_BACKOFF: Duration = Duration::from_secs(5);

struct Resubscribe {
    transport: Arc<dyn QueueTransport>,
    topic: String,
    current: Option<EventStream>,
    backoff: Duration,
}

/// Follow `topic` forever, starting from an already-open `initial` stream.
///
/// The returned stream never ends on its own; drop it (or abort the task
/// polling it) to stop.
pub fn resubscribing(
    transport: Arc<dyn QueueTransport>,
    topic: &str,
    initial: EventStream,
) -> EventStream {
    let state = Resubscribe {
        transport,
        topic: topic.to_string(),
        current: Some(initial),
        backoff: INITIAL_BACKOFF,
    };

    futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(stream) = state.current.as_mut() {
                let next = stream.next().await;
                match next {
                    Some(payload) => {
                        state.backoff = INITIAL_BACKOFF;
                        return Some((payload, state));
                    }
                    None => {
                        tracing::warn!(topic = %state.topic, "Subscription stream ended, resubscribing");
                        state.current = None;
                    }
                }
            }

            tokio::time::sleep(state.backoff).await;
            state.backoff = (state.backoff * 2).min(MAX_BACKOFF);

            match state.transport.subscribe(&state.topic).await {
                Ok(stream) => {
                    tracing::info!(topic = %state.topic, "Resubscribed to topic");
                    state.current = Some(stream);
                }
                Err(e) => {
                    tracing::warn!(
                        topic = %state.topic,
                        error = %e,
                        retry_in_ms = state.backoff.as_millis() as u64,
                        "Resubscribe failed"
                    );
                }
            }
        }
    })
    .boxed()
}
