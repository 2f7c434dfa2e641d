//! Real-time event delivery over WebSocket.
//!
//! Sockets connected to this node live in a [`WsManager`]. Events are never
//! sent to sockets directly: producers publish a [`RealtimeEvent`] on the
//! queue fabric and every node's relay fans it out to its own sockets, so a
//! client sees events no matter which node produced them.

mod handler;
mod heartbeat;
pub mod manager;
pub mod relay;

pub use handler::ws_handler;
pub use heartbeat::start_heartbeat;
pub use manager::WsManager;
pub use relay::{notify, publish_event, start_relay, RealtimeEvent, REALTIME_TOPIC};
