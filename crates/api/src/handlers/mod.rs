//! Request handlers.
//!
//! - [`webhooks`] -- inbound webhook triggers (async and synchronous).
//! - [`workers`] -- the worker pull and completion endpoints.

pub mod webhooks;
pub mod workers;
