//! Shared domain types for the flowgate dispatch subsystem.
//!
//! Everything here is free of I/O transports so the queue, worker, and API
//! crates can depend on it without pulling each other in.

pub mod config;
pub mod error;
pub mod job;
pub mod lock;
pub mod mode;
pub mod types;
pub mod worker;
