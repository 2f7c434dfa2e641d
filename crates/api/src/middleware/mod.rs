//! Request extractors enforcing authentication.
//!
//! - [`auth::WorkerAuth`] -- Extracts the worker identity from a Bearer token.

pub mod auth;
