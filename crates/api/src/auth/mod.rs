//! Worker authentication primitives.
//!
//! - [`jwt`] -- worker token issuance and validation.

pub mod jwt;
