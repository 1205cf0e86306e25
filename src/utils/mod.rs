//! The `utils` module provides definitions shared across the `echomark`
//! server and benchmark client.
//!
//! It centralizes the error types every layer returns and the tracing
//! subscriber setup used by the binary.

pub mod error;
pub mod logging;
