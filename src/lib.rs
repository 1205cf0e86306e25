//! # echomark
//!
//! `echomark` is a minimal WebSocket benchmarking server. Every client
//! message carrying a counter `c` is answered with `{"c": c, "ts": now}`, so a
//! client can measure round-trip latency and throughput under load.
//!
//! ## Core Modules
//!
//! - `transport`: The listener, the per-connection session state machine and the event wire format.
//! - `registry`: Bookkeeping of the currently open sessions.
//! - `client`: A load-generating benchmark client.
//! - `config`: Handles loading and managing server configuration.
//! - `utils`: Error types and logging setup.

pub mod client;
pub mod config;
pub mod registry;
pub mod transport;
pub mod utils;
