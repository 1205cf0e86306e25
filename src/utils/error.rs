//! The `error` module defines the error types used within `echomark`.
//!
//! Each layer gets its own enum so callers can tell a malformed payload
//! apart from a dead transport or a failed bind. Errors local to one
//! connection never escape that connection's task.

use std::io;

use thiserror::Error;

/// Failures converting an event to or from its wire representation.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The payload is not a JSON object.
    #[error("malformed event payload: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("event payload has no `c` field")]
    MissingCount,

    #[error("failed to encode event: {0}")]
    Encode(#[source] serde_json::Error),

    /// `c` is present but is not a non-negative integer.
    #[error("count must be a non-negative integer (got {0})")]
    InvalidCount(String),
}

/// Failures raised while a session processes its lifecycle events.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The outbound half of the connection is gone; the frame was not sent.
    #[error("transport closed")]
    TransportClosed,

    #[error("invalid session state: expected {expected}, found {actual}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },
}

/// Failures that abort the server as a whole.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("failed to build runtime: {0}")]
    Runtime(#[source] io::Error),
}

/// Failures reported by the benchmark client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("expected count {expected}, server replied with {actual}")]
    UnexpectedCount { expected: u64, actual: u64 },

    #[error("server closed the connection before replying")]
    ClosedEarly,

    #[error("benchmark task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
