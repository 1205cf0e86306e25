//! Wire format of the counter-echo event.
//!
//! Both directions carry a flat JSON object `{"c": <count>, "ts": <seconds>}`.
//! Framing belongs to the WebSocket layer; this module only deals with the
//! payload bytes.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::utils::error::CodecError;

/// A single benchmark event.
///
/// `count` echoes the value supplied by the client (0 for the greeting) and
/// `timestamp` is the server clock, in whole seconds since the Unix epoch,
/// at the moment the event was produced.
///
/// # Example
///
/// ```rust
/// use echomark::transport::message::Event;
///
/// let event = Event::new(7, 1_725_000_000);
/// assert_eq!(event.encode().unwrap(), r#"{"c":7,"ts":1725000000}"#);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "c")]
    pub count: u64,
    #[serde(rename = "ts")]
    pub timestamp: i64,
}

impl Event {
    pub fn new(count: u64, timestamp: i64) -> Self {
        Self { count, timestamp }
    }

    /// Builds an event stamped with the current server time.
    pub fn now(count: u64) -> Self {
        Self::new(count, chrono::Utc::now().timestamp())
    }

    /// The event sent once, unconditionally, when a connection opens.
    pub fn greeting() -> Self {
        Self::now(0)
    }

    /// Serializes the event as `{"c":..,"ts":..}`, `c` first.
    pub fn encode(&self) -> Result<String, CodecError> {
        serde_json::to_string(self).map_err(CodecError::Encode)
    }

    /// Parses a complete event as produced by [`Event::encode`].
    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        serde_json::from_slice(payload).map_err(CodecError::Decode)
    }
}

/// Extracts the count from a client payload.
///
/// Fails when the payload is not a JSON object, has no `c` field, or `c` is
/// anything other than an integer in `0..=u64::MAX`. `ts` and any other
/// field is ignored.
pub fn decode_count(payload: &[u8]) -> Result<u64, CodecError> {
    let mut object: Map<String, Value> =
        serde_json::from_slice(payload).map_err(CodecError::Decode)?;
    let count = object.remove("c").ok_or(CodecError::MissingCount)?;

    count
        .as_u64()
        .ok_or_else(|| CodecError::InvalidCount(count.to_string()))
}
