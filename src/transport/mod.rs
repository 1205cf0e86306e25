//! The `transport` module is responsible for the network side of the
//! benchmark server.
//!
//! It defines the event wire format, the per-connection session state
//! machine implementing the echo protocol, and the WebSocket listener that
//! accepts connections and drives one session per connection.

pub mod message;
pub mod session;
pub mod websocket;

#[cfg(test)]
mod websocket_tests;

pub use message::Event;
pub use session::{CloseReason, Session, SessionState};
pub use websocket::{Server, start_websocket_server};
