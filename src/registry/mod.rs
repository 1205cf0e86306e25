//! The `registry` module keeps the process-wide set of open sessions.
//!
//! It is bookkeeping only: sessions never look each other up through it,
//! so a lost entry affects diagnostics and nothing else.

pub mod engine;

pub use engine::{SessionEntry, SessionId, SessionRegistry, SharedRegistry};
