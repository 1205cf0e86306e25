use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub type SessionId = String;

/// Handle shared by the listener and every session task.
pub type SharedRegistry = Arc<Mutex<SessionRegistry>>;

/// What the registry remembers about an open session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEntry {
    pub peer: String,
    /// Unix seconds at which the session reached the open state.
    pub opened_at: i64,
}

/// Represents the set of currently open sessions
/// Sessions add themselves when they open and remove themselves when they close
/// Alongside the live set it counts every open and close seen so shutdown can report them
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<SessionId, SessionEntry>,
    total_opened: u64,
    total_closed: u64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedRegistry {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Records an open session.
    /// Returns false and keeps the existing entry if the id is already present
    pub fn add(&mut self, id: SessionId, entry: SessionEntry) -> bool {
        if self.sessions.contains_key(&id) {
            return false;
        }
        self.sessions.insert(id, entry);
        self.total_opened += 1;
        true
    }

    /// Forgets a session. Removing an id that is not present is a no-op
    pub fn remove(&mut self, id: &str) -> Option<SessionEntry> {
        let removed = self.sessions.remove(id);
        if removed.is_some() {
            self.total_closed += 1;
        }
        removed
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn total_opened(&self) -> u64 {
        self.total_opened
    }

    pub fn total_closed(&self) -> u64 {
        self.total_closed
    }

    /// Peer addresses of every open session, in no particular order.
    pub fn peers(&self) -> Vec<String> {
        self.sessions.values().map(|e| e.peer.clone()).collect()
    }
}

/// Locks the registry, recovering the guard if a session task panicked
/// while holding it. The registry carries no invariant a panic could break.
pub fn lock(registry: &SharedRegistry) -> MutexGuard<'_, SessionRegistry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}
