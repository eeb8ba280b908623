//! Thread-safe registry of live peer sessions.
//!
//! Every read and write goes through one mutex guarding the whole map. The
//! live map is never handed out; callers that need to iterate (broadcast,
//! shutdown) take a [`SessionRegistry::snapshot`] and release the lock before
//! doing any network I/O.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::session::{PeerId, Session};

/// Maps [`PeerId`] to the [`Session`] currently serving that endpoint.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<PeerId, Arc<Session>>>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a session, returning the one it replaced, if any.
    pub fn insert(&self, session: Arc<Session>) -> Option<Arc<Session>> {
        self.sessions.lock().insert(session.peer_id(), session)
    }

    /// Removes `session` if it is still the registered entry for its peer.
    ///
    /// A newer session registered under the same endpoint is left alone.
    /// Returns `true` if an entry was removed.
    pub fn remove(&self, session: &Arc<Session>) -> bool {
        let mut sessions = self.sessions.lock();
        match sessions.get(&session.peer_id()) {
            Some(current) if Arc::ptr_eq(current, session) => {
                sessions.remove(&session.peer_id());
                true
            }
            _ => false,
        }
    }

    /// Removes every session in `stale` under a single lock acquisition.
    ///
    /// Returns the number of entries actually removed.
    pub fn remove_all(&self, stale: &[Arc<Session>]) -> usize {
        let mut sessions = self.sessions.lock();
        let mut removed = 0;
        for session in stale {
            if sessions
                .get(&session.peer_id())
                .is_some_and(|current| Arc::ptr_eq(current, session))
            {
                sessions.remove(&session.peer_id());
                removed += 1;
            }
        }
        removed
    }

    /// Copies the current set of sessions out from under the lock.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.lock().values().cloned().collect()
    }

    /// Empties the registry, returning every session it held.
    pub fn drain(&self) -> Vec<Arc<Session>> {
        self.sessions.lock().drain().map(|(_, s)| s).collect()
    }

    /// Returns `true` if a session is registered for `peer_id`.
    #[must_use]
    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.sessions.lock().contains_key(peer_id)
    }

    /// Registered peers and when each connected.
    #[must_use]
    pub fn peers(&self) -> Vec<(PeerId, Instant)> {
        self.sessions
            .lock()
            .values()
            .map(|s| (s.peer_id(), s.connected_at()))
            .collect()
    }

    /// Number of registered sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Returns `true` if no sessions are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}
