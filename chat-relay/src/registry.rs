//! The authoritative set of admitted sessions.
//!
//! Every membership change and every broadcast snapshot goes through one
//! mutex, so a snapshot always sees the complete membership from either
//! before or after any concurrent add/remove. The lock is never held across
//! an await point.

use std::{
    collections::BTreeMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use tracing::debug;

use crate::{
    error::RegistryError,
    session::{Session, SessionId},
};

#[derive(Debug)]
pub struct Registry {
    inner: Mutex<Inner>,
    next_id: AtomicU64,
}

#[derive(Debug)]
struct Inner {
    sessions: BTreeMap<SessionId, Arc<Session>>,
    accepting: bool,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                sessions: BTreeMap::new(),
                accepting: true,
            }),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn next_session_id(&self) -> SessionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admits a session that has finished its handshake and marks it active.
    pub fn add(&self, session: Arc<Session>) -> Result<(), RegistryError> {
        let mut inner = self.lock();
        if !inner.accepting {
            return Err(RegistryError::ShuttingDown);
        }

        let id = session.id();
        if inner.sessions.contains_key(&id) {
            return Err(RegistryError::DuplicateSession(id));
        }
        if !session.activate() {
            return Err(RegistryError::Inactive(id));
        }

        inner.sessions.insert(id, session);
        debug!(session = id, members = inner.sessions.len(), "session registered");
        Ok(())
    }

    /// Removes and retires the session. Absent ids are ignored so that the
    /// read loop and a forced disconnect can both clean up.
    pub fn remove(&self, id: SessionId) -> Option<Arc<Session>> {
        let mut inner = self.lock();
        let removed = inner.sessions.remove(&id)?;
        removed.retire();
        debug!(session = id, members = inner.sessions.len(), "session removed");
        Some(removed)
    }

    /// Point-in-time membership, ordered by session id.
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.lock().sessions.values().cloned().collect()
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.lock().sessions.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Empties the registry and refuses any later admission. The caller owns
    /// closing the returned sessions.
    pub fn drain(&self) -> Vec<Arc<Session>> {
        let mut inner = self.lock();
        inner.accepting = false;
        let drained: Vec<_> = std::mem::take(&mut inner.sessions).into_values().collect();
        for session in &drained {
            session.retire();
        }
        drained
    }
}
