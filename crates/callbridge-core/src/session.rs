//! Per-call session store: registry, media status, and message queue.
//!
//! The three tables are kept separate (a queue may fill up before the
//! call's media status becomes `Available`) but live behind one mutex, so
//! the read-then-write sequences of the dispatch decision are atomic across
//! concurrent webhook deliveries and bot activity consumers. No lock is
//! ever held across an `.await`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::error::{BridgeError, Result};
use crate::types::{CallSession, DispatchAction, MediaStatus};

#[derive(Default)]
struct Tables {
    sessions: HashMap<String, CallSession>,
    status: HashMap<String, MediaStatus>,
    queues: HashMap<String, VecDeque<String>>,
}

impl Tables {
    fn ensure_registered(&self, session_id: &str) -> Result<()> {
        if self.sessions.contains_key(session_id) {
            Ok(())
        } else {
            Err(BridgeError::NotFound(session_id.to_string()))
        }
    }
}

/// In-memory owner of all per-call state.
#[derive(Default)]
pub struct SessionStore {
    tables: Mutex<Tables>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // --- Registry ---

    /// Register a new call. Fails with `DuplicateSession` if the id is taken.
    pub fn create(&self, session: CallSession) -> Result<()> {
        let mut tables = self.lock();
        if tables.sessions.contains_key(&session.session_id) {
            return Err(BridgeError::DuplicateSession(session.session_id));
        }
        let id = session.session_id.clone();
        tables.status.insert(id.clone(), MediaStatus::Uninitialized);
        tables.sessions.insert(id.clone(), session);
        debug!(session_id = %id, "Session registered");
        Ok(())
    }

    pub fn get(&self, session_id: &str) -> Result<CallSession> {
        self.lock()
            .sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| BridgeError::NotFound(session_id.to_string()))
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.lock().sessions.contains_key(session_id)
    }

    /// Drop the call and everything attached to it. Returns the removed
    /// session, or `None` if it was already gone.
    pub fn remove(&self, session_id: &str) -> Option<CallSession> {
        let mut tables = self.lock();
        tables.status.remove(session_id);
        let dropped = tables.queues.remove(session_id).map(|q| q.len()).unwrap_or(0);
        let removed = tables.sessions.remove(session_id);
        if removed.is_some() {
            debug!(session_id, dropped_messages = dropped, "Session removed");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // --- Media status ---

    pub fn set_available(&self, session_id: &str) -> Result<()> {
        self.set_status(session_id, MediaStatus::Available)
    }

    pub fn set_playing(&self, session_id: &str) -> Result<()> {
        self.set_status(session_id, MediaStatus::Playing)
    }

    fn set_status(&self, session_id: &str, status: MediaStatus) -> Result<()> {
        let mut tables = self.lock();
        tables.ensure_registered(session_id)?;
        tables.status.insert(session_id.to_string(), status);
        Ok(())
    }

    /// Current status; unknown sessions read as `Uninitialized`.
    pub fn media_status(&self, session_id: &str) -> MediaStatus {
        self.lock()
            .status
            .get(session_id)
            .copied()
            .unwrap_or_default()
    }

    pub fn is_available(&self, session_id: &str) -> bool {
        self.media_status(session_id) == MediaStatus::Available
    }

    // --- Message queue ---

    pub fn enqueue(&self, session_id: &str, message: impl Into<String>) -> Result<usize> {
        let mut tables = self.lock();
        tables.ensure_registered(session_id)?;
        let queue = tables.queues.entry(session_id.to_string()).or_default();
        queue.push_back(message.into());
        Ok(queue.len())
    }

    pub fn dequeue_next(&self, session_id: &str) -> Option<String> {
        self.lock()
            .queues
            .get_mut(session_id)
            .and_then(|q| q.pop_front())
    }

    pub fn queue_len(&self, session_id: &str) -> usize {
        self.lock()
            .queues
            .get(session_id)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    // --- Dispatch decision ---

    /// Decide the next media command for a call.
    ///
    /// Only an `Available` call gets a command. With messages pending, the
    /// oldest is dequeued and the call moves to `Playing` before the lock is
    /// released, so two concurrent callers can never both receive `Play`.
    pub fn next_action(&self, session_id: &str) -> DispatchAction {
        let mut tables = self.lock();
        let Some(session) = tables.sessions.get(session_id).cloned() else {
            return DispatchAction::Hold;
        };
        if tables.status.get(session_id).copied().unwrap_or_default() != MediaStatus::Available {
            return DispatchAction::Hold;
        }

        let next = tables
            .queues
            .get_mut(session_id)
            .and_then(|q| q.pop_front());

        match next {
            Some(message) => {
                tables
                    .status
                    .insert(session_id.to_string(), MediaStatus::Playing);
                DispatchAction::Play { session, message }
            }
            None => DispatchAction::Listen { session },
        }
    }
}
