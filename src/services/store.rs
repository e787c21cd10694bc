//! Session store — the durable element collection behind the relay.
//!
//! DESIGN
//! ======
//! The relay depends on four operations only: `get_session`,
//! `list_elements`, `append_element` and `clear_elements`. Session CRUD is
//! here too because the HTTP layer needs it, but nothing real-time lives in
//! a store. Two backends exist: `MemStore` below and `PgStore`.
//!
//! Element order is insertion order, tracked by the store-assigned `seq`.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::frame::now_ms;
use crate::state::{DrawElement, Element, Session};

/// Name given to the session that exists at startup.
pub const DEFAULT_SESSION_NAME: &str = "Untitled Whiteboard";

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("session not found: {0}")]
    SessionNotFound(i64),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

// =============================================================================
// CONTRACT
// =============================================================================

/// Storage contract consumed by the relay and the HTTP layer.
#[async_trait::async_trait]
pub trait SessionStore: Send + Sync {
    /// Fetch one session.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the backend fails.
    async fn get_session(&self, session_id: i64) -> Result<Option<Session>, StoreError>;

    /// All sessions, least recently updated first.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the backend fails.
    async fn list_sessions(&self) -> Result<Vec<Session>, StoreError>;

    /// Create a session with the given name.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the backend fails.
    async fn create_session(&self, name: &str) -> Result<Session, StoreError>;

    /// Rename a session, bumping `updated_at`. `None` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the backend fails.
    async fn rename_session(&self, session_id: i64, name: &str) -> Result<Option<Session>, StoreError>;

    /// Elements of a session in insertion order.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the backend fails.
    async fn list_elements(&self, session_id: i64) -> Result<Vec<Element>, StoreError>;

    /// Append an element and return it with its durable `seq`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::SessionNotFound`] for an unknown session, or a
    /// backend error.
    async fn append_element(&self, session_id: i64, element: DrawElement) -> Result<Element, StoreError>;

    /// Remove every element of a session.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the backend fails.
    async fn clear_elements(&self, session_id: i64) -> Result<(), StoreError>;
}

// =============================================================================
// IN-MEMORY BACKEND
// =============================================================================

#[derive(Default)]
struct MemInner {
    sessions: BTreeMap<i64, Session>,
    /// Keyed by `seq`, so iteration is insertion order.
    elements: BTreeMap<i64, Element>,
    next_session_id: i64,
    next_seq: i64,
}

/// Mutex-protected in-memory store. Seeded with the default session (id 1).
pub struct MemStore {
    inner: Mutex<MemInner>,
}

impl MemStore {
    #[must_use]
    pub fn new() -> Self {
        let mut inner = MemInner { next_session_id: 1, next_seq: 1, ..MemInner::default() };
        let now = now_ms();
        let id = inner.next_session_id;
        inner.next_session_id += 1;
        inner
            .sessions
            .insert(id, Session { id, name: DEFAULT_SESSION_NAME.into(), created_at: now, updated_at: now });
        Self { inner: Mutex::new(inner) }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemInner> {
        // Every mutation completes under the lock, so a poisoned guard is still consistent.
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl SessionStore for MemStore {
    async fn get_session(&self, session_id: i64) -> Result<Option<Session>, StoreError> {
        Ok(self.lock().sessions.get(&session_id).cloned())
    }

    async fn list_sessions(&self) -> Result<Vec<Session>, StoreError> {
        let mut sessions: Vec<Session> = self.lock().sessions.values().cloned().collect();
        sessions.sort_by_key(|s| (s.updated_at, s.id));
        Ok(sessions)
    }

    async fn create_session(&self, name: &str) -> Result<Session, StoreError> {
        let mut inner = self.lock();
        let id = inner.next_session_id;
        inner.next_session_id += 1;
        let now = now_ms();
        let session = Session { id, name: name.to_owned(), created_at: now, updated_at: now };
        inner.sessions.insert(id, session.clone());
        Ok(session)
    }

    async fn rename_session(&self, session_id: i64, name: &str) -> Result<Option<Session>, StoreError> {
        let mut inner = self.lock();
        let Some(session) = inner.sessions.get_mut(&session_id) else {
            return Ok(None);
        };
        session.name = name.to_owned();
        session.updated_at = now_ms().max(session.updated_at);
        Ok(Some(session.clone()))
    }

    async fn list_elements(&self, session_id: i64) -> Result<Vec<Element>, StoreError> {
        Ok(self
            .lock()
            .elements
            .values()
            .filter(|e| e.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn append_element(&self, session_id: i64, element: DrawElement) -> Result<Element, StoreError> {
        let mut inner = self.lock();
        if !inner.sessions.contains_key(&session_id) {
            return Err(StoreError::SessionNotFound(session_id));
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let stored = Element { seq, session_id, created_at: now_ms(), element };
        inner.elements.insert(seq, stored.clone());
        Ok(stored)
    }

    async fn clear_elements(&self, session_id: i64) -> Result<(), StoreError> {
        self.lock().elements.retain(|_, e| e.session_id != session_id);
        Ok(())
    }
}

#[cfg(test)]
#[path = "store_test.rs"]
mod tests;
