//! Session registry: the single shared mutable map of session state.
//!
//! The background worker writes full replacements; status pollers read
//! cloned snapshots. Each session sits behind its own lock so writes to
//! one session never block another, and no lock is held across an await.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};

use crate::models::session::SessionState;
use crate::Result;

/// Boxed future returned by registry operations.
pub type RegistryFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Concurrency-safe store of session state keyed by `session_id`.
///
/// All writes for one key are linearizable. Implementations may be
/// in-process or an external key-value store.
pub trait SessionRegistry: Send + Sync {
    /// Snapshot of a session, if registered.
    fn get(&self, session_id: &str) -> RegistryFuture<'_, Option<SessionState>>;

    /// Insert or fully replace a session.
    fn put(&self, state: SessionState) -> RegistryFuture<'_, ()>;

    /// Remove a session. Returns `true` if it existed.
    fn delete(&self, session_id: &str) -> RegistryFuture<'_, bool>;

    /// Snapshots of every registered session, oldest first.
    fn list(&self) -> RegistryFuture<'_, Vec<SessionState>>;
}

type Slot = Arc<RwLock<SessionState>>;

/// In-process registry with per-session locking.
#[derive(Debug, Default)]
pub struct InMemorySessionRegistry {
    slots: RwLock<HashMap<String, Slot>>,
}

impl InMemorySessionRegistry {
    /// Construct an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, session_id: &str) -> Option<Slot> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned()
    }

    fn put_sync(&self, state: SessionState) {
        if let Some(slot) = self.slot(&state.session_id) {
            *slot.write().unwrap_or_else(PoisonError::into_inner) = state;
            return;
        }

        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        match slots.get(&state.session_id) {
            Some(slot) => *slot.write().unwrap_or_else(PoisonError::into_inner) = state,
            None => {
                slots.insert(state.session_id.clone(), Arc::new(RwLock::new(state)));
            }
        }
    }
}

impl SessionRegistry for InMemorySessionRegistry {
    fn get(&self, session_id: &str) -> RegistryFuture<'_, Option<SessionState>> {
        let state = self
            .slot(session_id)
            .map(|slot| slot.read().unwrap_or_else(PoisonError::into_inner).clone());
        Box::pin(async move { Ok(state) })
    }

    fn put(&self, state: SessionState) -> RegistryFuture<'_, ()> {
        self.put_sync(state);
        Box::pin(async { Ok(()) })
    }

    fn delete(&self, session_id: &str) -> RegistryFuture<'_, bool> {
        let removed = self
            .slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id)
            .is_some();
        Box::pin(async move { Ok(removed) })
    }

    fn list(&self) -> RegistryFuture<'_, Vec<SessionState>> {
        let slots: Vec<Slot> = self
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        let mut states: Vec<SessionState> = slots
            .iter()
            .map(|slot| slot.read().unwrap_or_else(PoisonError::into_inner).clone())
            .collect();
        states.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        Box::pin(async move { Ok(states) })
    }
}
