//! Session registry: the authoritative map of registered sessions.
//!
//! Constructed once by the host and shared by reference with the manager and
//! every supervisor. All operations take the lock once, so "is this id
//! registered" is consistent for every reader.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use tokio::sync::RwLock;

use worldhost_common::error::{HostError, HostResult};

use crate::record::RunningSession;

#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, Arc<RunningSession>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert if absent. A colliding id is an engine contract breach.
    pub async fn insert(&self, session: Arc<RunningSession>) -> HostResult<()> {
        let mut sessions = self.sessions.write().await;
        match sessions.entry(session.id().to_owned()) {
            Entry::Occupied(entry) => Err(HostError::DuplicateSession(entry.key().clone())),
            Entry::Vacant(entry) => {
                entry.insert(session);
                Ok(())
            }
        }
    }

    pub async fn get(&self, id: &str) -> Option<Arc<RunningSession>> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn remove(&self, id: &str) -> Option<Arc<RunningSession>> {
        self.sessions.write().await.remove(id)
    }

    /// Remove `session` only if it is still the record registered under its id.
    pub async fn remove_if_same(&self, session: &Arc<RunningSession>) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get(session.id()) {
            Some(current) if Arc::ptr_eq(current, session) => {
                sessions.remove(session.id());
                true
            }
            _ => false,
        }
    }

    pub async fn snapshot(&self) -> Vec<Arc<RunningSession>> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}
