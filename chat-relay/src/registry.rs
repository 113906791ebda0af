use std::{collections::BTreeMap, sync::Arc};

use tokio::sync::Mutex;

use crate::session::{Session, SessionId};

/// The set of sessions that have completed the username handshake.
///
/// Every add, remove and snapshot takes the same lock, so a snapshot is always
/// a single point-in-time view. Members are keyed by [`SessionId`] and come
/// back in join order.
#[derive(Default)]
pub struct Registry {
    sessions: Mutex<BTreeMap<SessionId, Arc<Session>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if the session was already a member.
    pub async fn add(&self, session: Arc<Session>) -> bool {
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(&session.id()) {
            return false;
        }
        sessions.insert(session.id(), session);
        true
    }

    pub async fn remove(&self, id: SessionId) -> Option<Arc<Session>> {
        let mut sessions = self.sessions.lock().await;
        sessions.remove(&id)
    }

    /// Copies the current members out; the lock is released before returning.
    pub async fn snapshot(&self) -> Vec<Arc<Session>> {
        let sessions = self.sessions.lock().await;
        sessions.values().cloned().collect()
    }

    pub async fn usernames(&self) -> Vec<String> {
        self.snapshot()
            .await
            .iter()
            .filter_map(|session| session.username().map(str::to_string))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }
}
