//! In-process session store

use super::SessionStore;
use crate::errors::{AppError, Result};
use crate::session::{Session, SessionStatus};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Session store backed by a map; same CAS semantics as the Postgres store
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    async fn filter<F>(&self, predicate: F) -> Vec<Session>
    where
        F: Fn(&Session) -> bool,
    {
        let mut found: Vec<Session> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| predicate(s))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        found
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create(&self, session: &Session) -> Result<Session> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(session.id()) {
            return Err(AppError::Internal {
                message: format!("session id {} already exists", session.id()),
            });
        }
        sessions.insert(session.id.clone(), session.clone());
        Ok(session.clone())
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<Session>> {
        Ok(self.sessions.read().await.get(id).cloned())
    }

    async fn find_active_by_party(&self, party_id: &str) -> Result<Vec<Session>> {
        Ok(self
            .filter(|s| s.status.is_open() && s.party_of(party_id).is_some())
            .await)
    }

    async fn update(&self, session: &Session) -> Result<Session> {
        let mut sessions = self.sessions.write().await;
        let stored = sessions
            .get_mut(session.id())
            .ok_or_else(|| AppError::SessionNotFound {
                id: session.id().to_string(),
            })?;

        if stored.version != session.version {
            return Err(AppError::VersionConflict {
                id: session.id().to_string(),
                expected: session.version,
            });
        }

        let mut next = session.clone();
        next.version += 1;
        *stored = next.clone();
        Ok(next)
    }

    async fn list_billable(&self) -> Result<Vec<Session>> {
        Ok(self
            .filter(|s| s.status == SessionStatus::Active && s.fully_joined())
            .await)
    }

    async fn list_open(&self) -> Result<Vec<Session>> {
        Ok(self.filter(|s| s.status.is_open()).await)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionKind;
    use chrono::Utc;
    use tokio_test::{assert_err, assert_ok};

    fn session(id: &str, requester: &str, provider: &str) -> Session {
        Session::new(
            id.into(),
            requester.into(),
            provider.into(),
            SessionKind::Audio,
            SessionStatus::Pending,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate_id() {
        let store = MemorySessionStore::new();
        assert_ok!(store.create(&session("s-1", "r", "p")).await);
        assert_err!(store.create(&session("s-1", "r2", "p2")).await);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_update_is_compare_and_swap() {
        let store = MemorySessionStore::new();
        let created = store.create(&session("s-1", "r", "p")).await.unwrap();

        let first = store.update(&created).await.unwrap();
        assert_eq!(first.version(), 1);

        let stale = store.update(&created).await;
        assert!(matches!(stale, Err(AppError::VersionConflict { expected: 0, .. })));
    }

    #[tokio::test]
    async fn test_find_active_by_party_matches_either_role() {
        let store = MemorySessionStore::new();
        store.create(&session("s-1", "alice", "bob")).await.unwrap();

        assert_eq!(store.find_active_by_party("alice").await.unwrap().len(), 1);
        assert_eq!(store.find_active_by_party("bob").await.unwrap().len(), 1);
        assert!(store.find_active_by_party("carol").await.unwrap().is_empty());

        let mut ended = store.get_by_id("s-1").await.unwrap().unwrap();
        ended.status = SessionStatus::Rejected;
        store.update(&ended).await.unwrap();
        assert!(store.find_active_by_party("alice").await.unwrap().is_empty());
        assert!(store.list_open().await.unwrap().is_empty());
    }
}
