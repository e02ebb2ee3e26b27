//! Session store
//!
//! Sessions outlive individual commands; `last_active` is refreshed on every
//! command.

use crate::error::OrchestrationError;
use crate::models::AgentSession;
use crate::Result;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[async_trait::async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(&self, session: AgentSession) -> Result<()>;
    async fn get(&self, id: Uuid) -> Result<Option<AgentSession>>;
    /// Refresh `last_active` and return the updated session.
    async fn touch(&self, id: Uuid) -> Result<AgentSession>;
    async fn list_for_user(&self, user_id: &str) -> Result<Vec<AgentSession>>;
}

/// In-memory session store
#[derive(Clone, Default)]
pub struct InMemorySessionStore {
    sessions: Arc<RwLock<HashMap<Uuid, AgentSession>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create(&self, session: AgentSession) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session.id) {
            return Err(OrchestrationError::InvalidState(format!(
                "session {} already exists",
                session.id
            )));
        }
        sessions.insert(session.id, session);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<AgentSession>> {
        let sessions = self.sessions.read().await;
        Ok(sessions.get(&id).cloned())
    }

    async fn touch(&self, id: Uuid) -> Result<AgentSession> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(&id)
            .ok_or_else(|| OrchestrationError::NotFound(format!("session {}", id)))?;
        session.last_active = Utc::now();
        Ok(session.clone())
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<AgentSession>> {
        let sessions = self.sessions.read().await;

        let mut items: Vec<AgentSession> = sessions
            .values()
            .filter(|session| session.user_id == user_id)
            .cloned()
            .collect();

        items.sort_by_key(|session| session.created_at);
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SessionConfig;

    #[tokio::test]
    async fn test_touch_refreshes_last_active() {
        let store = InMemorySessionStore::new();
        let session = AgentSession::new(Uuid::new_v4(), "user-1", SessionConfig::default());
        let created = session.last_active;
        store.create(session.clone()).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let touched = store.touch(session.id).await.unwrap();
        assert!(touched.last_active > created);
        assert_eq!(touched.created_at, session.created_at);
    }

    #[tokio::test]
    async fn test_duplicate_and_missing_sessions() {
        let store = InMemorySessionStore::new();
        let session = AgentSession::new(Uuid::new_v4(), "user-1", SessionConfig::default());
        store.create(session.clone()).await.unwrap();
        assert!(store.create(session).await.is_err());
        assert!(matches!(
            store.touch(Uuid::new_v4()).await,
            Err(OrchestrationError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_for_user() {
        let store = InMemorySessionStore::new();
        for user in ["alice", "alice", "bob"] {
            store
                .create(AgentSession::new(Uuid::new_v4(), user, SessionConfig::default()))
                .await
                .unwrap();
        }
        assert_eq!(store.list_for_user("alice").await.unwrap().len(), 2);
        assert!(store.list_for_user("carol").await.unwrap().is_empty());
    }
}
