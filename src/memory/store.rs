//! In-memory memory store

use super::MemoryStore;
use crate::models::MemoryEntry;
use crate::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Clone, Default)]
pub struct InMemoryMemoryStore {
    entries: Arc<RwLock<HashMap<Uuid, Vec<MemoryEntry>>>>,
}

impl InMemoryMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl MemoryStore for InMemoryMemoryStore {
    async fn append(&self, entry: MemoryEntry) -> Result<()> {
        let mut entries = self.entries.write().await;
        let log = entries.entry(entry.session_id).or_default();

        // Keep timestamp order; equal timestamps stay in append order.
        let position = log.partition_point(|existing| existing.timestamp <= entry.timestamp);
        log.insert(position, entry);
        Ok(())
    }

    async fn recent(&self, session_id: Uuid, limit: usize) -> Result<Vec<MemoryEntry>> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(&session_id)
            .map(|log| {
                let skip = log.len().saturating_sub(limit);
                log[skip..].to_vec()
            })
            .unwrap_or_default())
    }

    async fn list(&self, session_id: Uuid) -> Result<Vec<MemoryEntry>> {
        let entries = self.entries.read().await;
        Ok(entries.get(&session_id).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MemoryType;
    use chrono::{Duration, Utc};

    #[tokio::test]
    async fn test_reload_returns_every_entry_in_order() {
        let store = InMemoryMemoryStore::new();
        let session_id = Uuid::new_v4();

        for i in 0..5 {
            store
                .append(MemoryEntry::new(session_id, MemoryType::Human, format!("turn {}", i)))
                .await
                .unwrap();
        }

        let all = store.list(session_id).await.unwrap();
        assert_eq!(all.len(), 5);
        assert!(all.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        assert_eq!(all[0].content, "turn 0");
        assert_eq!(all[4].content, "turn 4");
    }

    #[tokio::test]
    async fn test_recent_is_bounded_tail() {
        let store = InMemoryMemoryStore::new();
        let session_id = Uuid::new_v4();
        for i in 0..4 {
            store
                .append(MemoryEntry::new(session_id, MemoryType::Agent, format!("m{}", i)))
                .await
                .unwrap();
        }

        let tail = store.recent(session_id, 2).await.unwrap();
        let contents: Vec<_> = tail.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(contents, vec!["m2", "m3"]);
        assert!(store.recent(Uuid::new_v4(), 2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_out_of_order_timestamp_is_sorted() {
        let store = InMemoryMemoryStore::new();
        let session_id = Uuid::new_v4();
        let mut late = MemoryEntry::new(session_id, MemoryType::Human, "late");
        late.timestamp = Utc::now() + Duration::seconds(5);
        store.append(late).await.unwrap();
        store
            .append(MemoryEntry::new(session_id, MemoryType::Human, "early"))
            .await
            .unwrap();

        let all = store.list(session_id).await.unwrap();
        assert_eq!(all[0].content, "early");
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let store = InMemoryMemoryStore::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        store.append(MemoryEntry::new(a, MemoryType::Human, "a")).await.unwrap();
        assert!(store.list(b).await.unwrap().is_empty());
    }
}
