//! Postgres-backed memory store

use super::MemoryStore;
use crate::db::db_error;
use crate::models::{MemoryEntry, MemoryType};
use crate::Result;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row};
use std::sync::Arc;
use tokio::sync::OnceCell;
use uuid::Uuid;

#[derive(Clone)]
pub struct PgMemoryStore {
    pool: PgPool,
    schema_ready: Arc<OnceCell<()>>,
}

impl PgMemoryStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            schema_ready: Arc::new(OnceCell::new()),
        }
    }

    async fn ensure_schema(&self) -> Result<()> {
        self.schema_ready
            .get_or_try_init(|| async {
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS memory_entries (
                      id BIGSERIAL PRIMARY KEY,
                      session_id UUID NOT NULL,
                      entry_type TEXT NOT NULL,
                      content TEXT NOT NULL,
                      metadata TEXT NOT NULL DEFAULT '{}',
                      created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                    );
                    "#,
                )
                .execute(&self.pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE INDEX IF NOT EXISTS idx_memory_entries_session_time
                    ON memory_entries (session_id, created_at);
                    "#,
                )
                .execute(&self.pool)
                .await?;

                Ok::<(), sqlx::Error>(())
            })
            .await
            .map_err(|e| db_error("Failed to initialize memory schema", e))?;

        Ok(())
    }

    fn type_to_db(entry_type: MemoryType) -> &'static str {
        match entry_type {
            MemoryType::Human => "human",
            MemoryType::Agent => "agent",
            MemoryType::System => "system",
        }
    }

    fn type_from_db(entry_type: &str) -> MemoryType {
        match entry_type {
            "agent" => MemoryType::Agent,
            "system" => MemoryType::System,
            _ => MemoryType::Human,
        }
    }

    fn entry_from_row(row: &sqlx::postgres::PgRow) -> Result<MemoryEntry> {
        let entry_type: String = row
            .try_get("entry_type")
            .map_err(|e| db_error("Failed to read memory entry", e))?;
        let metadata: String = row.try_get("metadata").unwrap_or_else(|_| "{}".to_string());
        let timestamp: DateTime<Utc> = row
            .try_get("created_at")
            .map_err(|e| db_error("Failed to read memory entry", e))?;

        Ok(MemoryEntry {
            session_id: row
                .try_get("session_id")
                .map_err(|e| db_error("Failed to read memory entry", e))?,
            entry_type: Self::type_from_db(&entry_type),
            content: row.try_get("content").unwrap_or_default(),
            timestamp,
            metadata: serde_json::from_str(&metadata).unwrap_or(Value::Null),
        })
    }
}

#[async_trait::async_trait]
impl MemoryStore for PgMemoryStore {
    async fn append(&self, entry: MemoryEntry) -> Result<()> {
        self.ensure_schema().await?;

        sqlx::query(
            r#"
            INSERT INTO memory_entries (session_id, entry_type, content, metadata, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(entry.session_id)
        .bind(Self::type_to_db(entry.entry_type))
        .bind(&entry.content)
        .bind(entry.metadata.to_string())
        .bind(entry.timestamp)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to append memory entry", e))?;

        Ok(())
    }

    async fn recent(&self, session_id: Uuid, limit: usize) -> Result<Vec<MemoryEntry>> {
        self.ensure_schema().await?;

        let rows = sqlx::query(
            r#"
            SELECT session_id, entry_type, content, metadata, created_at
            FROM memory_entries
            WHERE session_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2
            "#,
        )
        .bind(session_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to load recent memory", e))?;

        let mut entries = rows
            .iter()
            .map(Self::entry_from_row)
            .collect::<Result<Vec<_>>>()?;
        entries.reverse();
        Ok(entries)
    }

    async fn list(&self, session_id: Uuid) -> Result<Vec<MemoryEntry>> {
        self.ensure_schema().await?;

        let rows = sqlx::query(
            r#"
            SELECT session_id, entry_type, content, metadata, created_at
            FROM memory_entries
            WHERE session_id = $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to load memory", e))?;

        rows.iter().map(Self::entry_from_row).collect()
    }
}
