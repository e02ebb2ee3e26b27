//! Postgres-backed execution log store
//!
//! Plan, tool calls and result are stored as JSON text.

use super::{ensure_terminal, ExecutionLogStore};
use crate::db::db_error;
use crate::error::OrchestrationError;
use crate::models::{ExecutionLog, ExecutionOutcome, ExecutionStatus};
use crate::Result;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::sync::Arc;
use tokio::sync::OnceCell;
use uuid::Uuid;

const SELECT_COLUMNS: &str =
    "id, session_id, command, plan, tool_calls, result, total_cost, duration_ms, status, created_at";

#[derive(Clone)]
pub struct PgExecutionLogStore {
    pool: PgPool,
    schema_ready: Arc<OnceCell<()>>,
}

impl PgExecutionLogStore {
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
                    CREATE TABLE IF NOT EXISTS execution_logs (
                      id UUID PRIMARY KEY,
                      session_id UUID NOT NULL,
                      command TEXT NOT NULL,
                      plan TEXT,
                      tool_calls TEXT NOT NULL DEFAULT '[]',
                      result TEXT NOT NULL DEFAULT 'null',
                      total_cost DOUBLE PRECISION NOT NULL DEFAULT 0,
                      duration_ms BIGINT NOT NULL DEFAULT 0,
                      status TEXT NOT NULL,
                      created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                    );
                    "#,
                )
                .execute(&self.pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE INDEX IF NOT EXISTS idx_execution_logs_session_time
                    ON execution_logs (session_id, created_at);
                    "#,
                )
                .execute(&self.pool)
                .await?;

                Ok::<(), sqlx::Error>(())
            })
            .await
            .map_err(|e| db_error("Failed to initialize execution log schema", e))?;

        Ok(())
    }

    fn status_to_db(status: ExecutionStatus) -> &'static str {
        match status {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
        }
    }

    fn status_from_db(status: &str) -> Result<ExecutionStatus> {
        match status {
            "running" => Ok(ExecutionStatus::Running),
            "completed" => Ok(ExecutionStatus::Completed),
            "failed" => Ok(ExecutionStatus::Failed),
            other => Err(OrchestrationError::Database(format!(
                "unknown execution status {}",
                other
            ))),
        }
    }

    fn log_from_row(row: &PgRow) -> Result<ExecutionLog> {
        let read = |e: sqlx::Error| db_error("Failed to read execution log", e);

        let plan: Option<String> = row.try_get("plan").map_err(read)?;
        let tool_calls: String = row.try_get("tool_calls").map_err(read)?;
        let result: String = row.try_get("result").map_err(read)?;
        let status: String = row.try_get("status").map_err(read)?;
        let duration_ms: i64 = row.try_get("duration_ms").map_err(read)?;

        Ok(ExecutionLog {
            id: row.try_get("id").map_err(read)?,
            session_id: row.try_get("session_id").map_err(read)?,
            command: row.try_get("command").map_err(read)?,
            plan: plan.map(|p| serde_json::from_str(&p)).transpose()?,
            tool_calls: serde_json::from_str(&tool_calls)?,
            result: serde_json::from_str(&result)?,
            total_cost: row.try_get("total_cost").map_err(read)?,
            duration_ms: duration_ms.max(0) as u64,
            status: Self::status_from_db(&status)?,
            created_at: row.try_get("created_at").map_err(read)?,
        })
    }
}

#[async_trait::async_trait]
impl ExecutionLogStore for PgExecutionLogStore {
    async fn create(&self, log: ExecutionLog) -> Result<()> {
        self.ensure_schema().await?;

        let plan = log.plan.as_ref().map(serde_json::to_string).transpose()?;

        sqlx::query(
            r#"
            INSERT INTO execution_logs
              (id, session_id, command, plan, tool_calls, result, total_cost, duration_ms, status, created_at)
            VALUES
              ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(log.id)
        .bind(log.session_id)
        .bind(&log.command)
        .bind(plan)
        .bind(serde_json::to_string(&log.tool_calls)?)
        .bind(log.result.to_string())
        .bind(log.total_cost)
        .bind(log.duration_ms as i64)
        .bind(Self::status_to_db(log.status))
        .bind(log.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to create execution log", e))?;

        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<ExecutionLog>> {
        self.ensure_schema().await?;

        let row = sqlx::query(&format!("SELECT {} FROM execution_logs WHERE id = $1", SELECT_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error("Failed to load execution log", e))?;

        row.as_ref().map(Self::log_from_row).transpose()
    }

    async fn finalize(&self, id: Uuid, outcome: ExecutionOutcome) -> Result<ExecutionLog> {
        ensure_terminal(&outcome)?;
        self.ensure_schema().await?;

        let plan = outcome.plan.as_ref().map(serde_json::to_string).transpose()?;

        // The status guard makes the update a one-shot transition.
        let updated = sqlx::query(
            r#"
            UPDATE execution_logs
            SET plan = $2, tool_calls = $3, result = $4, total_cost = $5, duration_ms = $6, status = $7
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(id)
        .bind(plan)
        .bind(serde_json::to_string(&outcome.tool_calls)?)
        .bind(outcome.result.to_string())
        .bind(outcome.total_cost)
        .bind(outcome.duration_ms as i64)
        .bind(Self::status_to_db(outcome.status))
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to finalize execution log", e))?;

        let log = self
            .get(id)
            .await?
            .ok_or_else(|| OrchestrationError::NotFound(format!("execution log {}", id)))?;

        if updated.rows_affected() == 0 {
            return Err(OrchestrationError::InvalidState(format!(
                "execution log {} already finalized",
                id
            )));
        }

        Ok(log)
    }

    async fn list_for_session(&self, session_id: Uuid) -> Result<Vec<ExecutionLog>> {
        self.ensure_schema().await?;

        let rows = sqlx::query(&format!(
            "SELECT {} FROM execution_logs WHERE session_id = $1 ORDER BY created_at ASC",
            SELECT_COLUMNS
        ))
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list execution logs", e))?;

        rows.iter().map(Self::log_from_row).collect()
    }
}
