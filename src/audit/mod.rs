//! Execution log store
//!
//! One log per top-level command. Created as `running` when the command
//! starts and finalized exactly once; a second finalize is an error.

use crate::error::OrchestrationError;
use crate::models::{ExecutionLog, ExecutionOutcome, ExecutionStatus};
use crate::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

pub mod postgres;

pub use postgres::PgExecutionLogStore;

#[async_trait::async_trait]
pub trait ExecutionLogStore: Send + Sync {
    async fn create(&self, log: ExecutionLog) -> Result<()>;
    async fn get(&self, id: Uuid) -> Result<Option<ExecutionLog>>;
    /// Apply the completion data to a `running` log.
    async fn finalize(&self, id: Uuid, outcome: ExecutionOutcome) -> Result<ExecutionLog>;
    /// Logs for a session, oldest first.
    async fn list_for_session(&self, session_id: Uuid) -> Result<Vec<ExecutionLog>>;
}

pub(crate) fn ensure_terminal(outcome: &ExecutionOutcome) -> Result<()> {
    if outcome.status == ExecutionStatus::Running {
        return Err(OrchestrationError::InvalidState(
            "execution log cannot be finalized as running".to_string(),
        ));
    }
    Ok(())
}

/// In-memory execution log store
#[derive(Clone, Default)]
pub struct InMemoryExecutionLogStore {
    logs: Arc<RwLock<HashMap<Uuid, ExecutionLog>>>,
}

impl InMemoryExecutionLogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl ExecutionLogStore for InMemoryExecutionLogStore {
    async fn create(&self, log: ExecutionLog) -> Result<()> {
        let mut logs = self.logs.write().await;
        if logs.contains_key(&log.id) {
            return Err(OrchestrationError::InvalidState(format!(
                "execution log {} already exists",
                log.id
            )));
        }
        logs.insert(log.id, log);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<ExecutionLog>> {
        let logs = self.logs.read().await;
        Ok(logs.get(&id).cloned())
    }

    async fn finalize(&self, id: Uuid, outcome: ExecutionOutcome) -> Result<ExecutionLog> {
        ensure_terminal(&outcome)?;

        let mut logs = self.logs.write().await;
        let log = logs
            .get_mut(&id)
            .ok_or_else(|| OrchestrationError::NotFound(format!("execution log {}", id)))?;

        if log.status != ExecutionStatus::Running {
            return Err(OrchestrationError::InvalidState(format!(
                "execution log {} already finalized",
                id
            )));
        }

        log.plan = outcome.plan;
        log.tool_calls = outcome.tool_calls;
        log.result = outcome.result;
        log.total_cost = outcome.total_cost;
        log.duration_ms = outcome.duration_ms;
        log.status = outcome.status;

        Ok(log.clone())
    }

    async fn list_for_session(&self, session_id: Uuid) -> Result<Vec<ExecutionLog>> {
        let logs = self.logs.read().await;

        let mut items: Vec<ExecutionLog> = logs
            .values()
            .filter(|log| log.session_id == session_id)
            .cloned()
            .collect();

        items.sort_by_key(|log| log.created_at);
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outcome(status: ExecutionStatus) -> ExecutionOutcome {
        ExecutionOutcome {
            plan: None,
            tool_calls: Vec::new(),
            result: json!({"ok": true}),
            total_cost: 1.5,
            duration_ms: 12,
            status,
        }
    }

    #[tokio::test]
    async fn test_finalize_exactly_once() {
        let store = InMemoryExecutionLogStore::new();
        let id = Uuid::new_v4();
        store
            .create(ExecutionLog::start(id, Uuid::new_v4(), "pay 1 USDC to x"))
            .await
            .unwrap();

        let log = store.finalize(id, outcome(ExecutionStatus::Completed)).await.unwrap();
        assert_eq!(log.status, ExecutionStatus::Completed);
        assert_eq!(log.total_cost, 1.5);

        let err = store.finalize(id, outcome(ExecutionStatus::Failed)).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::InvalidState(_)));
        let stored = store.get(id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_finalize_rejects_running_and_missing() {
        let store = InMemoryExecutionLogStore::new();
        let id = Uuid::new_v4();
        assert!(matches!(
            store.finalize(id, outcome(ExecutionStatus::Failed)).await,
            Err(OrchestrationError::NotFound(_))
        ));

        store.create(ExecutionLog::start(id, Uuid::new_v4(), "x")).await.unwrap();
        assert!(store.finalize(id, outcome(ExecutionStatus::Running)).await.is_err());
    }

    #[tokio::test]
    async fn test_list_for_session() {
        let store = InMemoryExecutionLogStore::new();
        let session_id = Uuid::new_v4();
        for command in ["a", "b"] {
            store
                .create(ExecutionLog::start(Uuid::new_v4(), session_id, command))
                .await
                .unwrap();
        }
        store
            .create(ExecutionLog::start(Uuid::new_v4(), Uuid::new_v4(), "other"))
            .await
            .unwrap();

        let logs = store.list_for_session(session_id).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].command, "a");
    }
}
