//! Approval Gate
//!
//! Human-in-the-loop decisions keyed by request id. The requesting task parks
//! on a oneshot receiver; `resolve` records the decision and wakes it. Each
//! request takes exactly one terminal decision; timeouts and cancellations
//! are recorded as `rejected`.

use crate::error::OrchestrationError;
use crate::models::{ApprovalDecision, ApprovalRequest};
use crate::Result;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

#[async_trait::async_trait]
pub trait ApprovalStore: Send + Sync {
    async fn create(&self, request: ApprovalRequest) -> Result<()>;
    async fn get(&self, id: Uuid) -> Result<Option<ApprovalRequest>>;
    /// Record the terminal decision; fails if one is already recorded.
    async fn decide(
        &self,
        id: Uuid,
        decision: ApprovalDecision,
        edited_args: Option<Value>,
    ) -> Result<ApprovalRequest>;
    async fn list_pending(&self, session_id: Uuid) -> Result<Vec<ApprovalRequest>>;
}

#[derive(Clone, Default)]
pub struct InMemoryApprovalStore {
    requests: Arc<RwLock<HashMap<Uuid, ApprovalRequest>>>,
}

impl InMemoryApprovalStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl ApprovalStore for InMemoryApprovalStore {
    async fn create(&self, request: ApprovalRequest) -> Result<()> {
        let mut requests = self.requests.write().await;
        requests.insert(request.id, request);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<ApprovalRequest>> {
        let requests = self.requests.read().await;
        Ok(requests.get(&id).cloned())
    }

    async fn decide(
        &self,
        id: Uuid,
        decision: ApprovalDecision,
        edited_args: Option<Value>,
    ) -> Result<ApprovalRequest> {
        let mut requests = self.requests.write().await;
        let request = requests
            .get_mut(&id)
            .ok_or_else(|| OrchestrationError::NotFound(format!("approval request {}", id)))?;

        if request.decision.is_terminal() {
            return Err(OrchestrationError::InvalidState(format!(
                "approval request {} already {:?}",
                id, request.decision
            )));
        }

        request.decision = decision;
        request.edited_args = edited_args;
        request.decision_made_at = Some(Utc::now());
        Ok(request.clone())
    }

    async fn list_pending(&self, session_id: Uuid) -> Result<Vec<ApprovalRequest>> {
        let requests = self.requests.read().await;
        let mut pending: Vec<ApprovalRequest> = requests
            .values()
            .filter(|r| r.session_id == session_id && !r.decision.is_terminal())
            .cloned()
            .collect();
        pending.sort_by_key(|r| r.created_at);
        Ok(pending)
    }
}

/// Decision delivered to the parked task.
#[derive(Debug, Clone, PartialEq)]
pub struct ApprovalResolution {
    pub decision: ApprovalDecision,
    pub edited_args: Option<Value>,
}

impl ApprovalResolution {
    fn rejected() -> Self {
        Self {
            decision: ApprovalDecision::Rejected,
            edited_args: None,
        }
    }
}

impl From<&ApprovalRequest> for ApprovalResolution {
    fn from(request: &ApprovalRequest) -> Self {
        Self {
            decision: request.decision,
            edited_args: request.edited_args.clone(),
        }
    }
}

pub struct ApprovalGate {
    store: Arc<dyn ApprovalStore>,
    waiters: Mutex<HashMap<Uuid, oneshot::Sender<ApprovalResolution>>>,
}

impl ApprovalGate {
    pub fn new(store: Arc<dyn ApprovalStore>) -> Self {
        Self {
            store,
            waiters: Mutex::new(HashMap::new()),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryApprovalStore::new()))
    }

    /// Create a pending request and the receiver its decision arrives on.
    pub async fn request(
        &self,
        session_id: Uuid,
        tool_name: &str,
        tool_args: Value,
    ) -> Result<(ApprovalRequest, oneshot::Receiver<ApprovalResolution>)> {
        let request = ApprovalRequest {
            id: Uuid::new_v4(),
            session_id,
            tool_name: tool_name.to_string(),
            tool_args,
            decision: ApprovalDecision::Pending,
            edited_args: None,
            decision_made_at: None,
            created_at: Utc::now(),
        };

        let (tx, rx) = oneshot::channel();
        self.store.create(request.clone()).await?;
        self.waiters.lock().await.insert(request.id, tx);

        info!(request_id = %request.id, %session_id, tool_name, "Approval requested");
        Ok((request, rx))
    }

    /// Record an external decision and wake the waiting task.
    pub async fn resolve(
        &self,
        request_id: Uuid,
        decision: ApprovalDecision,
        edited_args: Option<Value>,
    ) -> Result<ApprovalRequest> {
        if !decision.is_terminal() {
            return Err(OrchestrationError::Validation(
                "pending is not a decision".to_string(),
            ));
        }
        let edited_args = match decision {
            ApprovalDecision::Edited => match edited_args {
                Some(args) if args.is_object() => Some(args),
                _ => {
                    return Err(OrchestrationError::Validation(
                        "edited_args must be a JSON object".to_string(),
                    ))
                }
            },
            _ => None,
        };

        let request = self.store.decide(request_id, decision, edited_args).await?;
        info!(request_id = %request_id, decision = ?decision, "Approval decided");

        if let Some(tx) = self.waiters.lock().await.remove(&request_id) {
            // Receiver dropped means the command already ended.
            let _ = tx.send(ApprovalResolution::from(&request));
        }

        Ok(request)
    }

    /// Park until a decision, the timeout, or cancellation.
    ///
    /// Timeout records `rejected`. Cancellation records `rejected` and
    /// returns `Cancelled`.
    pub async fn await_decision(
        &self,
        request_id: Uuid,
        receiver: oneshot::Receiver<ApprovalResolution>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ApprovalResolution> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.close(request_id).await?;
                Err(OrchestrationError::Cancelled)
            }
            received = tokio::time::timeout(timeout, receiver) => match received {
                Ok(Ok(resolution)) => Ok(resolution),
                Ok(Err(_)) => Ok(ApprovalResolution::rejected()),
                Err(_) => {
                    warn!(request_id = %request_id, "Approval timed out");
                    self.close(request_id).await
                }
            },
        }
    }

    /// Record `rejected` unless a decision landed first; returns what stuck.
    async fn close(&self, request_id: Uuid) -> Result<ApprovalResolution> {
        self.waiters.lock().await.remove(&request_id);
        match self
            .store
            .decide(request_id, ApprovalDecision::Rejected, None)
            .await
        {
            Ok(request) => Ok(ApprovalResolution::from(&request)),
            Err(OrchestrationError::InvalidState(_)) => {
                let request = self.store.get(request_id).await?.ok_or_else(|| {
                    OrchestrationError::NotFound(format!("approval request {}", request_id))
                })?;
                Ok(ApprovalResolution::from(&request))
            }
            Err(err) => Err(err),
        }
    }

    pub async fn get(&self, request_id: Uuid) -> Result<Option<ApprovalRequest>> {
        self.store.get(request_id).await
    }

    pub async fn pending_for_session(&self, session_id: Uuid) -> Result<Vec<ApprovalRequest>> {
        self.store.list_pending(session_id).await
    }
}
