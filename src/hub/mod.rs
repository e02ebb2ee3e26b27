//! Session Event Hub
//!
//! Registry of per-session actors. Each connected session gets one actor
//! task with its own inbox and ordered outbound stream; the registry only
//! holds channel handles. Sessions never share mutable state.

mod actor;
mod claim;

use crate::agent::Orchestrator;
use crate::error::OrchestrationError;
use crate::events::{AgentEvent, ClientMessage};
use crate::Result;
use actor::SessionActor;
pub use claim::{ActiveSessions, SessionClaim};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

struct SessionHandle {
    connection_id: Uuid,
    cancel: CancellationToken,
}

/// One client's view of a session: an inbox and the ordered event stream.
pub struct SessionConnection {
    pub session_id: Uuid,
    pub connection_id: Uuid,
    inbox: mpsc::UnboundedSender<ClientMessage>,
    events: mpsc::UnboundedReceiver<AgentEvent>,
}

impl SessionConnection {
    pub fn send(&self, message: ClientMessage) -> Result<()> {
        self.inbox
            .send(message)
            .map_err(|_| OrchestrationError::InvalidState(format!("session {} is closed", self.session_id)))
    }

    /// Next outbound event; `None` once the session actor has stopped.
    pub async fn next_event(&mut self) -> Option<AgentEvent> {
        self.events.recv().await
    }

    pub fn into_parts(
        self,
    ) -> (
        mpsc::UnboundedSender<ClientMessage>,
        mpsc::UnboundedReceiver<AgentEvent>,
    ) {
        (self.inbox, self.events)
    }
}

pub struct SessionEventHub {
    orchestrator: Arc<Orchestrator>,
    sessions: RwLock<HashMap<Uuid, SessionHandle>>,
    claims: ActiveSessions,
    root: CancellationToken,
}

impl SessionEventHub {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            sessions: RwLock::new(HashMap::new()),
            claims: ActiveSessions::new(),
            root: CancellationToken::new(),
        }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Claim the session for an execution started outside its actor. The
    /// actor refuses to execute while the claim is held, and vice versa.
    pub fn claim_session(&self, session_id: Uuid) -> Option<SessionClaim> {
        self.claims.try_claim(session_id)
    }

    /// Start an actor for the session. An existing actor for the same id is
    /// replaced and its executions cancelled.
    pub async fn connect(&self, session_id: Option<Uuid>) -> SessionConnection {
        let session_id = session_id.unwrap_or_else(Uuid::new_v4);
        let connection_id = Uuid::new_v4();
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let cancel = self.root.child_token();

        let actor = SessionActor::new(
            session_id,
            self.orchestrator.clone(),
            self.claims.clone(),
            inbox_rx,
            event_tx,
            cancel.clone(),
        );
        tokio::spawn(actor.run());

        let previous = self.sessions.write().await.insert(
            session_id,
            SessionHandle {
                connection_id,
                cancel,
            },
        );
        if let Some(previous) = previous {
            previous.cancel.cancel();
            info!(%session_id, replaced = %previous.connection_id, "Session reconnected");
        } else {
            info!(%session_id, %connection_id, "Session connected");
        }

        SessionConnection {
            session_id,
            connection_id,
            inbox: inbox_tx,
            events: event_rx,
        }
    }

    /// Stop the session's actor if this connection still owns it.
    pub async fn disconnect(&self, session_id: Uuid, connection_id: Uuid) {
        let mut sessions = self.sessions.write().await;
        let owned = sessions
            .get(&session_id)
            .map_or(false, |handle| handle.connection_id == connection_id);
        if owned {
            if let Some(handle) = sessions.remove(&session_id) {
                handle.cancel.cancel();
                info!(%session_id, %connection_id, "Session disconnected");
            }
        }
    }

    pub async fn is_connected(&self, session_id: Uuid) -> bool {
        self.sessions.read().await.contains_key(&session_id)
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Cancel every session and everything running under it.
    pub async fn shutdown(&self) {
        self.root.cancel();
        self.sessions.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;
    use crate::models::{ExecutionLog, ExecutionStatus, ToolInput, ToolOutput};
    use crate::tools::{create_simulated_registry, SimulatedLedger, Tool, X402_PAYMENT};
    use serde_json::json;
    use std::time::Duration;

    /// Payment tool that never settles in time.
    struct StalledPayment;

    #[async_trait::async_trait]
    impl Tool for StalledPayment {
        fn name(&self) -> &'static str {
            X402_PAYMENT
        }

        fn description(&self) -> &'static str {
            "payment that hangs"
        }

        async fn execute(&self, _input: &ToolInput) -> Result<ToolOutput> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(ToolOutput::ok(json!({ "cost": 0.1 })))
        }
    }

    fn hub() -> SessionEventHub {
        let registry = create_simulated_registry(Arc::new(SimulatedLedger::new()));
        let orchestrator = Orchestrator::in_memory(OrchestratorConfig::default(), registry);
        SessionEventHub::new(Arc::new(orchestrator))
    }

    fn stalled_hub() -> SessionEventHub {
        let mut registry = create_simulated_registry(Arc::new(SimulatedLedger::new()));
        registry.register(Arc::new(StalledPayment));
        let orchestrator = Orchestrator::in_memory(OrchestratorConfig::default(), registry);
        SessionEventHub::new(Arc::new(orchestrator))
    }

    async fn settled_log(hub: &SessionEventHub, execution_id: Uuid) -> ExecutionLog {
        for _ in 0..100 {
            let log = hub.orchestrator().execution_log(execution_id).await.unwrap();
            if let Some(log) = log.filter(|log| log.status != ExecutionStatus::Running) {
                return log;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("execution {} never finalized", execution_id);
    }

    async fn assert_quiet(connection: &mut SessionConnection, execution_id: Uuid) {
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(200), connection.next_event()).await
        {
            assert_ne!(event.execution_id(), Some(execution_id), "event after cancel: {:?}", event);
        }
    }

    async fn next(connection: &mut SessionConnection) -> AgentEvent {
        tokio::time::timeout(Duration::from_secs(5), connection.next_event())
            .await
            .expect("timed out waiting for event")
            .expect("event stream closed")
    }

    async fn collect_until_terminal(connection: &mut SessionConnection) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        loop {
            let event = next(connection).await;
            let terminal = event.is_terminal();
            events.push(event);
            if terminal {
                return events;
            }
        }
    }

    fn execute(command: &str) -> ClientMessage {
        ClientMessage::Execute {
            command: command.to_string(),
            plan: None,
            budget_limit: None,
        }
    }

    #[tokio::test]
    async fn test_events_arrive_in_causal_order() {
        let hub = hub();
        let mut connection = hub.connect(None).await;
        let session_id = connection.session_id;

        assert_eq!(next(&mut connection).await, AgentEvent::Connected { session_id });

        connection.send(execute("pay 0.10 USDC to API service")).unwrap();
        let events = collect_until_terminal(&mut connection).await;

        let types: Vec<_> = events.iter().map(AgentEvent::event_type).collect();
        assert_eq!(types.first(), Some(&"thinking"));
        assert_eq!(types.last(), Some(&"complete"));
        let call = types.iter().position(|t| *t == "tool_call").unwrap();
        let result = types.iter().position(|t| *t == "tool_result").unwrap();
        assert!(call < result);
        assert!(events.iter().all(|e| e.session_id() == session_id));

        match events.last() {
            Some(AgentEvent::Complete { status, total_cost, .. }) => {
                assert_eq!(*status, ExecutionStatus::Completed);
                assert!((total_cost - 0.10).abs() < 1e-9);
            }
            other => panic!("unexpected terminal event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancel_while_awaiting_approval() {
        let hub = hub();
        let mut connection = hub.connect(None).await;
        next(&mut connection).await;

        connection.send(execute("pay 250 USDC to vendor")).unwrap();
        let execution_id = loop {
            if let AgentEvent::ApprovalRequired { execution_id, .. } = next(&mut connection).await {
                break execution_id;
            }
        };

        // Only one active execution per session.
        connection.send(execute("check my balance")).unwrap();
        match next(&mut connection).await {
            AgentEvent::Error { error_type, .. } => assert_eq!(error_type, "invalid_state"),
            other => panic!("expected error, got {:?}", other),
        }

        connection.send(ClientMessage::Cancel { execution_id }).unwrap();
        assert_eq!(
            next(&mut connection).await,
            AgentEvent::Cancelled {
                session_id: connection.session_id,
                execution_id,
                cancelled: true,
            }
        );

        assert_quiet(&mut connection, execution_id).await;

        let log = settled_log(&hub, execution_id).await;
        assert_eq!(log.status, ExecutionStatus::Failed);
        assert_eq!(log.result["error_type"], "cancelled");
        assert!(log.tool_calls.is_empty());

        // The session accepts a new command once the cancelled task is gone.
        connection.send(execute("check my balance")).unwrap();
        let events = collect_until_terminal(&mut connection).await;
        assert!(matches!(
            events.last(),
            Some(AgentEvent::Complete { status: ExecutionStatus::Completed, .. })
        ));
    }

    #[tokio::test]
    async fn test_cancel_mid_tool_stops_the_stream() {
        let hub = stalled_hub();
        let mut connection = hub.connect(None).await;
        next(&mut connection).await;

        connection.send(execute("pay 5 USDC to vendor")).unwrap();
        let execution_id = loop {
            if let AgentEvent::ToolCall { execution_id, tool_name, .. } = next(&mut connection).await {
                assert_eq!(tool_name, X402_PAYMENT);
                break execution_id;
            }
        };

        connection.send(ClientMessage::Cancel { execution_id }).unwrap();
        assert_eq!(
            next(&mut connection).await,
            AgentEvent::Cancelled {
                session_id: connection.session_id,
                execution_id,
                cancelled: true,
            }
        );
        assert_quiet(&mut connection, execution_id).await;

        let log = settled_log(&hub, execution_id).await;
        assert_eq!(log.status, ExecutionStatus::Failed);
        assert_eq!(log.result["error_type"], "cancelled");
        assert_eq!(log.total_cost, 0.0);
    }

    #[tokio::test]
    async fn test_claimed_session_refuses_execute() {
        let hub = hub();
        let mut connection = hub.connect(None).await;
        next(&mut connection).await;

        let claim = hub.claim_session(connection.session_id).expect("claim");
        connection.send(execute("check my balance")).unwrap();
        match next(&mut connection).await {
            AgentEvent::Error { error_type, .. } => assert_eq!(error_type, "invalid_state"),
            other => panic!("expected error, got {:?}", other),
        }

        drop(claim);
        connection.send(execute("check my balance")).unwrap();
        let events = collect_until_terminal(&mut connection).await;
        assert!(matches!(events.last(), Some(AgentEvent::Complete { .. })));
    }

    #[tokio::test]
    async fn test_cancel_unknown_execution_is_acknowledged() {
        let hub = hub();
        let mut connection = hub.connect(None).await;
        next(&mut connection).await;

        let execution_id = Uuid::new_v4();
        connection.send(ClientMessage::Cancel { execution_id }).unwrap();
        assert_eq!(
            next(&mut connection).await,
            AgentEvent::Cancelled {
                session_id: connection.session_id,
                execution_id,
                cancelled: false,
            }
        );
    }

    #[tokio::test]
    async fn test_approve_resumes_execution() {
        let hub = hub();
        let mut connection = hub.connect(None).await;
        next(&mut connection).await;

        connection.send(execute("pay 250 USDC to vendor")).unwrap();
        let request_id = loop {
            match next(&mut connection).await {
                AgentEvent::ApprovalRequired { request_id, tool_name, .. } => {
                    assert_eq!(tool_name, X402_PAYMENT);
                    break request_id;
                }
                AgentEvent::ToolCall { .. } => panic!("tool ran before approval"),
                _ => {}
            }
        };

        connection.send(ClientMessage::Approve { request_id }).unwrap();
        let events = collect_until_terminal(&mut connection).await;
        assert!(events.iter().any(|e| e.event_type() == "tool_call"));
        assert!(matches!(
            events.last(),
            Some(AgentEvent::Complete { status: ExecutionStatus::Completed, .. })
        ));
    }

    #[tokio::test]
    async fn test_approval_from_other_session_is_refused() {
        let hub = hub();
        let mut owner = hub.connect(None).await;
        let mut other = hub.connect(None).await;
        next(&mut owner).await;
        next(&mut other).await;

        owner.send(execute("pay 250 USDC to vendor")).unwrap();
        let request_id = loop {
            if let AgentEvent::ApprovalRequired { request_id, .. } = next(&mut owner).await {
                break request_id;
            }
        };

        other.send(ClientMessage::Approve { request_id }).unwrap();
        match next(&mut other).await {
            AgentEvent::Error { error_type, .. } => assert_eq!(error_type, "not_found"),
            event => panic!("expected error, got {:?}", event),
        }
    }

    #[tokio::test]
    async fn test_reconnect_replaces_previous_actor() {
        let hub = hub();
        let mut first = hub.connect(None).await;
        let session_id = first.session_id;
        next(&mut first).await;

        let mut second = hub.connect(Some(session_id)).await;
        assert_eq!(next(&mut second).await, AgentEvent::Connected { session_id });
        assert_eq!(hub.session_count().await, 1);

        let closed = tokio::time::timeout(Duration::from_secs(5), first.next_event())
            .await
            .expect("old stream should close");
        assert!(closed.is_none());

        // A stale disconnect does not remove the new owner.
        hub.disconnect(session_id, first.connection_id).await;
        assert!(hub.is_connected(session_id).await);
        hub.disconnect(session_id, second.connection_id).await;
        assert!(!hub.is_connected(session_id).await);
    }
}
