//! Per-session actor
//!
//! Owns the session's single active execution and the ordered outbound
//! stream. Inbound messages are handled one at a time. Each execution gets
//! its own event channel; cancelling drops that channel after draining it,
//! so a `cancelled` event is never followed by anything else from that
//! execution.

use super::claim::ActiveSessions;
use crate::agent::Orchestrator;
use crate::error::OrchestrationError;
use crate::events::{AgentEvent, ClientMessage, EventSink};
use crate::models::{ApprovalDecision, CommandRequest, ExecutionPlan};
use crate::Result;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

struct ActiveExecution {
    execution_id: Uuid,
    cancel: CancellationToken,
    events: mpsc::UnboundedReceiver<AgentEvent>,
    handle: JoinHandle<()>,
    /// Terminal event already forwarded; only the task's exit is left.
    finished: bool,
}

pub(crate) struct SessionActor {
    session_id: Uuid,
    orchestrator: Arc<Orchestrator>,
    claims: ActiveSessions,
    inbox: mpsc::UnboundedReceiver<ClientMessage>,
    outbound: mpsc::UnboundedSender<AgentEvent>,
    cancel: CancellationToken,
    active: Option<ActiveExecution>,
    /// Task of an execution that was cancelled or has finished but may not
    /// have exited yet. Awaited before the next execution starts.
    retiring: Option<JoinHandle<()>>,
}

async fn next_execution_event(active: &mut Option<ActiveExecution>) -> Option<AgentEvent> {
    match active {
        Some(active) => active.events.recv().await,
        None => std::future::pending().await,
    }
}

impl SessionActor {
    pub(crate) fn new(
        session_id: Uuid,
        orchestrator: Arc<Orchestrator>,
        claims: ActiveSessions,
        inbox: mpsc::UnboundedReceiver<ClientMessage>,
        outbound: mpsc::UnboundedSender<AgentEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session_id,
            orchestrator,
            claims,
            inbox,
            outbound,
            cancel,
            active: None,
            retiring: None,
        }
    }

    pub(crate) async fn run(mut self) {
        self.send(AgentEvent::Connected {
            session_id: self.session_id,
        });

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                event = next_execution_event(&mut self.active) => match event {
                    Some(event) => self.forward(event),
                    None => self.retire(),
                },
                message = self.inbox.recv() => match message {
                    Some(message) => self.handle(message).await,
                    None => break,
                },
            }
        }

        if let Some(active) = self.active.take() {
            active.cancel.cancel();
        }
        debug!(session_id = %self.session_id, "Session actor stopped");
    }

    async fn handle(&mut self, message: ClientMessage) {
        // Anything the execution produced so far goes out before the reply.
        self.drain();

        match message {
            ClientMessage::Execute {
                command,
                plan,
                budget_limit,
            } => self.execute(command, plan, budget_limit).await,
            ClientMessage::Cancel { execution_id } => self.cancel_execution(execution_id),
            ClientMessage::Approve { request_id } => {
                self.decide(request_id, ApprovalDecision::Approved, None).await
            }
            ClientMessage::Reject { request_id } => {
                self.decide(request_id, ApprovalDecision::Rejected, None).await
            }
            ClientMessage::Edit {
                request_id,
                edited_args,
            } => {
                self.decide(request_id, ApprovalDecision::Edited, Some(edited_args))
                    .await
            }
        }
    }

    async fn execute(&mut self, command: String, plan: Option<ExecutionPlan>, budget_limit: Option<f64>) {
        if let Some(active) = self.active.as_ref().filter(|active| !active.finished) {
            warn!(
                session_id = %self.session_id,
                execution_id = %active.execution_id,
                "Execute rejected: session already has an active execution"
            );
            self.reject_execute();
            return;
        }

        // A finished or cancelled task releases its claim when it exits.
        self.retire();
        if let Some(handle) = self.retiring.take() {
            if let Err(err) = handle.await {
                warn!(session_id = %self.session_id, error = %err, "Previous execution task failed");
            }
        }

        let Some(claim) = self.claims.try_claim(self.session_id) else {
            warn!(session_id = %self.session_id, "Execute rejected: session is executing elsewhere");
            self.reject_execute();
            return;
        };

        let execution_id = Uuid::new_v4();
        let cancel = self.cancel.child_token();
        let request = CommandRequest {
            command,
            session_id: Some(self.session_id),
            budget_limit,
            execution_id: Some(execution_id),
            plan,
            ..Default::default()
        };

        let (event_tx, events) = mpsc::unbounded_channel();
        let orchestrator = self.orchestrator.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            orchestrator.run(request, EventSink::new(event_tx), token).await;
            drop(claim);
        });

        info!(session_id = %self.session_id, %execution_id, "Execution started");
        self.active = Some(ActiveExecution {
            execution_id,
            cancel,
            events,
            handle,
            finished: false,
        });
    }

    fn reject_execute(&self) {
        let err = OrchestrationError::InvalidState("execution already active".to_string());
        self.send(AgentEvent::Error {
            session_id: self.session_id,
            execution_id: None,
            error: "An execution is already running in this session".to_string(),
            error_type: err.kind().to_string(),
        });
    }

    fn cancel_execution(&mut self, execution_id: Uuid) {
        let targets_active = self
            .active
            .as_ref()
            .map_or(false, |active| active.execution_id == execution_id && !active.finished);
        let target = if targets_active { self.active.take() } else { None };

        let Some(mut active) = target else {
            debug!(session_id = %self.session_id, %execution_id, "Cancel ignored: no such active execution");
            self.send(AgentEvent::Cancelled {
                session_id: self.session_id,
                execution_id,
                cancelled: false,
            });
            return;
        };

        active.cancel.cancel();
        while let Ok(event) = active.events.try_recv() {
            self.send(event);
        }
        // Dropping the receiver discards whatever the task emits while it
        // winds down.
        drop(active.events);
        self.retiring = Some(active.handle);

        info!(session_id = %self.session_id, %execution_id, "Execution cancelled");
        self.send(AgentEvent::Cancelled {
            session_id: self.session_id,
            execution_id,
            cancelled: true,
        });
    }

    async fn decide(&mut self, request_id: Uuid, decision: ApprovalDecision, edited_args: Option<Value>) {
        if let Err(err) = self.resolve(request_id, decision, edited_args).await {
            warn!(session_id = %self.session_id, %request_id, error = %err, "Approval decision failed");
            self.send(AgentEvent::Error {
                session_id: self.session_id,
                execution_id: self.active.as_ref().map(|active| active.execution_id),
                error: err.public_message(),
                error_type: err.kind().to_string(),
            });
        }
    }

    async fn resolve(&self, request_id: Uuid, decision: ApprovalDecision, edited_args: Option<Value>) -> Result<()> {
        let approvals = self.orchestrator.approvals();
        match approvals.get(request_id).await? {
            Some(request) if request.session_id == self.session_id => {}
            _ => {
                return Err(OrchestrationError::NotFound(format!(
                    "approval request {}",
                    request_id
                )))
            }
        }
        approvals.resolve(request_id, decision, edited_args).await?;
        Ok(())
    }

    fn drain(&mut self) {
        loop {
            let next = match self.active.as_mut() {
                Some(active) => active.events.try_recv(),
                None => return,
            };
            match next {
                Ok(event) => self.forward(event),
                Err(TryRecvError::Empty) => return,
                Err(TryRecvError::Disconnected) => {
                    self.retire();
                    return;
                }
            }
        }
    }

    /// Release the current execution: its task goes to `retiring` so the
    /// next execute waits for it to exit.
    fn retire(&mut self) {
        if let Some(active) = self.active.take() {
            debug!(session_id = %self.session_id, execution_id = %active.execution_id, "Execution retired");
            self.retiring = Some(active.handle);
        }
    }

    fn forward(&mut self, event: AgentEvent) {
        if event.is_terminal() {
            if let Some(active) = self.active.as_mut() {
                if event.execution_id() == Some(active.execution_id) {
                    active.finished = true;
                }
            }
        }
        self.send(event);
    }

    fn send(&self, event: AgentEvent) {
        if self.outbound.send(event).is_err() {
            debug!(session_id = %self.session_id, "Outbound stream closed");
        }
    }
}
