//! Control-plane messages
//!
//! Outbound [`AgentEvent`]s and inbound [`ClientMessage`]s share the
//! `{type, data}` envelope. Every outbound payload carries `session_id`.

use crate::models::{ExecutionPlan, ExecutionStatus};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use uuid::Uuid;

const REDACTED_KEYS: &[&str] = &[
    "private_key",
    "secret",
    "api_key",
    "password",
    "mnemonic",
    "seed",
    "authorization",
];

/// Orchestrator state reported by `thinking` events.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPhase {
    Parsing,
    Planning,
    BudgetCheck,
    Executing,
    AwaitingApproval,
    Logging,
    MemoryWrite,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum AgentEvent {
    Connected {
        session_id: Uuid,
    },
    Thinking {
        session_id: Uuid,
        execution_id: Uuid,
        phase: ExecutionPhase,
        message: String,
    },
    ToolCall {
        session_id: Uuid,
        execution_id: Uuid,
        tool_name: String,
        tool_args: Value,
    },
    ToolResult {
        session_id: Uuid,
        execution_id: Uuid,
        tool_name: String,
        success: bool,
        result: Value,
    },
    ApprovalRequired {
        session_id: Uuid,
        execution_id: Uuid,
        request_id: Uuid,
        step_id: u32,
        tool_name: String,
        tool_args: Value,
        description: String,
    },
    Complete {
        session_id: Uuid,
        execution_id: Uuid,
        status: ExecutionStatus,
        result: Value,
        total_cost: f64,
        duration_ms: u64,
    },
    Error {
        session_id: Uuid,
        #[serde(skip_serializing_if = "Option::is_none")]
        execution_id: Option<Uuid>,
        error: String,
        error_type: String,
    },
    SubagentStart {
        session_id: Uuid,
        execution_id: Uuid,
        sub_session_id: Uuid,
        domain: String,
    },
    SubagentEnd {
        session_id: Uuid,
        execution_id: Uuid,
        sub_session_id: Uuid,
        domain: String,
        success: bool,
    },
    /// Also used as the no-op acknowledgement (`cancelled: false`).
    Cancelled {
        session_id: Uuid,
        execution_id: Uuid,
        cancelled: bool,
    },
}

impl AgentEvent {
    pub fn session_id(&self) -> Uuid {
        match self {
            AgentEvent::Connected { session_id }
            | AgentEvent::Thinking { session_id, .. }
            | AgentEvent::ToolCall { session_id, .. }
            | AgentEvent::ToolResult { session_id, .. }
            | AgentEvent::ApprovalRequired { session_id, .. }
            | AgentEvent::Complete { session_id, .. }
            | AgentEvent::Error { session_id, .. }
            | AgentEvent::SubagentStart { session_id, .. }
            | AgentEvent::SubagentEnd { session_id, .. }
            | AgentEvent::Cancelled { session_id, .. } => *session_id,
        }
    }

    pub fn execution_id(&self) -> Option<Uuid> {
        match self {
            AgentEvent::Connected { .. } => None,
            AgentEvent::Error { execution_id, .. } => *execution_id,
            AgentEvent::Thinking { execution_id, .. }
            | AgentEvent::ToolCall { execution_id, .. }
            | AgentEvent::ToolResult { execution_id, .. }
            | AgentEvent::ApprovalRequired { execution_id, .. }
            | AgentEvent::Complete { execution_id, .. }
            | AgentEvent::SubagentStart { execution_id, .. }
            | AgentEvent::SubagentEnd { execution_id, .. }
            | AgentEvent::Cancelled { execution_id, .. } => Some(*execution_id),
        }
    }

    /// Terminal event for one execution.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AgentEvent::Complete { .. } | AgentEvent::Error { .. } | AgentEvent::Cancelled { cancelled: true, .. }
        )
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            AgentEvent::Connected { .. } => "connected",
            AgentEvent::Thinking { .. } => "thinking",
            AgentEvent::ToolCall { .. } => "tool_call",
            AgentEvent::ToolResult { .. } => "tool_result",
            AgentEvent::ApprovalRequired { .. } => "approval_required",
            AgentEvent::Complete { .. } => "complete",
            AgentEvent::Error { .. } => "error",
            AgentEvent::SubagentStart { .. } => "subagent_start",
            AgentEvent::SubagentEnd { .. } => "subagent_end",
            AgentEvent::Cancelled { .. } => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    Execute {
        command: String,
        #[serde(default)]
        plan: Option<ExecutionPlan>,
        #[serde(default)]
        budget_limit: Option<f64>,
    },
    Approve {
        request_id: Uuid,
    },
    Reject {
        request_id: Uuid,
    },
    Edit {
        request_id: Uuid,
        edited_args: Value,
    },
    Cancel {
        execution_id: Uuid,
    },
}

/// Producer side of an execution's progress stream.
///
/// A disabled sink drops everything; the synchronous surface uses one.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<AgentEvent>>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<AgentEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: AgentEvent) {
        if let Some(tx) = &self.tx {
            // Receiver gone means the session disconnected.
            let _ = tx.send(event);
        }
    }
}

fn is_secret_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    REDACTED_KEYS.iter().any(|secret| key.contains(secret))
}

/// Copy of `args` with secret-looking keys masked, at any depth.
pub fn redact_args(args: &Value) -> Value {
    match args {
        Value::Object(map) => {
            let redacted: Map<String, Value> = map
                .iter()
                .map(|(key, value)| {
                    if is_secret_key(key) {
                        (key.clone(), Value::String("[REDACTED]".to_string()))
                    } else {
                        (key.clone(), redact_args(value))
                    }
                })
                .collect();
            Value::Object(redacted)
        }
        Value::Array(items) => Value::Array(items.iter().map(redact_args).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_envelope_shape() {
        let session_id = Uuid::new_v4();
        let event = AgentEvent::Connected { session_id };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "connected");
        assert_eq!(value["data"]["session_id"], json!(session_id));
    }

    #[test]
    fn test_parse_client_messages() {
        let request_id = Uuid::new_v4();
        let raw = json!({"type": "edit", "data": {"request_id": request_id, "edited_args": {"amount": 50}}});
        let message: ClientMessage = serde_json::from_value(raw).unwrap();
        assert_eq!(
            message,
            ClientMessage::Edit {
                request_id,
                edited_args: json!({"amount": 50})
            }
        );

        let raw = json!({"type": "execute", "data": {"command": "check my balance"}});
        let message: ClientMessage = serde_json::from_value(raw).unwrap();
        assert!(matches!(message, ClientMessage::Execute { plan: None, budget_limit: None, .. }));
    }

    #[test]
    fn test_unknown_message_type_is_rejected() {
        let raw = json!({"type": "shutdown", "data": {}});
        assert!(serde_json::from_value::<ClientMessage>(raw).is_err());
    }

    #[test]
    fn test_redact_nested_secrets() {
        let args = json!({
            "amount": 5,
            "wallet": {"Private_Key": "abc", "address": "0x1"},
            "headers": [{"Authorization": "Bearer x"}]
        });
        let redacted = redact_args(&args);
        assert_eq!(redacted["amount"], json!(5));
        assert_eq!(redacted["wallet"]["Private_Key"], "[REDACTED]");
        assert_eq!(redacted["wallet"]["address"], "0x1");
        assert_eq!(redacted["headers"][0]["Authorization"], "[REDACTED]");
    }

    #[test]
    fn test_disabled_sink_drops_events() {
        EventSink::disabled().emit(AgentEvent::Connected {
            session_id: Uuid::new_v4(),
        });
    }
}
