//! Error types for the command orchestrator

use thiserror::Error;
use uuid::Uuid;

/// Result type alias for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchestrationError>;

#[derive(Error, Debug)]
pub enum OrchestrationError {

    // =============================
    // Command Pipeline Errors
    // =============================

    #[error("Could not understand command: {0}")]
    Classification(String),

    #[error("Amount {requested} exceeds budget limit of {limit}")]
    BudgetExceeded { requested: f64, limit: f64 },

    #[error("Policy violation: {0}")]
    PolicyViolation(String),

    #[error("Approval request {0} was rejected")]
    ApprovalRejected(Uuid),

    #[error("Tool {tool} failed: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("Sub-execution {session_id} (parent {parent_session_id}) failed: {message}")]
    SubExecution {
        session_id: Uuid,
        parent_session_id: Uuid,
        message: String,
    },

    #[error("Execution cancelled")]
    Cancelled,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("UUID parse error: {0}")]
    Uuid(#[from] uuid::Error),
}

impl OrchestrationError {
    /// Stable tag carried in results and `error` events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Classification(_) => "classification_failure",
            Self::BudgetExceeded { .. } => "budget_exceeded",
            Self::PolicyViolation(_) => "policy_violation",
            Self::ApprovalRejected(_) => "approval_rejected",
            Self::ToolExecution { .. } => "tool_execution_failure",
            Self::SubExecution { .. } => "sub_execution_failure",
            Self::Cancelled => "cancelled",
            Self::Validation(_) => "validation_error",
            Self::InvalidState(_) => "invalid_state",
            Self::NotFound(_) => "not_found",
            Self::Database(_)
            | Self::Config(_)
            | Self::Serialization(_)
            | Self::Http(_)
            | Self::Uuid(_) => "internal_error",
        }
    }

    /// Message safe to hand back to a caller.
    ///
    /// Collaborator responses, driver errors and tool arguments stay in the
    /// logs; only the category and the caller's own numbers are echoed.
    pub fn public_message(&self) -> String {
        match self {
            Self::Classification(_) => {
                "Could not understand the command. Try one of the suggested commands.".to_string()
            }
            Self::BudgetExceeded { requested, limit } => format!(
                "Amount {} exceeds budget limit of {}",
                format_amount(*requested),
                format_amount(*limit)
            ),
            Self::PolicyViolation(_) => "Requested action is not permitted by policy".to_string(),
            Self::ApprovalRejected(_) => "Action was rejected during approval".to_string(),
            Self::ToolExecution { tool, .. } => format!("Tool {} failed to complete", tool),
            Self::SubExecution { .. } => "Sub-execution failed to complete".to_string(),
            Self::Cancelled => "Execution cancelled".to_string(),
            Self::Validation(message) => message.clone(),
            Self::InvalidState(_) => "Request conflicts with the current state".to_string(),
            Self::NotFound(what) => format!("{} not found", what),
            _ => "Internal error while executing command".to_string(),
        }
    }
}

fn format_amount(value: f64) -> String {
    let rendered = format!("{:.6}", value);
    rendered
        .trim_end_matches('0')
        .trim_end_matches('.')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_message_mentions_limit() {
        let err = OrchestrationError::BudgetExceeded {
            requested: 500.0,
            limit: 100.0,
        };
        assert_eq!(err.kind(), "budget_exceeded");
        assert_eq!(err.public_message(), "Amount 500 exceeds budget limit of 100");
    }

    #[test]
    fn test_public_message_hides_tool_detail() {
        let err = OrchestrationError::ToolExecution {
            tool: "x402_payment".to_string(),
            message: "upstream said: private_key=abc".to_string(),
        };
        let message = err.public_message();
        assert!(message.contains("x402_payment"));
        assert!(!message.contains("private_key"));
    }

    #[test]
    fn test_internal_errors_are_generic() {
        let err = OrchestrationError::Database("password authentication failed".to_string());
        assert_eq!(err.kind(), "internal_error");
        assert!(!err.public_message().contains("password"));
    }
}
