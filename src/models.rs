//! Core data models for the command orchestrator
//!
//! Field names and enum values are the wire/storage contract.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

//
// ================= Enums =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Payment,
    Swap,
    LeveragedTrade,
    BalanceCheck,
    Discovery,
    Unknown,
}

impl Intent {
    /// Intents that always get a plan, even without sequencing language.
    pub fn is_multi_stage(self) -> bool {
        matches!(self, Intent::Payment | Intent::Swap | Intent::LeveragedTrade)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Intent::Payment => "payment",
            Intent::Swap => "swap",
            Intent::LeveragedTrade => "leveraged_trade",
            Intent::BalanceCheck => "balance_check",
            Intent::Discovery => "discovery",
            Intent::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Validate,
    Payment,
    Swap,
    LeveragedTrade,
    BalanceCheck,
    Discovery,
    Review,
}

impl ActionType {
    pub fn from_intent(intent: Intent) -> Self {
        match intent {
            Intent::Payment => ActionType::Payment,
            Intent::Swap => ActionType::Swap,
            Intent::LeveragedTrade => ActionType::LeveragedTrade,
            Intent::BalanceCheck => ActionType::BalanceCheck,
            Intent::Discovery => ActionType::Discovery,
            Intent::Unknown => ActionType::Review,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalDecision {
    Pending,
    Approved,
    Rejected,
    Edited,
}

impl ApprovalDecision {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ApprovalDecision::Pending)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MemoryType {
    Human,
    Agent,
    System,
}

//
// ================= Command =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParsedCommand {
    pub intent: Intent,
    pub action: String,
    pub parameters: Map<String, Value>,
    pub confidence: f64,
    pub raw_text: String,
}

impl ParsedCommand {
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(Value::as_str)
    }

    pub fn amount(&self) -> Option<f64> {
        amount_of(&self.parameters)
    }
}

/// Monetary amount carried by an action's parameters.
pub fn amount_of(parameters: &Map<String, Value>) -> Option<f64> {
    parameters.get("amount").and_then(Value::as_f64)
}

//
// ================= Plan =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionPlan {
    pub approach: String,
    pub steps: Vec<PlanStep>,
    pub requires_human_approval: bool,
    pub created_at: DateTime<Utc>,
}

impl ExecutionPlan {
    /// Step ids must be 1-based and contiguous.
    pub fn has_contiguous_ids(&self) -> bool {
        self.steps
            .iter()
            .enumerate()
            .all(|(index, step)| step.id as usize == index + 1)
    }

    /// Sum of the monetary amounts of every action step.
    pub fn total_amount(&self) -> f64 {
        self.steps
            .iter()
            .filter(|step| step.action_type != ActionType::Validate)
            .filter_map(|step| amount_of(&step.parameters))
            .sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanStep {
    pub id: u32,
    pub description: String,
    pub action_type: ActionType,
    pub outcome: String,
    pub status: StepStatus,
    #[serde(default)]
    pub requires_approval: bool,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

//
// ================= Execution Log =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub tool_name: String,
    pub tool_args: Value,
    pub result: Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionLog {
    pub id: Uuid,
    pub session_id: Uuid,
    pub command: String,
    pub plan: Option<ExecutionPlan>,
    pub tool_calls: Vec<ToolCall>,
    pub result: Value,
    pub total_cost: f64,
    pub duration_ms: u64,
    pub status: ExecutionStatus,
    pub created_at: DateTime<Utc>,
}

impl ExecutionLog {
    /// Fresh log row for a command that has just started.
    pub fn start(id: Uuid, session_id: Uuid, command: impl Into<String>) -> Self {
        Self {
            id,
            session_id,
            command: command.into(),
            plan: None,
            tool_calls: Vec::new(),
            result: Value::Null,
            total_cost: 0.0,
            duration_ms: 0,
            status: ExecutionStatus::Running,
            created_at: Utc::now(),
        }
    }
}

/// Completion data applied to a running log exactly once.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub plan: Option<ExecutionPlan>,
    pub tool_calls: Vec<ToolCall>,
    pub result: Value,
    pub total_cost: f64,
    pub duration_ms: u64,
    pub status: ExecutionStatus,
}

//
// ================= Approvals =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApprovalRequest {
    pub id: Uuid,
    pub session_id: Uuid,
    pub tool_name: String,
    pub tool_args: Value,
    pub decision: ApprovalDecision,
    pub edited_args: Option<Value>,
    pub decision_made_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

//
// ================= Sessions & Memory =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct SessionConfig {
    pub budget_limit: Option<f64>,
    pub approval_threshold: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentSession {
    pub id: Uuid,
    pub user_id: String,
    pub wallet_ref: Option<String>,
    pub config: SessionConfig,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

impl AgentSession {
    pub fn new(id: Uuid, user_id: impl Into<String>, config: SessionConfig) -> Self {
        let now = Utc::now();
        Self {
            id,
            user_id: user_id.into(),
            wallet_ref: None,
            config,
            created_at: now,
            last_active: now,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryEntry {
    pub session_id: Uuid,
    #[serde(rename = "type")]
    pub entry_type: MemoryType,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Value,
}

impl MemoryEntry {
    pub fn new(session_id: Uuid, entry_type: MemoryType, content: impl Into<String>) -> Self {
        Self {
            session_id,
            entry_type,
            content: content.into(),
            timestamp: Utc::now(),
            metadata: Value::Object(Map::new()),
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

//
// ================= Tool I/O =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInput {
    pub tool_name: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutput {
    pub success: bool,
    pub data: Value,
    pub error: Option<String>,
}

impl ToolOutput {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data,
            error: None,
        }
    }

    /// Monetary outflow reported by the tool.
    pub fn cost(&self) -> f64 {
        self.data.get("cost").and_then(Value::as_f64).unwrap_or(0.0)
    }
}

//
// ================= Requests & Results =================
//

/// One command submitted to the orchestrator.
#[derive(Debug, Clone, Default)]
pub struct CommandRequest {
    pub command: String,
    pub session_id: Option<Uuid>,
    pub user_id: Option<String>,
    pub budget_limit: Option<f64>,
    /// Pre-allocated id for the execution log (the event hub needs it up front).
    pub execution_id: Option<Uuid>,
    /// Caller-supplied plan that replaces the derived one.
    pub plan: Option<ExecutionPlan>,
}

impl CommandRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn with_session(mut self, session_id: Uuid) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn with_budget(mut self, budget_limit: f64) -> Self {
        self.budget_limit = Some(budget_limit);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubExecutionSummary {
    pub session_id: Uuid,
    pub parent_session_id: Uuid,
    pub domain: String,
    pub success: bool,
}

/// Structured result of one command; failures are values, not panics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub success: bool,
    pub execution_id: Uuid,
    pub session_id: Uuid,
    pub status: ExecutionStatus,
    pub intent: Intent,
    pub confidence: f64,
    pub parsed: Option<ParsedCommand>,
    pub plan: Option<ExecutionPlan>,
    pub result: Value,
    pub tool_calls: Vec<ToolCall>,
    pub total_cost: f64,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub_executions: Vec<SubExecutionSummary>,
    pub memory_context: String,
}

/// Synchronous request/response surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub session_id: Uuid,
    pub status: ExecutionStatus,
    pub result: Value,
    pub total_cost: f64,
}

impl From<&CommandResult> for ExecuteResponse {
    fn from(result: &CommandResult) -> Self {
        Self {
            session_id: result.session_id,
            status: result.status,
            result: result.result.clone(),
            total_cost: result.total_cost,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step(id: u32, action_type: ActionType, amount: Option<f64>) -> PlanStep {
        let mut parameters = Map::new();
        if let Some(amount) = amount {
            parameters.insert("amount".to_string(), json!(amount));
        }
        PlanStep {
            id,
            description: format!("step {}", id),
            action_type,
            outcome: String::new(),
            status: StepStatus::Pending,
            requires_approval: false,
            parameters,
        }
    }

    #[test]
    fn test_wire_enum_values() {
        assert_eq!(serde_json::to_value(Intent::LeveragedTrade).unwrap(), json!("leveraged_trade"));
        assert_eq!(serde_json::to_value(StepStatus::InProgress).unwrap(), json!("in_progress"));
        assert_eq!(serde_json::to_value(ExecutionStatus::Running).unwrap(), json!("running"));
        assert_eq!(serde_json::to_value(ApprovalDecision::Edited).unwrap(), json!("edited"));
        assert_eq!(serde_json::to_value(MemoryType::Human).unwrap(), json!("human"));
    }

    #[test]
    fn test_memory_entry_type_field_name() {
        let entry = MemoryEntry::new(Uuid::new_v4(), MemoryType::Agent, "done");
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["type"], json!("agent"));
    }

    #[test]
    fn test_plan_totals_skip_validation_step() {
        let plan = ExecutionPlan {
            approach: "sequential".to_string(),
            steps: vec![
                step(1, ActionType::Validate, Some(99.0)),
                step(2, ActionType::Swap, Some(10.0)),
                step(3, ActionType::Payment, Some(5.0)),
            ],
            requires_human_approval: false,
            created_at: Utc::now(),
        };
        assert!(plan.has_contiguous_ids());
        assert_eq!(plan.total_amount(), 15.0);
    }

    #[test]
    fn test_non_contiguous_ids_detected() {
        let plan = ExecutionPlan {
            approach: "sequential".to_string(),
            steps: vec![step(1, ActionType::Validate, None), step(3, ActionType::Payment, None)],
            requires_human_approval: false,
            created_at: Utc::now(),
        };
        assert!(!plan.has_contiguous_ids());
    }
}
