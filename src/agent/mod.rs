//! Orchestrator - the per-command state machine
//!
//! parsing → planning → budget_check → executing(step i) → awaiting_approval?
//! → logging → memory_write → done | failed
//!
//! Every failure is caught here and turned into a structured result; the
//! execution log is always finalized.

use crate::approval::{ApprovalGate, InMemoryApprovalStore};
use crate::audit::{ExecutionLogStore, InMemoryExecutionLogStore, PgExecutionLogStore};
use crate::classifier::IntentClassifier;
use crate::config::OrchestratorConfig;
use crate::db;
use crate::error::OrchestrationError;
use crate::events::{redact_args, AgentEvent, EventSink, ExecutionPhase};
use crate::execution::{total_cost, ExecutionEngine, ExecutionScope};
use crate::memory::{ContextManager, InMemoryMemoryStore, MemoryStore, PgMemoryStore};
use crate::models::{
    amount_of, ActionType, AgentSession, ApprovalDecision, CommandRequest, CommandResult,
    ExecuteResponse, ExecutionLog, ExecutionOutcome, ExecutionPlan, ExecutionStatus, Intent,
    MemoryEntry, MemoryType, ParsedCommand, PlanStep, SessionConfig, StepStatus,
    SubExecutionSummary, ToolCall,
};
use crate::planner::{normalize_plan, HeuristicPlanner, Planner, PlanningContext};
use crate::policy::ToolGate;
use crate::state::{InMemorySessionStore, SessionStore};
use crate::subagent::SubExecutionSpawner;
use crate::tools::{create_default_registry, ToolRegistry, CHECK_BALANCE, DISCOVER_SERVICES, X402_PAYMENT, TOKEN_SWAP, OPEN_LEVERAGED_POSITION};
use crate::Result;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

const ANONYMOUS_USER: &str = "anonymous";

/// Mutable record of one command as it progresses.
#[derive(Default)]
struct CommandTrace {
    parsed: Option<ParsedCommand>,
    plan: Option<ExecutionPlan>,
    tool_calls: Vec<ToolCall>,
    sub_executions: Vec<SubExecutionSummary>,
    completed: Vec<String>,
}

impl CommandTrace {
    fn set_step_status(&mut self, index: usize, status: StepStatus) {
        if let Some(step) = self.plan.as_mut().and_then(|plan| plan.steps.get_mut(index)) {
            step.status = status;
        }
    }
}

/// Primary tool an action resolves to, used to label approval requests.
fn primary_tool(action_type: ActionType) -> &'static str {
    match action_type {
        ActionType::Payment => X402_PAYMENT,
        ActionType::Swap => TOKEN_SWAP,
        ActionType::LeveragedTrade => OPEN_LEVERAGED_POSITION,
        ActionType::BalanceCheck => CHECK_BALANCE,
        ActionType::Discovery => DISCOVER_SERVICES,
        ActionType::Validate | ActionType::Review => "none",
    }
}

fn check_budget(requested: f64, limit: Option<f64>) -> Result<()> {
    match limit {
        Some(limit) if requested > limit => {
            Err(OrchestrationError::BudgetExceeded { requested, limit })
        }
        _ => Ok(()),
    }
}

/// Parameters an action needs before anything is dispatched.
fn required_parameters(action_type: ActionType) -> &'static [&'static str] {
    match action_type {
        ActionType::Payment => &["amount", "token", "recipient"],
        ActionType::Swap => &["amount", "from_token", "to_token"],
        ActionType::LeveragedTrade => &["amount", "asset", "direction"],
        ActionType::Validate
        | ActionType::Review
        | ActionType::BalanceCheck
        | ActionType::Discovery => &[],
    }
}

fn validate_steps(steps: &[PlanStep]) -> Result<Value> {
    let mut checked = 0;
    for step in steps {
        for key in required_parameters(step.action_type) {
            let present = match step.parameters.get(*key) {
                Some(Value::String(s)) => !s.trim().is_empty(),
                Some(Value::Null) | None => false,
                Some(_) => true,
            };
            if !present {
                return Err(OrchestrationError::Validation(format!(
                    "Step {} ({}) is missing {}",
                    step.id, step.description, key
                )));
            }
        }
        if let Some(amount) = amount_of(&step.parameters) {
            if !(amount.is_finite() && amount > 0.0) {
                return Err(OrchestrationError::Validation(format!(
                    "Step {} has a non-positive amount",
                    step.id
                )));
            }
        }
        checked += 1;
    }
    Ok(json!({ "validated_steps": checked }))
}

/// Main orchestrator that coordinates one command end to end
pub struct Orchestrator {
    config: OrchestratorConfig,
    planner: Box<dyn Planner>,
    engine: ExecutionEngine,
    spawner: SubExecutionSpawner,
    approvals: Arc<ApprovalGate>,
    sessions: Arc<dyn SessionStore>,
    logs: Arc<dyn ExecutionLogStore>,
    memory: Arc<dyn MemoryStore>,
    context_manager: ContextManager,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        planner: Box<dyn Planner>,
        engine: ExecutionEngine,
        approvals: Arc<ApprovalGate>,
        sessions: Arc<dyn SessionStore>,
        logs: Arc<dyn ExecutionLogStore>,
        memory: Arc<dyn MemoryStore>,
    ) -> Self {
        let spawner = SubExecutionSpawner::new(
            engine.clone(),
            memory.clone(),
            config.max_leverage,
            config.swap_slippage_bps,
        );
        let context_manager = ContextManager::new(config.memory_context_turns);

        Self {
            config,
            planner,
            engine,
            spawner,
            approvals,
            sessions,
            logs,
            memory,
            context_manager,
        }
    }

    /// In-memory stores around the given tools.
    pub fn in_memory(config: OrchestratorConfig, registry: ToolRegistry) -> Self {
        let gate = Arc::new(ToolGate::with_allowlist(config.allowed_tools.clone()));
        Self::new(
            config,
            Box::new(HeuristicPlanner),
            ExecutionEngine::new(registry, gate),
            Arc::new(ApprovalGate::new(Arc::new(InMemoryApprovalStore::new()))),
            Arc::new(InMemorySessionStore::new()),
            Arc::new(InMemoryExecutionLogStore::new()),
            Arc::new(InMemoryMemoryStore::new()),
        )
    }

    /// Tools and stores selected by configuration.
    pub fn from_config(config: OrchestratorConfig) -> Result<Self> {
        let registry = create_default_registry(&config)?;
        let gate = Arc::new(ToolGate::with_allowlist(config.allowed_tools.clone()));

        let (logs, memory): (Arc<dyn ExecutionLogStore>, Arc<dyn MemoryStore>) =
            match &config.database_url {
                Some(url) => {
                    let pool = db::connect_lazy(url)?;
                    info!("Store backend: postgres");
                    (
                        Arc::new(PgExecutionLogStore::new(pool.clone())),
                        Arc::new(PgMemoryStore::new(pool)),
                    )
                }
                None => {
                    info!("Store backend: in-memory");
                    (
                        Arc::new(InMemoryExecutionLogStore::new()),
                        Arc::new(InMemoryMemoryStore::new()),
                    )
                }
            };

        Ok(Self::new(
            config,
            Box::new(HeuristicPlanner),
            ExecutionEngine::new(registry, gate),
            Arc::new(ApprovalGate::in_memory()),
            Arc::new(InMemorySessionStore::new()),
            logs,
            memory,
        ))
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn approvals(&self) -> &Arc<ApprovalGate> {
        &self.approvals
    }

    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.sessions
    }

    pub async fn execution_log(&self, execution_id: Uuid) -> Result<Option<ExecutionLog>> {
        self.logs.get(execution_id).await
    }

    pub async fn session_memory(&self, session_id: Uuid) -> Result<Vec<MemoryEntry>> {
        self.memory.list(session_id).await
    }

    /// Synchronous surface: no event stream, no external cancellation.
    pub async fn execute(
        &self,
        command: &str,
        session_id: Option<Uuid>,
        budget_limit: Option<f64>,
    ) -> ExecuteResponse {
        let request = CommandRequest {
            command: command.to_string(),
            session_id,
            budget_limit,
            ..Default::default()
        };
        let result = self
            .run(request, EventSink::disabled(), CancellationToken::new())
            .await;
        ExecuteResponse::from(&result)
    }

    /// Run one command to a terminal state. Never returns an error: failures
    /// are reported in the result and the execution log.
    pub async fn run(
        &self,
        request: CommandRequest,
        events: EventSink,
        cancel: CancellationToken,
    ) -> CommandResult {
        let start = Instant::now();
        let session_id = request.session_id.unwrap_or_else(Uuid::new_v4);
        let execution_id = request.execution_id.unwrap_or_else(Uuid::new_v4);
        let scope = ExecutionScope::new(session_id, execution_id, cancel, events);

        info!(%session_id, %execution_id, command = %request.command, "Command received");

        let log_created = match self
            .logs
            .create(ExecutionLog::start(execution_id, session_id, &request.command))
            .await
        {
            Ok(()) => true,
            Err(err) => {
                warn!(%execution_id, error = %err, "Failed to create execution log");
                false
            }
        };

        let mut trace = CommandTrace::default();
        let outcome = self.drive(&request, &scope, &mut trace).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        self.phase(&scope, ExecutionPhase::Logging, "Recording execution");
        let (status, result, error) = match outcome {
            Ok(result) => (ExecutionStatus::Completed, result, None),
            Err(err) => {
                warn!(%execution_id, error = %err, kind = err.kind(), "Command failed");
                let result = json!({
                    "error": err.public_message(),
                    "error_type": err.kind(),
                });
                (ExecutionStatus::Failed, result, Some(err))
            }
        };
        let cost = total_cost(&trace.tool_calls);

        if log_created {
            let finalized = self
                .logs
                .finalize(
                    execution_id,
                    ExecutionOutcome {
                        plan: trace.plan.clone(),
                        tool_calls: trace.tool_calls.clone(),
                        result: result.clone(),
                        total_cost: cost,
                        duration_ms,
                        status,
                    },
                )
                .await;
            if let Err(err) = finalized {
                warn!(%execution_id, error = %err, "Failed to finalize execution log");
            }
        }

        self.phase(&scope, ExecutionPhase::MemoryWrite, "Updating session memory");
        let agent_summary = match &error {
            None => format!("Completed: {}", trace.completed.join("; ")),
            Some(err) => format!("Failed: {}", err.public_message()),
        };
        self.write_memory(session_id, execution_id, &request.command, agent_summary, status)
            .await;
        let memory_context = self.render_memory(session_id).await;

        match &error {
            None => scope.emit(AgentEvent::Complete {
                session_id,
                execution_id,
                status,
                result: result.clone(),
                total_cost: cost,
                duration_ms,
            }),
            Some(OrchestrationError::Cancelled) => {}
            Some(err) => scope.emit(AgentEvent::Error {
                session_id,
                execution_id: Some(execution_id),
                error: err.public_message(),
                error_type: err.kind().to_string(),
            }),
        }

        info!(
            %session_id,
            %execution_id,
            status = ?status,
            total_cost = cost,
            duration_ms,
            tool_calls = trace.tool_calls.len(),
            "Command finished"
        );

        let (intent, confidence) = trace
            .parsed
            .as_ref()
            .map_or((Intent::Unknown, 0.0), |p| (p.intent, p.confidence));
        let suggestions = match &error {
            Some(OrchestrationError::Classification(_)) => IntentClassifier::suggestions(),
            _ => Vec::new(),
        };

        CommandResult {
            success: error.is_none(),
            execution_id,
            session_id,
            status,
            intent,
            confidence,
            parsed: trace.parsed,
            plan: trace.plan,
            result,
            tool_calls: trace.tool_calls,
            total_cost: cost,
            duration_ms,
            error: error.as_ref().map(OrchestrationError::public_message),
            error_type: error.as_ref().map(|e| e.kind().to_string()),
            suggestions,
            sub_executions: trace.sub_executions,
            memory_context,
        }
    }

    async fn drive(
        &self,
        request: &CommandRequest,
        scope: &ExecutionScope,
        trace: &mut CommandTrace,
    ) -> Result<Value> {
        // === PARSE ===
        self.phase(scope, ExecutionPhase::Parsing, "Understanding command");
        let session = self
            .ensure_session(scope.session_id, request.user_id.as_deref())
            .await?;
        let history = self
            .memory
            .recent(scope.session_id, self.config.memory_context_turns)
            .await?;
        debug!(session_id = %scope.session_id, history_len = history.len(), "Session memory loaded");

        let parsed = IntentClassifier::classify(&request.command);
        trace.parsed = Some(parsed.clone());
        info!(intent = %parsed.intent, confidence = parsed.confidence, "Command classified");

        if parsed.intent == Intent::Unknown {
            return Err(OrchestrationError::Classification(request.command.clone()));
        }

        // === PLAN ===
        self.phase(scope, ExecutionPhase::Planning, "Deriving plan");
        let approval_threshold = session
            .config
            .approval_threshold
            .unwrap_or(self.config.approval_threshold);
        let context = PlanningContext { approval_threshold };

        let plan = match &request.plan {
            Some(plan) => Some(normalize_plan(plan.clone(), &context)?),
            None => self.planner.create_plan(&parsed, &context).await?,
        };
        trace.plan = plan;

        // === BUDGET ===
        self.phase(scope, ExecutionPhase::BudgetCheck, "Checking budget");
        let budget_limit = request
            .budget_limit
            .or(session.config.budget_limit)
            .or(self.config.default_budget_limit);
        let requested = match &trace.plan {
            Some(plan) => plan.total_amount(),
            None => parsed.amount().unwrap_or(0.0),
        };
        check_budget(requested, budget_limit)?;

        scope.check_cancelled()?;

        // === EXECUTE ===
        if trace.plan.is_some() {
            return self.execute_plan(scope, trace, budget_limit).await;
        }

        let action_type = ActionType::from_intent(parsed.intent);
        let mut parameters = parsed.parameters.clone();
        if amount_of(&parameters).map_or(false, |amount| amount > approval_threshold) {
            parameters = self
                .await_approval(scope, 1, action_type, &format!("{} command", parsed.intent), parameters, 0.0, budget_limit)
                .await?;
        }
        self.phase(scope, ExecutionPhase::Executing, &format!("Executing {}", parsed.action));
        let output = self.dispatch(scope, action_type, &parameters, trace).await?;
        trace.completed.push(parsed.action.clone());

        Ok(json!({
            "intent": parsed.intent,
            "output": output,
        }))
    }

    async fn execute_plan(
        &self,
        scope: &ExecutionScope,
        trace: &mut CommandTrace,
        budget_limit: Option<f64>,
    ) -> Result<Value> {
        let steps = trace
            .plan
            .as_ref()
            .map(|plan| plan.steps.clone())
            .unwrap_or_default();
        let plan_total: f64 = trace.plan.as_ref().map_or(0.0, ExecutionPlan::total_amount);
        let mut step_results = Vec::with_capacity(steps.len());

        for (index, step) in steps.iter().enumerate() {
            scope.check_cancelled()?;
            trace.set_step_status(index, StepStatus::InProgress);
            self.phase(
                scope,
                ExecutionPhase::Executing,
                &format!("Step {}: {}", step.id, step.description),
            );
            debug!(step_id = step.id, action_type = ?step.action_type, "Executing step");

            let outcome = match step.action_type {
                ActionType::Validate => validate_steps(&steps[index + 1..]),
                _ => self.execute_step(scope, step, trace, plan_total, budget_limit).await,
            };

            match outcome {
                Ok(output) => {
                    trace.set_step_status(index, StepStatus::Completed);
                    if step.action_type != ActionType::Validate {
                        trace.completed.push(step.description.clone());
                    }
                    step_results.push(json!({
                        "step": step.id,
                        "action_type": step.action_type,
                        "description": step.description,
                        "output": output,
                    }));
                }
                Err(err) => {
                    trace.set_step_status(index, StepStatus::Failed);
                    warn!(step_id = step.id, error = %err, "Step failed; halting plan");
                    return Err(err);
                }
            }
        }

        Ok(json!({
            "steps": step_results,
            "summary": trace.completed.join("; "),
        }))
    }

    async fn execute_step(
        &self,
        scope: &ExecutionScope,
        step: &PlanStep,
        trace: &mut CommandTrace,
        plan_total: f64,
        budget_limit: Option<f64>,
    ) -> Result<Value> {
        let mut parameters = step.parameters.clone();
        if step.requires_approval {
            parameters = self
                .await_approval(
                    scope,
                    step.id,
                    step.action_type,
                    &step.description,
                    parameters,
                    plan_total,
                    budget_limit,
                )
                .await?;
        }
        self.dispatch(scope, step.action_type, &parameters, trace).await
    }

    /// Park the command on a human decision. Returns the parameters to run
    /// with: unchanged when approved, merged with the edits when edited.
    #[allow(clippy::too_many_arguments)]
    async fn await_approval(
        &self,
        scope: &ExecutionScope,
        step_id: u32,
        action_type: ActionType,
        description: &str,
        parameters: Map<String, Value>,
        plan_total: f64,
        budget_limit: Option<f64>,
    ) -> Result<Map<String, Value>> {
        let tool_name = primary_tool(action_type);
        let tool_args = redact_args(&Value::Object(parameters.clone()));
        let (request, receiver) = self
            .approvals
            .request(scope.session_id, tool_name, tool_args.clone())
            .await?;

        self.phase(
            scope,
            ExecutionPhase::AwaitingApproval,
            &format!("Waiting for approval of step {}", step_id),
        );
        scope.emit(AgentEvent::ApprovalRequired {
            session_id: scope.session_id,
            execution_id: scope.execution_id,
            request_id: request.id,
            step_id,
            tool_name: tool_name.to_string(),
            tool_args,
            description: description.to_string(),
        });

        let resolution = self
            .approvals
            .await_decision(request.id, receiver, self.config.approval_timeout, &scope.cancel)
            .await?;

        match resolution.decision {
            ApprovalDecision::Approved => Ok(parameters),
            ApprovalDecision::Edited => {
                let original = amount_of(&parameters).unwrap_or(0.0);
                let mut merged = parameters;
                if let Some(Value::Object(edits)) = resolution.edited_args {
                    for (key, value) in edits {
                        merged.insert(key, value);
                    }
                }
                let edited = amount_of(&merged).unwrap_or(0.0);
                let base = if plan_total > 0.0 { plan_total - original } else { 0.0 };
                check_budget(base + edited, budget_limit)?;
                info!(request_id = %request.id, "Resuming with edited arguments");
                Ok(merged)
            }
            ApprovalDecision::Rejected | ApprovalDecision::Pending => {
                Err(OrchestrationError::ApprovalRejected(request.id))
            }
        }
    }

    /// Exhaustive action dispatch. Swaps and leveraged trades go through the
    /// sub-execution spawner, everything else calls its tool directly.
    async fn dispatch(
        &self,
        scope: &ExecutionScope,
        action_type: ActionType,
        parameters: &Map<String, Value>,
        trace: &mut CommandTrace,
    ) -> Result<Value> {
        match action_type {
            ActionType::Validate => Ok(json!({ "validated": true })),
            ActionType::Review => Ok(json!({
                "review": parameters.get("instruction").cloned().unwrap_or(Value::Null),
                "note": "no automated action taken",
            })),
            ActionType::Payment => {
                let args = json!({
                    "amount": amount_of(parameters),
                    "token": parameters.get("token"),
                    "recipient": parameters.get("recipient"),
                });
                let output = self
                    .engine
                    .invoke(scope, X402_PAYMENT, args, &mut trace.tool_calls)
                    .await?;
                Ok(output.data)
            }
            ActionType::BalanceCheck => {
                let mut args = Map::new();
                if let Some(token) = parameters.get("token") {
                    args.insert("token".into(), token.clone());
                }
                let output = self
                    .engine
                    .invoke(scope, CHECK_BALANCE, Value::Object(args), &mut trace.tool_calls)
                    .await?;
                Ok(output.data)
            }
            ActionType::Discovery => {
                let mut args = Map::new();
                if let Some(category) = parameters.get("category") {
                    args.insert("category".into(), category.clone());
                }
                let output = self
                    .engine
                    .invoke(scope, DISCOVER_SERVICES, Value::Object(args), &mut trace.tool_calls)
                    .await?;
                Ok(output.data)
            }
            ActionType::Swap | ActionType::LeveragedTrade => {
                let domain = match action_type {
                    ActionType::Swap => Intent::Swap,
                    _ => Intent::LeveragedTrade,
                };
                let result = self
                    .spawner
                    .run(scope, scope.session_id, domain, parameters)
                    .await?;

                trace.sub_executions.push(result.summary());
                trace.tool_calls.extend(result.tool_calls.iter().cloned());

                let sub_session_id = result.session_id;
                let output = result.output.clone();
                if let Some(err) = result.into_error() {
                    return Err(err);
                }
                Ok(json!({
                    "sub_session_id": sub_session_id,
                    "parent_session_id": scope.session_id,
                    "result": output,
                }))
            }
        }
    }

    async fn ensure_session(&self, session_id: Uuid, user_id: Option<&str>) -> Result<AgentSession> {
        if self.sessions.get(session_id).await?.is_some() {
            return self.sessions.touch(session_id).await;
        }

        let session = AgentSession::new(
            session_id,
            user_id.unwrap_or(ANONYMOUS_USER),
            SessionConfig {
                budget_limit: self.config.default_budget_limit,
                approval_threshold: Some(self.config.approval_threshold),
            },
        );
        match self.sessions.create(session.clone()).await {
            Ok(()) => {
                info!(%session_id, "Session created");
                Ok(session)
            }
            // Lost a creation race with another command on the same id.
            Err(OrchestrationError::InvalidState(_)) => self.sessions.touch(session_id).await,
            Err(err) => Err(err),
        }
    }

    async fn write_memory(
        &self,
        session_id: Uuid,
        execution_id: Uuid,
        command: &str,
        summary: String,
        status: ExecutionStatus,
    ) {
        let metadata = json!({ "execution_id": execution_id, "status": status });
        let entries = [
            MemoryEntry::new(session_id, MemoryType::Human, command).with_metadata(metadata.clone()),
            MemoryEntry::new(session_id, MemoryType::Agent, summary).with_metadata(metadata),
        ];
        for entry in entries {
            if let Err(err) = self.memory.append(entry).await {
                warn!(%session_id, error = %err, "Failed to write session memory");
                return;
            }
        }
    }

    async fn render_memory(&self, session_id: Uuid) -> String {
        match self
            .memory
            .recent(session_id, self.context_manager.max_turns())
            .await
        {
            Ok(entries) => self.context_manager.render(&entries),
            Err(err) => {
                warn!(%session_id, error = %err, "Failed to load session memory");
                String::new()
            }
        }
    }

    fn phase(&self, scope: &ExecutionScope, phase: ExecutionPhase, message: &str) {
        if scope.cancel.is_cancelled() {
            return;
        }
        scope.emit(AgentEvent::Thinking {
            session_id: scope.session_id,
            execution_id: scope.execution_id,
            phase,
            message: message.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{create_simulated_registry, SimulatedLedger};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn orchestrator(config: OrchestratorConfig) -> Arc<Orchestrator> {
        let registry = create_simulated_registry(Arc::new(SimulatedLedger::new()));
        Arc::new(Orchestrator::in_memory(config, registry))
    }

    async fn run(orchestrator: &Orchestrator, request: CommandRequest) -> CommandResult {
        orchestrator
            .run(request, EventSink::disabled(), CancellationToken::new())
            .await
    }

    #[tokio::test]
    async fn test_simple_payment_completes() {
        let orchestrator = orchestrator(OrchestratorConfig::default());
        let result = run(&orchestrator, CommandRequest::new("pay 0.10 USDC to API service")).await;

        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.intent, Intent::Payment);
        assert!(result.confidence >= 0.9);
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.tool_calls.len(), 1);
        assert_eq!(result.tool_calls[0].tool_name, X402_PAYMENT);
        assert!((result.total_cost - 0.10).abs() < 1e-9);

        let log = orchestrator.execution_log(result.execution_id).await.unwrap().unwrap();
        assert_eq!(log.status, ExecutionStatus::Completed);
        assert_eq!(log.tool_calls.len(), 1);
    }

    #[tokio::test]
    async fn test_budget_exceeded_invokes_nothing() {
        let orchestrator = orchestrator(OrchestratorConfig::default());
        let result = run(
            &orchestrator,
            CommandRequest::new("pay 500 USDC to service").with_budget(100.0),
        )
        .await;

        assert!(!result.success);
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert!(result.tool_calls.is_empty());
        assert_eq!(result.error_type.as_deref(), Some("budget_exceeded"));
        assert!(result.error.unwrap().contains("100"));

        let log = orchestrator.execution_log(result.execution_id).await.unwrap().unwrap();
        assert_eq!(log.status, ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn test_composite_command_spawns_sub_execution() {
        let orchestrator = orchestrator(OrchestratorConfig::default());
        let result = run(
            &orchestrator,
            CommandRequest::new("Swap 10 CRO for USDC then pay 5 USDC to service"),
        )
        .await;

        assert!(result.success, "{:?}", result.error);
        let plan = result.plan.as_ref().unwrap();
        assert!(plan.steps.len() >= 2);
        assert!(plan.steps.iter().all(|s| s.status == StepStatus::Completed));

        assert_eq!(result.sub_executions.len(), 1);
        let sub = &result.sub_executions[0];
        assert_ne!(sub.session_id, result.session_id);
        assert_eq!(sub.parent_session_id, result.session_id);

        let tools: Vec<_> = result.tool_calls.iter().map(|c| c.tool_name.as_str()).collect();
        assert_eq!(tools, vec![TOKEN_SWAP, X402_PAYMENT]);
        assert_eq!(result.result["steps"].as_array().unwrap().len(), plan.steps.len());
    }

    #[tokio::test]
    async fn test_unknown_command_returns_suggestions() {
        let orchestrator = orchestrator(OrchestratorConfig::default());
        let result = run(&orchestrator, CommandRequest::new("asdf qwer")).await;

        assert!(!result.success);
        assert_eq!(result.intent, Intent::Unknown);
        assert_eq!(result.confidence, 0.0);
        assert!(!result.suggestions.is_empty());
        assert!(result.plan.is_none());
        assert!(result.tool_calls.is_empty());
        assert_eq!(result.status, ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn test_memory_accumulates_across_commands() {
        let orchestrator = orchestrator(OrchestratorConfig::default());
        let first = run(&orchestrator, CommandRequest::new("check my balance")).await;
        let second = run(
            &orchestrator,
            CommandRequest::new("find weather services").with_session(first.session_id),
        )
        .await;

        let memory = orchestrator.session_memory(first.session_id).await.unwrap();
        assert_eq!(memory.len(), 4);
        assert_eq!(memory[0].entry_type, MemoryType::Human);
        assert_eq!(memory[0].content, "check my balance");
        assert!(second.memory_context.contains("check my balance"));
        assert!(second.memory_context.find("check my balance") < second.memory_context.find("find weather services"));
    }

    #[tokio::test]
    async fn test_policy_violation_aborts_plan() {
        let config = OrchestratorConfig {
            allowed_tools: vec![TOKEN_SWAP.to_string()],
            ..Default::default()
        };
        let orchestrator = orchestrator(config);
        let result = run(
            &orchestrator,
            CommandRequest::new("Swap 10 CRO for USDC then pay 5 USDC to service"),
        )
        .await;

        assert!(!result.success);
        assert_eq!(result.error_type.as_deref(), Some("policy_violation"));
        let plan = result.plan.unwrap();
        assert_eq!(plan.steps[1].status, StepStatus::Completed);
        assert_eq!(plan.steps[2].status, StepStatus::Failed);
        assert_eq!(result.tool_calls.len(), 1);
    }

    #[tokio::test]
    async fn test_approval_suspends_until_decided() {
        let orchestrator = orchestrator(OrchestratorConfig::default());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let runner = orchestrator.clone();
        let task = tokio::spawn(async move {
            runner
                .run(
                    CommandRequest::new("pay 250 USDC to vendor"),
                    EventSink::new(tx),
                    CancellationToken::new(),
                )
                .await
        });

        let request_id = loop {
            match rx.recv().await.expect("event stream ended") {
                AgentEvent::ApprovalRequired { request_id, execution_id, .. } => {
                    let log = orchestrator.execution_log(execution_id).await.unwrap().unwrap();
                    assert_eq!(log.status, ExecutionStatus::Running);
                    break request_id;
                }
                AgentEvent::ToolCall { .. } => panic!("tool ran before approval"),
                _ => continue,
            }
        };

        orchestrator
            .approvals()
            .resolve(request_id, ApprovalDecision::Edited, Some(json!({"amount": 50.0})))
            .await
            .unwrap();

        let result = task.await.unwrap();
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.tool_calls[0].tool_args["amount"], json!(50.0));
        assert!((result.total_cost - 50.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_rejection_fails_command() {
        let config = OrchestratorConfig {
            approval_timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let orchestrator = orchestrator(config);
        let result = run(&orchestrator, CommandRequest::new("pay 250 USDC to vendor")).await;

        assert!(!result.success);
        assert_eq!(result.error_type.as_deref(), Some("approval_rejected"));
        assert!(result.tool_calls.is_empty());
    }

    #[tokio::test]
    async fn test_excess_leverage_reports_both_session_ids() {
        let orchestrator = orchestrator(OrchestratorConfig::default());
        let result = run(
            &orchestrator,
            CommandRequest::new("open a 50x long on BTC with 10 USDC"),
        )
        .await;

        assert!(!result.success);
        assert_eq!(result.error_type.as_deref(), Some("sub_execution_failure"));
        assert_eq!(result.sub_executions.len(), 1);
        assert_eq!(result.sub_executions[0].parent_session_id, result.session_id);
    }

    #[tokio::test]
    async fn test_sync_surface() {
        let orchestrator = orchestrator(OrchestratorConfig::default());
        let response = orchestrator.execute("pay 1 USDC to bob", None, None).await;
        assert_eq!(response.status, ExecutionStatus::Completed);
        assert!((response.total_cost - 1.0).abs() < 1e-9);
    }
}
