//! Sub-Execution Spawner
//!
//! Swaps and leveraged trades run in an isolated context: a fresh session id,
//! a mandatory parent reference, private memory and a narrowed tool set.
//! Risk handling (slippage bound, leverage cap, derived stop-loss) happens
//! here, not in the parent.

use crate::error::OrchestrationError;
use crate::events::AgentEvent;
use crate::execution::{ExecutionEngine, ExecutionScope};
use crate::memory::MemoryStore;
use crate::models::{
    amount_of, Intent, MemoryEntry, MemoryType, SubExecutionSummary, ToolCall,
};
use crate::tools::{OPEN_LEVERAGED_POSITION, PLACE_RISK_ORDER, TOKEN_SWAP};
use crate::Result;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Fraction of margin lost at which the stop-loss fires.
const STOP_LOSS_MARGIN_FRACTION: f64 = 0.5;

/// Tools bound to each sub-execution domain.
fn domain_tools(domain: Intent) -> Option<&'static [&'static str]> {
    match domain {
        Intent::Swap => Some(&[TOKEN_SWAP]),
        Intent::LeveragedTrade => Some(&[OPEN_LEVERAGED_POSITION, PLACE_RISK_ORDER]),
        Intent::Payment | Intent::BalanceCheck | Intent::Discovery | Intent::Unknown => None,
    }
}

/// Isolated state for one sub-execution. Nothing in here is shared with the
/// parent: memory is owned, the engine holds its own registry copy.
pub struct SubExecutionContext {
    pub session_id: Uuid,
    pub parent_session_id: Uuid,
    pub domain: Intent,
    memory: Vec<MemoryEntry>,
    engine: ExecutionEngine,
}

impl SubExecutionContext {
    pub fn memory(&self) -> &[MemoryEntry] {
        &self.memory
    }

    pub fn tools(&self) -> Vec<&str> {
        self.engine.registry().list()
    }

    /// Check every isolation invariant; any violation is a hard error.
    pub fn verify_isolation(&self) -> Result<()> {
        let violation = |message: &str| OrchestrationError::SubExecution {
            session_id: self.session_id,
            parent_session_id: self.parent_session_id,
            message: message.to_string(),
        };

        if self.parent_session_id.is_nil() {
            return Err(violation("parent reference is missing"));
        }
        if self.session_id == self.parent_session_id {
            return Err(violation("sub-session id equals parent session id"));
        }
        if self.memory.iter().any(|entry| entry.session_id != self.session_id) {
            return Err(violation("memory entry scoped to another session"));
        }
        if self.engine.registry().is_empty() {
            return Err(violation("no tools bound"));
        }
        Ok(())
    }

    fn remember(&mut self, entry_type: MemoryType, content: impl Into<String>) {
        self.memory
            .push(MemoryEntry::new(self.session_id, entry_type, content));
    }
}

/// What a sub-execution hands back to its parent.
#[derive(Debug, Clone)]
pub struct SubExecutionResult {
    pub session_id: Uuid,
    pub parent_session_id: Uuid,
    pub domain: Intent,
    pub success: bool,
    pub output: Value,
    pub tool_calls: Vec<ToolCall>,
    /// Sanitized failure message.
    pub error: Option<String>,
}

impl SubExecutionResult {
    pub fn summary(&self) -> SubExecutionSummary {
        SubExecutionSummary {
            session_id: self.session_id,
            parent_session_id: self.parent_session_id,
            domain: self.domain.to_string(),
            success: self.success,
        }
    }

    /// Failure as the error the parent records.
    pub fn into_error(self) -> Option<OrchestrationError> {
        if self.success {
            return None;
        }
        Some(OrchestrationError::SubExecution {
            session_id: self.session_id,
            parent_session_id: self.parent_session_id,
            message: self.error.unwrap_or_else(|| "sub-execution failed".to_string()),
        })
    }
}

pub struct SubExecutionSpawner {
    engine: ExecutionEngine,
    memory: Arc<dyn MemoryStore>,
    max_leverage: f64,
    swap_slippage_bps: u32,
}

impl SubExecutionSpawner {
    pub fn new(
        engine: ExecutionEngine,
        memory: Arc<dyn MemoryStore>,
        max_leverage: f64,
        swap_slippage_bps: u32,
    ) -> Self {
        Self {
            engine,
            memory,
            max_leverage,
            swap_slippage_bps,
        }
    }

    /// Fresh isolated context for `domain` under `parent_session_id`.
    pub fn context_for(&self, parent_session_id: Uuid, domain: Intent) -> Result<SubExecutionContext> {
        let tools = domain_tools(domain).ok_or_else(|| {
            OrchestrationError::Validation(format!("{} does not run as a sub-execution", domain))
        })?;

        let mut session_id = Uuid::new_v4();
        while session_id == parent_session_id {
            session_id = Uuid::new_v4();
        }

        let context = SubExecutionContext {
            session_id,
            parent_session_id,
            domain,
            memory: Vec::new(),
            engine: self.engine.with_registry(self.engine.registry().subset(tools)),
        };
        context.verify_isolation()?;
        Ok(context)
    }

    /// Run one domain action to completion.
    ///
    /// Domain failures come back as an unsuccessful result; only
    /// cancellation and isolation violations are returned as errors.
    pub async fn run(
        &self,
        scope: &ExecutionScope,
        parent_session_id: Uuid,
        domain: Intent,
        parameters: &Map<String, Value>,
    ) -> Result<SubExecutionResult> {
        let mut context = self.context_for(parent_session_id, domain)?;
        let sub_scope = scope.child();

        info!(
            sub_session_id = %context.session_id,
            %parent_session_id,
            domain = %domain,
            "Sub-execution started"
        );
        scope.emit(AgentEvent::SubagentStart {
            session_id: scope.session_id,
            execution_id: scope.execution_id,
            sub_session_id: context.session_id,
            domain: domain.to_string(),
        });

        context.remember(
            MemoryType::System,
            format!("{} sub-execution spawned by session {}", domain, parent_session_id),
        );
        context.remember(MemoryType::Human, Value::Object(parameters.clone()).to_string());

        let mut tool_calls = Vec::new();
        let outcome = match domain {
            Intent::Swap => self.swap(&context, &sub_scope, parameters, &mut tool_calls).await,
            Intent::LeveragedTrade => {
                self.leveraged_trade(&context, &sub_scope, parameters, &mut tool_calls)
                    .await
            }
            Intent::Payment | Intent::BalanceCheck | Intent::Discovery | Intent::Unknown => {
                Err(OrchestrationError::Validation(format!(
                    "{} does not run as a sub-execution",
                    domain
                )))
            }
        };

        let result = match outcome {
            Ok(output) => {
                context.remember(MemoryType::Agent, output.to_string());
                SubExecutionResult {
                    session_id: context.session_id,
                    parent_session_id,
                    domain,
                    success: true,
                    output,
                    tool_calls,
                    error: None,
                }
            }
            Err(OrchestrationError::Cancelled) => {
                context.remember(MemoryType::System, "cancelled");
                self.persist(&context).await;
                return Err(OrchestrationError::Cancelled);
            }
            Err(err) => {
                warn!(sub_session_id = %context.session_id, error = %err, "Sub-execution failed");
                let message = err.public_message();
                context.remember(MemoryType::Agent, format!("failed: {}", message));
                SubExecutionResult {
                    session_id: context.session_id,
                    parent_session_id,
                    domain,
                    success: false,
                    output: Value::Null,
                    tool_calls,
                    error: Some(message),
                }
            }
        };

        self.persist(&context).await;

        scope.emit(AgentEvent::SubagentEnd {
            session_id: scope.session_id,
            execution_id: scope.execution_id,
            sub_session_id: result.session_id,
            domain: domain.to_string(),
            success: result.success,
        });
        debug!(sub_session_id = %result.session_id, success = result.success, "Sub-execution finished");

        Ok(result)
    }

    async fn persist(&self, context: &SubExecutionContext) {
        for entry in context.memory() {
            if let Err(err) = self.memory.append(entry.clone()).await {
                warn!(sub_session_id = %context.session_id, error = %err, "Failed to persist sub-execution memory");
                return;
            }
        }
    }

    async fn swap(
        &self,
        context: &SubExecutionContext,
        scope: &ExecutionScope,
        parameters: &Map<String, Value>,
        tool_calls: &mut Vec<ToolCall>,
    ) -> Result<Value> {
        let args = json!({
            "amount": amount_of(parameters),
            "from_token": parameters.get("from_token"),
            "to_token": parameters.get("to_token"),
            "slippage_bps": self.swap_slippage_bps,
        });

        let output = context.engine.invoke(scope, TOKEN_SWAP, args, tool_calls).await?;

        let realized = output
            .data
            .get("realized_slippage_bps")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        if realized > f64::from(self.swap_slippage_bps) {
            return Err(OrchestrationError::ToolExecution {
                tool: TOKEN_SWAP.to_string(),
                message: format!(
                    "realized slippage {} bps exceeds limit {} bps",
                    realized, self.swap_slippage_bps
                ),
            });
        }

        Ok(json!({ "swap": output.data }))
    }

    async fn leveraged_trade(
        &self,
        context: &SubExecutionContext,
        scope: &ExecutionScope,
        parameters: &Map<String, Value>,
        tool_calls: &mut Vec<ToolCall>,
    ) -> Result<Value> {
        let leverage = parameters
            .get("leverage")
            .and_then(Value::as_f64)
            .unwrap_or(1.0);
        if !(1.0..=self.max_leverage).contains(&leverage) {
            return Err(OrchestrationError::PolicyViolation(format!(
                "leverage {}x is outside the allowed range 1x to {}x",
                leverage, self.max_leverage
            )));
        }

        let direction = parameters
            .get("direction")
            .and_then(Value::as_str)
            .unwrap_or("long")
            .to_lowercase();

        let args = json!({
            "asset": parameters.get("asset"),
            "direction": direction,
            "amount": amount_of(parameters),
            "collateral_token": parameters.get("collateral_token").cloned().unwrap_or_else(|| json!("USDC")),
            "leverage": leverage,
        });
        let position = context
            .engine
            .invoke(scope, OPEN_LEVERAGED_POSITION, args, tool_calls)
            .await?;

        let entry_price = position
            .data
            .get("entry_price")
            .and_then(Value::as_f64)
            .ok_or_else(|| OrchestrationError::ToolExecution {
                tool: OPEN_LEVERAGED_POSITION.to_string(),
                message: "position response has no entry price".to_string(),
            })?;
        let position_id = position.data.get("position_id").cloned().unwrap_or(Value::Null);

        let trigger_price = stop_loss_trigger(entry_price, leverage, &direction);
        let exit_side = if direction == "short" { "buy" } else { "sell" };

        let stop_loss = context
            .engine
            .invoke(
                scope,
                PLACE_RISK_ORDER,
                json!({
                    "position_id": position_id,
                    "order_type": "stop_loss",
                    "side": exit_side,
                    "trigger_price": trigger_price,
                }),
                tool_calls,
            )
            .await?;

        Ok(json!({
            "position": position.data,
            "stop_loss": stop_loss.data,
        }))
    }
}

/// Trigger at which half the margin is gone: entry × (1 ∓ 0.5 / leverage).
pub fn stop_loss_trigger(entry_price: f64, leverage: f64, direction: &str) -> f64 {
    let offset = STOP_LOSS_MARGIN_FRACTION / leverage;
    let trigger = if direction == "short" {
        entry_price * (1.0 + offset)
    } else {
        entry_price * (1.0 - offset)
    };
    (trigger * 1_000_000.0).round() / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventSink;
    use crate::memory::InMemoryMemoryStore;
    use crate::policy::ToolGate;
    use crate::tools::{create_simulated_registry, SimulatedLedger, BUILTIN_TOOLS};
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn spawner(memory: Arc<InMemoryMemoryStore>) -> SubExecutionSpawner {
        let registry = create_simulated_registry(Arc::new(SimulatedLedger::new()));
        let gate = Arc::new(ToolGate::with_allowlist(BUILTIN_TOOLS.iter().copied()));
        SubExecutionSpawner::new(ExecutionEngine::new(registry, gate), memory, 20.0, 50)
    }

    fn params(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_context_isolation_invariants() {
        let spawner = spawner(Arc::new(InMemoryMemoryStore::new()));
        let parent = Uuid::new_v4();

        let context = spawner.context_for(parent, Intent::Swap).unwrap();
        assert_ne!(context.session_id, parent);
        assert_eq!(context.parent_session_id, parent);
        assert!(context.memory().is_empty());
        assert_eq!(context.tools(), vec![TOKEN_SWAP]);
        assert!(context.verify_isolation().is_ok());

        assert!(spawner.context_for(parent, Intent::Payment).is_err());
        assert!(spawner.context_for(Uuid::nil(), Intent::Swap).is_err());
    }

    #[tokio::test]
    async fn test_swap_runs_isolated_and_persists_own_memory() {
        let memory = Arc::new(InMemoryMemoryStore::new());
        let spawner = spawner(memory.clone());
        let parent = Uuid::new_v4();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let scope = ExecutionScope::new(parent, Uuid::new_v4(), CancellationToken::new(), EventSink::new(tx));

        let result = spawner
            .run(&scope, parent, Intent::Swap, &params(json!({"amount": 10.0, "from_token": "CRO", "to_token": "USDC"})))
            .await
            .unwrap();

        assert!(result.success);
        assert_ne!(result.session_id, parent);
        assert_eq!(result.parent_session_id, parent);
        assert_eq!(result.tool_calls.len(), 1);
        assert!(memory.list(parent).await.unwrap().is_empty());
        assert!(!memory.list(result.session_id).await.unwrap().is_empty());

        let mut types = Vec::new();
        while let Ok(event) = rx.try_recv() {
            types.push(event.event_type());
        }
        assert_eq!(types, vec!["subagent_start", "tool_call", "tool_result", "subagent_end"]);
    }

    #[tokio::test]
    async fn test_leveraged_trade_places_stop_loss() {
        let spawner = spawner(Arc::new(InMemoryMemoryStore::new()));
        let parent = Uuid::new_v4();
        let scope = ExecutionScope::new(parent, Uuid::new_v4(), CancellationToken::new(), EventSink::disabled());

        let result = spawner
            .run(
                &scope,
                parent,
                Intent::LeveragedTrade,
                &params(json!({"direction": "long", "asset": "BTC", "amount": 100.0, "collateral_token": "USDC", "leverage": 5.0})),
            )
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.tool_calls.len(), 2);
        assert_eq!(result.tool_calls[1].tool_name, PLACE_RISK_ORDER);
        assert_eq!(result.output["stop_loss"]["trigger_price"], json!(54_000.0));
    }

    #[tokio::test]
    async fn test_excess_leverage_fails_before_any_tool() {
        let spawner = spawner(Arc::new(InMemoryMemoryStore::new()));
        let parent = Uuid::new_v4();
        let scope = ExecutionScope::new(parent, Uuid::new_v4(), CancellationToken::new(), EventSink::disabled());

        let result = spawner
            .run(
                &scope,
                parent,
                Intent::LeveragedTrade,
                &params(json!({"direction": "short", "asset": "ETH", "amount": 10.0, "leverage": 50.0})),
            )
            .await
            .unwrap();

        assert!(!result.success);
        assert!(result.tool_calls.is_empty());
        let err = result.into_error().unwrap();
        assert!(matches!(err, OrchestrationError::SubExecution { parent_session_id, .. } if parent_session_id == parent));
    }

    #[test]
    fn test_stop_loss_trigger_direction() {
        assert_eq!(stop_loss_trigger(100.0, 5.0, "long"), 90.0);
        assert_eq!(stop_loss_trigger(100.0, 5.0, "short"), 110.0);
    }
}
