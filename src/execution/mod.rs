//! Gated tool invocation
//!
//! Every tool call goes through here: Tool Gate, then the tool, then a
//! `ToolCall` appended to the caller's log in invocation order. The call is
//! raced against the execution's cancellation token.

use crate::error::OrchestrationError;
use crate::events::{redact_args, AgentEvent, EventSink};
use crate::models::{ToolCall, ToolInput, ToolOutput};
use crate::policy::ToolGate;
use crate::tools::ToolRegistry;
use crate::Result;
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Identity and control handles for one running execution.
#[derive(Debug, Clone)]
pub struct ExecutionScope {
    /// Session events are correlated with (always the client-facing one).
    pub session_id: Uuid,
    pub execution_id: Uuid,
    pub cancel: CancellationToken,
    pub events: EventSink,
}

impl ExecutionScope {
    pub fn new(session_id: Uuid, execution_id: Uuid, cancel: CancellationToken, events: EventSink) -> Self {
        Self {
            session_id,
            execution_id,
            cancel,
            events,
        }
    }

    /// Scope for nested work: same correlation ids, child cancellation.
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            ..self.clone()
        }
    }

    pub fn emit(&self, event: AgentEvent) {
        self.events.emit(event);
    }

    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(OrchestrationError::Cancelled);
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct ExecutionEngine {
    registry: ToolRegistry,
    gate: Arc<ToolGate>,
}

impl ExecutionEngine {
    pub fn new(registry: ToolRegistry, gate: Arc<ToolGate>) -> Self {
        Self { registry, gate }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Engine bound to a narrower tool set, same gate.
    pub fn with_registry(&self, registry: ToolRegistry) -> Self {
        Self {
            registry,
            gate: self.gate.clone(),
        }
    }

    /// Gate, invoke and record one tool call.
    ///
    /// A gate denial records nothing. Any invocation that reached the tool
    /// is appended to `calls`, including failures.
    pub async fn invoke(
        &self,
        scope: &ExecutionScope,
        tool_name: &str,
        args: Value,
        calls: &mut Vec<ToolCall>,
    ) -> Result<ToolOutput> {
        self.gate.validate(tool_name, &args)?;
        scope.check_cancelled()?;

        let tool = self.registry.get(tool_name).ok_or_else(|| {
            warn!(tool_name, "Tool allowed but not registered");
            OrchestrationError::ToolExecution {
                tool: tool_name.to_string(),
                message: "tool not registered".to_string(),
            }
        })?;

        let redacted = redact_args(&args);
        scope.emit(AgentEvent::ToolCall {
            session_id: scope.session_id,
            execution_id: scope.execution_id,
            tool_name: tool_name.to_string(),
            tool_args: redacted.clone(),
        });

        let input = ToolInput {
            tool_name: tool_name.to_string(),
            parameters: args,
        };
        let start = Instant::now();

        let outcome = tokio::select! {
            biased;
            _ = scope.cancel.cancelled() => Err(OrchestrationError::Cancelled),
            result = tool.execute(&input) => result.and_then(|output| {
                if output.success {
                    Ok(output)
                } else {
                    Err(OrchestrationError::ToolExecution {
                        tool: tool_name.to_string(),
                        message: output.error.unwrap_or_else(|| "tool reported failure".to_string()),
                    })
                }
            }),
        };

        let elapsed_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(output) => {
                debug!(
                    execution_id = %scope.execution_id,
                    tool_name,
                    elapsed_ms,
                    cost = output.cost(),
                    "Tool call succeeded"
                );
                calls.push(ToolCall {
                    tool_name: tool_name.to_string(),
                    tool_args: redacted,
                    result: output.data.clone(),
                    timestamp: Utc::now(),
                });
                scope.emit(AgentEvent::ToolResult {
                    session_id: scope.session_id,
                    execution_id: scope.execution_id,
                    tool_name: tool_name.to_string(),
                    success: true,
                    result: output.data.clone(),
                });
                Ok(output)
            }
            Err(err) => {
                warn!(
                    execution_id = %scope.execution_id,
                    tool_name,
                    elapsed_ms,
                    error = %err,
                    "Tool call failed"
                );
                let error_result = json!({ "error": err.public_message() });
                calls.push(ToolCall {
                    tool_name: tool_name.to_string(),
                    tool_args: redacted,
                    result: error_result.clone(),
                    timestamp: Utc::now(),
                });
                if !matches!(err, OrchestrationError::Cancelled) {
                    scope.emit(AgentEvent::ToolResult {
                        session_id: scope.session_id,
                        execution_id: scope.execution_id,
                        tool_name: tool_name.to_string(),
                        success: false,
                        result: error_result,
                    });
                }
                Err(err)
            }
        }
    }
}

/// Sum of `cost` over successful calls; failed calls carry no cost.
pub fn total_cost(calls: &[ToolCall]) -> f64 {
    let sum: f64 = calls
        .iter()
        .filter(|call| call.result.get("error").is_none())
        .filter_map(|call| call.result.get("cost").and_then(Value::as_f64))
        .sum();
    (sum * 1_000_000.0).round() / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{create_simulated_registry, SimulatedLedger, Tool, BUILTIN_TOOLS, X402_PAYMENT};
    use tokio::sync::mpsc;

    struct SlowTool;

    #[async_trait::async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &'static str {
            "slow_quote"
        }

        fn description(&self) -> &'static str {
            "never returns in time"
        }

        async fn execute(&self, _input: &ToolInput) -> Result<ToolOutput> {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            Ok(ToolOutput::ok(json!({})))
        }
    }

    fn engine() -> ExecutionEngine {
        let registry = create_simulated_registry(Arc::new(SimulatedLedger::new()));
        ExecutionEngine::new(registry, Arc::new(ToolGate::with_allowlist(BUILTIN_TOOLS.iter().copied())))
    }

    fn scope() -> (ExecutionScope, mpsc::UnboundedReceiver<AgentEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let scope = ExecutionScope::new(Uuid::new_v4(), Uuid::new_v4(), CancellationToken::new(), EventSink::new(tx));
        (scope, rx)
    }

    #[tokio::test]
    async fn test_invoke_records_call_and_events_in_order() {
        let (scope, mut rx) = scope();
        let mut calls = Vec::new();
        let output = engine()
            .invoke(
                &scope,
                X402_PAYMENT,
                json!({"amount": 0.1, "token": "USDC", "recipient": "svc", "api_key": "k"}),
                &mut calls,
            )
            .await
            .unwrap();

        assert!(output.success);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].tool_args["api_key"], "[REDACTED]");
        assert_eq!(rx.recv().await.unwrap().event_type(), "tool_call");
        assert_eq!(rx.recv().await.unwrap().event_type(), "tool_result");
        assert!((total_cost(&calls) - 0.1).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_denied_tool_records_nothing() {
        let (scope, mut rx) = scope();
        let mut calls = Vec::new();
        let err = engine()
            .invoke(&scope, "execute_code", json!({}), &mut calls)
            .await
            .unwrap_err();

        assert!(matches!(err, OrchestrationError::PolicyViolation(_)));
        assert!(calls.is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failed_call_is_kept_without_cost() {
        let (scope, _rx) = scope();
        let mut calls = Vec::new();
        let result = engine()
            .invoke(&scope, X402_PAYMENT, json!({"amount": 1e9, "token": "USDC", "recipient": "x"}), &mut calls)
            .await;

        assert!(result.is_err());
        assert_eq!(calls.len(), 1);
        assert!(calls[0].result.get("error").is_some());
        assert_eq!(total_cost(&calls), 0.0);
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_tool() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(SlowTool));
        let engine = ExecutionEngine::new(registry, Arc::new(ToolGate::with_allowlist(["slow_quote"])));
        let (scope, mut rx) = scope();

        let cancel = scope.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            cancel.cancel();
        });

        let mut calls = Vec::new();
        let err = engine
            .invoke(&scope, "slow_quote", json!({}), &mut calls)
            .await
            .unwrap_err();

        assert!(matches!(err, OrchestrationError::Cancelled));
        assert_eq!(rx.recv().await.unwrap().event_type(), "tool_call");
        assert!(rx.try_recv().is_err());
    }
}
