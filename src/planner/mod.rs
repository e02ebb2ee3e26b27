//! Planner trait and implementations
//!
//! Decides whether a command needs decomposition and, if so, emits ordered
//! steps. Step 1 is always a validation step; every action leg follows in
//! textual order. Balance checks and discovery never get a plan on their own.

use crate::classifier::IntentClassifier;
use crate::error::OrchestrationError;
use crate::models::{
    amount_of, ActionType, ExecutionPlan, Intent, ParsedCommand, PlanStep, StepStatus,
};
use crate::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Map, Value};
use tracing::debug;

pub mod segment;

pub use segment::{has_sequencing, split_segments};

/// Maximum steps allowed per plan
const MAX_STEPS_PER_PLAN: usize = 20;

/// Session-dependent inputs to planning.
#[derive(Debug, Clone, Copy)]
pub struct PlanningContext {
    pub approval_threshold: f64,
}

/// Trait for plan generation
#[async_trait]
pub trait Planner: Send + Sync {
    /// Build a plan for a parsed command, or `None` when it runs as a single action.
    async fn create_plan(
        &self,
        command: &ParsedCommand,
        context: &PlanningContext,
    ) -> Result<Option<ExecutionPlan>>;
}

/// Rule-based planner: sequencing keywords split the instruction, each
/// segment is classified on its own.
pub struct HeuristicPlanner;

#[async_trait]
impl Planner for HeuristicPlanner {
    async fn create_plan(
        &self,
        command: &ParsedCommand,
        context: &PlanningContext,
    ) -> Result<Option<ExecutionPlan>> {
        if command.intent == Intent::Unknown {
            return Ok(None);
        }

        let sequenced = has_sequencing(&command.raw_text);
        if !sequenced && !command.intent.is_multi_stage() {
            return Ok(None);
        }

        let legs: Vec<ParsedCommand> = if sequenced {
            split_segments(&command.raw_text)
                .iter()
                .map(|segment| IntentClassifier::classify(segment))
                .collect()
        } else {
            vec![command.clone()]
        };

        if legs.len() + 1 > MAX_STEPS_PER_PLAN {
            return Err(OrchestrationError::Validation(format!(
                "Command has too many steps (maximum {})",
                MAX_STEPS_PER_PLAN
            )));
        }

        let mut steps = Vec::with_capacity(legs.len() + 1);
        steps.push(validation_step(legs.len()));
        for (index, leg) in legs.iter().enumerate() {
            steps.push(action_step(index as u32 + 2, leg, context.approval_threshold));
        }

        let requires_human_approval = steps.iter().any(|step| step.requires_approval);
        let approach = if sequenced {
            format!("sequential: {} legs executed in order", legs.len())
        } else {
            format!("single {} action with pre-validation", command.intent)
        };

        debug!(
            intent = %command.intent,
            step_count = steps.len(),
            requires_human_approval,
            "Plan created"
        );

        Ok(Some(ExecutionPlan {
            approach,
            steps,
            requires_human_approval,
            created_at: Utc::now(),
        }))
    }
}

/// Accept a caller-supplied plan: ids must be contiguous, statuses reset,
/// and approval flags can only be raised, never lowered.
pub fn normalize_plan(mut plan: ExecutionPlan, context: &PlanningContext) -> Result<ExecutionPlan> {
    if plan.steps.is_empty() {
        return Err(OrchestrationError::Validation("Plan has no steps".to_string()));
    }
    if plan.steps.len() > MAX_STEPS_PER_PLAN {
        return Err(OrchestrationError::Validation(format!(
            "Plan exceeds {} steps",
            MAX_STEPS_PER_PLAN
        )));
    }
    if !plan.has_contiguous_ids() {
        return Err(OrchestrationError::Validation(
            "Plan step ids must be 1-based and contiguous".to_string(),
        ));
    }

    for step in &mut plan.steps {
        step.status = StepStatus::Pending;
        step.requires_approval |= exceeds_threshold(&step.parameters, context.approval_threshold);
    }
    plan.requires_human_approval = plan.steps.iter().any(|step| step.requires_approval);
    Ok(plan)
}

fn exceeds_threshold(parameters: &Map<String, Value>, threshold: f64) -> bool {
    amount_of(parameters).map_or(false, |amount| amount > threshold)
}

fn validation_step(legs: usize) -> PlanStep {
    let mut parameters = Map::new();
    parameters.insert("legs".into(), json!(legs));

    PlanStep {
        id: 1,
        description: format!("Validate parameters for {} action(s)", legs),
        action_type: ActionType::Validate,
        outcome: "All actions have usable amounts, tokens and targets".to_string(),
        status: StepStatus::Pending,
        requires_approval: false,
        parameters,
    }
}

fn action_step(id: u32, leg: &ParsedCommand, approval_threshold: f64) -> PlanStep {
    let action_type = ActionType::from_intent(leg.intent);
    let mut parameters = leg.parameters.clone();
    if leg.intent == Intent::Unknown {
        parameters.insert("instruction".into(), json!(leg.raw_text));
    }

    let (description, outcome) = describe(leg);

    PlanStep {
        id,
        description,
        action_type,
        outcome,
        status: StepStatus::Pending,
        requires_approval: exceeds_threshold(&parameters, approval_threshold),
        parameters,
    }
}

fn describe(leg: &ParsedCommand) -> (String, String) {
    let text = |key: &str| display(&leg.parameters, key);

    match leg.intent {
        Intent::Payment => (
            format!("Pay {} {} to {}", text("amount"), text("token"), text("recipient")),
            "Payment settled via x402".to_string(),
        ),
        Intent::Swap => (
            format!("Swap {} {} for {}", text("amount"), text("from_token"), text("to_token")),
            "Swap executed in an isolated sub-execution".to_string(),
        ),
        Intent::LeveragedTrade => (
            format!(
                "Open {}x {} on {} with {} {}",
                text("leverage"),
                text("direction"),
                text("asset"),
                text("amount"),
                text("collateral_token")
            ),
            "Position opened with a protective stop-loss".to_string(),
        ),
        Intent::BalanceCheck => (
            match leg.param_str("token") {
                Some(token) => format!("Check {} balance", token),
                None => "Check wallet balances".to_string(),
            },
            "Current balances reported".to_string(),
        ),
        Intent::Discovery => (
            match leg.param_str("category") {
                Some(category) => format!("Discover {} services", category),
                None => "Discover available services".to_string(),
            },
            "Matching services listed".to_string(),
        ),
        Intent::Unknown => (
            format!("Review unresolved instruction: \"{}\"", leg.raw_text),
            "No automated action".to_string(),
        ),
    }
}

fn display(parameters: &Map<String, Value>, key: &str) -> String {
    match parameters.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.as_f64().map(format_number).unwrap_or_else(|| n.to_string()),
        Some(Value::Null) | None => "?".to_string(),
        Some(other) => other.to_string(),
    }
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}
