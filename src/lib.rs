//! Command Agent Orchestrator
//!
//! Turns free-text financial commands into gated, audited tool calls:
//! - Classifies intent and extracts parameters without a language model
//! - Splits sequenced commands into ordered plan steps
//! - Enforces budget ceilings, a default-deny tool allowlist and human
//!   approval above a threshold
//! - Runs swaps and leveraged trades in isolated sub-executions
//! - Streams ordered progress events per session and persists every
//!   execution and conversation turn
//!
//! COMMAND LIFECYCLE:
//! PARSE → PLAN → BUDGET CHECK → EXECUTE (→ APPROVAL?) → LOG → MEMORY

pub mod agent;
pub mod api;
pub mod approval;
pub mod audit;
pub mod classifier;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod execution;
pub mod hub;
pub mod memory;
pub mod models;
pub mod planner;
pub mod policy;
pub mod state;
pub mod subagent;
pub mod tools;

pub use error::{OrchestrationError, Result};

// Re-export common types
pub use classifier::IntentClassifier;
pub use models::*;
