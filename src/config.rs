//! Environment-driven configuration
//!
//! Binaries call `dotenv::dotenv()` first, then [`OrchestratorConfig::from_env`].

use crate::error::OrchestrationError;
use crate::tools::BUILTIN_TOOLS;
use crate::Result;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Budget ceiling applied when neither request nor session sets one.
    pub default_budget_limit: Option<f64>,
    /// Amounts above this need a human decision.
    pub approval_threshold: f64,
    /// Number of memory turns rendered into the context string.
    pub memory_context_turns: usize,
    pub approval_timeout: Duration,
    pub max_leverage: f64,
    pub swap_slippage_bps: u32,
    pub allowed_tools: Vec<String>,
    pub ledger_api_base_url: Option<String>,
    pub database_url: Option<String>,
    pub port: u16,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_budget_limit: None,
            approval_threshold: 100.0,
            memory_context_turns: 10,
            approval_timeout: Duration::from_secs(300),
            max_leverage: 20.0,
            swap_slippage_bps: 50,
            allowed_tools: BUILTIN_TOOLS.iter().map(|s| s.to_string()).collect(),
            ledger_api_base_url: None,
            database_url: None,
            port: 8080,
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let allowed_tools = match non_empty_var("ALLOWED_TOOLS") {
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect(),
            None => defaults.allowed_tools,
        };

        let port = match non_empty_var("PORT").or_else(|| non_empty_var("API_PORT")) {
            Some(raw) => parse_value("PORT", &raw)?,
            None => defaults.port,
        };

        Ok(Self {
            default_budget_limit: parse_optional("DEFAULT_BUDGET_LIMIT")?,
            approval_threshold: parse_optional("APPROVAL_THRESHOLD")?
                .unwrap_or(defaults.approval_threshold),
            memory_context_turns: parse_optional("MEMORY_CONTEXT_TURNS")?
                .unwrap_or(defaults.memory_context_turns),
            approval_timeout: parse_optional::<u64>("APPROVAL_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.approval_timeout),
            max_leverage: parse_optional("MAX_LEVERAGE")?.unwrap_or(defaults.max_leverage),
            swap_slippage_bps: parse_optional("SWAP_SLIPPAGE_BPS")?
                .unwrap_or(defaults.swap_slippage_bps),
            allowed_tools,
            ledger_api_base_url: non_empty_var("LEDGER_API_BASE_URL")
                .map(|url| url.trim_end_matches('/').to_string()),
            database_url: non_empty_var("DATABASE_URL").or_else(|| non_empty_var("POSTGRES_URL")),
            port,
        })
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_optional<T: FromStr>(key: &str) -> Result<Option<T>> {
    non_empty_var(key)
        .map(|raw| parse_value(key, &raw))
        .transpose()
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| OrchestrationError::Config(format!("{} has an invalid value: {}", key, raw)))
}
