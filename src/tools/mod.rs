//! Tool trait and registry
//!
//! Every ledger/exchange capability sits behind [`Tool`]. Two families exist:
//! HTTP-backed tools calling the settlement back-end (`ledger`) and
//! deterministic simulated tools (`simulated`). The registry is chosen once at
//! startup; nothing downstream knows which family it got.

use crate::config::OrchestratorConfig;
use crate::models::{ToolInput, ToolOutput};
use crate::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

pub mod ledger;
pub mod simulated;

pub use ledger::{create_ledger_registry, LedgerApiClient};
pub use simulated::{create_simulated_registry, SimulatedLedger};

pub const X402_PAYMENT: &str = "x402_payment";
pub const TOKEN_SWAP: &str = "token_swap";
pub const OPEN_LEVERAGED_POSITION: &str = "open_leveraged_position";
pub const PLACE_RISK_ORDER: &str = "place_risk_order";
pub const CHECK_BALANCE: &str = "check_balance";
pub const DISCOVER_SERVICES: &str = "discover_services";

pub const BUILTIN_TOOLS: &[&str] = &[
    X402_PAYMENT,
    TOKEN_SWAP,
    OPEN_LEVERAGED_POSITION,
    PLACE_RISK_ORDER,
    CHECK_BALANCE,
    DISCOVER_SERVICES,
];

/// Trait for a single tool
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    async fn execute(&self, input: &ToolInput) -> Result<ToolOutput>;
}

/// Tool registry for looking up and executing tools
#[derive(Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// New registry holding only the named tools that exist here.
    pub fn subset(&self, names: &[&str]) -> ToolRegistry {
        let tools = names
            .iter()
            .filter_map(|name| self.tools.get(*name).map(|tool| (name.to_string(), tool.clone())))
            .collect();
        ToolRegistry { tools }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// HTTP-backed tools when a ledger URL is configured, simulated ones otherwise.
pub fn create_default_registry(config: &OrchestratorConfig) -> Result<ToolRegistry> {
    match &config.ledger_api_base_url {
        Some(base_url) => {
            info!(base_url = %base_url, "Tool backend: ledger API");
            let client = LedgerApiClient::new(base_url)?;
            Ok(create_ledger_registry(client))
        }
        None => {
            info!("Tool backend: simulated ledger");
            Ok(create_simulated_registry(Arc::new(SimulatedLedger::new())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulated_registry_has_every_builtin() {
        let registry = create_default_registry(&OrchestratorConfig::default()).unwrap();
        for name in BUILTIN_TOOLS {
            assert!(registry.contains(name), "missing {}", name);
        }
        assert_eq!(registry.len(), BUILTIN_TOOLS.len());
    }

    #[test]
    fn test_subset_is_independent() {
        let registry = create_default_registry(&OrchestratorConfig::default()).unwrap();
        let subset = registry.subset(&[TOKEN_SWAP, "not_a_tool"]);
        assert_eq!(subset.list(), vec![TOKEN_SWAP]);
        assert_eq!(registry.len(), BUILTIN_TOOLS.len());
    }
}
