//! HTTP-backed tools calling the settlement/exchange service.

use super::{
    Tool, ToolRegistry, CHECK_BALANCE, DISCOVER_SERVICES, OPEN_LEVERAGED_POSITION,
    PLACE_RISK_ORDER, TOKEN_SWAP, X402_PAYMENT,
};
use crate::error::OrchestrationError;
use crate::models::{ToolInput, ToolOutput};
use crate::Result;
use reqwest::Client;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Clone)]
pub struct LedgerApiClient {
    client: Client,
    base_url: String,
}

impl LedgerApiClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(8)
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn post_json(&self, tool: &str, path: &str, body: &Value) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        debug!(tool, path, "Calling ledger API");

        let response = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| OrchestrationError::ToolExecution {
                tool: tool.to_string(),
                message: format!("request to {} failed: {}", path, e),
            })?;

        let status = response.status();
        let body = response
            .json::<Value>()
            .await
            .map_err(|e| OrchestrationError::ToolExecution {
                tool: tool.to_string(),
                message: format!("invalid JSON response: {}", e),
            })?;

        if !status.is_success() {
            return Err(OrchestrationError::ToolExecution {
                tool: tool.to_string(),
                message: format!("ledger API returned {} for {}: {}", status, path, body),
            });
        }

        Ok(body)
    }
}

/// One ledger endpoint exposed as a tool.
pub struct LedgerTool {
    tool_name: &'static str,
    tool_description: &'static str,
    path: &'static str,
    /// Payments report their own amount as cost when the service omits it.
    amount_is_cost: bool,
    api: LedgerApiClient,
}

impl LedgerTool {
    pub fn new(
        tool_name: &'static str,
        tool_description: &'static str,
        path: &'static str,
        amount_is_cost: bool,
        api: LedgerApiClient,
    ) -> Self {
        Self {
            tool_name,
            tool_description,
            path,
            amount_is_cost,
            api,
        }
    }
}

#[async_trait::async_trait]
impl Tool for LedgerTool {
    fn name(&self) -> &'static str {
        self.tool_name
    }

    fn description(&self) -> &'static str {
        self.tool_description
    }

    async fn execute(&self, input: &ToolInput) -> Result<ToolOutput> {
        if !input.parameters.is_object() {
            return Err(OrchestrationError::Validation(
                "tool_input must be a JSON object".to_string(),
            ));
        }

        let mut data = self
            .api
            .post_json(self.tool_name, self.path, &input.parameters)
            .await?;

        if self.amount_is_cost && data.get("cost").is_none() {
            if let (Some(object), Some(amount)) = (
                data.as_object_mut(),
                input.parameters.get("amount").cloned(),
            ) {
                object.insert("cost".to_string(), amount);
            }
        }

        if data.get("cost").is_none() {
            if let Some(object) = data.as_object_mut() {
                object.insert("cost".to_string(), json!(0.0));
            }
        }

        Ok(ToolOutput::ok(data))
    }
}

/// Registry of HTTP-backed tools sharing one connection pool.
pub fn create_ledger_registry(api: LedgerApiClient) -> ToolRegistry {
    let mut registry = ToolRegistry::new();

    let tools: [(&'static str, &'static str, &'static str, bool); 6] = [
        (X402_PAYMENT, "Settle an x402 payment to a service or address", "/api/v1/payments/x402", true),
        (TOKEN_SWAP, "Swap one token for another on the exchange", "/api/v1/exchange/swap", false),
        (
            OPEN_LEVERAGED_POSITION,
            "Open a leveraged long or short position",
            "/api/v1/perps/positions",
            false,
        ),
        (
            PLACE_RISK_ORDER,
            "Place a stop-loss or take-profit order for a position",
            "/api/v1/perps/orders",
            false,
        ),
        (CHECK_BALANCE, "Read wallet balances", "/api/v1/wallet/balance", false),
        (DISCOVER_SERVICES, "List payable services by category", "/api/v1/services/discover", false),
    ];

    for (name, description, path, amount_is_cost) in tools {
        registry.register(Arc::new(LedgerTool::new(
            name,
            description,
            path,
            amount_is_cost,
            api.clone(),
        )));
    }

    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::BUILTIN_TOOLS;

    #[test]
    fn test_ledger_registry_covers_builtins() {
        let api = LedgerApiClient::new("http://127.0.0.1:9/").unwrap();
        let registry = create_ledger_registry(api);
        for name in BUILTIN_TOOLS {
            assert!(registry.contains(name));
        }
    }

    #[tokio::test]
    async fn test_unreachable_ledger_is_tool_failure() {
        let api = LedgerApiClient::new("http://127.0.0.1:9").unwrap();
        let tool = LedgerTool::new(X402_PAYMENT, "pay", "/api/v1/payments/x402", true, api);
        let input = ToolInput {
            tool_name: X402_PAYMENT.to_string(),
            parameters: json!({"amount": 1.0, "token": "USDC", "recipient": "svc"}),
        };
        let err = tool.execute(&input).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::ToolExecution { .. }));
    }
}
