//! Deterministic in-process ledger
//!
//! Backs every built-in tool with fixed quotes and an in-memory wallet so the
//! whole pipeline runs without a settlement service. Transaction ids are
//! SHA-256 digests of the call arguments plus a monotonically increasing
//! nonce, so a given sequence of calls always yields the same ids.

use super::{
    Tool, ToolRegistry, CHECK_BALANCE, DISCOVER_SERVICES, OPEN_LEVERAGED_POSITION,
    PLACE_RISK_ORDER, TOKEN_SWAP, X402_PAYMENT,
};
use crate::error::OrchestrationError;
use crate::models::{ToolInput, ToolOutput};
use crate::Result;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Swap fee charged by the simulated exchange, in basis points.
const SWAP_FEE_BPS: f64 = 30.0;

/// One basis point of price impact per this many USD swapped.
const USD_PER_IMPACT_BPS: f64 = 1_000.0;

fn usd_price(token: &str) -> Option<f64> {
    let price = match token {
        "USDC" | "USDT" | "DAI" => 1.0,
        "CRO" => 0.1,
        "ETH" | "WETH" => 3_000.0,
        "BTC" | "WBTC" => 60_000.0,
        "SOL" => 150.0,
        "ATOM" => 8.0,
        _ => return None,
    };
    Some(price)
}

const SERVICE_CATALOG: &[(&str, &str, f64)] = &[
    ("weather-now", "weather", 0.01),
    ("forecast-pro", "weather", 0.05),
    ("price-feed", "market-data", 0.02),
    ("orderbook-depth", "market-data", 0.10),
    ("news-digest", "news", 0.03),
    ("llm-inference", "ai", 0.25),
    ("image-captioning", "ai", 0.08),
];

fn round6(value: f64) -> f64 {
    (value * 1_000_000.0).round() / 1_000_000.0
}

fn failure(tool: &str, message: impl Into<String>) -> OrchestrationError {
    OrchestrationError::ToolExecution {
        tool: tool.to_string(),
        message: message.into(),
    }
}

fn required_f64(tool: &str, args: &Value, key: &str) -> Result<f64> {
    let value = match args.get(key) {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match value {
        Some(v) if v.is_finite() && v > 0.0 => Ok(v),
        _ => Err(failure(tool, format!("{} must be a positive number", key))),
    }
}

fn required_str<'a>(tool: &str, args: &'a Value, key: &str) -> Result<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| failure(tool, format!("{} is required", key)))
}

fn token_arg(tool: &str, args: &Value, key: &str) -> Result<String> {
    let token = required_str(tool, args, key)?.to_uppercase();
    if usd_price(&token).is_none() {
        return Err(failure(tool, format!("unsupported token {}", token)));
    }
    Ok(token)
}

/// Shared wallet and nonce for all simulated tools.
pub struct SimulatedLedger {
    balances: RwLock<HashMap<String, f64>>,
    nonce: AtomicU64,
}

impl SimulatedLedger {
    pub fn new() -> Self {
        Self::with_balances([
            ("USDC", 1_000.0),
            ("CRO", 10_000.0),
            ("ETH", 2.0),
            ("BTC", 0.05),
        ])
    }

    pub fn with_balances<I, S>(balances: I) -> Self
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        Self {
            balances: RwLock::new(balances.into_iter().map(|(k, v)| (k.into(), v)).collect()),
            nonce: AtomicU64::new(0),
        }
    }

    pub async fn balance(&self, token: &str) -> f64 {
        self.balances.read().await.get(token).copied().unwrap_or(0.0)
    }

    fn tx_hash(&self, tool: &str, args: &Value) -> String {
        let nonce = self.nonce.fetch_add(1, Ordering::SeqCst);
        let mut hasher = Sha256::new();
        hasher.update(tool.as_bytes());
        hasher.update(args.to_string().as_bytes());
        hasher.update(nonce.to_le_bytes());
        format!("0x{}", hex::encode(hasher.finalize()))
    }

    async fn debit(&self, tool: &str, token: &str, amount: f64) -> Result<()> {
        let mut balances = self.balances.write().await;
        let available = balances.get(token).copied().unwrap_or(0.0);
        if available + 1e-9 < amount {
            return Err(failure(
                tool,
                format!("insufficient {} balance ({} available)", token, available),
            ));
        }
        balances.insert(token.to_string(), round6(available - amount));
        Ok(())
    }

    async fn credit(&self, token: &str, amount: f64) {
        let mut balances = self.balances.write().await;
        *balances.entry(token.to_string()).or_insert(0.0) += amount;
    }
}

impl Default for SimulatedLedger {
    fn default() -> Self {
        Self::new()
    }
}

//
// ================= Payments =================
//

pub struct SimulatedPayment {
    ledger: Arc<SimulatedLedger>,
}

#[async_trait::async_trait]
impl Tool for SimulatedPayment {
    fn name(&self) -> &'static str {
        X402_PAYMENT
    }

    fn description(&self) -> &'static str {
        "Settle an x402 payment against the simulated wallet"
    }

    async fn execute(&self, input: &ToolInput) -> Result<ToolOutput> {
        let args = &input.parameters;
        let amount = required_f64(X402_PAYMENT, args, "amount")?;
        let token = token_arg(X402_PAYMENT, args, "token")?;
        let recipient = required_str(X402_PAYMENT, args, "recipient")?;

        self.ledger.debit(X402_PAYMENT, &token, amount).await?;
        let cost = usd_price(&token).map_or(amount, |price| round6(amount * price));

        Ok(ToolOutput::ok(json!({
            "status": "settled",
            "tx_hash": self.ledger.tx_hash(X402_PAYMENT, args),
            "amount": amount,
            "token": token,
            "recipient": recipient,
            "cost": cost,
        })))
    }
}

//
// ================= Exchange =================
//

pub struct SimulatedSwap {
    ledger: Arc<SimulatedLedger>,
}

#[async_trait::async_trait]
impl Tool for SimulatedSwap {
    fn name(&self) -> &'static str {
        TOKEN_SWAP
    }

    fn description(&self) -> &'static str {
        "Swap tokens at fixed simulated quotes"
    }

    async fn execute(&self, input: &ToolInput) -> Result<ToolOutput> {
        let args = &input.parameters;
        let amount = required_f64(TOKEN_SWAP, args, "amount")?;
        let from_token = token_arg(TOKEN_SWAP, args, "from_token")?;
        let to_token = token_arg(TOKEN_SWAP, args, "to_token")?;
        if from_token == to_token {
            return Err(failure(TOKEN_SWAP, "from_token and to_token must differ"));
        }

        let from_price = usd_price(&from_token).unwrap_or(0.0);
        let to_price = usd_price(&to_token).unwrap_or(1.0);
        let usd_value = amount * from_price;
        let realized_slippage_bps = (usd_value / USD_PER_IMPACT_BPS).ceil();

        if let Some(limit) = args.get("slippage_bps").and_then(Value::as_f64) {
            if realized_slippage_bps > limit {
                return Err(failure(
                    TOKEN_SWAP,
                    format!(
                        "price impact {} bps exceeds slippage limit {} bps",
                        realized_slippage_bps, limit
                    ),
                ));
            }
        }

        let fee_usd = usd_value * SWAP_FEE_BPS / 10_000.0;
        let haircut = 1.0 - (SWAP_FEE_BPS + realized_slippage_bps) / 10_000.0;
        let amount_out = round6(usd_value * haircut / to_price);

        self.ledger.debit(TOKEN_SWAP, &from_token, amount).await?;
        self.ledger.credit(&to_token, amount_out).await;

        Ok(ToolOutput::ok(json!({
            "status": "filled",
            "tx_hash": self.ledger.tx_hash(TOKEN_SWAP, args),
            "from_token": from_token,
            "to_token": to_token,
            "amount_in": amount,
            "amount_out": amount_out,
            "realized_slippage_bps": realized_slippage_bps,
            "cost": round6(fee_usd),
        })))
    }
}

//
// ================= Perpetuals =================
//

pub struct SimulatedOpenPosition {
    ledger: Arc<SimulatedLedger>,
}

#[async_trait::async_trait]
impl Tool for SimulatedOpenPosition {
    fn name(&self) -> &'static str {
        OPEN_LEVERAGED_POSITION
    }

    fn description(&self) -> &'static str {
        "Open a leveraged position against simulated marks"
    }

    async fn execute(&self, input: &ToolInput) -> Result<ToolOutput> {
        let args = &input.parameters;
        let asset = token_arg(OPEN_LEVERAGED_POSITION, args, "asset")?;
        let margin = required_f64(OPEN_LEVERAGED_POSITION, args, "amount")?;
        let leverage = required_f64(OPEN_LEVERAGED_POSITION, args, "leverage")?;
        let direction = required_str(OPEN_LEVERAGED_POSITION, args, "direction")?.to_lowercase();
        if direction != "long" && direction != "short" {
            return Err(failure(OPEN_LEVERAGED_POSITION, "direction must be long or short"));
        }
        let collateral = match args.get("collateral_token").and_then(Value::as_str) {
            Some(_) => token_arg(OPEN_LEVERAGED_POSITION, args, "collateral_token")?,
            None => "USDC".to_string(),
        };

        self.ledger
            .debit(OPEN_LEVERAGED_POSITION, &collateral, margin)
            .await?;

        let entry_price = usd_price(&asset).unwrap_or(0.0);
        let margin_usd = margin * usd_price(&collateral).unwrap_or(1.0);
        let tx_hash = self.ledger.tx_hash(OPEN_LEVERAGED_POSITION, args);

        Ok(ToolOutput::ok(json!({
            "status": "open",
            "position_id": format!("pos_{}", &tx_hash[2..14]),
            "tx_hash": tx_hash,
            "asset": asset,
            "direction": direction,
            "leverage": leverage,
            "entry_price": entry_price,
            "size": round6(margin_usd * leverage / entry_price),
            "margin": margin,
            "collateral_token": collateral,
            "cost": round6(margin_usd),
        })))
    }
}

pub struct SimulatedRiskOrder {
    ledger: Arc<SimulatedLedger>,
}

#[async_trait::async_trait]
impl Tool for SimulatedRiskOrder {
    fn name(&self) -> &'static str {
        PLACE_RISK_ORDER
    }

    fn description(&self) -> &'static str {
        "Attach a stop-loss or take-profit order to an open position"
    }

    async fn execute(&self, input: &ToolInput) -> Result<ToolOutput> {
        let args = &input.parameters;
        let position_id = required_str(PLACE_RISK_ORDER, args, "position_id")?;
        let order_type = required_str(PLACE_RISK_ORDER, args, "order_type")?;
        let trigger_price = required_f64(PLACE_RISK_ORDER, args, "trigger_price")?;
        let tx_hash = self.ledger.tx_hash(PLACE_RISK_ORDER, args);

        Ok(ToolOutput::ok(json!({
            "status": "resting",
            "order_id": format!("ord_{}", &tx_hash[2..14]),
            "position_id": position_id,
            "order_type": order_type,
            "trigger_price": trigger_price,
            "cost": 0.0,
        })))
    }
}

//
// ================= Read-only =================
//

pub struct SimulatedBalance {
    ledger: Arc<SimulatedLedger>,
}

#[async_trait::async_trait]
impl Tool for SimulatedBalance {
    fn name(&self) -> &'static str {
        CHECK_BALANCE
    }

    fn description(&self) -> &'static str {
        "Read simulated wallet balances"
    }

    async fn execute(&self, input: &ToolInput) -> Result<ToolOutput> {
        let balances = match input.parameters.get("token").and_then(Value::as_str) {
            Some(token) => {
                let token = token.to_uppercase();
                let amount = self.ledger.balance(&token).await;
                let mut single = serde_json::Map::new();
                single.insert(token, json!(amount));
                Value::Object(single)
            }
            None => {
                let all = self.ledger.balances.read().await;
                serde_json::to_value(&*all)?
            }
        };

        Ok(ToolOutput::ok(json!({
            "balances": balances,
            "cost": 0.0,
        })))
    }
}

pub struct SimulatedDiscovery;

#[async_trait::async_trait]
impl Tool for SimulatedDiscovery {
    fn name(&self) -> &'static str {
        DISCOVER_SERVICES
    }

    fn description(&self) -> &'static str {
        "List x402-payable services from a fixed catalog"
    }

    async fn execute(&self, input: &ToolInput) -> Result<ToolOutput> {
        let category = input
            .parameters
            .get("category")
            .and_then(Value::as_str)
            .map(str::to_lowercase);

        let services: Vec<Value> = SERVICE_CATALOG
            .iter()
            .filter(|(_, cat, _)| category.as_deref().map_or(true, |wanted| *cat == wanted))
            .map(|(name, cat, price)| {
                json!({
                    "name": name,
                    "category": cat,
                    "price_per_call": price,
                    "endpoint": format!("https://services.example/{}", name),
                })
            })
            .collect();

        Ok(ToolOutput::ok(json!({
            "count": services.len(),
            "services": services,
            "cost": 0.0,
        })))
    }
}

/// Registry of simulated tools sharing one wallet.
pub fn create_simulated_registry(ledger: Arc<SimulatedLedger>) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(SimulatedPayment {
        ledger: ledger.clone(),
    }));
    registry.register(Arc::new(SimulatedSwap {
        ledger: ledger.clone(),
    }));
    registry.register(Arc::new(SimulatedOpenPosition {
        ledger: ledger.clone(),
    }));
    registry.register(Arc::new(SimulatedRiskOrder {
        ledger: ledger.clone(),
    }));
    registry.register(Arc::new(SimulatedBalance { ledger }));
    registry.register(Arc::new(SimulatedDiscovery));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    fn input(tool: &str, parameters: Value) -> ToolInput {
        ToolInput {
            tool_name: tool.to_string(),
            parameters,
        }
    }

    #[tokio::test]
    async fn test_payment_debits_and_reports_cost() {
        let ledger = Arc::new(SimulatedLedger::new());
        let registry = create_simulated_registry(ledger.clone());
        let tool = registry.get(X402_PAYMENT).unwrap();

        let output = assert_ok!(
            tool.execute(&input(
                X402_PAYMENT,
                json!({"amount": 0.10, "token": "USDC", "recipient": "API service"})
            ))
            .await
        );

        assert!(output.success);
        assert!((output.cost() - 0.10).abs() < 1e-9);
        assert!(output.data["tx_hash"].as_str().unwrap().starts_with("0x"));
        assert!((ledger.balance("USDC").await - 999.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_tx_hashes_are_deterministic_per_sequence() {
        let args = json!({"amount": 1.0, "token": "USDC", "recipient": "bob"});
        let mut hashes = Vec::new();
        for _ in 0..2 {
            let registry = create_simulated_registry(Arc::new(SimulatedLedger::new()));
            let tool = registry.get(X402_PAYMENT).unwrap();
            let output = tool.execute(&input(X402_PAYMENT, args.clone())).await.unwrap();
            hashes.push(output.data["tx_hash"].clone());
        }
        assert_eq!(hashes[0], hashes[1]);
    }

    #[tokio::test]
    async fn test_payment_rejects_insufficient_funds() {
        let registry = create_simulated_registry(Arc::new(SimulatedLedger::with_balances([("USDC", 1.0)])));
        let tool = registry.get(X402_PAYMENT).unwrap();
        let err = tool
            .execute(&input(X402_PAYMENT, json!({"amount": 5, "token": "USDC", "recipient": "x"})))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::ToolExecution { .. }));
    }

    #[tokio::test]
    async fn test_swap_enforces_slippage_limit() {
        let ledger = Arc::new(SimulatedLedger::with_balances([("USDC", 1_000_000.0)]));
        let registry = create_simulated_registry(ledger.clone());
        let tool = registry.get(TOKEN_SWAP).unwrap();

        let small = tool
            .execute(&input(
                TOKEN_SWAP,
                json!({"amount": 100, "from_token": "USDC", "to_token": "CRO", "slippage_bps": 50}),
            ))
            .await
            .unwrap();
        assert!(small.data["amount_out"].as_f64().unwrap() > 990.0);
        assert!(ledger.balance("CRO").await > 990.0);

        let large = tool
            .execute(&input(
                TOKEN_SWAP,
                json!({"amount": 500000, "from_token": "USDC", "to_token": "ETH", "slippage_bps": 50}),
            ))
            .await;
        assert!(large.is_err());
    }

    #[tokio::test]
    async fn test_open_position_reports_entry_price() {
        let registry = create_simulated_registry(Arc::new(SimulatedLedger::new()));
        let tool = registry.get(OPEN_LEVERAGED_POSITION).unwrap();
        let output = tool
            .execute(&input(
                OPEN_LEVERAGED_POSITION,
                json!({"asset": "BTC", "direction": "long", "amount": 100, "leverage": 5, "collateral_token": "USDC"}),
            ))
            .await
            .unwrap();

        assert_eq!(output.data["entry_price"], json!(60_000.0));
        assert!(output.data["position_id"].as_str().unwrap().starts_with("pos_"));
        assert!((output.cost() - 100.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_discovery_filters_by_category() {
        let output = SimulatedDiscovery
            .execute(&input(DISCOVER_SERVICES, json!({"category": "weather"})))
            .await
            .unwrap();
        assert_eq!(output.data["count"], json!(2));
        assert_eq!(output.cost(), 0.0);
    }
}
