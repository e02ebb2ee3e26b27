use command_agent_orchestrator::{
    agent::Orchestrator, api::start_server, config::OrchestratorConfig, hub::SessionEventHub,
};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = OrchestratorConfig::from_env()?;
    let port = config.port;

    info!("Command Agent Orchestrator - API Server");
    info!(
        port,
        approval_threshold = config.approval_threshold,
        tools = config.allowed_tools.len(),
        ledger = config.ledger_api_base_url.is_some(),
        postgres = config.database_url.is_some(),
        "Configuration loaded"
    );

    let orchestrator = Arc::new(Orchestrator::from_config(config)?);
    let hub = Arc::new(SessionEventHub::new(orchestrator));

    info!("Orchestrator initialized, starting API server");
    start_server(hub, port).await?;

    Ok(())
}
