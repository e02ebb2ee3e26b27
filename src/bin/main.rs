use command_agent_orchestrator::{
    agent::Orchestrator,
    config::OrchestratorConfig,
    events::{AgentEvent, EventSink},
    models::{ApprovalDecision, CommandRequest},
};
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_COMMAND: &str = "swap 10 CRO for USDC then pay 5 USDC to API service";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = OrchestratorConfig::from_env()?;
    let orchestrator = Arc::new(Orchestrator::from_config(config)?);

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = if args.is_empty() {
        DEFAULT_COMMAND.to_string()
    } else {
        args.join(" ")
    };

    info!(command = %command, "Running orchestrator");

    let (tx, mut events) = mpsc::unbounded_channel();
    let runner = orchestrator.clone();
    let task = tokio::spawn(async move {
        runner
            .run(CommandRequest::new(command), EventSink::new(tx), CancellationToken::new())
            .await
    });

    // Stream ends when the run drops its sink.
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    while let Some(event) = events.recv().await {
        match event {
            AgentEvent::Thinking { message, .. } => println!("  .. {}", message),
            AgentEvent::ToolCall { tool_name, .. } => println!("  -> {}", tool_name),
            AgentEvent::ApprovalRequired {
                request_id,
                tool_name,
                tool_args,
                description,
                ..
            } => {
                println!("\nApproval required: {} ({})", description, tool_name);
                println!("  args: {}", tool_args);
                print!("Approve? [y/N] ");
                std::io::stdout().flush()?;

                let answer = stdin.next_line().await?.unwrap_or_default();
                let decision = match answer.trim().to_ascii_lowercase().as_str() {
                    "y" | "yes" => ApprovalDecision::Approved,
                    _ => ApprovalDecision::Rejected,
                };
                orchestrator.approvals().resolve(request_id, decision, None).await?;
            }
            _ => {}
        }
    }

    let result = task.await?;

    println!("\n=== COMMAND RESULT ===");
    println!("Execution ID: {}", result.execution_id);
    println!("Session ID:   {}", result.session_id);
    println!("Intent:       {} ({:.2})", result.intent, result.confidence);
    println!("Status:       {:?}", result.status);
    println!("Total cost:   {}", result.total_cost);
    if let Some(plan) = &result.plan {
        println!("\nPlan: {}", plan.approach);
        for step in &plan.steps {
            println!("  {}: {} [{:?}]", step.id, step.description, step.status);
        }
    }
    for call in &result.tool_calls {
        println!("  tool {} -> {}", call.tool_name, call.result);
    }
    if let Some(error) = &result.error {
        eprintln!("\nCommand failed: {}", error);
        for suggestion in &result.suggestions {
            eprintln!("  try: {}", suggestion);
        }
        std::process::exit(1);
    }

    println!("\n{}", serde_json::to_string_pretty(&result.result)?);
    Ok(())
}
