//! Start the gateway programmatically from the usual config search paths.
//!
//! Usage:
//!   export OPENAI_API_KEY=sk-...
//!   cargo run --example basic_gateway

use llm_gateway::{build_router, AppState, Gateway, GatewayConfig};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config = GatewayConfig::find_and_load(None)?;
    println!("Gates: {}", config.gates.len());
    for gate in &config.gates {
        println!("  {} -> {} ({})", gate.name, gate.model, gate.routing_strategy.as_str());
    }

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(300))
        .build()?;
    let (gateway, _ledger) = Gateway::from_config(&config, client)?;

    let port = config.port;
    let state = Arc::new(AppState {
        gateway,
        default_owner: config.default_owner.clone(),
    });

    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    println!("Listening on http://{}", addr);
    println!();
    println!("  curl localhost:{port}/v1/chat/completions \\");
    println!("    -d '{{\"model\":\"<gate name>\",\"messages\":[{{\"role\":\"user\",\"content\":\"hi\"}}]}}'");

    axum::serve(listener, build_router(state)).await?;
    Ok(())
}
