//! Gateway binary entry point

use anyhow::Context;

use mcp_gateway::api::build_router;
use mcp_gateway::config::Config;
use mcp_gateway::observability::init_tracing;
use mcp_gateway::server::Server;
use mcp_gateway::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load().context("Failed to load configuration")?;

    init_tracing(&config).context("Failed to initialize tracing")?;

    tracing::info!(
        service = %config.service.name,
        environment = %config.service.environment,
        "Starting MCP registry gateway"
    );

    let state = AppState::initialize(config.clone())
        .await
        .context("Failed to initialize application state")?;

    let app = build_router(state.clone());

    Server::new(config)
        .serve(app, state)
        .await
        .context("Server error")?;

    Ok(())
}
