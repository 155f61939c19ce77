//! Conductor Binary
//!
//! Runs the orchestration server with configuration from
//! `config/conductor.toml` (or `CONDUCTOR_CONFIG_PATH`) and
//! `CONDUCTOR__*` environment overrides.

use anyhow::Context;
use std::sync::Arc;
use tokio::signal;
use tracing::info;

use conductor_core::config::ConfigManager;
use conductor_core::execution::OrchestrationServer;
use conductor_core::logging::init_structured_logging;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_structured_logging();

    let manager = ConfigManager::load().context("failed to load conductor configuration")?;
    let server = OrchestrationServer::new(Arc::new(manager.config().clone()));

    let address = server
        .start()
        .await
        .context("failed to start orchestration server")?;
    info!(address = %address, "Conductor ready for agent connections");

    signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("Shutdown signal received");

    server.dispose().await?;
    info!("Conductor stopped");
    Ok(())
}
