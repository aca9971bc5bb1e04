//! Rule graph automation server
//!
//! Usage: `rulegraph [CONFIG]` (defaults to `rulegraph.yaml`; a missing
//! file means default settings).

use anyhow::{Context, Result};
use rulegraph_config::EngineConfig;
use rulegraph_server::{start_server, RuleGraph};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG: &str = "rulegraph.yaml";

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG.to_string());
    let config = EngineConfig::load_or_default(&config_path)
        .with_context(|| format!("loading {config_path}"))?;

    // RUST_LOG wins over the configured filter
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.filter))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!("Starting rulegraph");

    let app = RuleGraph::from_config(&config)?;
    let restored = app.engine.restore().await?;
    app.engine.start().await;
    info!(rules = restored, "Automation engine running");

    let addr = config.bind_addr()?;
    let server = tokio::spawn(start_server(app.app_state(), addr));

    tokio::select! {
        result = server => match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("API server stopped: {}", e),
            Err(e) => warn!("API server task failed: {}", e),
        },
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Shutting down...");
        }
    }

    app.engine.stop();
    Ok(())
}
