//! Elastic Node - self-sizing worker pools on a single node
//!
//! Hosts the configured services, resizes their pools every control period
//! and serves health, metrics and history over HTTP.

use anyhow::Result;
use node_lib::{NodeFacade, TracingSink};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const NODE_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!(version = NODE_VERSION, "Starting elastic-node");

    let config = config::NodeConfig::load()?;
    info!(
        node_id = %config.node_id,
        services = config.services.len(),
        "Node configured"
    );

    let node = Arc::new(NodeFacade::new(config.settings())?);
    node.set_verbose(config.verbose);
    node.add_sink(Arc::new(TracingSink)).await;
    if let Some(path) = &config.log_file {
        node.log_to_file(path).await?;
        info!(path = %path.display(), "Writing allocation log");
    }

    for service in config.services() {
        node.add_service(service).await?;
    }
    node.start().await?;

    let app_state = Arc::new(api::AppState::new(node.clone()));
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("SIGINT received, shutting down");
        }
        result = api_handle => {
            match result {
                Ok(Err(e)) => warn!(error = %e, "API server failed, shutting down"),
                Err(e) => warn!(error = %e, "API server task ended, shutting down"),
                Ok(Ok(())) => {}
            }
        }
    }

    node.stop().await;
    Ok(())
}
