// ABOUTME: CLI start command - run the supervised office process until interrupted

use super::OutputFormat;
use anyhow::{Context, Result};
use office_bridge::bridge::{BootstrapService, BridgeConfig};
use serde_json::json;
use tracing::info;

/// Start the office process, report its endpoint, and stop it on Ctrl-C
pub async fn execute(config: BridgeConfig, format: OutputFormat) -> Result<()> {
    let service = BootstrapService::new(config.service);
    let endpoint = service
        .start()
        .await
        .context("Failed to start office process")?;

    match format {
        OutputFormat::Text => {
            println!("Office process running at {endpoint}");
            println!("Connect with: {}", endpoint.accept_arg());
            println!("Press Ctrl-C to stop.");
        }
        OutputFormat::Json => {
            println!(
                "{}",
                json!({ "endpoint": endpoint.to_string(), "accept": endpoint.accept_arg() })
            );
        }
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    info!("Interrupt received, stopping office process");
    service.stop().await;
    Ok(())
}
