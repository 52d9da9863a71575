// ABOUTME: CLI probe command - connect directly to an office endpoint and resolve its loader

use super::{OutputFormat, ProbeArgs};
use anyhow::{Context, Result};
use office_bridge::bridge::transport::{DEFAULT_HOST, DEFAULT_PORT};
use office_bridge::bridge::{BridgeConnection, Connection, Endpoint};
use serde::Serialize;
use std::time::Instant;

/// Outcome of a single probe
#[derive(Debug, Serialize)]
pub struct ProbeReport {
    pub endpoint: String,
    pub loader: String,
    pub elapsed_ms: u128,
}

/// Build the endpoint named on the command line
pub fn endpoint_from_args(args: &ProbeArgs) -> Endpoint {
    match &args.pipe {
        Some(name) => Endpoint::Pipe {
            name: name.clone(),
            dir: args.pipe_dir.clone().unwrap_or_else(std::env::temp_dir),
        },
        None => Endpoint::Socket {
            host: args.host.clone().unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: args.port.unwrap_or(DEFAULT_PORT),
        },
    }
}

pub async fn execute(args: ProbeArgs, format: OutputFormat) -> Result<()> {
    let endpoint = endpoint_from_args(&args);
    let started = Instant::now();

    let connection = BridgeConnection::open(&endpoint)
        .await
        .with_context(|| format!("Failed to connect to {endpoint}"))?;
    let loader = connection
        .loader()
        .await
        .context("Endpoint did not hand out a loader")?;
    connection.close().await.context("Failed to close connection")?;

    let report = ProbeReport {
        endpoint: endpoint.to_string(),
        loader: loader.reference.object,
        elapsed_ms: started.elapsed().as_millis(),
    };

    match format {
        OutputFormat::Text => println!(
            "{} is responsive (loader {}, {} ms)",
            report.endpoint, report.loader, report.elapsed_ms
        ),
        OutputFormat::Json => println!("{}", serde_json::to_string(&report)?),
    }
    Ok(())
}
