// ABOUTME: Stand-in office process speaking the bridge protocol
//
// Accepts the same command line the supervisor builds for the real office
// binary, listens on the --accept= endpoint, and exits after a terminate call.

#![allow(missing_docs)]

use anyhow::{Context, Result};
use clap::Parser;
use office_bridge::bridge::stub::StubService;
use office_bridge::bridge::transport::PIPE_DIR_ENV;
use office_bridge::bridge::Endpoint;
use std::path::PathBuf;
use std::time::Duration;

/// Bridge protocol stub for testing without an office installation
#[derive(Parser, Debug)]
#[command(name = "office-bridge-stub")]
#[allow(dead_code, clippy::struct_excessive_bools)] // UI switches are accepted and ignored
#[command(author, version, about, long_about = None)]
struct Args {
    /// Endpoint to listen on, e.g. pipe,name=uno1;urp; or socket,host=localhost,port=8100;urp;
    #[arg(long)]
    accept: String,

    /// Wait this long before listening, to mimic a slow office start
    #[arg(long, default_value_t = 0)]
    listen_delay_ms: u64,

    /// Exit immediately with this code instead of listening
    #[arg(long)]
    exit_code: Option<i32>,

    #[arg(long, hide = true)]
    headless: bool,
    #[arg(long, hide = true)]
    nologo: bool,
    #[arg(long, hide = true)]
    nodefault: bool,
    #[arg(long, hide = true)]
    norestore: bool,
    #[arg(long, hide = true)]
    nocrashreport: bool,
    #[arg(long, hide = true)]
    nolockcheck: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stdout)
        .with_ansi(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "office_bridge=info,office_bridge_stub=info".into()),
        )
        .init();

    if let Some(code) = args.exit_code {
        tracing::warn!(code = code, "Exiting without listening");
        std::process::exit(code);
    }

    let pipe_dir = std::env::var_os(PIPE_DIR_ENV).map_or_else(std::env::temp_dir, PathBuf::from);
    let endpoint = Endpoint::parse_accept(&args.accept, &pipe_dir)
        .with_context(|| format!("Invalid --accept value '{}'", args.accept))?;

    StubService::new(endpoint, Duration::from_millis(args.listen_delay_ms))
        .serve()
        .await
        .context("Stub service failed")
}
