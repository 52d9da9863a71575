// ABOUTME: CLI argument parsing and command routing for office-bridge
//
// Provides command-line interface for:
// - Running a supervised office process until interrupted (start)
// - Probing an already running office endpoint (probe)
// - Exercising a bootstrapping pool end to end (check)

pub mod check;
pub mod probe;
pub mod start;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use office_bridge::bridge::BridgeConfig;
use std::path::{Path, PathBuf};

/// Pooled, supervised connections to a headless office service
#[derive(Parser)]
#[command(name = "office-bridge")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (default: ./.office-bridge/config.toml, then ~/.office-bridge/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Also write JSON-lines logs into this directory
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,
}

/// Output format for commands
#[derive(Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Start the office process and keep it running until Ctrl-C
    Start,

    /// Connect to a running endpoint and check that it answers
    Probe(ProbeArgs),

    /// Lease connections from a bootstrapping pool and probe each one
    Check(CheckArgs),
}

/// Arguments for the probe command
#[derive(clap::Args)]
pub struct ProbeArgs {
    /// Pipe name to connect to
    #[arg(long, conflicts_with_all = ["host", "port"])]
    pub pipe: Option<String>,

    /// Directory holding pipe sockets (default: system temp dir)
    #[arg(long, requires = "pipe")]
    pub pipe_dir: Option<PathBuf>,

    /// Socket host
    #[arg(long)]
    pub host: Option<String>,

    /// Socket port
    #[arg(long)]
    pub port: Option<u16>,
}

/// Arguments for the check command
#[derive(clap::Args)]
pub struct CheckArgs {
    /// Number of sequential leases
    #[arg(long, default_value_t = 3)]
    pub leases: usize,

    /// Stop the office process whenever a connection is destroyed
    #[arg(long)]
    pub restarting: bool,
}

/// Load configuration from an explicit path or the default search path
pub fn load_config(path: Option<&Path>) -> Result<BridgeConfig> {
    match path {
        Some(path) => BridgeConfig::load_from(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => BridgeConfig::load().context("Failed to load config"),
    }
}
