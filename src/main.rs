// ABOUTME: Main entry point for office-bridge
//
// Binary: office-bridge
// Usage: office-bridge [--config FILE] [--format text|json] <COMMAND>
// - start: boot the office process and keep it up until Ctrl-C
// - probe: check an already running endpoint
// - check: lease connections from a bootstrapping pool

#![allow(missing_docs)]

use anyhow::Result;
use clap::Parser;
use std::path::Path;

mod cli;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    setup_logging(args.log_dir.as_deref())?;
    setup_panic_handler();

    match args.command {
        cli::Commands::Start => {
            let config = cli::load_config(args.config.as_deref())?;
            cli::start::execute(config, args.format).await
        }
        cli::Commands::Probe(probe_args) => cli::probe::execute(probe_args, args.format).await,
        cli::Commands::Check(check_args) => {
            let config = cli::load_config(args.config.as_deref())?;
            cli::check::execute(config, check_args, args.format).await
        }
    }
}

/// Human-readable logs on stderr, plus JSON lines in `log_dir` when given
fn setup_logging(log_dir: Option<&Path>) -> Result<()> {
    use anyhow::Context;
    use std::fs::OpenOptions;
    use std::sync::Mutex;
    use tracing_subscriber::prelude::*;

    let file_layer = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;

            // JSONL log file with timestamp
            let log_file = dir.join(format!(
                "office-bridge-{}.jsonl",
                chrono::Local::now().format("%Y%m%d-%H%M%S")
            ));
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_file)
                .with_context(|| format!("Failed to create log file {}", log_file.display()))?;

            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_writer(Mutex::new(file))
                    .with_ansi(false),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "office_bridge=info".into()),
        )
        .init();
    Ok(())
}

fn setup_panic_handler() {
    use tracing::error;

    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        error!("Application panicked: {}", panic_info);
        default_hook(panic_info);
    }));
}
