// ABOUTME: CLI check command - drive a bootstrapping pool through a few leases
//
// Starts the office process through the pool's factory, leases connections one
// after another, probes each, then shuts the pool and the process down.

use super::{CheckArgs, OutputFormat};
use anyhow::{Context, Result};
use office_bridge::bridge::metrics::MetricsSnapshot;
use office_bridge::bridge::{
    BootstrapFactory, BootstrapService, BridgeConfig, Connection, ConnectionFactory,
    ConnectionPool, PoolStats,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// Result of one lease
#[derive(Debug, Serialize)]
pub struct LeaseReport {
    pub lease: usize,
    pub connection_id: Option<u64>,
    pub uses: u32,
    pub loader: String,
}

#[derive(Debug, Serialize)]
struct CheckReport {
    leases: Vec<LeaseReport>,
    stats: PoolStats,
    metrics: MetricsSnapshot,
}

pub async fn execute(config: BridgeConfig, args: CheckArgs, format: OutputFormat) -> Result<()> {
    let service = Arc::new(BootstrapService::new(config.service.clone()));
    let factory: Arc<dyn ConnectionFactory> =
        if args.restarting || config.pool.restart_on_destroy {
            Arc::new(BootstrapFactory::restarting(Arc::clone(&service)))
        } else {
            Arc::new(BootstrapFactory::new(Arc::clone(&service)))
        };
    let pool = ConnectionPool::with_settings(&config.pool, factory);

    let result = run_leases(&pool, args.leases).await;

    let stats = pool.stats();
    pool.shutdown().await;
    service.stop().await;

    let report = CheckReport {
        leases: result?,
        stats,
        metrics: pool.metrics().snapshot(),
    };

    match format {
        OutputFormat::Text => {
            for lease in &report.leases {
                println!(
                    "lease {}: connection {} (use {}) loader {}",
                    lease.lease,
                    lease
                        .connection_id
                        .map_or_else(|| "-".to_string(), |id| id.to_string()),
                    lease.uses,
                    lease.loader
                );
            }
            println!(
                "created {} destroyed {} recycled {} probe failures {}",
                report.metrics.created,
                report.metrics.destroyed,
                report.metrics.recycled,
                report.metrics.probe_failures
            );
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
    }
    Ok(())
}

async fn run_leases(pool: &Arc<ConnectionPool>, leases: usize) -> Result<Vec<LeaseReport>> {
    let mut reports = Vec::with_capacity(leases);
    for lease in 1..=leases {
        let handle = pool
            .get_connection()
            .await
            .with_context(|| format!("Lease {lease} failed"))?;
        let loader = handle
            .loader()
            .await
            .with_context(|| format!("Loader probe failed on lease {lease}"))?;

        info!(lease = lease, id = ?handle.id(), uses = handle.uses(), "Leased connection");
        reports.push(LeaseReport {
            lease,
            connection_id: handle.id(),
            uses: handle.uses(),
            loader: loader.reference.object,
        });
        handle.close().await?;
    }
    Ok(reports)
}
