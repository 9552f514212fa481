//! Cashier background worker
//!
//! Runs the periodic jobs: bonus expiry and dispatch of approved withdrawals.

use cashier::config::ConfigLoader;
use cashier::services::CashierBuilder;
use cashier::storage::Storage;
use cashier::withdrawal::SimulatedPayoutGateway;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "cashier-worker")]
#[command(about = "Bonus expiry and withdrawal dispatch worker", long_about = None)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(long)]
    config: Option<String>,

    /// Database directory (overrides the configuration)
    #[arg(long)]
    db_path: Option<String>,

    /// Seconds between job runs (defaults to the bonus expiry sweep interval)
    #[arg(long)]
    interval_secs: Option<u64>,

    /// Simulated gateway latency in milliseconds
    #[arg(long, default_value = "100")]
    gateway_delay_ms: u64,

    /// Run each job once and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut loader = ConfigLoader::new();
    if let Some(path) = &args.config {
        loader = loader.with_path(path);
    }
    let mut config = loader.load()?;
    if let Some(db_path) = args.db_path {
        config.storage.data_directory = db_path;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.monitoring.log_level.as_filter())),
        )
        .init();

    info!(data_directory = %config.storage.data_directory, "Opening cashier database");
    let storage = Storage::open_with_config(&config.storage.data_directory, &config.storage)?;

    let interval = Duration::from_secs(
        args.interval_secs
            .unwrap_or(config.bonus.expiry_sweep_interval_secs)
            .max(1),
    );
    let enable_metrics = config.monitoring.enable_metrics;
    let cashier = CashierBuilder::new(config)
        .with_gateway(Arc::new(SimulatedPayoutGateway::new(Duration::from_millis(
            args.gateway_delay_ms,
        ))))
        .build(storage)?;

    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                break;
            }
        }

        match cashier.lifecycle.expire_bonuses() {
            Ok(summary) => info!(
                scanned = summary.scanned,
                expired = summary.expired,
                failed = summary.failed,
                "Bonus expiry sweep finished"
            ),
            Err(e) => error!(error = %e, "Bonus expiry sweep failed"),
        }

        match cashier.withdrawals.process_pending_withdrawals().await {
            Ok(summary) => info!(
                attempted = summary.attempted,
                completed = summary.completed,
                failed = summary.failed,
                "Withdrawal dispatch finished"
            ),
            Err(e) => error!(error = %e, "Withdrawal dispatch failed"),
        }

        if args.once {
            break;
        }
    }

    if enable_metrics {
        println!("{}", cashier.metrics.render());
    }
    Ok(())
}
