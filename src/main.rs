// =============================================================================
// Candle Collector — Main Entry Point
// =============================================================================
//
// Streams trades and 1m klines for one symbol from Binance, enriches every
// closed kline with buyer/seller statistics, and writes the result to the
// configured sink.  `candle-collector health` inspects a running collector's
// output instead.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod collector;
mod config;
mod health;
mod logging;
mod market_data;
mod storage;
mod types;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::collector::Collector;
use crate::config::CollectorConfig;
use crate::market_data::CandleAggregator;

#[derive(Debug, Parser)]
#[command(name = "candle-collector", version, about = "Binance 1m candle collector")]
struct Cli {
    /// Optional JSON config file; environment variables override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Collect candles until interrupted (default).
    Run,
    /// Check that a collector is producing fresh data.
    Health {
        /// Data directory to inspect; defaults to the configured one.
        data_dir: Option<PathBuf>,
        /// Maximum age of the newest candle before it counts as stale.
        #[arg(long, default_value_t = 5)]
        max_age_minutes: i64,
        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },
}

fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();
    let cli = Cli::parse();
    let (config, ignored_env) = CollectorConfig::resolve(cli.config.as_deref())?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_collector(config, cli.config, ignored_env),
        Command::Health {
            data_dir,
            max_age_minutes,
            json,
        } => {
            for entry in &ignored_env {
                eprintln!("ignoring unparseable environment override {entry}");
            }
            let data_dir = data_dir.unwrap_or(config.data_dir);
            let report =
                health::run_health_check(&data_dir, chrono::Duration::minutes(max_age_minutes));
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", report.render());
            }
            std::process::exit(if report.healthy { 0 } else { 1 });
        }
    }
}

#[tokio::main]
async fn run_collector(
    config: CollectorConfig,
    config_file: Option<PathBuf>,
    ignored_env: Vec<String>,
) -> anyhow::Result<()> {
    // ── 2. Logging ───────────────────────────────────────────────────────
    let _log_guard = logging::init(config.log_directive(), &config.data_dir)?;

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Candle Collector — Starting Up                    ║");
    info!("╚══════════════════════════════════════════════════════════╝");
    for entry in &ignored_env {
        warn!(%entry, "ignoring unparseable environment override");
    }

    let aggregator = CandleAggregator::default();
    info!(
        config_file = ?config_file,
        symbol = %config.symbol,
        output = %config.output_format,
        data_dir = %config.data_dir.display(),
        retention_ms = aggregator.retention_ms(),
        "configuration resolved"
    );

    // ── 3. Sink + collector ──────────────────────────────────────────────
    let sink = storage::open_sink(config.output_format, &config.data_dir)?;
    let (collector, candles_rx) = Collector::new(&config.symbol, aggregator);
    let collector = Arc::new(collector);
    let stats = collector.stats_handle();

    let writer = tokio::spawn(collector::run_sink_writer(candles_rx, sink, stats.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── 4. Status loop ───────────────────────────────────────────────────
    let status = tokio::spawn(collector::run_status_loop(
        collector.clone(),
        Duration::from_secs(config.status_interval_secs),
        config.buffer_size,
        shutdown_rx.clone(),
    ));

    // ── 5. Market stream ─────────────────────────────────────────────────
    let stream_config = config.clone();
    let stream_collector = collector.clone();
    let mut stream = tokio::spawn(async move {
        market_data::stream::run_with_reconnect(&stream_config, stream_collector, shutdown_rx)
            .await
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 6. Shutdown ──────────────────────────────────────────────────────
    let outcome = tokio::select! {
        res = &mut stream => res,
        _ = shutdown_signal() => {
            warn!("Shutdown signal received — stopping gracefully");
            let _ = shutdown_tx.send(true);
            (&mut stream).await
        }
    };
    let _ = shutdown_tx.send(true);
    let _ = status.await;

    // Dropping the last collector handle closes the candle channel so the
    // writer drains what is queued and exits.
    drop(collector);
    if let Err(e) = writer.await {
        error!(error = %e, "sink writer task failed");
    }

    let final_stats = stats.snapshot();
    info!(
        trades = final_stats.trades_recorded,
        candles = final_stats.candles_emitted,
        persisted = final_stats.candles_persisted,
        failures = final_stats.persist_failures,
        "Candle Collector shut down complete."
    );

    match outcome {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            error!(error = %e, "market stream gave up");
            Err(e)
        }
        Err(e) => Err(anyhow::anyhow!("market stream task failed: {e}")),
    }
}

/// Resolves on Ctrl+C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
