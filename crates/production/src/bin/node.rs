//! quorumstate local node
//!
//! Runs every member of one committee in this process, feeds the chain with
//! generated key-value requests and logs the chain status.
//!
//! # Usage
//!
//! ```bash
//! # Defaults: 4 nodes, threshold 3
//! quorumstate-node
//!
//! # With a configuration file, stopping after a minute
//! quorumstate-node --config node.toml --duration-secs 60
//! ```
//!
//! See `NodeConfig` for the configuration file format.

use anyhow::{Context, Result};
use clap::Parser;
use quorumstate_production::{KeyValueVm, LocalDevnet, NodeConfig};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// quorumstate local node
///
/// Runs a single-process committee over an in-memory ledger.
#[derive(Parser, Debug)]
#[command(name = "quorumstate-node")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (overridden by RUST_LOG)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Stop after this many seconds instead of waiting for a signal
    #[arg(long)]
    duration_secs: Option<u64>,

    /// Interval between status reports
    #[arg(long, default_value_t = 5)]
    report_secs: u64,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

async fn wait_for_stop(duration: Option<Duration>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let deadline = async {
        match duration {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
        _ = deadline => info!("Run duration elapsed"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let config = match &cli.config {
        Some(path) => NodeConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => {
            let config = NodeConfig::default();
            config.validate().context("Invalid default configuration")?;
            config
        }
    };

    info!(
        nodes = config.devnet.nodes,
        threshold = config.devnet.threshold,
        "quorumstate node starting..."
    );

    let devnet = Arc::new(
        LocalDevnet::start(
            &config,
            Arc::new(KeyValueVm),
            tokio::runtime::Handle::current(),
        )
        .context("Failed to start devnet")?,
    );
    info!(
        chain_id = %hex::encode(devnet.chain_id().as_bytes()),
        "Chain running"
    );

    let processed = Arc::new(AtomicU64::new(0));
    if let Some(mut rx) = devnet.subscribe_processed(0) {
        let processed = Arc::clone(&processed);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(_) => {
                        processed.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        processed.fetch_add(n, Ordering::Relaxed);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    let generator = (config.devnet.request_interval_ms > 0).then(|| {
        let devnet = Arc::clone(&devnet);
        let interval = Duration::from_millis(config.devnet.request_interval_ms);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut seq = 0u64;
            loop {
                ticker.tick().await;
                seq += 1;
                let request = KeyValueVm::set_request(
                    seq,
                    now_ms(),
                    &format!("key-{}", seq % 16),
                    seq.to_le_bytes().to_vec(),
                );
                devnet.submit(&request);
            }
        })
    });

    let reporter = {
        let devnet = Arc::clone(&devnet);
        let processed = Arc::clone(&processed);
        let period = Duration::from_secs(cli.report_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let Some(status) = devnet.status(0) else {
                    continue;
                };
                match serde_json::to_string(status.as_ref()) {
                    Ok(json) => info!(
                        processed = processed.load(Ordering::Relaxed),
                        status = %json,
                        "Chain status"
                    ),
                    Err(e) => warn!(error = %e, "Failed to serialize status"),
                }
            }
        })
    };

    info!("Node started, press Ctrl+C to stop");
    wait_for_stop(cli.duration_secs.map(Duration::from_secs)).await;

    if let Some(generator) = generator {
        generator.abort();
    }
    reporter.abort();

    info!("Initiating graceful shutdown...");
    let stopping = Arc::clone(&devnet);
    tokio::task::spawn_blocking(move || stopping.shutdown())
        .await
        .context("Shutdown task failed")?;
    info!(
        processed = processed.load(Ordering::Relaxed),
        "Shutdown complete"
    );
    Ok(())
}
