//! airsweepd: airborne RF surveillance collector.
//!
//! Drives one or more SDR sweeper subprocesses across their configured
//! bands, correlates sweeps with drone telemetry and persists the spectrum
//! to a per-flight SQLite database.

mod config;
mod logging;
mod orchestrator;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use clap::Parser;
use log::{error, info, warn};
use tokio::sync::broadcast;

use airsweep_core::storage::Store;

use config::Config;
use orchestrator::Orchestrator;

/// airsweepd - airborne RF surveillance collector
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short = 'f', long, default_value = "airsweep.yaml")]
    config: PathBuf,

    /// Override the data directory from the configuration file
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Directory where log files are stored (console-only when omitted)
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Number of days to keep log files
    #[arg(long, default_value = "7")]
    log_retention_days: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = Config::load(&args.config)?;
    logging::init(
        args.log_dir.as_deref(),
        args.log_retention_days,
        args.verbose,
        Some(&config.settings.log_level),
    )?;

    let data_dir = args
        .data_dir
        .unwrap_or_else(|| PathBuf::from(&config.storage.data_directory));
    let db_path = session_db_path(&data_dir)?;
    info!("writing flight data to {:?}", db_path);

    let store = Arc::new(Store::new(db_path));
    let mut orchestrator = Orchestrator::new(store.clone());

    // The serial/MAVLink telemetry feed is wired up by the deployment; a
    // build without one records sweeps unlinked.
    if config.telemetry.as_ref().is_some_and(|t| t.enabled) {
        warn!("telemetry feed configured but no provider is built in; sweeps will be stored without telemetry");
    }

    for device in &config.devices {
        orchestrator.create_device(device)?;
    }

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            let _ = shutdown_tx.send(());
        }
    });

    let result = orchestrator.run(shutdown_rx).await;

    if let Err(err) = store.close() {
        error!("closing store: {err}");
    }

    result?;
    info!("collection finished");
    Ok(())
}

/// Per-flight database file inside the data directory. The directory must
/// already exist; creating it is a deployment concern.
fn session_db_path(data_dir: &Path) -> Result<PathBuf, std::io::Error> {
    let metadata = std::fs::metadata(data_dir).map_err(|err| {
        std::io::Error::new(
            err.kind(),
            format!("storage directory {data_dir:?}: {err}"),
        )
    })?;
    if !metadata.is_dir() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("storage path {data_dir:?} is not a directory"),
        ));
    }

    let stamp = Utc::now().format("%Y%m%d_%H%M%S");
    Ok(data_dir.join(format!("sdr_session_{stamp}.sqlite")))
}
