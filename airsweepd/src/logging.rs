//! Logging setup: console output, optional daily-rotated file output, and a
//! bridge routing `log` macros into tracing.

use std::fs;
use std::io;
use std::path::Path;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize the logging system.
///
/// Console output is always enabled. When `log_dir` is given, a daily-rotated
/// file appender is added and files older than `retention_days` are removed.
/// `verbose` forces debug level; otherwise `level` (from the configuration
/// file) applies, with `RUST_LOG` taking precedence over both.
pub fn init(
    log_dir: Option<&Path>,
    retention_days: u64,
    verbose: bool,
    level: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let default_level = if verbose {
        "debug".to_string()
    } else {
        level.unwrap_or("info").to_string()
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let file_layer = match log_dir {
        None => None,
        Some(log_dir) => {
            fs::create_dir_all(log_dir)?;
            clean_old_logs(log_dir, retention_days)?;

            let appender = tracing_appender::rolling::daily(log_dir, "airsweepd.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            // The guard must outlive the process for buffered lines to flush.
            Box::leak(Box::new(guard));

            Some(
                fmt::layer()
                    .with_writer(writer)
                    .with_target(true)
                    .with_ansi(false),
            )
        }
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(io::stdout)
                .with_target(true)
                .with_level(true),
        )
        .with(file_layer)
        .try_init()?;

    // try_init already installs the log bridge when tracing-subscriber is
    // built with its tracing-log feature; a second install is redundant.
    let _ = tracing_log::LogTracer::init();
    Ok(())
}

/// Remove log files older than the retention window.
fn clean_old_logs(log_dir: &Path, retention_days: u64) -> io::Result<()> {
    let cutoff = std::time::SystemTime::now()
        - std::time::Duration::from_secs(retention_days * 24 * 60 * 60);

    for entry in fs::read_dir(log_dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with("airsweepd.log"))
        {
            continue;
        }
        if let Ok(modified) = entry.metadata().and_then(|m| m.modified()) {
            if modified < cutoff {
                let _ = fs::remove_file(&path);
            }
        }
    }
    Ok(())
}
