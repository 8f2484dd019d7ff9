//! Process-wide logging configuration.
//!
//! This module provides:
//! - `tracing` subscriber setup with console and daily-rolling file output
//! - Local timezone timestamps for logs
//! - The [`funnel`] through which pipeline stages report per-job outcomes

pub mod funnel;

pub use funnel::{LogFunnel, LogLevel, LogProducer, LogRecord, LogSink, MemorySink, TracingSink};

use chrono::Local;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::Writer, time::FormatTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::utils::fs;

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "wsus_bam=info,sqlx=warn,reqwest=warn";

/// Filter used when `--verbose` is given.
pub const VERBOSE_LOG_FILTER: &str = "wsus_bam=debug,sqlx=warn,reqwest=info";

/// Base name of the rolling log file.
pub const LOG_FILE_NAME: &str = "wsus-bam.log";

/// Custom timer that uses the local timezone via chrono.
#[derive(Debug, Clone, Copy)]
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = Local::now();
        write!(w, "{}", now.format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

/// Pick the filter directive: `RUST_LOG` wins, then the verbosity flag.
pub fn filter_directive(verbose: bool) -> String {
    match std::env::var("RUST_LOG") {
        Ok(directive) if !directive.trim().is_empty() => directive,
        _ if verbose => VERBOSE_LOG_FILTER.to_string(),
        _ => DEFAULT_LOG_FILTER.to_string(),
    }
}

/// Initialize console + file logging.
///
/// # Arguments
/// * `log_dir` - Directory for log files
/// * `verbose` - Enable debug-level diagnostics
///
/// # Returns
/// The appender's `WorkerGuard`; keep it alive for the process lifetime so
/// buffered lines are flushed on exit.
pub fn init_logging(log_dir: &Path, verbose: bool) -> crate::Result<WorkerGuard> {
    let log_path = PathBuf::from(log_dir);

    fs::ensure_dir_all_sync_with_op("creating log directory", &log_path)?;

    let file_appender = tracing_appender::rolling::daily(&log_path, LOG_FILE_NAME);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_new(filter_directive(verbose))
        .map_err(|e| crate::Error::config(format!("Invalid log filter directive: {}", e)))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_ansi(true)
                .with_target(verbose)
                .with_timer(LocalTimer),
        )
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_timer(LocalTimer),
        )
        .try_init()
        .map_err(|e| {
            crate::Error::Other(format!("Failed to set global default subscriber: {}", e))
        })?;

    Ok(guard)
}
