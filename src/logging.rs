//! Tracing setup for the `conductor` binary.
//!
//! Human-readable events go to stderr. When a log directory is given, the same
//! events are also written as JSON lines to `conductor.log` in that directory.

use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_FILE_NAME: &str = "conductor.log";

/// Filter used when `RUST_LOG` is unset.
pub fn default_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("conductor=debug,info")
        } else {
            EnvFilter::new("conductor=info,warn")
        }
    })
}

/// Install the global subscriber.
///
/// The returned guard flushes the file writer on drop; hold it for the life of
/// the process.
pub fn init(verbose: bool, log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact();

    let Some(dir) = log_dir else {
        tracing_subscriber::registry()
            .with(default_filter(verbose))
            .with(stderr_layer)
            .try_init()
            .context("Failed to install tracing subscriber")?;
        return Ok(None);
    };

    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
    let appender = tracing_appender::rolling::never(dir, LOG_FILE_NAME);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(default_filter(verbose))
        .with(stderr_layer)
        .with(fmt::layer().json().with_writer(writer).with_current_span(false))
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(Some(guard))
}
