//! Tracing subscriber setup for the binary.

use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

use crate::config::LogFormat;

pub const LOG_FILE_PREFIX: &str = "runweave.log";

/// `RUST_LOG` if set, otherwise `info` (`debug` when verbose).
pub fn env_filter(verbose: bool) -> EnvFilter {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy()
}

/// Install the global subscriber: stderr in `format`, plus JSON lines in a
/// daily-rolling file under `log_dir` when given. Keep the returned guard
/// alive until exit so buffered file output is flushed.
pub fn init(format: LogFormat, verbose: bool, log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    layers.push(match format {
        LogFormat::Pretty => fmt::layer().with_writer(std::io::stderr).boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_writer(std::io::stderr)
            .boxed(),
    });

    let guard = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            layers.push(
                fmt::layer()
                    .json()
                    .with_ansi(false)
                    .with_writer(writer)
                    .boxed(),
            );
            Some(guard)
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(layers)
        .with(env_filter(verbose))
        .try_init()
        .context("Failed to install tracing subscriber")?;
    Ok(guard)
}
