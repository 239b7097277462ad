//! Tracing setup shared by the agent binary subcommands.

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "scanner_agent=info";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Log to stderr only. Used by the short-lived CLI subcommands.
pub fn init_stderr() {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(env_filter())
        .try_init();
}

/// Log to stderr and to a daily rolling `agent.log.YYYY-MM-DD` under `log_dir`.
///
/// The returned guard flushes the file writer on drop; hold it for the life
/// of the process.
///
/// # Errors
///
/// Returns an error if `log_dir` cannot be created.
pub fn init_with_file(log_dir: &Path) -> std::io::Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)?;
    let appender = tracing_appender::rolling::daily(log_dir, "agent.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let _ = tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(fmt::layer().with_ansi(false).with_writer(writer))
        .try_init();

    Ok(guard)
}
