//! Tracing setup for the agent and its background jobs.
//!
//! `RUST_LOG` wins when set; otherwise the configured `mk_log_level`
//! applies. Output goes to stderr in compact format, or to `--log-file`
//! through a non-blocking writer whose guard the caller must hold.

use std::path::Path;

use anyhow::{Context, Result, anyhow};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the global subscriber.
///
/// # Example
/// ```bash
/// RUST_LOG=mk_agent=debug mk-agent run --config /tmp/mk_conf.toml
/// ```
pub fn init(default_level: &str, log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    match log_file {
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr).compact())
                .try_init()
                .context("install tracing subscriber")?;
            Ok(None)
        }
        Some(path) => {
            let dir = path
                .parent()
                .filter(|dir| !dir.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let name = path
                .file_name()
                .ok_or_else(|| anyhow!("log file path has no file name: {}", path.display()))?;
            std::fs::create_dir_all(dir).with_context(|| format!("create log dir {}", dir.display()))?;
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(writer).with_ansi(false).compact())
                .try_init()
                .context("install tracing subscriber")?;
            Ok(Some(guard))
        }
    }
}
