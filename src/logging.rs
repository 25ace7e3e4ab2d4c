//! Tracing setup for agentmesh processes.
//!
//! A node logs to two places at once:
//! - `agentmesh.log.<date>` in the log directory, rolled daily, plain text
//!   with thread ids and source locations for post-mortems across nodes;
//! - stderr, colored, for whoever is watching the node.
//!
//! `RUST_LOG` replaces [`DEFAULT_FILTER`]. [`LOG_DIR_ENV`] replaces the
//! per-user data directory so several nodes on one host can log apart.

use anyhow::Result;
use std::ffi::OsString;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Runtime internals at debug, dependencies at info.
pub const DEFAULT_FILTER: &str = "info,agentmesh=debug";

/// Environment variable naming the log directory.
pub const LOG_DIR_ENV: &str = "AGENTMESH_LOG_DIR";

const LOG_FILE_PREFIX: &str = "agentmesh.log";

/// Install the global subscriber. Keep the guard alive for the life of the
/// process or buffered file output is lost.
pub fn init() -> Result<(WorkerGuard, PathBuf)> {
    let log_dir = resolve_log_dir(std::env::var_os(LOG_DIR_ENV))?;
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .with_target(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_dir = %log_dir.display(),
        "agentmesh logging initialized"
    );

    Ok((guard, log_dir))
}

/// A non-empty override wins, otherwise `logs` under the data directory.
fn resolve_log_dir(override_dir: Option<OsString>) -> Result<PathBuf> {
    if let Some(dir) = override_dir.filter(|dir| !dir.is_empty()) {
        return Ok(PathBuf::from(dir));
    }
    let dirs = directories::ProjectDirs::from("com", "agentmesh", "agentmesh")
        .ok_or_else(|| anyhow::anyhow!("Could not determine a data directory for logs"))?;
    Ok(dirs.data_dir().join("logs"))
}

/// Console-only subscriber for tests. Safe to call from several tests; only
/// the first call installs it.
#[cfg(test)]
pub fn init_test() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init();
}
