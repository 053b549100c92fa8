//! Logging setup.
//!
//! CLI modes log to stderr (default `warn`). The TUI owns the terminal, so
//! there logs go to `<data dir>/liveness-cli/logs/liveness-cli.log` (default
//! `info`), cleared at session start. `RUST_LOG` overrides either default.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const LOG_FILE: &str = "liveness-cli.log";

fn env_filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Install the global subscriber. Returns the log file path in file mode.
pub fn init(to_file: bool) -> io::Result<Option<PathBuf>> {
    if !to_file {
        tracing_subscriber::registry()
            .with(env_filter("warn"))
            .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
            .try_init()
            .ok();
        return Ok(None);
    }

    let dir = crate::storage::log_dir()
        .map_err(|e| io::Error::new(io::ErrorKind::NotFound, e.to_string()))?;
    fs::create_dir_all(&dir)?;
    let path = dir.join(LOG_FILE);
    let file = fs::File::create(&path)?;

    tracing_subscriber::registry()
        .with(env_filter("info"))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(Mutex::new(file))
                .with_ansi(false),
        )
        .try_init()
        .ok();
    Ok(Some(path))
}
