//! Tracing subscriber setup shared by the supervisor and its workers.

use anyhow::{Context, Result, anyhow};
use std::{fs, path::Path, sync::Mutex};
use tracing_subscriber::EnvFilter;

/// Install the global subscriber.
///
/// Without a log directory events go to stderr. With one, each process
/// appends to `<log_dir>/<role>.log` so concurrent workers never share a file.
/// `RUST_LOG` overrides the default `info` level.
pub fn init(log_dir: Option<&Path>, role: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match log_dir {
        Some(dir) => {
            fs::create_dir_all(dir)
                .with_context(|| format!("creating log directory {}", dir.display()))?;
            let path = dir.join(format!("{}.log", role));
            let file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init()
        }
        None => builder.with_writer(std::io::stderr).try_init(),
    }
    .map_err(|err| anyhow!("installing tracing subscriber: {}", err))
}
