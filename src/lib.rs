//! Tether - keeps one game automation agent connected to one server
//!
//! Owns the connection resource for a chat-operated bot: connect and
//! disconnect, involuntary-loss recovery with bounded backoff, durable
//! scheduled connections and resume after a process restart.

pub mod client;
pub mod commands;
pub mod config;
pub mod router;
pub mod runtime;
pub mod schedule;
pub mod servers;
pub mod session;

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use runtime::Tether;

/// Per-process log file under `logs/YYYY/MM/DD/`
fn open_log_file(data_dir: &Path) -> Option<(File, PathBuf)> {
    let now = chrono::Local::now();
    let dir = config::log_dir(data_dir).join(now.format("%Y/%m/%d").to_string());
    fs::create_dir_all(&dir).ok()?;

    let path = dir.join(format!("{}.log", now.format("%Y-%m-%d_%H-%M-%S")));
    let file = File::options().create(true).append(true).open(&path).ok()?;
    Some((file, path))
}

/// Initialize logging
///
/// Always logs to stderr; with a data directory, also to a plain-text file
/// there. Returns the log file path when one was opened.
pub fn init_logging(file_dir: Option<&Path>) -> Option<PathBuf> {
    let (file_layer, path) = match file_dir.and_then(open_log_file) {
        Some((file, path)) => (
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            ),
            Some(path),
        ),
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    path
}
