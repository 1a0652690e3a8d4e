//! Session logger: routes `tracing` output to a single file in the OS data
//! directory.
//!
//! The file is **truncated at each launch**, so it only ever holds the most
//! recent session. Filtering comes from `LAYERFORGE_LOG` when set (standard
//! `EnvFilter` syntax), otherwise from the configured level.
//!
//! Log location:
//!   Linux:    `~/.local/share/layerforge/layerforge.log`
//!   Windows:  `%APPDATA%\Layerforge\layerforge.log`
//!   macOS:    `~/Library/Application Support/Layerforge/layerforge.log`

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use crate::config;

pub const LOG_ENV: &str = "LAYERFORGE_LOG";

static LOG_PATH: OnceLock<PathBuf> = OnceLock::new();

/// Path of the current session log, once [`init`] succeeded in opening it.
pub fn log_path() -> Option<&'static PathBuf> {
    LOG_PATH.get()
}

fn log_file_path() -> PathBuf {
    config::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("layerforge.log")
}

fn open_truncated(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).write(true).truncate(true).open(path)
}

/// Filter from `LAYERFORGE_LOG`, falling back to `level`, then to `info`.
pub fn build_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber. Call once at startup.
///
/// * Creates (or truncates) the session log file. When the file cannot be
///   opened, output goes to stderr instead.
/// * With `echo_stderr`, output goes to stderr and no file is written; used
///   by the CLI's `--verbose`.
/// * Installs a panic hook that records the panic before running the
///   previous hook.
pub fn init(level: &str, echo_stderr: bool) {
    let filter = build_filter(level);
    let path = log_file_path();

    let writer = if echo_stderr {
        BoxMakeWriter::new(std::io::stderr)
    } else {
        match open_truncated(&path) {
            Ok(file) => {
                let _ = LOG_PATH.set(path.clone());
                BoxMakeWriter::new(Arc::new(file))
            }
            Err(e) => {
                eprintln!("[logger] Failed to open log file {}: {e}", path.display());
                BoxMakeWriter::new(std::io::stderr)
            }
        }
    };

    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(echo_stderr)
        .with_target(true)
        .try_init()
        .is_ok();
    if !installed {
        // Someone else already owns the global subscriber
        return;
    }

    info!(version = env!("CARGO_PKG_VERSION"), log = %path.display(), "session started");

    let prev = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic| {
        error!("PANIC: {panic}");
        prev(panic);
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_level_falls_back() {
        // Only meaningful when the env var is unset
        if std::env::var(LOG_ENV).is_err() {
            assert_eq!(build_filter("debug").to_string(), "debug");
            assert_eq!(build_filter("not a [valid filter").to_string(), "info");
        }
    }

    #[test]
    fn log_file_is_truncated() {
        let path = std::env::temp_dir()
            .join(format!("layerforge-log-{}", uuid::Uuid::new_v4()))
            .join("session.log");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "old session").unwrap();
        drop(open_truncated(&path).unwrap());
        assert_eq!(fs::read_to_string(&path).unwrap(), "");
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }
}
