//! CSV event log: one row per event, mirrored to the console via
//! `tracing`. Verbosity gates both the CSV row and the "stats" in-band
//! detail line.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};

use super::csv_escape;
use crate::config::Verbosity;

/// Event severity: the four standard tiers plus an informal "stats" tier
/// used for the per-message proxy line, gated at the same threshold as
/// `Debug`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Error,
    Warn,
    Info,
    Debug,
    Stats,
}

impl Level {
    fn threshold(self) -> Verbosity {
        match self {
            Level::Error => 1,
            Level::Warn | Level::Info => 2,
            Level::Debug | Level::Stats => 3,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Level::Error => "error",
            Level::Warn => "warn",
            Level::Info => "info",
            Level::Debug => "debug",
            Level::Stats => "stats",
        }
    }
}

pub struct EventLog {
    file: Option<Mutex<File>>,
    path: Option<PathBuf>,
    server_name: String,
    verbosity: Verbosity,
}

impl EventLog {
    pub fn open(path: &Path, server_name: String, verbosity: Verbosity) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("unable to open log file {}", path.display()))?;
        Ok(Self {
            file: Some(Mutex::new(file)),
            path: Some(path.to_path_buf()),
            server_name,
            verbosity,
        })
    }

    /// A sink with no backing file, used in unit tests and wherever a
    /// collaborator needs an `EventLog` but the test doesn't care about
    /// its output.
    pub fn silent() -> Self {
        Self {
            file: None,
            path: None,
            server_name: String::new(),
            verbosity: 3,
        }
    }

    /// Record one event. Emits to `tracing` at the matching level always;
    /// writes the CSV row only when `level` is within the configured
    /// verbosity.
    pub fn log(&self, proto: &str, level: Level, remote_addr: &str, useragent: &str, message: &str) {
        match level {
            Level::Error => tracing::error!(proto, remote_addr, "{message}"),
            Level::Warn => tracing::warn!(proto, remote_addr, "{message}"),
            Level::Info => tracing::info!(proto, remote_addr, "{message}"),
            Level::Debug | Level::Stats => tracing::debug!(proto, remote_addr, "{message}"),
        }

        if level.threshold() > self.verbosity {
            return;
        }

        let Some(file) = &self.file else { return };

        let row = [
            chrono::Utc::now().to_rfc3339(),
            csv_escape(&self.server_name),
            level.as_str().to_string(),
            csv_escape(proto),
            csv_escape(remote_addr),
            csv_escape(useragent),
            csv_escape(message),
        ]
        .join(" , ");

        if let Ok(mut f) = file.lock() {
            let _ = writeln!(f, "{row}");
        }
    }

    /// Rotate the log file: close, rename to `<path>.YYYY-MM-DD` (yesterday,
    /// local time), reopen the base path for append, and optionally gzip
    /// the rotated file in the background.
    pub async fn rotate(&self, compress: bool) -> Result<()> {
        let Some(path) = &self.path else { return Ok(()) };
        let Some(file_lock) = &self.file else { return Ok(()) };

        let rotated = super::rotated_name(path);

        {
            let mut guard = file_lock.lock().unwrap();
            guard.sync_all().ok();
        }

        std::fs::rename(path, &rotated)
            .with_context(|| format!("failed to rename {} to {}", path.display(), rotated.display()))?;

        let new_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to reopen log file {}", path.display()))?;
        *file_lock.lock().unwrap() = new_file;

        if compress {
            tokio::spawn(super::gzip_and_remove(rotated));
        }

        Ok(())
    }
}
