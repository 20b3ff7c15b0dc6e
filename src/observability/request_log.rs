//! Per-query request log: one hex-encoded CSV row per proxied message,
//! enabled only when `requests_log_path` is configured.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};

use super::csv_escape;

pub struct RequestLog {
    file: Mutex<File>,
    path: PathBuf,
    server_name: String,
}

impl RequestLog {
    pub fn open(path: &Path, server_name: String) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("unable to open requests log file {}", path.display()))?;
        Ok(Self {
            file: Mutex::new(file),
            path: path.to_path_buf(),
            server_name,
        })
    }

    /// Record one query/reply pair. `query` and `reply` already carry
    /// their 2-byte length prefixes.
    pub fn record(&self, proto: &str, remote_addr: &str, query: &[u8], reply: &[u8]) {
        let row = [
            chrono::Utc::now().to_rfc3339(),
            csv_escape(&self.server_name),
            csv_escape(proto),
            csv_escape(remote_addr),
            hex::encode(query),
            hex::encode(reply),
        ]
        .join(" , ");

        if let Ok(mut f) = self.file.lock() {
            let _ = writeln!(f, "{row}");
        }
    }

    /// Rotate the log file using the same scheme as the event log.
    pub async fn rotate(&self, compress: bool) -> Result<()> {
        let rotated = super::rotated_name(&self.path);

        {
            let mut guard = self.file.lock().unwrap();
            guard.sync_all().ok();
        }

        std::fs::rename(&self.path, &rotated).with_context(|| {
            format!("failed to rename {} to {}", self.path.display(), rotated.display())
        })?;

        let new_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to reopen requests log file {}", self.path.display()))?;
        *self.file.lock().unwrap() = new_file;

        if compress {
            tokio::spawn(super::gzip_and_remove(rotated));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn records_hex_encoded_query_and_reply() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("requests.log");
        let log = RequestLog::open(&path, "test-server".to_string()).unwrap();

        log.record("tls", "192.0.2.7:1234", &[0x00, 0x02, 0xAB, 0xCD], &[0x00, 0x01, 0xEF]);

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("0002abcd"));
        assert!(contents.contains("0001ef"));
        assert!(contents.contains("192.0.2.7:1234"));
    }
}
