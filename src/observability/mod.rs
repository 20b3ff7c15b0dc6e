//! Observability Glue: structured event log, optional per-query request
//! log, and counter increments forwarded to an external monitoring sink.

pub mod event_log;
pub mod monitoring;
pub mod request_log;

/// Escape a free-text field for the CSV log schemas: `,`, `"`, and newline
/// are replaced with literal placeholder tokens so a single row always
/// has a fixed number of fields.
pub fn csv_escape(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        value
            .replace(',', "__COMMA__")
            .replace('"', "__QUOTE__")
            .replace('\n', "__NEWLINE__")
    } else {
        value.to_string()
    }
}

/// Rename `path` to `<path>.<yesterday's date>` in local time, matching
/// both the event log and request log rotation schemes.
pub(crate) fn rotated_name(path: &std::path::Path) -> std::path::PathBuf {
    let yesterday = chrono::Local::now() - chrono::Duration::days(1);
    let suffix = yesterday.format("%Y-%m-%d").to_string();
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(suffix);
    std::path::PathBuf::from(name)
}

/// Gzip `path` to `<path>.gz` and remove the uncompressed original on
/// success. Runs on the blocking thread pool since it's invoked from a
/// background rotation task.
pub(crate) async fn gzip_and_remove(path: std::path::PathBuf) {
    let result = tokio::task::spawn_blocking(move || gzip_and_remove_sync(&path)).await;
    if let Ok(Err(e)) = result {
        tracing::warn!("failed to compress rotated log: {e:#}");
    }
}

fn gzip_and_remove_sync(path: &std::path::Path) -> anyhow::Result<()> {
    use std::io::Read;

    let mut input = std::fs::File::open(path)?;
    let mut contents = Vec::new();
    input.read_to_end(&mut contents)?;
    drop(input);

    let gz_path = {
        let mut name = path.as_os_str().to_os_string();
        name.push(".gz");
        std::path::PathBuf::from(name)
    };
    let out = std::fs::File::create(&gz_path)?;
    let mut encoder = flate2::write::GzEncoder::new(out, flate2::Compression::default());
    std::io::Write::write_all(&mut encoder, &contents)?;
    encoder.finish()?;

    std::fs::remove_file(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_only_when_needed() {
        assert_eq!(csv_escape("plain"), "plain");
        assert_eq!(csv_escape("a,b"), "a__COMMA__b");
        assert_eq!(csv_escape("a\"b"), "a__QUOTE__b");
        assert_eq!(csv_escape("a\nb"), "a__NEWLINE__b");
    }

    #[test]
    fn rotated_name_uses_yesterdays_date() {
        let path = std::path::Path::new("/var/log/dnsproxy.log");
        let rotated = rotated_name(path);
        let expected_date = (chrono::Local::now() - chrono::Duration::days(1)).format("%Y-%m-%d").to_string();
        assert_eq!(rotated.to_string_lossy(), format!("/var/log/dnsproxy.log.{expected_date}"));
    }
}
