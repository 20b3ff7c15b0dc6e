//! Configuration Loader: parses the line-oriented `key = value` file format
//! into `ServerConfig`, collecting every validation error instead of
//! failing fast so `test` mode can report all problems at once.

use std::fs;
use std::net::ToSocketAddrs;
use std::path::PathBuf;

/// Verbosity scale: 0=silent operational, 1=errors, 2=+warnings and info,
/// 3=+debug/trace.
pub type Verbosity = u8;

/// The embedded default configuration, printed verbatim by `dnsproxy config`.
pub const DEFAULT_CONFIG: &str = include_str!("../dnsproxy.conf");

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub log_path: PathBuf,
    pub verbosity: Verbosity,
    pub requests_log_path: Option<PathBuf>,
    pub compress_rotated_logs: bool,
    pub dns_server_addr: String,
    pub https_port: u16,
    pub http_port: u16,
    pub tls_port: u16,
    pub quic_port: u16,
    pub http_redirect: Option<String>,
    pub server_name: String,
    pub control_zone: Option<String>,
    pub well_known_path: Option<PathBuf>,
    pub zabbix_server: Option<String>,
}

/// Intermediate representation while scanning the file; every field is
/// optional until validated, so that missing-required-field errors can be
/// reported alongside malformed-value errors in one pass.
#[derive(Default)]
struct RawConfig {
    cert_path: Option<String>,
    key_path: Option<String>,
    log_path: Option<String>,
    verbosity: Option<Verbosity>,
    requests_log_path: Option<String>,
    compress_rotated_logs: bool,
    dns_server_addr: Option<String>,
    https_port: u16,
    http_port: u16,
    tls_port: u16,
    quic_port: u16,
    http_redirect: Option<String>,
    server_name: String,
    control_zone: Option<String>,
    well_known_path: Option<String>,
    zabbix_server: Option<String>,
}

/// Load and validate the configuration at `path`. Returns either a
/// validated `ServerConfig` or the ordered list of human-readable errors
/// collected along the way.
pub fn load_config(path: &std::path::Path) -> Result<ServerConfig, Vec<String>> {
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => return Err(vec![format!("unable to read config file {}: {e}", path.display())]),
    };

    let mut raw = RawConfig::default();
    let mut errors = Vec::new();

    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();

        match key {
            "cert_path" => raw.cert_path = Some(value.to_string()),
            "key_path" => raw.key_path = Some(value.to_string()),
            "log_path" => raw.log_path = Some(value.to_string()),
            "log_level" => match parse_log_level(value) {
                Some(v) => raw.verbosity = Some(v),
                None => errors.push(format!("invalid log_level value: {value}")),
            },
            "verbosity" => match value.parse::<Verbosity>() {
                Ok(v) if v <= 3 => raw.verbosity = Some(v),
                _ => errors.push(format!("invalid verbosity value: {value}")),
            },
            "requests_log_path" => raw.requests_log_path = Some(value.to_string()),
            "compress_rotated_logs" => raw.compress_rotated_logs = parse_bool(value),
            "dns_server_addr" => raw.dns_server_addr = Some(value.to_string()),
            "https_port" => match value.parse::<u16>() {
                Ok(v) => raw.https_port = v,
                Err(_) => errors.push(format!("invalid https_port value: {value}")),
            },
            "http_port" => match value.parse::<u16>() {
                Ok(v) => raw.http_port = v,
                Err(_) => errors.push(format!("invalid http_port value: {value}")),
            },
            "tls_port" => match value.parse::<u16>() {
                Ok(v) => raw.tls_port = v,
                Err(_) => errors.push(format!("invalid tls_port value: {value}")),
            },
            "quic_port" => match value.parse::<u16>() {
                Ok(v) => raw.quic_port = v,
                Err(_) => errors.push(format!("invalid quic_port value: {value}")),
            },
            "http_redirect" => raw.http_redirect = Some(value.to_string()),
            "server_name" => raw.server_name = value.to_string(),
            "control_zone" => raw.control_zone = Some(value.to_string()),
            "well_known_path" => raw.well_known_path = Some(value.to_string()),
            "zabbix_server" => raw.zabbix_server = Some(value.to_string()),
            _ => continue, // unknown keys are silently ignored
        }
    }

    let cert_path = raw.cert_path.map(PathBuf::from);
    let key_path = raw.key_path.map(PathBuf::from);
    let log_path = raw.log_path.map(PathBuf::from);

    match &cert_path {
        Some(p) if p.is_file() => {}
        Some(p) => errors.push(format!("certificate file does not exist or is unreadable: {}", p.display())),
        None => errors.push("cert_path is required".to_string()),
    }
    match &key_path {
        Some(p) if p.is_file() => {}
        Some(p) => errors.push(format!("private key file does not exist or is unreadable: {}", p.display())),
        None => errors.push("key_path is required".to_string()),
    }
    if log_path.is_none() {
        errors.push("log_path is required".to_string());
    }

    let dns_server_addr = match &raw.dns_server_addr {
        Some(addr) if addr.to_socket_addrs().is_ok() => addr.clone(),
        Some(addr) => {
            errors.push(format!("invalid dns server address: {addr}"));
            addr.clone()
        }
        None => {
            errors.push("dns_server_addr is required".to_string());
            String::new()
        }
    };

    if raw.https_port == 0 && raw.tls_port == 0 && raw.quic_port == 0 {
        errors.push("at least one of https_port, tls_port, or quic_port must be non-zero".to_string());
    }

    if let Some(redirect) = &raw.http_redirect {
        if let Err(e) = validate_redirect_url(redirect) {
            errors.push(e);
        }
    }

    if let Some(zone) = &raw.control_zone {
        if !zone.ends_with('.') || zone.starts_with('.') {
            errors.push(format!(
                "control_zone must end with '.' and not start with '.': {zone}"
            ));
        }
    }

    let well_known_path = raw.well_known_path.map(PathBuf::from);
    if let Some(p) = &well_known_path {
        if !p.is_dir() {
            errors.push(format!("well_known_path does not exist or is not a directory: {}", p.display()));
        }
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    Ok(ServerConfig {
        cert_path: cert_path.unwrap(),
        key_path: key_path.unwrap(),
        log_path: log_path.unwrap(),
        verbosity: raw.verbosity.unwrap_or(1),
        requests_log_path: raw.requests_log_path.map(PathBuf::from),
        compress_rotated_logs: raw.compress_rotated_logs,
        dns_server_addr,
        https_port: raw.https_port,
        http_port: raw.http_port,
        tls_port: raw.tls_port,
        quic_port: raw.quic_port,
        http_redirect: raw.http_redirect,
        server_name: raw.server_name,
        control_zone: raw.control_zone,
        well_known_path,
        zabbix_server: raw.zabbix_server,
    })
}

fn parse_log_level(value: &str) -> Option<Verbosity> {
    match value.to_ascii_lowercase().as_str() {
        "debug" => Some(3),
        "info" => Some(2),
        "warn" => Some(2),
        "error" => Some(1),
        _ => None,
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "true" | "on" | "yes")
}

fn validate_redirect_url(value: &str) -> Result<(), String> {
    let scheme_end = value.find("://").ok_or_else(|| format!("invalid http_redirect: {value}"))?;
    match &value[..scheme_end] {
        "http" | "https" => Ok(()),
        other => Err(format!("invalid http_redirect: unsupported scheme {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_pem_stub(contents: &str) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f
    }

    #[test]
    fn loads_minimal_valid_config() {
        let cert = write_pem_stub("cert");
        let key = write_pem_stub("key");

        let mut conf = NamedTempFile::new().unwrap();
        writeln!(
            conf,
            "cert_path = {}\nkey_path = {}\nlog_path = /tmp/dnsproxy.log\ndns_server_addr = 127.0.0.1:53\ntls_port = 853\nserver_name = test\n",
            cert.path().display(),
            key.path().display(),
        )
        .unwrap();

        let config = load_config(conf.path()).expect("config should be valid");
        assert_eq!(config.tls_port, 853);
        assert_eq!(config.server_name, "test");
        assert_eq!(config.verbosity, 1);
    }

    #[test]
    fn rejects_config_with_no_listen_port() {
        let cert = write_pem_stub("cert");
        let key = write_pem_stub("key");

        let mut conf = NamedTempFile::new().unwrap();
        writeln!(
            conf,
            "cert_path = {}\nkey_path = {}\nlog_path = /tmp/dnsproxy.log\ndns_server_addr = 127.0.0.1:53\n",
            cert.path().display(),
            key.path().display(),
        )
        .unwrap();

        let errors = load_config(conf.path()).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("non-zero")));
    }

    #[test]
    fn rejects_bad_control_zone() {
        let cert = write_pem_stub("cert");
        let key = write_pem_stub("key");

        let mut conf = NamedTempFile::new().unwrap();
        writeln!(
            conf,
            "cert_path = {}\nkey_path = {}\nlog_path = /tmp/dnsproxy.log\ndns_server_addr = 127.0.0.1:53\ntls_port = 853\ncontrol_zone = .bad.\n",
            cert.path().display(),
            key.path().display(),
        )
        .unwrap();

        let errors = load_config(conf.path()).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("control_zone")));
    }

    #[test]
    fn log_level_and_verbosity_synonyms_agree() {
        assert_eq!(parse_log_level("debug"), Some(3));
        assert_eq!(parse_log_level("error"), Some(1));
        assert_eq!(parse_log_level("bogus"), None);
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let cert = write_pem_stub("cert");
        let key = write_pem_stub("key");

        let mut conf = NamedTempFile::new().unwrap();
        writeln!(
            conf,
            "cert_path = {}\nkey_path = {}\nlog_path = /tmp/dnsproxy.log\ndns_server_addr = 127.0.0.1:53\ntls_port = 853\nsome_future_key = whatever\n",
            cert.path().display(),
            key.path().display(),
        )
        .unwrap();

        assert!(load_config(conf.path()).is_ok());
    }
}
