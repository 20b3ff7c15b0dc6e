//! Listener Supervisor: loads configuration and certificate material,
//! starts the DoT/DoQ/DoH listener pairs (plus the optional well-known HTTP
//! pair) across IPv4 and IPv6, owns the single-capacity fatal-error channel,
//! and tears everything down on `Stop`. The outer CLI loop in `main.rs`
//! re-enters `start` while the returned `should_restart` flag is true.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::config::{self, ServerConfig};
use crate::dns::control_zone::VersionInfo;
use crate::dns::proxy_handler::ProxyContext;
use crate::listeners::doh::DohContext;
use crate::listeners::wellknown::WellKnownContext;
use crate::listeners::{doh, doq, dot, wellknown};
use crate::observability::event_log::EventLog;
use crate::observability::monitoring::{LoggingSink, Monitoring};
use crate::observability::request_log::RequestLog;
use crate::tls::CertificateMaterial;

/// Build metadata surfaced by `version.<zone>` and `-v`/`--version`. `Rust`
/// has no direct analogue of the Go source's linker-injected `BuiltOn`/
/// `Revision` variables, so these fall back to `"unknown"` when the
/// corresponding environment variable isn't set at compile time (a CI
/// pipeline can supply `DNSPROXY_BUILT_ON`/`DNSPROXY_REVISION`).
pub const VERSION_INFO: VersionInfo = VersionInfo {
    version: env!("CARGO_PKG_VERSION"),
    built_on: match option_env!("DNSPROXY_BUILT_ON") {
        Some(v) => v,
        None => "unknown",
    },
    revision: match option_env!("DNSPROXY_REVISION") {
        Some(v) => v,
        None => "unknown",
    },
};

/// Process-wide "restart requested" flag, shared between the Signal &
/// Lifecycle Driver and the Start/Stop loop. Lives for the lifetime of the
/// process, across every `start`/`stop` iteration.
#[derive(Default)]
pub struct SupervisorState {
    restart_requested: Mutex<bool>,
}

impl SupervisorState {
    pub fn set_restart(&self, value: bool) {
        *self.restart_requested.lock().unwrap() = value;
    }

    pub fn restart_requested(&self) -> bool {
        *self.restart_requested.lock().unwrap()
    }
}

/// Messages the Signal & Lifecycle Driver feeds into a running supervisor
/// iteration. The OS-signal translator in `main.rs` is the sole producer;
/// `start`'s select loop is the sole consumer.
pub enum ControlMessage {
    /// `INT`/`TERM`: stop without restarting.
    Shutdown,
    /// `USR2`: stop and re-enter `start` with freshly reloaded configuration.
    Reload,
    /// `USR1`: rotate the log files without interrupting the running
    /// listeners.
    Rotate,
}

/// Run one Listener Supervisor iteration to completion. Blocks until a
/// fatal listener error arrives, or the signal driver sends `Shutdown`/
/// `Reload` over `control_rx`. Returns `(should_restart, result)`; the
/// caller re-enters `start` while `should_restart` is true.
pub async fn start(
    config_path: &Path,
    state: &Arc<SupervisorState>,
    control_rx: &mut mpsc::Receiver<ControlMessage>,
) -> (bool, Result<()>) {
    let config = match config::load_config(config_path) {
        Ok(c) => c,
        Err(errors) => {
            eprintln!("dnsproxy configuration is invalid:");
            for e in &errors {
                eprintln!("  - {e}");
            }
            std::process::exit(1);
        }
    };

    let event_log = match EventLog::open(&config.log_path, config.server_name.clone(), config.verbosity) {
        Ok(log) => Arc::new(log),
        Err(e) => return (false, Err(e)),
    };

    let request_log = match &config.requests_log_path {
        Some(path) => match RequestLog::open(path, config.server_name.clone()) {
            Ok(log) => Some(Arc::new(log)),
            Err(e) => return (false, Err(e)),
        },
        None => None,
    };

    let cert = match CertificateMaterial::load(&config.cert_path, &config.key_path) {
        Ok(cert) => cert,
        Err(e) => return (false, Err(e)),
    };

    let monitoring = Arc::new(Monitoring::new());
    let monitoring_handle = config
        .zabbix_server
        .as_ref()
        .map(|_| monitoring.clone().start_send_loop(Arc::new(LoggingSink)));

    let (error_tx, mut error_rx) = mpsc::channel::<anyhow::Error>(1);
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    spawn_listeners(&config, &cert, &event_log, &request_log, &monitoring, &cancel_rx, &error_tx, &mut tasks);

    info!("dnsproxy ready (server_name={})", config.server_name);

    let mut watchdog = tokio::time::interval(Duration::from_secs(1));
    let outcome = loop {
        tokio::select! {
            _ = watchdog.tick() => {
                tracing::trace!("watchdog keep-alive");
            }
            error = error_rx.recv() => {
                let err = error.unwrap_or_else(|| anyhow::anyhow!("a listener task ended without reporting an error"));
                break (state.restart_requested(), Err(err));
            }
            msg = control_rx.recv() => {
                match msg {
                    Some(ControlMessage::Shutdown) => break (false, Ok(())),
                    Some(ControlMessage::Reload) => break (true, Ok(())),
                    Some(ControlMessage::Rotate) => {
                        if let Err(e) = event_log.rotate(config.compress_rotated_logs).await {
                            warn!("failed to rotate event log: {e:#}");
                        }
                        if let Some(request_log) = &request_log {
                            if let Err(e) = request_log.rotate(config.compress_rotated_logs).await {
                                warn!("failed to rotate request log: {e:#}");
                            }
                        }
                    }
                    None => break (false, Ok(())),
                }
            }
        }
    };

    let (should_restart, result) = outcome;
    stop(should_restart, state, cancel_tx, tasks, monitoring_handle).await;
    (should_restart, result)
}

/// Tear down one supervisor iteration: record the restart intent, signal
/// every listener to stop via the shared cancellation watch, wait for them
/// to exit, and stop the monitoring send loop. Idempotent in the sense that
/// sending `true`/`true` twice on an already-closed watch channel is a
/// no-op; callers only ever invoke this once per iteration.
async fn stop(
    restart: bool,
    state: &Arc<SupervisorState>,
    cancel_tx: watch::Sender<bool>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
    monitoring_handle: Option<tokio::task::JoinHandle<()>>,
) {
    state.set_restart(restart);
    info!(restart, "stopping listener supervisor iteration");

    let _ = cancel_tx.send(true);
    for task in tasks {
        let _ = task.await;
    }
    if let Some(handle) = monitoring_handle {
        handle.abort();
    }
}

/// Spawn every enabled listener pair (IPv4 + IPv6) for this iteration. Each
/// listener slot is a distinct call site: there is no shared variable an
/// IPv6 listener could be mistakenly assigned into.
#[allow(clippy::too_many_arguments)]
fn spawn_listeners(
    config: &ServerConfig,
    cert: &CertificateMaterial,
    event_log: &Arc<EventLog>,
    request_log: &Option<Arc<RequestLog>>,
    monitoring: &Arc<Monitoring>,
    cancel_rx: &watch::Receiver<bool>,
    error_tx: &mpsc::Sender<anyhow::Error>,
    tasks: &mut Vec<tokio::task::JoinHandle<()>>,
) {
    if config.tls_port != 0 {
        let proxy_ctx = Arc::new(ProxyContext {
            upstream_addr: config.dns_server_addr.clone(),
            control_zone: config.control_zone.clone(),
            version_info: VERSION_INFO,
            event_log: event_log.clone(),
            request_log: request_log.clone(),
            monitoring: monitoring.clone(),
        });
        match cert.server_config_no_alpn() {
            Ok(tls_config) => {
                spawn(tasks, error_tx.clone(), dot::run(
                    addr(config.tls_port, IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
                    tls_config.clone(),
                    proxy_ctx.clone(),
                    cancel_rx.clone(),
                ));
                spawn(tasks, error_tx.clone(), dot::run(
                    addr(config.tls_port, IpAddr::V6(Ipv6Addr::UNSPECIFIED)),
                    tls_config,
                    proxy_ctx,
                    cancel_rx.clone(),
                ));
            }
            Err(e) => {
                let _ = error_tx.try_send(e);
            }
        }
    }

    if config.quic_port != 0 || config.tls_port != 0 {
        let quic_port = if config.quic_port != 0 { config.quic_port } else { config.tls_port };
        let proxy_ctx = Arc::new(ProxyContext {
            upstream_addr: config.dns_server_addr.clone(),
            control_zone: config.control_zone.clone(),
            version_info: VERSION_INFO,
            event_log: event_log.clone(),
            request_log: request_log.clone(),
            monitoring: monitoring.clone(),
        });
        match cert.server_config_with_alpn(vec![doq::ALPN_DOQ.to_vec()]) {
            Ok(tls_config) => {
                spawn(tasks, error_tx.clone(), doq::run(
                    addr(quic_port, IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
                    tls_config,
                    proxy_ctx.clone(),
                    cancel_rx.clone(),
                ));
            }
            Err(e) => {
                let _ = error_tx.try_send(e);
            }
        }
        match cert.server_config_with_alpn(vec![doq::ALPN_DOQ.to_vec()]) {
            Ok(tls_config) => {
                spawn(tasks, error_tx.clone(), doq::run(
                    addr(quic_port, IpAddr::V6(Ipv6Addr::UNSPECIFIED)),
                    tls_config,
                    proxy_ctx,
                    cancel_rx.clone(),
                ));
            }
            Err(e) => {
                let _ = error_tx.try_send(e);
            }
        }
    }

    if config.https_port != 0 {
        let doh_ctx = Arc::new(DohContext {
            upstream_addr: config.dns_server_addr.clone(),
            control_zone: config.control_zone.clone(),
            version_info: VERSION_INFO,
            http_redirect: config.http_redirect.clone(),
            event_log: event_log.clone(),
            request_log: request_log.clone(),
            monitoring: monitoring.clone(),
        });
        let alpn = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
        match cert.server_config_with_alpn(alpn.clone()) {
            Ok(tls_config) => spawn(tasks, error_tx.clone(), doh::run(
                addr(config.https_port, IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
                tls_config,
                doh_ctx.clone(),
                cancel_rx.clone(),
            )),
            Err(e) => {
                let _ = error_tx.try_send(e);
            }
        }
        match cert.server_config_with_alpn(alpn) {
            Ok(tls_config) => spawn(tasks, error_tx.clone(), doh::run(
                addr(config.https_port, IpAddr::V6(Ipv6Addr::UNSPECIFIED)),
                tls_config,
                doh_ctx,
                cancel_rx.clone(),
            )),
            Err(e) => {
                let _ = error_tx.try_send(e);
            }
        }
    }

    if config.http_port != 0 {
        if let Some(root) = &config.well_known_path {
            let wk_ctx = Arc::new(WellKnownContext {
                root: root.clone(),
                event_log: event_log.clone(),
            });
            spawn(tasks, error_tx.clone(), wellknown::run(
                addr(config.http_port, IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
                wk_ctx.clone(),
                cancel_rx.clone(),
            ));
            spawn(tasks, error_tx.clone(), wellknown::run(
                addr(config.http_port, IpAddr::V6(Ipv6Addr::UNSPECIFIED)),
                wk_ctx,
                cancel_rx.clone(),
            ));
        }
    }
}

fn addr(port: u16, ip: IpAddr) -> SocketAddr {
    SocketAddr::new(ip, port)
}

/// Spawn a listener task, forwarding its first fatal error into the
/// single-capacity error channel. `try_send` silently drops a second error
/// if one already occupies the channel: the supervisor only needs the
/// first fatal failure to begin tearing everything down.
fn spawn<F>(tasks: &mut Vec<tokio::task::JoinHandle<()>>, error_tx: mpsc::Sender<anyhow::Error>, fut: F)
where
    F: std::future::Future<Output = Result<()>> + Send + 'static,
{
    tasks.push(tokio::spawn(async move {
        if let Err(e) = fut.await {
            let _ = error_tx.try_send(e);
        }
    }));
}
