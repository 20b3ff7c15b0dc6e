//! DoQ Listener: QUIC accept loop (ALPN `doq`), exactly one bidirectional
//! stream serviced per connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use quinn::crypto::rustls::QuicServerConfig;
use quinn::{Endpoint, TransportConfig};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::dns::proxy_handler::{self, ProxyContext};

/// ALPN token for DNS-over-QUIC per RFC 9250.
pub const ALPN_DOQ: &[u8] = b"doq";

pub async fn run(
    addr: SocketAddr,
    tls_config: rustls::ServerConfig,
    ctx: Arc<ProxyContext>,
    mut cancel: watch::Receiver<bool>,
) -> Result<()> {
    let quic_crypto = QuicServerConfig::try_from(tls_config)
        .context("failed to build QUIC crypto config")?;
    let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(quic_crypto));
    let mut transport = TransportConfig::default();
    transport.max_concurrent_bidi_streams(1u32.into());
    transport.max_concurrent_uni_streams(0u32.into());
    server_config.transport_config(Arc::new(transport));

    let endpoint = Endpoint::server(server_config, addr)
        .with_context(|| format!("unable to start DoQ listener on {addr}"))?;

    info!("DoQ listener started on {}", addr);

    loop {
        tokio::select! {
            incoming = endpoint.accept() => {
                let Some(incoming) = incoming else {
                    info!("DoQ listener on {addr} closed");
                    return Ok(());
                };
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    match incoming.await {
                        Ok(connection) => handle_connection(connection, ctx).await,
                        Err(e) => warn!("DoQ connection setup failed: {e:#}"),
                    }
                });
            }
            _ = cancel.changed() => {
                info!("DoQ listener on {addr} received shutdown signal");
                endpoint.close(0u32.into(), b"shutting down");
                return Ok(());
            }
        }
    }
}

async fn handle_connection(connection: quinn::Connection, ctx: Arc<ProxyContext>) {
    let remote_addr = connection.remote_address().to_string();

    let (send, recv) = match connection.accept_bi().await {
        Ok(pair) => pair,
        Err(e) => {
            warn!("DoQ stream accept failed for {remote_addr}: {e:#}");
            return;
        }
    };

    let monitoring = ctx.monitoring.clone();
    let handle = tokio::spawn(handle_stream(send, recv, ctx, remote_addr.clone()));
    match handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("DoQ stream from {remote_addr} failed: {e:#}"),
        Err(join_err) if join_err.is_panic() => {
            monitoring.increment_panic_recover();
            error!("DoQ handler for {remote_addr} recovered from panic: {join_err}");
        }
        Err(_) => {}
    }
}

async fn handle_stream(
    mut send: quinn::SendStream,
    mut recv: quinn::RecvStream,
    ctx: Arc<ProxyContext>,
    remote_addr: String,
) -> Result<()> {
    // quinn's send/recv halves don't implement `AsyncRead + AsyncWrite` on
    // a single handle, so bridge them through an in-process duplex pipe
    // that `serve_one_exchange` can treat as one bidirectional stream. The
    // client is expected to finish its send side after writing the query
    // (RFC 9250 §4.2), so `read_to_end` naturally yields the whole message
    // regardless of how it was fragmented across QUIC packets.
    let (mut client_side, mut server_side) = tokio::io::duplex(crate::dns::framing::MAX_PAYLOAD + 64);

    let pump = tokio::spawn(async move {
        use tokio::io::AsyncWriteExt;
        match recv.read_to_end(crate::dns::framing::MAX_PAYLOAD + 16).await {
            Ok(query) => {
                let _ = client_side.write_all(&query).await;
            }
            Err(e) => {
                tracing::warn!("DoQ stream read failed: {e:#}");
                return;
            }
        }
        let mut reply = Vec::new();
        use tokio::io::AsyncReadExt;
        let _ = client_side.read_to_end(&mut reply).await;
        if !reply.is_empty() {
            let _ = send.write_all(&reply).await;
        }
        let _ = send.finish();
    });

    let result = proxy_handler::serve_one_exchange(&ctx, "quic", &remote_addr, &mut server_side).await;
    drop(server_side);
    let _ = tokio::time::timeout(Duration::from_secs(5), pump).await;
    result
}
