//! DoT Listener: TLS-wrapped TCP accept loop on IPv4 and IPv6, one
//! isolated handler task per connection.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rustls::ServerConfig;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

use crate::dns::proxy_handler::{self, ProxyContext};

/// Bind and serve the DoT accept loop on `addr` until `cancel` fires.
/// Accept errors other than listener-closed are logged and ignored; the
/// loop only returns once the listener itself closes or `cancel` fires.
pub async fn run(
    addr: SocketAddr,
    tls_config: Arc<ServerConfig>,
    ctx: Arc<ProxyContext>,
    mut cancel: watch::Receiver<bool>,
) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("unable to start DoT listener on {addr}"))?;
    let acceptor = TlsAcceptor::from(tls_config);

    info!("DoT listener started on {}", listener.local_addr().unwrap_or(addr));

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("DoT accept error on {addr}: {e:#}");
                        continue;
                    }
                };
                let acceptor = acceptor.clone();
                let ctx = ctx.clone();
                spawn_isolated(stream, peer_addr, acceptor, ctx);
            }
            _ = cancel.changed() => {
                info!("DoT listener on {addr} received shutdown signal");
                return Ok(());
            }
        }
    }
}

/// Spawn the connection handler in its own task and watch its join result
/// separately, so a panic inside the handler is contained (counted and
/// logged) without ever reaching the accept loop above.
fn spawn_isolated(
    stream: tokio::net::TcpStream,
    peer_addr: SocketAddr,
    acceptor: TlsAcceptor,
    ctx: Arc<ProxyContext>,
) {
    tokio::spawn(async move {
        let monitoring = ctx.monitoring.clone();
        let handle = tokio::spawn(handle_connection(stream, peer_addr, acceptor, ctx));
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("DoT connection from {peer_addr} failed: {e:#}"),
            Err(join_err) if join_err.is_panic() => {
                monitoring.increment_panic_recover();
                error!("DoT handler for {peer_addr} recovered from panic: {join_err}");
            }
            Err(_) => {}
        }
    });
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    peer_addr: SocketAddr,
    acceptor: TlsAcceptor,
    ctx: Arc<ProxyContext>,
) -> Result<()> {
    let mut tls_stream = acceptor
        .accept(stream)
        .await
        .context("TLS handshake failed")?;
    proxy_handler::serve_one_exchange(&ctx, "tls", &peer_addr.to_string(), &mut tls_stream).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::control_zone::VersionInfo;
    use crate::observability::event_log::EventLog;
    use crate::observability::monitoring::Monitoring;
    use rcgen::{generate_simple_self_signed, CertifiedKey};
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use std::io::Cursor;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn test_ctx(upstream_addr: String) -> Arc<ProxyContext> {
        Arc::new(ProxyContext {
            upstream_addr,
            control_zone: None,
            version_info: VersionInfo { version: "t", built_on: "t", revision: "t" },
            event_log: Arc::new(EventLog::silent()),
            request_log: None,
            monitoring: Arc::new(Monitoring::new()),
        })
    }

    async fn spawn_stub_upstream(reply_payload: Vec<u8>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else { break };
                let reply_payload = reply_payload.clone();
                tokio::spawn(async move {
                    let mut len_buf = [0u8; 2];
                    if stream.read_exact(&mut len_buf).await.is_err() {
                        return;
                    }
                    let len = u16::from_be_bytes(len_buf) as usize;
                    let mut q = vec![0u8; len];
                    let _ = stream.read_exact(&mut q).await;
                    let framed = crate::dns::framing::with_length_prefix(&reply_payload);
                    let _ = stream.write_all(&framed).await;
                });
            }
        });
        addr
    }

    #[derive(Debug)]
    struct NoVerify;
    impl ServerCertVerifier for NoVerify {
        fn verify_server_cert(
            &self,
            _end_entity: &rustls::pki_types::CertificateDer<'_>,
            _intermediates: &[rustls::pki_types::CertificateDer<'_>],
            _server_name: &rustls::pki_types::ServerName<'_>,
            _ocsp_response: &[u8],
            _now: rustls::pki_types::UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }
        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &rustls::pki_types::CertificateDer<'_>,
            _dss: &rustls::DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }
        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &rustls::pki_types::CertificateDer<'_>,
            _dss: &rustls::DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }
        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            rustls::crypto::ring::default_provider().signature_verification_algorithms.supported_schemes()
        }
    }

    #[tokio::test]
    async fn dot_round_trip_over_tls() {
        let CertifiedKey { cert, signing_key } =
            generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let certs = rustls_pemfile::certs(&mut Cursor::new(cert.pem().as_bytes()))
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        let key = rustls_pemfile::private_key(&mut Cursor::new(signing_key.serialize_pem().as_bytes()))
            .unwrap()
            .unwrap();
        let tls_config = Arc::new(
            ServerConfig::builder()
                .with_no_client_auth()
                .with_single_cert(certs, key)
                .unwrap(),
        );

        let upstream_addr = spawn_stub_upstream(b"canned-reply".to_vec()).await;
        let ctx = test_ctx(upstream_addr);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (_cancel_tx, cancel_rx) = watch::channel(false);

        tokio::spawn(async move {
            let acceptor = TlsAcceptor::from(tls_config);
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        let Ok((stream, peer)) = accepted else { break };
                        spawn_isolated(stream, peer, acceptor.clone(), ctx.clone());
                    }
                    _ = cancel_rx.clone().changed() => break,
                }
            }
        });

        let tls_connector_config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerify))
            .with_no_client_auth();
        let connector = tokio_rustls::TlsConnector::from(Arc::new(tls_connector_config));

        let tcp = TcpStream::connect(addr).await.unwrap();
        let server_name = rustls::pki_types::ServerName::try_from("localhost").unwrap();
        let mut tls = connector.connect(server_name, tcp).await.unwrap();

        let query = crate::dns::framing::with_length_prefix(b"a-query");
        tls.write_all(&query).await.unwrap();

        let mut reply = vec![0u8; 2 + 12];
        tls.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply[2..], b"canned-reply");
    }
}
