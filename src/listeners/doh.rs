//! DoH Handler: HTTP/1.1+HTTP/2 handler rooted at `/dns-query`, decoding
//! the DNS message from a GET `dns` query parameter or a POST body and
//! returning the upstream reply as raw `application/dns-message` bytes.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use base64::Engine;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::{Method, Request, Response, StatusCode};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

use crate::dns::{control_zone, framing, upstream};
use crate::observability::event_log::{EventLog, Level};
use crate::observability::monitoring::Monitoring;
use crate::observability::request_log::RequestLog;

const MIN_DOH_GET_PAYLOAD: usize = 13;

/// Everything the DoH handler needs per request, shared across every
/// connection.
pub struct DohContext {
    pub upstream_addr: String,
    pub control_zone: Option<String>,
    pub version_info: control_zone::VersionInfo,
    pub http_redirect: Option<String>,
    pub event_log: Arc<EventLog>,
    pub request_log: Option<Arc<RequestLog>>,
    pub monitoring: Arc<Monitoring>,
}

pub async fn run(
    addr: SocketAddr,
    tls_config: rustls::ServerConfig,
    ctx: Arc<DohContext>,
    mut cancel: watch::Receiver<bool>,
) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("unable to start DoH listener on {addr}"))?;
    let acceptor = TlsAcceptor::from(Arc::new(tls_config));

    info!("DoH listener started on {}", listener.local_addr().unwrap_or(addr));

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("DoH accept error on {addr}: {e:#}");
                        continue;
                    }
                };
                let acceptor = acceptor.clone();
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, peer_addr, acceptor, ctx).await {
                        warn!("DoH connection from {peer_addr} failed: {e:#}");
                    }
                });
            }
            _ = cancel.changed() => {
                info!("DoH listener on {addr} received shutdown signal");
                return Ok(());
            }
        }
    }
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    peer_addr: SocketAddr,
    acceptor: TlsAcceptor,
    ctx: Arc<DohContext>,
) -> Result<()> {
    let tls_stream = acceptor.accept(stream).await.context("TLS handshake failed")?;
    let io = TokioIo::new(tls_stream);

    let service = service_fn(move |req| {
        let ctx = ctx.clone();
        async move { handle_request(req, peer_addr, ctx).await }
    });

    auto::Builder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("connection error: {e}"))
}

/// Outer entry point: spawns the actual handling as its own task so a
/// panic is contained and counted rather than tearing down the HTTP
/// connection loop.
async fn handle_request(
    req: Request<Incoming>,
    peer_addr: SocketAddr,
    ctx: Arc<DohContext>,
) -> std::result::Result<Response<Full<Bytes>>, std::convert::Infallible> {
    let monitoring = ctx.monitoring.clone();
    let handle = tokio::spawn(handle_request_inner(req, peer_addr, ctx));
    match handle.await {
        Ok(response) => Ok(response),
        Err(join_err) if join_err.is_panic() => {
            monitoring.increment_panic_recover();
            error!("DoH handler for {peer_addr} recovered from panic: {join_err}");
            Ok(with_common_headers(Response::new(Full::new(Bytes::new()))))
        }
        Err(_) => Ok(with_common_headers(Response::new(Full::new(Bytes::new())))),
    }
}

fn with_common_headers(mut resp: Response<Full<Bytes>>) -> Response<Full<Bytes>> {
    let date = chrono::Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
    let headers = resp.headers_mut();
    if let Ok(value) = hyper::header::HeaderValue::from_str(&date) {
        headers.insert("Date", value);
    }
    headers.insert("X-Powered-By", hyper::header::HeaderValue::from_static("-"));
    headers.insert("Server", hyper::header::HeaderValue::from_static("-"));
    resp
}

fn text_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    with_common_headers(
        Response::builder()
            .status(status)
            .body(Full::new(Bytes::from_static(body.as_bytes())))
            .unwrap(),
    )
}

fn empty_response(status: StatusCode) -> Response<Full<Bytes>> {
    with_common_headers(Response::builder().status(status).body(Full::new(Bytes::new())).unwrap())
}

async fn handle_request_inner(
    req: Request<Incoming>,
    peer_addr: SocketAddr,
    ctx: Arc<DohContext>,
) -> Response<Full<Bytes>> {
    let remote_addr = peer_addr.to_string();
    let useragent = req
        .headers()
        .get(hyper::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    if useragent.is_empty() {
        ctx.event_log.log("https", Level::Info, &remote_addr, &useragent, "missing user agent");
        return text_response(StatusCode::BAD_REQUEST, "a user agent is required");
    }

    ctx.event_log.log("https", Level::Info, &remote_addr, &useragent, "connect");

    let path = req.uri().path().to_string();

    if path == "/" && req.method() == Method::GET {
        if let Some(redirect) = &ctx.http_redirect {
            return with_common_headers(
                Response::builder()
                    .status(StatusCode::FOUND)
                    .header("Location", redirect.as_str())
                    .body(Full::new(Bytes::new()))
                    .unwrap(),
            );
        }
    }

    if path != "/dns-query" {
        return empty_response(StatusCode::NOT_FOUND);
    }

    if req.method() != Method::GET && req.method() != Method::POST {
        return empty_response(StatusCode::METHOD_NOT_ALLOWED);
    }

    let message = match extract_message(req).await {
        Ok(m) => m,
        Err(resp) => return resp,
    };

    let msg_with_len = framing::with_length_prefix(&message);

    let reply = match control_zone::try_answer(
        ctx.control_zone.as_deref(),
        &remote_addr,
        &msg_with_len,
        &ctx.version_info,
    ) {
        Some(reply) => reply,
        None => match upstream::forward(&ctx.upstream_addr, &msg_with_len).await {
            Ok(reply) => {
                ctx.monitoring.increment_forward("doh");
                reply
            }
            Err(e) => {
                ctx.monitoring.increment_error("doh");
                ctx.event_log.log(
                    "https",
                    Level::Error,
                    &remote_addr,
                    &useragent,
                    &format!("error proxying dns message: {e:#}"),
                );
                return text_response(StatusCode::INTERNAL_SERVER_ERROR, "internal server error");
            }
        },
    };

    if let Some(request_log) = &ctx.request_log {
        request_log.record("https", &remote_addr, &msg_with_len, &reply);
    }
    ctx.event_log.log("https", Level::Stats, "", "", "message proxied");

    let payload = framing::split_length_prefix(&reply).unwrap_or(&[]);
    with_common_headers(
        Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "application/dns-message")
            .header("Content-Length", payload.len().to_string())
            .body(Full::new(Bytes::copy_from_slice(payload)))
            .unwrap(),
    )
}

/// Decode the inner DNS message from either a GET `dns` query parameter
/// (base64url, unpadded) or a POST body.
async fn extract_message(req: Request<Incoming>) -> std::result::Result<Vec<u8>, Response<Full<Bytes>>> {
    match *req.method() {
        Method::GET => {
            let query = req.uri().query().unwrap_or("");
            let encoded = query
                .split('&')
                .find_map(|pair| pair.strip_prefix("dns="))
                .filter(|v| !v.is_empty())
                .ok_or_else(|| text_response(StatusCode::BAD_REQUEST, "missing dns query in url"))?;

            let decoded = base64::engine::general_purpose::URL_SAFE_NO_PAD
                .decode(encoded)
                .map_err(|_| text_response(StatusCode::BAD_REQUEST, "invalid base64 value in dns query"))?;

            if decoded.len() <= MIN_DOH_GET_PAYLOAD - 1 {
                return Err(text_response(StatusCode::BAD_REQUEST, "invalid base64 value in dns query"));
            }
            Ok(decoded)
        }
        Method::POST => {
            if let Some(len) = req.headers().get(hyper::header::CONTENT_LENGTH) {
                if let Some(len) = len.to_str().ok().and_then(|v| v.parse::<usize>().ok()) {
                    if len > framing::MAX_PAYLOAD {
                        return Err(text_response(StatusCode::BAD_REQUEST, "message too large"));
                    }
                }
            }
            let body = req
                .into_body()
                .collect()
                .await
                .map_err(|_| empty_response(StatusCode::BAD_REQUEST))?
                .to_bytes();
            if body.len() > framing::MAX_PAYLOAD {
                return Err(text_response(StatusCode::BAD_REQUEST, "message too large"));
            }
            Ok(body.to_vec())
        }
        _ => Err(empty_response(StatusCode::METHOD_NOT_ALLOWED)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_path_extracts_dns_param() {
        let query = "dns=AAABAAABAAAAAAAAA";
        let found = query.split('&').find_map(|pair| pair.strip_prefix("dns="));
        assert_eq!(found, Some("AAABAAABAAAAAAAAA"));
    }

    #[test]
    fn base64url_roundtrip_matches_engine() {
        let payload = vec![0u8; 20];
        let encoded = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(&payload);
        let decoded = base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(&encoded).unwrap();
        assert_eq!(decoded, payload);
    }
}
