//! Length-Framed Proxy Handler: the exchange shared by DoT and DoQ once a
//! bidirectional byte stream to a client is available.

use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::dns::{control_zone, framing, upstream};
use crate::observability::event_log::{EventLog, Level};
use crate::observability::monitoring::Monitoring;
use crate::observability::request_log::RequestLog;

/// Everything a Length-Framed Proxy Handler exchange needs, bundled so that
/// DoT and DoQ listeners can share one call site.
pub struct ProxyContext {
    pub upstream_addr: String,
    pub control_zone: Option<String>,
    pub version_info: control_zone::VersionInfo,
    pub event_log: Arc<EventLog>,
    pub request_log: Option<Arc<RequestLog>>,
    pub monitoring: Arc<Monitoring>,
}

const ASCII_REQUEST_TOO_LARGE: &[u8] = b"request too large";
const ASCII_INVALID_MESSAGE_SIZE: &[u8] = b"invalid message size";

/// Translate the event-log transport tag (`"tls"`/`"quic"`) into the
/// monitoring counter name (`"dot"`/`"doq"`). The two schemes use
/// different abbreviations for the same transport.
fn metric_proto(proto: &str) -> &str {
    match proto {
        "tls" => "dot",
        "quic" => "doq",
        other => other,
    }
}

/// Perform exactly one query-response exchange over `stream`.
///
/// `proto` is the transport tag (`"tls"` or `"quic"`) used for event-log
/// rows; `remote_addr` is the textual peer address.
pub async fn serve_one_exchange<S>(
    ctx: &ProxyContext,
    proto: &str,
    remote_addr: &str,
    stream: &mut S,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let size = match framing::read_length(stream).await {
        Ok(size) => size,
        Err(e) => {
            ctx.event_log.log(
                proto,
                Level::Warn,
                remote_addr,
                "",
                &format!("error reading message: {e:#}"),
            );
            return Err(e);
        }
    };

    if size > framing::MAX_PAYLOAD {
        ctx.event_log.log(
            proto,
            Level::Warn,
            remote_addr,
            "",
            &format!("request too large: {size}"),
        );
        let _ = stream.write_all(ASCII_REQUEST_TOO_LARGE).await;
        anyhow::bail!("request too large");
    }

    let payload = match framing::read_payload(stream, size).await {
        Ok(payload) => payload,
        Err(e) => {
            ctx.event_log.log(proto, Level::Warn, remote_addr, "", "invalid message size");
            let _ = stream.write_all(ASCII_INVALID_MESSAGE_SIZE).await;
            return Err(e);
        }
    };

    let msg_with_len = framing::with_length_prefix(&payload);

    let reply = match control_zone::try_answer(
        ctx.control_zone.as_deref(),
        remote_addr,
        &msg_with_len,
        &ctx.version_info,
    ) {
        Some(reply) => reply,
        None => match upstream::forward(&ctx.upstream_addr, &msg_with_len).await {
            Ok(reply) => {
                ctx.monitoring.increment_forward(metric_proto(proto));
                reply
            }
            Err(e) => {
                ctx.monitoring.increment_error(metric_proto(proto));
                ctx.event_log.log(
                    proto,
                    Level::Error,
                    remote_addr,
                    "",
                    &format!("error proxying message: {e:#}"),
                );
                return Err(e);
            }
        },
    };

    if let Some(request_log) = &ctx.request_log {
        request_log.record(proto, remote_addr, &msg_with_len, &reply);
    }

    ctx.event_log.log(proto, Level::Stats, "", "", "message proxied");

    // `reply` already carries its own length prefix (from either the
    // control zone or the upstream forwarder), so write it as a raw blob
    // rather than re-framing it with `framing::write_framed`.
    stream.write_all(&reply).await?;
    stream.flush().await?;
    Ok(())
}
