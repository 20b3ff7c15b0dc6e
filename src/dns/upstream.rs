//! Upstream Forwarder: one fresh TCP connection per query to the configured
//! recursive resolver.

use anyhow::Context;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::framing;

/// Forward `msg_with_len` (already length-prefixed) to `upstream_addr`,
/// returning the upstream's length-prefixed reply verbatim.
///
/// Opens a new connection per call; connections are never pooled so that a
/// single upstream TCP stream always carries exactly one query and one
/// reply, matching the framing assumption DNS-over-TCP makes.
pub async fn forward(upstream_addr: &str, msg_with_len: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut conn = TcpStream::connect(upstream_addr)
        .await
        .with_context(|| format!("failed to dial upstream resolver {upstream_addr}"))?;

    conn.write_all(msg_with_len)
        .await
        .context("failed to write query to upstream resolver")?;
    conn.flush().await.context("failed to flush query to upstream resolver")?;

    let mut len_buf = [0u8; 2];
    conn.read_exact(&mut len_buf)
        .await
        .context("failed to read reply length from upstream resolver")?;
    let len = u16::from_be_bytes(len_buf) as usize;

    let mut reply = vec![0u8; len];
    conn.read_exact(&mut reply)
        .await
        .context("failed to read reply body from upstream resolver")?;

    Ok(framing::with_length_prefix(&reply))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Spins up a stub upstream that echoes back a fixed reply payload for
    /// every connection, mirroring the single-dial-per-query contract.
    async fn spawn_stub_upstream(reply_payload: Vec<u8>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            loop {
                let (mut stream, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => break,
                };
                let reply_payload = reply_payload.clone();
                tokio::spawn(async move {
                    let mut len_buf = [0u8; 2];
                    if stream.read_exact(&mut len_buf).await.is_err() {
                        return;
                    }
                    let len = u16::from_be_bytes(len_buf) as usize;
                    let mut query = vec![0u8; len];
                    if stream.read_exact(&mut query).await.is_err() {
                        return;
                    }
                    let framed = framing::with_length_prefix(&reply_payload);
                    let _ = stream.write_all(&framed).await;
                });
            }
        });

        addr
    }

    #[tokio::test]
    async fn forward_returns_upstream_reply_verbatim() {
        let reply = b"canned-reply".to_vec();
        let addr = spawn_stub_upstream(reply.clone()).await;

        let query = framing::with_length_prefix(b"a-query");
        let got = forward(&addr, &query).await.unwrap();

        assert_eq!(framing::split_length_prefix(&got).unwrap(), reply.as_slice());
    }

    #[tokio::test]
    async fn forward_fails_on_unreachable_upstream() {
        // Port 0 connect attempts fail fast; using an address nothing listens on.
        let result = forward("127.0.0.1:1", &framing::with_length_prefix(b"x")).await;
        assert!(result.is_err());
    }
}
