//! 16-bit big-endian length-prefixed framing shared by DoT, DoQ, and the
//! upstream DNS-over-TCP connection.

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum payload size (excluding the length prefix) accepted from a
/// client on DoT, DoQ, and DoH-POST.
pub const MAX_PAYLOAD: usize = 4096;

/// Read a 2-byte big-endian length prefix.
pub async fn read_length<R: AsyncRead + Unpin>(reader: &mut R) -> Result<usize> {
    let mut len_buf = [0u8; 2];
    reader
        .read_exact(&mut len_buf)
        .await
        .context("failed to read length prefix")?;
    Ok(u16::from_be_bytes(len_buf) as usize)
}

/// Read exactly `len` bytes of payload.
pub async fn read_payload<R: AsyncRead + Unpin>(reader: &mut R, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .await
        .context("failed to read message body")?;
    Ok(buf)
}

/// Write `payload` preceded by its 2-byte big-endian length.
pub async fn write_framed<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let len = (payload.len() as u16).to_be_bytes();
    writer
        .write_all(&len)
        .await
        .context("failed to write length prefix")?;
    writer
        .write_all(payload)
        .await
        .context("failed to write message body")?;
    writer.flush().await.context("failed to flush message")?;
    Ok(())
}

/// Prepend a freshly computed 2-byte big-endian length to `payload`,
/// producing the canonical internal `msgWithLen` representation.
pub fn with_length_prefix(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 2);
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Split a `msgWithLen` buffer into its declared length and payload slice,
/// failing if the declared length does not match what's actually present.
pub fn split_length_prefix(msg_with_len: &[u8]) -> Result<&[u8]> {
    anyhow::ensure!(msg_with_len.len() >= 2, "message too short for length prefix");
    let len = u16::from_be_bytes([msg_with_len[0], msg_with_len[1]]) as usize;
    let payload = &msg_with_len[2..];
    anyhow::ensure!(payload.len() == len, "declared length does not match payload size");
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn roundtrip_preserves_payload() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let message = b"hello dns world";

        write_framed(&mut client, message).await.unwrap();

        let len = read_length(&mut server).await.unwrap();
        assert_eq!(len, message.len());
        let payload = read_payload(&mut server, len).await.unwrap();
        assert_eq!(&payload, message);
    }

    #[tokio::test]
    async fn length_encoding_matches_across_sizes() {
        for &size in &[0usize, 512, 65535] {
            let (mut writer, mut reader) = tokio::io::duplex(size + 16);
            let msg = vec![0xAA; size];
            write_framed(&mut writer, &msg).await.unwrap();

            let len = read_length(&mut reader).await.unwrap();
            assert_eq!(len, size);
            if size > 0 {
                let payload = read_payload(&mut reader, len).await.unwrap();
                assert_eq!(payload, msg);
            }
        }
    }

    #[test]
    fn with_length_prefix_matches_split() {
        let payload = b"abcxyz";
        let framed = with_length_prefix(payload);
        assert_eq!(&framed[0..2], &6u16.to_be_bytes());
        assert_eq!(split_length_prefix(&framed).unwrap(), payload);
    }

    #[test]
    fn split_rejects_mismatched_length() {
        let mut framed = with_length_prefix(b"abc");
        framed[1] = 9;
        assert!(split_length_prefix(&framed).is_err());
    }
}
