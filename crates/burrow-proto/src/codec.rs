//! Newline-delimited JSON framing for the control stream.
//!
//! Messages are single JSON objects separated by whitespace. The reader is
//! lenient about surrounding whitespace and nothing else; a message that
//! fails to decode is fatal and the caller closes the session.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Cap on a single handshake message. Anything larger is not a handshake.
const MAX_MESSAGE_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid message: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("peer closed the stream mid-handshake")]
    UnexpectedEof,

    #[error("message exceeds {MAX_MESSAGE_SIZE} bytes")]
    TooLarge,

    #[error("timed out waiting for handshake message")]
    Timeout,
}

/// Write one message followed by a newline separator.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut buf = serde_json::to_vec(message)?;
    buf.push(b'\n');
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one newline-terminated JSON message.
///
/// Reads byte-by-byte up to the delimiter; handshake messages are tiny and
/// each session performs exactly three reads, so simplicity wins over
/// buffering (which would also swallow bytes belonging to whatever follows
/// the handshake on a misbehaving peer).
pub async fn read_message<R, T>(reader: &mut R) -> Result<T, CodecError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut buf: Vec<u8> = Vec::with_capacity(256);
    let mut byte = [0u8; 1];

    loop {
        let n = reader.read(&mut byte).await?;
        if n == 0 {
            if buf.iter().all(|b| b.is_ascii_whitespace()) {
                return Err(CodecError::UnexpectedEof);
            }
            // Peer half-closed right after the last message; accept it.
            break;
        }
        if byte[0] == b'\n' {
            if buf.iter().all(|b| b.is_ascii_whitespace()) {
                // Blank line between messages; keep scanning.
                buf.clear();
                continue;
            }
            break;
        }
        buf.push(byte[0]);
        if buf.len() > MAX_MESSAGE_SIZE {
            return Err(CodecError::TooLarge);
        }
    }

    let text = std::str::from_utf8(&buf)
        .map_err(|_| CodecError::Decode(serde::de::Error::custom("not valid UTF-8")))?;
    Ok(serde_json::from_str(text.trim())?)
}

/// [`read_message`] bounded by a deadline.
pub async fn read_message_timeout<R, T>(reader: &mut R, limit: Duration) -> Result<T, CodecError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    tokio::time::timeout(limit, read_message(reader))
        .await
        .map_err(|_| CodecError::Timeout)?
}
