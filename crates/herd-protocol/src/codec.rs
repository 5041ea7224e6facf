//! Frame codec: length-prefixed JSON messages on a byte stream.
//!
//! Each frame is a u32 big-endian payload length followed by that many
//! bytes of JSON encoding one [`Message`]. The header and payload are
//! written with a single `write_all`, so a frame is never partially
//! observable to the peer as long as one writer owns the stream.

use crate::Message;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Hard cap on a single frame's payload. A peer announcing more than this
/// is malformed, not merely large.
pub const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    /// Malformed framing or an unrecognized frame kind.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The peer closed the stream cleanly between frames.
    #[error("connection closed")]
    Eof,
    /// Transport failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Write one frame. Atomic at the frame boundary.
pub async fn write_frame<W>(writer: &mut W, message: &Message) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    let payload = serde_json::to_vec(message)
        .map_err(|e| CodecError::Protocol(format!("encoding {} frame: {e}", message.kind())))?;
    if payload.len() > MAX_FRAME_BYTES {
        return Err(CodecError::Protocol(format!(
            "{} frame of {} bytes exceeds the {MAX_FRAME_BYTES}-byte cap",
            message.kind(),
            payload.len()
        )));
    }
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&u32::try_from(payload.len()).expect("payload under u32 cap").to_be_bytes());
    frame.extend_from_slice(&payload);
    writer.write_all(&frame).await?;
    Ok(())
}

/// Read one frame.
///
/// A clean close before the first header byte is [`CodecError::Eof`];
/// truncation anywhere after that is a protocol error, as is an
/// out-of-range length or a payload that does not decode to a known kind.
pub async fn read_frame<R>(reader: &mut R) -> Result<Message, CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    match reader.read(&mut header).await {
        Ok(0) => return Err(CodecError::Eof),
        Ok(n) if n < header.len() => {
            reader
                .read_exact(&mut header[n..])
                .await
                .map_err(truncated)?;
        }
        Ok(_) => {}
        Err(e) => return Err(CodecError::Io(e)),
    }

    let len = u32::from_be_bytes(header) as usize;
    if len == 0 || len > MAX_FRAME_BYTES {
        return Err(CodecError::Protocol(format!("frame length {len} out of range")));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await.map_err(truncated)?;
    serde_json::from_slice(&payload).map_err(|e| CodecError::Protocol(format!("decoding frame: {e}")))
}

fn truncated(e: std::io::Error) -> CodecError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        CodecError::Protocol("truncated frame".to_owned())
    } else {
        CodecError::Io(e)
    }
}
