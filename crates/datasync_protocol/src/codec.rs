//! Length-prefixed frame I/O.
//!
//! Each frame on the stream is `| len: u32 BE | CBOR Frame |`.

use crate::error::{ProtocolError, ProtocolResult};
use crate::frame::Frame;
use std::io::ErrorKind;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default upper bound on an encoded frame (16 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Reads one frame.
///
/// Returns `Ok(None)` when the peer closed the stream cleanly between frames.
///
/// # Errors
///
/// Returns [`ProtocolError::FrameTooLarge`] if the announced length exceeds
/// `max_size`, a codec error for a malformed frame, or an I/O error
/// (including EOF in the middle of a frame).
pub async fn read_frame<R>(reader: &mut R, max_size: usize) -> ProtocolResult<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    // Only EOF before the first length byte is a clean close.
    let mut prefix = [0u8; 4];
    prefix[0] = match reader.read_u8().await {
        Ok(byte) => byte,
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    reader.read_exact(&mut prefix[1..]).await?;
    let len = u32::from_be_bytes(prefix) as usize;
    if len > max_size {
        return Err(ProtocolError::FrameTooLarge {
            size: len,
            max: max_size,
        });
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Frame::from_bytes(&buf).map(Some)
}

/// Writes one frame and flushes the stream.
///
/// # Errors
///
/// Returns an error if the frame cannot be encoded or written.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> ProtocolResult<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = frame.to_bytes()?;
    let len = u32::try_from(bytes.len()).map_err(|_| ProtocolError::FrameTooLarge {
        size: bytes.len(),
        max: u32::MAX as usize,
    })?;
    writer.write_u32(len).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}
