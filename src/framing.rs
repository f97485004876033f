//! Native-messaging frame codec used on the Relay's stdin/stdout.
//!
//! ```text
//! [u32 LE length] [length bytes of UTF-8 JSON]
//! ```
//!
//! There is no type byte and no delimiter. The payload is forwarded
//! verbatim; this module never looks inside it.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::constants::FRAME_HEADER_LEN;
use crate::error::{BridgeError, Result};

/// Encode `payload` as one frame.
///
/// Returns `[u32 LE length][payload]`.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let length = payload.len() as u32;
    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.extend_from_slice(&length.to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Write one frame and flush immediately.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&encode_frame(payload)).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame.
///
/// Reads exactly four length bytes, checks the length against `max_len`,
/// then reads exactly that many payload bytes. Returns `Ok(None)` on a clean
/// end of stream before the first length byte.
///
/// # Errors
///
/// [`BridgeError::FrameTooLarge`] before any payload byte is consumed when
/// the declared length exceeds `max_len`; [`BridgeError::Io`] when the stream
/// ends mid-frame.
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_LEN];
    let mut filled = 0;
    while filled < FRAME_HEADER_LEN {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
        }
        filled += n;
    }

    let length = u32::from_le_bytes(header) as usize;
    if length > max_len {
        return Err(BridgeError::FrameTooLarge { len: length, max: max_len });
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}
