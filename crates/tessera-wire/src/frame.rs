//! Stream framing: a 4-byte big-endian length followed by the body.
//!
//! The body is the output of [`Registry::marshal`](crate::Registry::marshal):
//! a 16-byte message type id and the MessagePack payload.

use crate::error::{NetError, NetResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the length prefix.
pub const FRAME_HEADER_SIZE: usize = 4;

/// Prefix `body` with its length.
pub fn encode_frame(body: &[u8], max: u32) -> NetResult<Vec<u8>> {
    let len = u32::try_from(body.len()).unwrap_or(u32::MAX);
    if len > max {
        return Err(NetError::FrameTooLarge { size: len, max });
    }
    let mut bytes = Vec::with_capacity(FRAME_HEADER_SIZE + body.len());
    bytes.extend_from_slice(&len.to_be_bytes());
    bytes.extend_from_slice(body);
    Ok(bytes)
}

/// Decode the length prefix from a 4-byte header.
pub fn decode_length(header: &[u8; FRAME_HEADER_SIZE]) -> u32 {
    u32::from_be_bytes(*header)
}

/// Write one frame and flush. Returns the bytes written, prefix included.
pub async fn write_frame<W>(writer: &mut W, body: &[u8], max: u32) -> NetResult<u64>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let bytes = encode_frame(body, max)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(bytes.len() as u64)
}

/// Read one frame body.
///
/// A declared length above `max` fails with [`NetError::FrameTooLarge`]
/// before the body buffer is allocated.
pub async fn read_frame<R>(reader: &mut R, max: u32) -> NetResult<Vec<u8>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; FRAME_HEADER_SIZE];
    reader.read_exact(&mut header).await?;

    let len = decode_length(&header);
    if len > max {
        return Err(NetError::FrameTooLarge { size: len, max });
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(body)
}
