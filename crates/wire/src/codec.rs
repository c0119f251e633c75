//! CBOR encoding and length-prefixed framing over byte streams

use std::io;

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{WireError, WireResult};

/// Largest frame accepted by default (10MB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Encode a value as CBOR
pub fn encode<T: Serialize>(value: &T) -> WireResult<Bytes> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(value, &mut buf).map_err(|e| WireError::Encode(e.to_string()))?;
    Ok(Bytes::from(buf))
}

/// Decode a CBOR value
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> WireResult<T> {
    ciborium::de::from_reader(bytes).map_err(|e| WireError::Decode(e.to_string()))
}

/// Write one frame: a 4-byte big-endian length followed by the CBOR payload.
///
/// A payload larger than `max_frame_size` fails with
/// [`WireError::FrameTooLarge`] before anything is written, so the stream
/// stays usable.
pub async fn write_frame<W, T>(writer: &mut W, value: &T, max_frame_size: usize) -> WireResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = encode(value)?;
    let max = max_frame_size.min(u32::MAX as usize);
    if payload.len() > max {
        return Err(WireError::FrameTooLarge {
            len: payload.len(),
            max,
        });
    }
    let len = payload.len() as u32;

    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;

    Ok(())
}

/// Read one frame written by [`write_frame`].
///
/// A stream that ends before the length prefix is reported as
/// [`WireError::ConnectionClosed`]; a stream that ends inside a frame is an
/// I/O error.
pub async fn read_frame<R, T>(reader: &mut R, max_frame_size: usize) -> WireResult<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    if let Err(e) = reader.read_exact(&mut len_buf).await {
        return Err(match e.kind() {
            io::ErrorKind::UnexpectedEof => WireError::ConnectionClosed,
            _ => WireError::Io(e),
        });
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_frame_size {
        return Err(WireError::FrameTooLarge {
            len,
            max: max_frame_size,
        });
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await?;

    decode(&data)
}
