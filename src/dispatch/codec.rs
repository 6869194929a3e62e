//! Length-prefixed frame codec.
//!
//! Wire format: `[4-byte length as u32 big-endian] [bincode-encoded Frame]`.
//! Both directions enforce the same maximum frame size; an oversized frame
//! is rejected before it is written and before its body is read.

use bincode::Options;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::protocol::Frame;
use super::DispatchError;

/// Encode `frame` into a body (without the length prefix).
///
/// # Errors
///
/// `FrameTooLarge` if the body exceeds `max_bytes`, `Codec` if encoding fails.
pub fn encode_frame(frame: &Frame, max_bytes: usize) -> Result<Vec<u8>, DispatchError> {
    let body = bincode::serialize(frame).map_err(|e| DispatchError::Codec(e.to_string()))?;
    if body.len() > max_bytes || u32::try_from(body.len()).is_err() {
        return Err(DispatchError::FrameTooLarge {
            size: body.len(),
            max: max_bytes,
        });
    }
    Ok(body)
}

/// Decode a body produced by [`encode_frame`].
///
/// # Errors
///
/// `Codec` if the bytes are not a valid frame.
pub fn decode_frame(body: &[u8], max_bytes: usize) -> Result<Frame, DispatchError> {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .allow_trailing_bytes()
        .with_limit(max_bytes as u64)
        .deserialize(body)
        .map_err(|e| DispatchError::Codec(e.to_string()))
}

/// Write one encoded body with its length prefix and flush.
///
/// # Errors
///
/// `Io` if the stream fails.
pub async fn write_body<W>(writer: &mut W, body: &[u8]) -> Result<(), DispatchError>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(body.len()).map_err(|_| DispatchError::FrameTooLarge {
        size: body.len(),
        max: u32::MAX as usize,
    })?;
    writer.write_u32(len).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

/// Encode and write one frame.
///
/// # Errors
///
/// See [`encode_frame`] and [`write_body`].
pub async fn write_frame<W>(writer: &mut W, frame: &Frame, max_bytes: usize) -> Result<(), DispatchError>
where
    W: AsyncWrite + Unpin,
{
    let body = encode_frame(frame, max_bytes)?;
    write_body(writer, &body).await
}

/// Read one frame. Returns `Ok(None)` on a clean end of stream between frames.
///
/// # Errors
///
/// `FrameTooLarge` if the announced length exceeds `max_bytes`, `Io` on a
/// truncated frame or stream failure, `Codec` on an undecodable body.
pub async fn read_frame<R>(reader: &mut R, max_bytes: usize) -> Result<Option<Frame>, DispatchError>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > max_bytes {
        return Err(DispatchError::FrameTooLarge {
            size: len,
            max: max_bytes,
        });
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    decode_frame(&body, max_bytes).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::protocol::{FrameKind, RpcRequest};
    use std::collections::HashMap;

    fn call_frame(image: Vec<u8>) -> Frame {
        let mut metadata = HashMap::new();
        metadata.insert("x-request-id".to_string(), "req-1".to_string());
        Frame {
            call_id: 7,
            kind: FrameKind::Call {
                metadata,
                request: RpcRequest::DetectObjects {
                    filename: "cat.jpg".into(),
                    image,
                },
            },
        }
    }

    #[tokio::test]
    async fn test_frames_survive_a_duplex_stream() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let frame = call_frame(vec![1, 2, 3]);
        write_frame(&mut a, &frame, 1024).await.expect("test: write");
        write_frame(&mut a, &Frame { call_id: 8, kind: FrameKind::Ping }, 1024)
            .await
            .expect("test: write ping");
        drop(a);

        let first = read_frame(&mut b, 1024).await.expect("test: read");
        assert_eq!(first, Some(frame));
        let second = read_frame(&mut b, 1024).await.expect("test: read ping");
        assert_eq!(second.map(|f| f.kind), Some(FrameKind::Ping));
        assert_eq!(read_frame(&mut b, 1024).await.expect("test: eof"), None);
    }

    #[test]
    fn test_encode_rejects_oversized_frame() {
        let err = encode_frame(&call_frame(vec![0u8; 4096]), 1024).unwrap_err();
        assert!(matches!(err, DispatchError::FrameTooLarge { max: 1024, .. }));
    }

    #[tokio::test]
    async fn test_read_rejects_oversized_length_prefix() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_u32(10_000).await.expect("test: write len");
        let err = read_frame(&mut b, 1024).await.unwrap_err();
        assert!(matches!(err, DispatchError::FrameTooLarge { size: 10_000, .. }));
    }

    #[tokio::test]
    async fn test_truncated_body_is_io_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_u32(32).await.expect("test: write len");
        a.write_all(&[1, 2, 3]).await.expect("test: write partial");
        drop(a);
        let err = read_frame(&mut b, 1024).await.unwrap_err();
        assert!(matches!(err, DispatchError::Io(_)));
    }

    #[test]
    fn test_garbage_body_is_codec_error() {
        let err = decode_frame(&[0xff; 3], 1024).unwrap_err();
        assert!(matches!(err, DispatchError::Codec(_)));
    }
}
