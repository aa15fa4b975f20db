//! Length-prefixed message framing.
//!
//! Every message on the wire, in either direction, is:
//!
//! ```text
//! [length: u32, big-endian][payload: length bytes]
//! ```
//!
//! The length is always in network byte order so peers on different
//! architectures agree on it. There is no other header: the sender is the
//! socket the frame arrived on, and the recipients are "everyone else".
//!
//! Two halves share the format:
//! - `encode_frame` / `decode_frame` work on in-memory buffers and are used
//!   by the non-blocking server loop, where a frame may arrive across many
//!   readiness events.
//! - `read_frame` / `write_frame` drive a tokio stream to completion and are
//!   used by the client.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{RelayError, Result};

/// Width of the length field.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Append one framed message to `dst`.
///
/// Payloads longer than `u32::MAX` are rejected.
pub fn encode_frame(payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    let len = u32::try_from(payload.len()).map_err(|_| RelayError::MessageTooLarge {
        len: payload.len(),
        max: u32::MAX as usize,
    })?;
    dst.reserve(LENGTH_PREFIX_LEN + payload.len());
    dst.put_u32(len);
    dst.put_slice(payload);
    Ok(())
}

/// Try to split one complete frame off the front of `src`.
///
/// Returns `Ok(None)` when more bytes are needed; nothing is consumed in that
/// case. A declared length above `max_len` fails as soon as the prefix is
/// complete, before any payload is buffered.
pub fn decode_frame(src: &mut BytesMut, max_len: usize) -> Result<Option<Bytes>> {
    if src.len() < LENGTH_PREFIX_LEN {
        return Ok(None);
    }

    let mut prefix = [0u8; LENGTH_PREFIX_LEN];
    prefix.copy_from_slice(&src[..LENGTH_PREFIX_LEN]);
    let len = u32::from_be_bytes(prefix) as usize;

    if len > max_len {
        return Err(RelayError::MessageTooLarge { len, max: max_len });
    }

    if src.len() < LENGTH_PREFIX_LEN + len {
        // Make room for the rest so the next read lands in one allocation
        src.reserve(LENGTH_PREFIX_LEN + len - src.len());
        return Ok(None);
    }

    src.advance(LENGTH_PREFIX_LEN);
    Ok(Some(src.split_to(len).freeze()))
}

/// Read exactly one frame from `reader`.
///
/// Short reads are accumulated until the prefix and then the payload are
/// complete. EOF at any point is `ConnectionClosed`.
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LENGTH_PREFIX_LEN];
    read_full(reader, &mut prefix).await?;

    let len = u32::from_be_bytes(prefix) as usize;
    if len > max_len {
        return Err(RelayError::MessageTooLarge { len, max: max_len });
    }

    let mut payload = BytesMut::zeroed(len);
    read_full(reader, &mut payload).await?;
    Ok(payload.freeze())
}

/// Write one frame to `writer` and flush it.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut frame = BytesMut::new();
    encode_frame(payload, &mut frame)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]).await {
            Ok(0) => return Err(RelayError::ConnectionClosed),
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    #[test]
    fn test_encode_layout() {
        let mut buf = BytesMut::new();
        encode_frame(b"hello", &mut buf).unwrap();
        assert_eq!(&buf[..], b"\x00\x00\x00\x05hello");
    }

    #[test]
    fn test_decode_empty_payload() {
        let mut buf = BytesMut::new();
        encode_frame(b"", &mut buf).unwrap();

        let frame = decode_frame(&mut buf, 10).unwrap().unwrap();
        assert!(frame.is_empty());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_max_len_boundary() {
        for len in [0usize, 1, 399, 400] {
            let payload = vec![b'x'; len];
            let mut buf = BytesMut::new();
            encode_frame(&payload, &mut buf).unwrap();
            let frame = decode_frame(&mut buf, 400).unwrap().unwrap();
            assert_eq!(&frame[..], &payload[..]);
        }
    }

    #[test]
    fn test_decode_partial() {
        let mut wire = BytesMut::new();
        encode_frame(b"hello", &mut wire).unwrap();

        // Feed one byte at a time; only the final byte completes the frame
        let mut buf = BytesMut::new();
        for (i, byte) in wire.iter().enumerate() {
            buf.put_u8(*byte);
            let result = decode_frame(&mut buf, 100).unwrap();
            if i + 1 < wire.len() {
                assert!(result.is_none());
            } else {
                assert_eq!(result.unwrap(), Bytes::from_static(b"hello"));
            }
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_multiple_frames() {
        let mut buf = BytesMut::new();
        encode_frame(b"one", &mut buf).unwrap();
        encode_frame(b"two", &mut buf).unwrap();
        buf.put_slice(b"\x00\x00"); // start of a third

        assert_eq!(decode_frame(&mut buf, 10).unwrap().unwrap(), Bytes::from_static(b"one"));
        assert_eq!(decode_frame(&mut buf, 10).unwrap().unwrap(), Bytes::from_static(b"two"));
        assert!(decode_frame(&mut buf, 10).unwrap().is_none());
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn test_decode_rejects_oversize_before_payload() {
        let mut buf = BytesMut::from(&b"\x00\x00\x01\x00"[..]); // 256, no payload yet
        match decode_frame(&mut buf, 255) {
            Err(RelayError::MessageTooLarge { len, max }) => {
                assert_eq!(len, 256);
                assert_eq!(max, 255);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_read_frame_across_short_reads() {
        let mut mock = Builder::new()
            .read(b"\x00")
            .read(b"\x00\x00")
            .read(b"\x05he")
            .read(b"l")
            .read(b"lo")
            .build();

        let frame = read_frame(&mut mock, 100).await.unwrap();
        assert_eq!(frame, Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn test_read_frame_eof_mid_payload() {
        let mut mock = Builder::new().read(b"\x00\x00\x00\x05hel").build();

        let result = read_frame(&mut mock, 100).await;
        assert!(matches!(result, Err(RelayError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_read_frame_io_error() {
        let mut mock = Builder::new()
            .read(b"\x00\x00")
            .read_error(std::io::Error::from(std::io::ErrorKind::ConnectionReset))
            .build();

        let result = read_frame(&mut mock, 100).await;
        assert!(matches!(result, Err(RelayError::Io(_))));
    }

    #[tokio::test]
    async fn test_read_frame_too_large() {
        let mut mock = Builder::new().read(b"\x00\x00\x10\x00").build();

        let result = read_frame(&mut mock, 400).await;
        assert!(matches!(
            result,
            Err(RelayError::MessageTooLarge { len: 4096, max: 400 })
        ));
    }

    #[tokio::test]
    async fn test_write_frame() {
        let mut mock = Builder::new()
            .write(b"\x00\x00\x00\x05")
            .write(b"hello")
            .build();

        write_frame(&mut mock, b"hello").await.unwrap();
    }
}
