//! Length-prefixed milter frames over a byte stream.
//!
//! A frame is `length:u32be` followed by `length` bytes, of which the first
//! is the command or response code. The codec is resumable across short
//! reads and distinguishes a clean close (EOF on a frame boundary) from a
//! connection dying mid-frame.

use crate::common::*;
use bytes::{Buf, BytesMut};
use thiserror::Error;

/// Bytes of the length prefix.
pub const HEADER_LEN: usize = 4;

/// Largest frame body (code byte excluded) accepted by default. Postfix
/// sends body chunks up to exactly this size.
pub const DEFAULT_MAX_BODY: usize = 65_535;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("stream ended inside a frame")]
    Truncated,
    #[error("frame length cannot be zero")]
    Malformed,
    #[error("frame too large: max {max} got {got}")]
    TooLarge { max: usize, got: usize },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct PacketCodec<IO> {
    io: IO,
    buffer: BytesMut,
    max_body: usize,
}

impl<IO> PacketCodec<IO> {
    pub fn new(io: IO) -> Self {
        Self::with_max_body(io, DEFAULT_MAX_BODY)
    }

    pub fn with_max_body(io: IO, max_body: usize) -> Self {
        PacketCodec {
            io,
            buffer: BytesMut::new(),
            max_body,
        }
    }

    pub fn into_inner(self) -> IO {
        self.io
    }
}

impl<IO> PacketCodec<IO>
where
    IO: Read + Unpin,
{
    /// Next frame as `(code, body)`. `Ok(None)` is a clean close: EOF with
    /// no bytes of a further frame buffered.
    pub async fn read_packet(&mut self) -> std::result::Result<Option<(u8, Vec<u8>)>, FrameError> {
        let mut chunk = [0u8; 8192];
        loop {
            if self.buffer.len() >= HEADER_LEN {
                let mut length_bytes = [0u8; HEADER_LEN];
                length_bytes.copy_from_slice(&self.buffer[..HEADER_LEN]);
                let length = u32::from_be_bytes(length_bytes) as usize;
                if length == 0 {
                    return Err(FrameError::Malformed);
                }
                if length - 1 > self.max_body {
                    return Err(FrameError::TooLarge {
                        max: self.max_body,
                        got: length - 1,
                    });
                }
                if self.buffer.len() >= HEADER_LEN + length {
                    self.buffer.advance(HEADER_LEN);
                    let code = self.buffer[0];
                    let body = self.buffer[1..length].to_vec();
                    self.buffer.advance(length);
                    return Ok(Some((code, body)));
                }
            }
            let len = self.io.read(&mut chunk).await?;
            if len == 0 {
                return if self.buffer.is_empty() {
                    Ok(None)
                } else {
                    Err(FrameError::Truncated)
                };
            }
            self.buffer.extend_from_slice(&chunk[..len]);
        }
    }
}

impl<IO> PacketCodec<IO>
where
    IO: Write + Unpin,
{
    /// Write one frame. The frame is assembled first so the stream sees a
    /// single write per packet.
    pub async fn write_packet(
        &mut self,
        code: u8,
        body: &[u8],
    ) -> std::result::Result<(), FrameError> {
        if body.len() > self.max_body {
            return Err(FrameError::TooLarge {
                max: self.max_body,
                got: body.len(),
            });
        }
        let mut frame = Vec::with_capacity(HEADER_LEN + 1 + body.len());
        frame.extend_from_slice(&(body.len() as u32 + 1).to_be_bytes());
        frame.push(code);
        frame.extend_from_slice(body);
        self.io.write_all(&frame).await?;
        self.io.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_std::io::Cursor;
    use futures_await_test::async_test;

    // The first exchange of every session, as Postfix sends it.
    const OPTNEG: &[u8] = b"\x00\x00\x00\x0dO\x00\x00\x00\x06\x00\x00\x01\xff\x00\x1f\xff\xff";

    #[async_test]
    async fn reads_a_whole_frame() {
        let mut codec = PacketCodec::new(Cursor::new(OPTNEG.to_vec()));
        let (code, body) = codec.read_packet().await.expect("frame").expect("some");
        assert_eq!(code, b'O');
        assert_eq!(body, &OPTNEG[5..]);
        assert!(codec.read_packet().await.expect("clean close").is_none());
    }

    #[async_test]
    async fn resumes_across_short_reads() {
        // A reader that hands out one byte at a time.
        struct Trickle(Vec<u8>, usize);
        impl Read for Trickle {
            fn poll_read(
                mut self: Pin<&mut Self>,
                _cx: &mut Context<'_>,
                buf: &mut [u8],
            ) -> Poll<io::Result<usize>> {
                if self.1 >= self.0.len() {
                    return Poll::Ready(Ok(0));
                }
                buf[0] = self.0[self.1];
                self.1 += 1;
                Poll::Ready(Ok(1))
            }
        }

        let mut codec = PacketCodec::new(Trickle(OPTNEG.to_vec(), 0));
        let (code, body) = codec.read_packet().await.expect("frame").expect("some");
        assert_eq!(code, b'O');
        assert_eq!(body.len(), 12);
    }

    #[async_test]
    async fn several_frames_in_one_buffer() {
        let mut bytes = OPTNEG.to_vec();
        bytes.extend_from_slice(b"\x00\x00\x00\x01Q");
        let mut codec = PacketCodec::new(Cursor::new(bytes));
        assert_eq!(codec.read_packet().await.unwrap().unwrap().0, b'O');
        let (code, body) = codec.read_packet().await.unwrap().unwrap();
        assert_eq!((code, body.as_slice()), (b'Q', &[][..]));
        assert!(codec.read_packet().await.unwrap().is_none());
    }

    #[async_test]
    async fn zero_length_is_malformed() {
        let mut codec = PacketCodec::new(Cursor::new(b"\x00\x00\x00\x00".to_vec()));
        assert!(matches!(
            codec.read_packet().await,
            Err(FrameError::Malformed)
        ));
    }

    #[async_test]
    async fn oversized_frame_is_rejected() {
        let mut codec =
            PacketCodec::with_max_body(Cursor::new(b"\x00\x01\x00\x01Q".to_vec()), 16);
        assert!(matches!(
            codec.read_packet().await,
            Err(FrameError::TooLarge { max: 16, .. })
        ));
    }

    #[async_test]
    async fn largest_negotiated_frame_is_accepted() {
        let mut bytes = (DEFAULT_MAX_BODY as u32 + 1).to_be_bytes().to_vec();
        bytes.push(b'B');
        bytes.extend_from_slice(&vec![b'x'; DEFAULT_MAX_BODY]);
        let mut codec = PacketCodec::new(Cursor::new(bytes));
        let (code, body) = codec.read_packet().await.unwrap().unwrap();
        assert_eq!(code, b'B');
        assert_eq!(body.len(), DEFAULT_MAX_BODY);
    }

    #[async_test]
    async fn eof_mid_frame_is_truncated() {
        let mut codec = PacketCodec::new(Cursor::new(OPTNEG[..7].to_vec()));
        assert!(matches!(
            codec.read_packet().await,
            Err(FrameError::Truncated)
        ));
    }

    #[async_test]
    async fn eof_mid_length_prefix_is_truncated() {
        let mut codec = PacketCodec::new(Cursor::new(b"\x00\x00".to_vec()));
        assert!(matches!(
            codec.read_packet().await,
            Err(FrameError::Truncated)
        ));
    }

    #[async_test]
    async fn writes_length_code_body() {
        let mut codec = PacketCodec::new(Cursor::new(vec![]));
        codec.write_packet(b'h', b"X-Tag\0v\0").await.expect("write");
        codec.write_packet(b'c', b"").await.expect("write");
        let written = codec.into_inner().into_inner();
        assert_eq!(
            written,
            b"\x00\x00\x00\x09hX-Tag\0v\0\x00\x00\x00\x01c".to_vec()
        );
    }

    #[async_test]
    async fn refuses_to_write_oversized_body() {
        let mut codec = PacketCodec::with_max_body(Cursor::new(vec![]), 4);
        assert!(matches!(
            codec.write_packet(b'b', b"12345").await,
            Err(FrameError::TooLarge { .. })
        ));
    }

    #[async_test]
    async fn garbage_stream_never_yields_a_bogus_frame() {
        // Random-ish noise either decodes as frames or errors, never panics.
        let noise: Vec<u8> = (0u32..4096).map(|i| (i.wrapping_mul(2654435761) >> 13) as u8).collect();
        let mut codec = PacketCodec::with_max_body(Cursor::new(noise), 64);
        loop {
            match codec.read_packet().await {
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(
                    FrameError::Truncated | FrameError::Malformed | FrameError::TooLarge { .. },
                ) => break,
                Err(FrameError::Io(e)) => panic!("unexpected io error: {}", e),
            }
        }
    }
}
