//! Length-prefixed framing for control lines and raw payload passthrough.
//!
//! Every control line travels as a 4-byte big-endian length followed by
//! that many bytes of UTF-8. Payload bytes are written unframed right after
//! the control line that declared their count, so the receiver must consume
//! exactly that many raw bytes before it reads the next frame header.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - EOF and resets map to `ChannelError::Closed`

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};

/// Maximum control frame body size (1 MB)
pub const MAX_FRAME_SIZE: usize = 1_048_576;

/// Chunk size for raw payload copies
const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Errors raised by the framed channel.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel closed by peer")]
    Closed,

    #[error("Truncated transfer: expected {expected} bytes, received {received}")]
    TruncatedTransfer { expected: u64, received: u64 },

    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Frame is not valid UTF-8")]
    InvalidUtf8,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ChannelError {
    fn from_read(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => Self::Closed,
            _ => Self::Io(err),
        }
    }
}

/// Outcome of streaming a raw payload into a local sink.
///
/// The channel side always consumes the full declared count; a failing
/// sink only means the bytes were discarded instead of stored.
#[derive(Debug)]
pub enum Delivery {
    Complete,
    SinkFailed(io::Error),
}

impl Delivery {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete)
    }
}

// ============================================================================
// Reader
// ============================================================================

/// Read half of a framed channel.
///
/// Control frames and raw payloads share one buffer, so payload bytes that
/// arrive in the same segment as their control line are never lost.
pub struct FrameReader<R> {
    inner: BufReader<R>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            inner: BufReader::new(reader),
        }
    }

    /// Blocks until one complete control frame is available.
    pub async fn receive_line(&mut self) -> Result<String, ChannelError> {
        let mut header = [0u8; 4];
        self.inner
            .read_exact(&mut header)
            .await
            .map_err(ChannelError::from_read)?;

        let len = u32::from_be_bytes(header) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(ChannelError::FrameTooLarge {
                size: len,
                max: MAX_FRAME_SIZE,
            });
        }

        let mut body = vec![0u8; len];
        self.inner
            .read_exact(&mut body)
            .await
            .map_err(ChannelError::from_read)?;

        String::from_utf8(body).map_err(|_| ChannelError::InvalidUtf8)
    }

    /// Reads exactly `count` raw bytes into memory.
    pub async fn receive_bytes(&mut self, count: u64) -> Result<Vec<u8>, ChannelError> {
        let mut buffer = Vec::new();
        match self.receive_into(count, &mut buffer).await? {
            Delivery::Complete => Ok(buffer),
            Delivery::SinkFailed(e) => Err(ChannelError::Io(e)),
        }
    }

    /// Streams exactly `count` raw bytes from the channel into `sink`.
    ///
    /// If `sink` fails part way, the remaining bytes are still read and
    /// discarded so the next frame header lines up; the sink error is
    /// returned as [`Delivery::SinkFailed`].
    pub async fn receive_into<W>(
        &mut self,
        count: u64,
        sink: &mut W,
    ) -> Result<Delivery, ChannelError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
        let mut remaining = count;
        let mut sink_error = None;

        while remaining > 0 {
            let read = (&mut self.inner)
                .take(remaining)
                .read(&mut buffer)
                .await
                .map_err(ChannelError::from_read)?;

            if read == 0 {
                return Err(ChannelError::TruncatedTransfer {
                    expected: count,
                    received: count - remaining,
                });
            }
            remaining -= read as u64;

            if sink_error.is_none() {
                if let Err(e) = sink.write_all(&buffer[..read]).await {
                    sink_error = Some(e);
                }
            }
        }

        if sink_error.is_none() {
            if let Err(e) = sink.flush().await {
                sink_error = Some(e);
            }
        }

        Ok(match sink_error {
            Some(e) => Delivery::SinkFailed(e),
            None => Delivery::Complete,
        })
    }

    pub fn into_inner(self) -> R {
        self.inner.into_inner()
    }
}

// ============================================================================
// Writer
// ============================================================================

/// Write half of a framed channel.
///
/// Not internally synchronized: exactly one task may own it.
pub struct FrameWriter<W> {
    inner: BufWriter<W>,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            inner: BufWriter::new(writer),
        }
    }

    /// Writes one control frame and flushes it.
    pub async fn send_line(&mut self, text: &str) -> Result<(), ChannelError> {
        let len = text.len();
        if len > MAX_FRAME_SIZE {
            return Err(ChannelError::FrameTooLarge {
                size: len,
                max: MAX_FRAME_SIZE,
            });
        }

        // len <= MAX_FRAME_SIZE, so it always fits in u32
        let header = (len as u32).to_be_bytes();
        self.inner.write_all(&header).await?;
        self.inner.write_all(text.as_bytes()).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Writes raw payload bytes with no framing.
    pub async fn send_bytes(&mut self, bytes: &[u8]) -> Result<(), ChannelError> {
        self.inner.write_all(bytes).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Streams exactly `count` raw bytes from `source`.
    ///
    /// Fails with `TruncatedTransfer` if `source` ends early; the peer is
    /// then out of sync and the channel must be closed.
    pub async fn send_from<S>(&mut self, source: &mut S, count: u64) -> Result<(), ChannelError>
    where
        S: AsyncRead + Unpin,
    {
        let copied = tokio::io::copy(&mut source.take(count), &mut self.inner).await?;
        self.inner.flush().await?;

        if copied < count {
            return Err(ChannelError::TruncatedTransfer {
                expected: count,
                received: copied,
            });
        }
        Ok(())
    }

    /// Flushes and shuts down the write side.
    pub async fn shutdown(&mut self) -> Result<(), ChannelError> {
        self.inner.flush().await?;
        self.inner.shutdown().await?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::duplex;

    /// Sink that rejects every write.
    struct FailingSink;

    impl AsyncWrite for FailingSink {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, "disk full")))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_line_then_payload_then_line() {
        let (client, server) = duplex(1024);
        let mut writer = FrameWriter::new(client);
        let mut reader = FrameReader::new(server);

        writer.send_line("/store report.txt 11").await.unwrap();
        writer.send_bytes(b"hello world").await.unwrap();
        writer.send_line("/dir").await.unwrap();

        assert_eq!(reader.receive_line().await.unwrap(), "/store report.txt 11");
        assert_eq!(reader.receive_bytes(11).await.unwrap(), b"hello world");
        assert_eq!(reader.receive_line().await.unwrap(), "/dir");
    }

    #[tokio::test]
    async fn test_empty_line_and_zero_payload() {
        let (client, server) = duplex(64);
        let mut writer = FrameWriter::new(client);
        let mut reader = FrameReader::new(server);

        writer.send_line("").await.unwrap();
        writer.send_line("after").await.unwrap();

        assert_eq!(reader.receive_line().await.unwrap(), "");
        assert!(reader.receive_bytes(0).await.unwrap().is_empty());
        assert_eq!(reader.receive_line().await.unwrap(), "after");
    }

    #[tokio::test]
    async fn test_closed_peer() {
        let (client, server) = duplex(64);
        drop(client);
        let mut reader = FrameReader::new(server);
        assert!(matches!(
            reader.receive_line().await,
            Err(ChannelError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_oversized_header_rejected() {
        let (mut client, server) = duplex(64);
        let mut reader = FrameReader::new(server);

        let header = ((MAX_FRAME_SIZE + 1) as u32).to_be_bytes();
        client.write_all(&header).await.unwrap();

        match reader.receive_line().await {
            Err(ChannelError::FrameTooLarge { size, max }) => {
                assert_eq!(size, MAX_FRAME_SIZE + 1);
                assert_eq!(max, MAX_FRAME_SIZE);
            }
            other => panic!("expected FrameTooLarge, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_invalid_utf8_rejected() {
        let (mut client, server) = duplex(64);
        let mut reader = FrameReader::new(server);

        client.write_all(&2u32.to_be_bytes()).await.unwrap();
        client.write_all(&[0xff, 0xfe]).await.unwrap();

        assert!(matches!(
            reader.receive_line().await,
            Err(ChannelError::InvalidUtf8)
        ));
    }

    #[tokio::test]
    async fn test_truncated_payload() {
        let (mut client, server) = duplex(64);
        let mut reader = FrameReader::new(server);

        client.write_all(b"hello").await.unwrap();
        drop(client);

        match reader.receive_bytes(11).await {
            Err(ChannelError::TruncatedTransfer { expected, received }) => {
                assert_eq!(expected, 11);
                assert_eq!(received, 5);
            }
            other => panic!("expected TruncatedTransfer, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_failing_sink_still_drains_payload() {
        let (client, server) = duplex(1024);
        let mut writer = FrameWriter::new(client);
        let mut reader = FrameReader::new(server);

        writer.send_bytes(b"0123456789").await.unwrap();
        writer.send_line("next").await.unwrap();

        let delivery = reader.receive_into(10, &mut FailingSink).await.unwrap();
        assert!(!delivery.is_complete());
        assert_eq!(reader.receive_line().await.unwrap(), "next");
    }

    #[tokio::test]
    async fn test_send_from_short_source() {
        let (client, _server) = duplex(1024);
        let mut writer = FrameWriter::new(client);
        let mut source: &[u8] = b"abc";

        match writer.send_from(&mut source, 10).await {
            Err(ChannelError::TruncatedTransfer { expected, received }) => {
                assert_eq!(expected, 10);
                assert_eq!(received, 3);
            }
            other => panic!("expected TruncatedTransfer, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_send_line_too_large() {
        let (client, _server) = duplex(64);
        let mut writer = FrameWriter::new(client);
        let text = "x".repeat(MAX_FRAME_SIZE + 1);
        assert!(matches!(
            writer.send_line(&text).await,
            Err(ChannelError::FrameTooLarge { .. })
        ));
    }
}
