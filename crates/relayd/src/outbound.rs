//! Per-session outbound queue and its single writer task.
//!
//! Every session owns exactly one writer task, which owns the socket's
//! write half. The session's own replies and the chat lines broadcast into
//! it by other sessions are all queued through a [`SessionLink`], so frames
//! are never interleaved. A file item is written as one unit (`Sending`
//! line, raw bytes, `Sent` line) and nothing can land inside the payload.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Write failures close the session instead of propagating

use std::time::Duration;

use tokio::fs::File;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use relay_core::{SessionId, TransferDescriptor};
use relay_protocol::{ChannelError, FrameWriter, Reply};

/// Outbound queue depth per session
pub const OUTBOUND_BUFFER: usize = 256;

/// Write timeout for a single control line (10 seconds)
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// One item queued for a session's writer.
#[derive(Debug)]
pub enum Outbound {
    /// A control line (reply or relayed chat)
    Line(String),

    /// A fetch: header line, exactly `descriptor.size` raw bytes, trailer line
    File {
        descriptor: TransferDescriptor,
        file: File,
    },
}

impl Outbound {
    pub fn reply(reply: Reply) -> Self {
        Self::Line(reply.to_string())
    }
}

/// Errors when queueing to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum OutboundError {
    #[error("outbound queue is full")]
    QueueFull,

    #[error("session writer is closed")]
    Closed,
}

/// Cheap-to-clone handle for queueing to one session and closing it.
///
/// Closing is idempotent and may race freely between the session's own
/// read loop, its writer, and the registry.
#[derive(Debug, Clone)]
pub struct SessionLink {
    sender: mpsc::Sender<Outbound>,
    closer: CancellationToken,
}

impl SessionLink {
    /// Creates a link and the queue receiver its writer task drains.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (sender, receiver) = mpsc::channel(capacity);
        let link = Self {
            sender,
            closer: CancellationToken::new(),
        };
        (link, receiver)
    }

    /// Queues without waiting. Used for broadcasts so one slow recipient
    /// never stalls delivery to the others.
    pub fn deliver(&self, item: Outbound) -> Result<(), OutboundError> {
        if self.is_closed() {
            return Err(OutboundError::Closed);
        }
        self.sender.try_send(item).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => OutboundError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => OutboundError::Closed,
        })
    }

    /// Queues, waiting for capacity. Used for the session's own replies.
    pub async fn send(&self, item: Outbound) -> Result<(), OutboundError> {
        if self.is_closed() {
            return Err(OutboundError::Closed);
        }
        self.sender
            .send(item)
            .await
            .map_err(|_| OutboundError::Closed)
    }

    /// Closes the session immediately. Safe to call more than once.
    pub fn close(&self) {
        self.closer.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closer.is_cancelled()
    }

    /// Token cancelled when the session is closed.
    pub fn close_token(&self) -> CancellationToken {
        self.closer.clone()
    }
}

/// Drains a session's queue onto the socket until every [`SessionLink`]
/// is dropped (graceful: the queue is flushed first) or the link is closed
/// (immediate). A write failure closes the link.
pub async fn run_writer<W>(
    mut writer: FrameWriter<W>,
    mut queue: mpsc::Receiver<Outbound>,
    closer: CancellationToken,
    session_id: SessionId,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let item = tokio::select! {
            biased;

            _ = closer.cancelled() => {
                debug!(session = %session_id, "Writer closed");
                break;
            }

            item = queue.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };

        if let Err(e) = write_item(&mut writer, item).await {
            warn!(session = %session_id, error = %e, "Failed to write to client");
            closer.cancel();
            break;
        }
    }

    if let Err(e) = writer.shutdown().await {
        debug!(session = %session_id, error = %e, "Writer shutdown failed");
    }
}

async fn write_item<W>(writer: &mut FrameWriter<W>, item: Outbound) -> Result<(), ChannelError>
where
    W: AsyncWrite + Unpin,
{
    match item {
        Outbound::Line(text) => write_line(writer, &text).await,
        Outbound::File {
            descriptor,
            mut file,
        } => {
            write_line(writer, &Reply::Sending(descriptor.clone()).to_string()).await?;
            // No deadline on the payload itself: a slow reader only stalls its own session.
            writer.send_from(&mut file, descriptor.size).await?;
            write_line(
                writer,
                &Reply::Sent {
                    name: descriptor.name,
                }
                .to_string(),
            )
            .await
        }
    }
}

async fn write_line<W>(writer: &mut FrameWriter<W>, text: &str) -> Result<(), ChannelError>
where
    W: AsyncWrite + Unpin,
{
    match timeout(WRITE_TIMEOUT, writer.send_line(text)).await {
        Ok(result) => result,
        Err(_) => Err(ChannelError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "write timed out",
        ))),
    }
}
