//! Connection to a relay server.
//!
//! A [`Client`] owns one TCP connection and speaks the framed protocol:
//! every request is one control line, uploads and downloads carry raw
//! payload bytes right after their control line. Chat lines relayed from
//! other sessions can arrive at any time; while a request waits for its
//! reply they are set aside and handed out later by [`Client::next_chat`].
//!
//! Lines are classified with [`Reply::parse`], so a chat line that happens
//! to read exactly like a reply is taken as that reply.
//!
//! **Panic-Free Policy:** No `.unwrap()`, `.expect()`, `panic!()`,
//! `unreachable!()`, or `todo!()` outside tests.

use std::collections::VecDeque;
use std::path::Path;

use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::{debug, warn};

use relay_core::{FileName, Handle, TransferDescriptor};
use relay_protocol::{Command, Delivery, FrameReader, FrameWriter, Reply};

use crate::error::{ClientError, Result};

/// Client for one relay server connection.
///
/// # Example
///
/// ```rust,ignore
/// use relay_client::Client;
///
/// let mut client = Client::connect("127.0.0.1:9000").await?;
/// client.register("alice").await?;
/// client.store_bytes("report.txt", b"hello world").await?;
/// let names = client.dir().await?;
/// client.leave().await?;
/// ```
pub struct Client {
    reader: FrameReader<OwnedReadHalf>,
    writer: FrameWriter<OwnedWriteHalf>,

    /// Handle confirmed by the server, if any
    handle: Option<Handle>,

    /// Chat lines that arrived while waiting for a reply
    pending_chat: VecDeque<String>,
}

impl Client {
    /// Connects to a relay server.
    ///
    /// # Errors
    ///
    /// `ClientError::Connect` if the TCP connection cannot be established.
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(ClientError::Connect)?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY");
        }

        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: FrameReader::new(reader),
            writer: FrameWriter::new(writer),
            handle: None,
            pending_chat: VecDeque::new(),
        })
    }

    /// Returns the registered handle, if any.
    pub fn handle(&self) -> Option<&Handle> {
        self.handle.as_ref()
    }

    /// Claims a handle.
    ///
    /// Once registered, further calls fail locally without contacting the
    /// server.
    ///
    /// # Errors
    ///
    /// - `ClientError::InvalidArgument` if `handle` is not a valid handle
    /// - `ClientError::AlreadyRegistered` if this connection has a handle
    /// - `ClientError::HandleTaken` if another session holds it
    pub async fn register(&mut self, handle: &str) -> Result<Handle> {
        if let Some(existing) = &self.handle {
            return Err(ClientError::AlreadyRegistered(existing.clone()));
        }
        let handle = Handle::new(handle)?;

        self.send_command(&Command::Register {
            handle: handle.clone(),
        })
        .await?;

        let reply = self
            .await_reply(|r| {
                matches!(
                    r,
                    Reply::Welcome { .. }
                        | Reply::RegistrationFailed
                        | Reply::AlreadyRegistered { .. }
                        | Reply::FormatError { .. }
                )
            })
            .await?;

        match reply {
            Reply::Welcome { handle } => {
                self.handle = Some(handle.clone());
                Ok(handle)
            }
            Reply::RegistrationFailed => Err(ClientError::HandleTaken(handle)),
            Reply::AlreadyRegistered { handle } => {
                self.handle = Some(handle.clone());
                Err(ClientError::AlreadyRegistered(handle))
            }
            other => Err(ClientError::Rejected(other)),
        }
    }

    /// Uploads exactly `size` bytes read from `source` as `name`.
    ///
    /// # Errors
    ///
    /// - `ClientError::InvalidArgument` if `name` is not a bare file name
    /// - `ClientError::Channel` if `source` ends before `size` bytes; the
    ///   connection is then out of step and must be dropped
    /// - `ClientError::StoreFailed` if the server could not save the file
    pub async fn store<S>(&mut self, name: &str, source: &mut S, size: u64) -> Result<()>
    where
        S: AsyncRead + Unpin,
    {
        let descriptor = TransferDescriptor::new(FileName::new(name)?, size);

        self.send_command(&Command::Store(descriptor)).await?;
        self.writer.send_from(source, size).await?;

        let reply = self
            .await_reply(|r| {
                matches!(
                    r,
                    Reply::Stored { .. } | Reply::StoreFailed { .. } | Reply::FormatError { .. }
                )
            })
            .await?;

        match reply {
            Reply::Stored { .. } => Ok(()),
            Reply::StoreFailed { name } => Err(ClientError::StoreFailed(name.to_string())),
            other => Err(ClientError::Rejected(other)),
        }
    }

    /// Uploads an in-memory buffer as `name`.
    pub async fn store_bytes(&mut self, name: &str, bytes: &[u8]) -> Result<()> {
        let mut source = bytes;
        self.store(name, &mut source, bytes.len() as u64).await
    }

    /// Uploads a local file under its own file name.
    ///
    /// # Errors
    ///
    /// `ClientError::Io` if the file cannot be opened, plus the errors of
    /// [`store`](Self::store).
    pub async fn store_file(&mut self, path: &Path) -> Result<()> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("{} has no usable file name", path.display()),
                )
            })?
            .to_string();

        let mut file = File::open(path).await?;
        let size = file.metadata().await?.len();
        self.store(&name, &mut file, size).await
    }

    /// Downloads `name` into memory.
    pub async fn get(&mut self, name: &str) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        self.get_into(name, &mut buffer).await?;
        Ok(buffer)
    }

    /// Downloads `name` into `sink`, returning the byte count.
    ///
    /// # Errors
    ///
    /// - `ClientError::NotFound` if the server has no such file
    /// - `ClientError::Io` if `sink` fails; the payload is still consumed so
    ///   the connection stays usable
    /// - `ClientError::Channel` if the connection fails mid-payload
    pub async fn get_into<W>(&mut self, name: &str, sink: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let name = FileName::new(name)?;
        self.send_command(&Command::Get { name: name.clone() })
            .await?;

        let reply = self
            .await_reply(|r| match r {
                Reply::Sending(desc) => desc.name == name,
                Reply::NotFound { .. } | Reply::FormatError { .. } => true,
                _ => false,
            })
            .await?;

        let descriptor = match reply {
            Reply::Sending(descriptor) => descriptor,
            Reply::NotFound { name } => return Err(ClientError::NotFound(name.to_string())),
            other => return Err(ClientError::Rejected(other)),
        };

        let delivery = self.reader.receive_into(descriptor.size, sink).await?;
        self.await_reply(|r| matches!(r, Reply::Sent { .. })).await?;

        match delivery {
            Delivery::Complete => {
                debug!(name = %descriptor.name, size = descriptor.size, "Downloaded file");
                Ok(descriptor.size)
            }
            Delivery::SinkFailed(e) => {
                warn!(name = %descriptor.name, error = %e, "Failed to save download");
                Err(e.into())
            }
        }
    }

    /// Lists the server directory. An empty directory yields an empty list.
    pub async fn dir(&mut self) -> Result<Vec<String>> {
        self.send_command(&Command::Dir).await?;

        let reply = self
            .await_reply(|r| {
                matches!(
                    r,
                    Reply::Listing(_) | Reply::EmptyDirectory | Reply::ListingUnavailable
                )
            })
            .await?;

        match reply {
            Reply::Listing(names) => Ok(names),
            Reply::EmptyDirectory => Ok(Vec::new()),
            other => Err(ClientError::Rejected(other)),
        }
    }

    /// Broadcasts a chat line to every other session.
    ///
    /// Text that starts with a command tag is interpreted as that command
    /// by the server.
    pub async fn chat(&mut self, text: &str) -> Result<()> {
        self.send_line(text).await
    }

    /// Waits for the next chat line from another session.
    pub async fn next_chat(&mut self) -> Result<String> {
        if let Some(line) = self.pending_chat.pop_front() {
            return Ok(line);
        }
        Ok(self.reader.receive_line().await?)
    }

    /// Sends a raw control line.
    pub async fn send_line(&mut self, line: &str) -> Result<()> {
        self.writer.send_line(line).await?;
        Ok(())
    }

    /// Reads the next line and classifies it, ignoring set-aside chat.
    pub async fn next_reply(&mut self) -> Result<Reply> {
        let line = self.reader.receive_line().await?;
        Ok(Reply::parse(&line))
    }

    /// Ends the session and closes the connection.
    pub async fn leave(mut self) -> Result<()> {
        self.send_command(&Command::Leave).await?;
        self.writer.shutdown().await?;
        Ok(())
    }

    async fn send_command(&mut self, command: &Command) -> Result<()> {
        self.send_line(&command.to_string()).await
    }

    /// Reads lines until one satisfies `accept`.
    ///
    /// Lines that do not are queued as chat. `ServerFull` always ends the
    /// wait since nothing else will follow it.
    async fn await_reply<F>(&mut self, accept: F) -> Result<Reply>
    where
        F: Fn(&Reply) -> bool,
    {
        loop {
            let line = self.reader.receive_line().await?;
            let reply = Reply::parse(&line);

            if reply == Reply::ServerFull {
                return Err(ClientError::ServerFull);
            }
            if accept(&reply) {
                return Ok(reply);
            }
            self.pending_chat.push_back(line);
        }
    }
}
