//! Connection handler for individual client connections.
//!
//! Each accepted connection gets its own `ConnectionHandler` that:
//! - Admits the session into the registry (or turns it away when full)
//! - Reads control lines and dispatches them as [`Command`]s
//! - Streams upload payloads into the server directory
//! - Queues its replies through the session's outbound link
//!
//! Format errors and failed commands produce a diagnostic reply and the
//! loop continues. Only channel failures, `/leave`, or a close from the
//! registry end the session.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Connection errors are logged and result in graceful disconnect

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::AsyncRead;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use relay_core::{FileName, Handle, SessionId, SessionInfo, TransferDescriptor};
use relay_protocol::{ChannelError, Command, FrameReader, Reply};

use crate::outbound::{Outbound, SessionLink};
use crate::registry::{RegistryError, RegistryHandle, RemovalReason};
use crate::storage::{FileStore, StorageError};

/// Connection handler for a single client.
pub struct ConnectionHandler<R> {
    /// Identity assigned at accept time
    session_id: SessionId,

    /// Remote address, when known
    peer: Option<SocketAddr>,

    /// Read half of the framed channel
    reader: FrameReader<R>,

    /// Queue to this session's writer task
    link: SessionLink,

    /// Handle to the session registry
    registry: RegistryHandle,

    /// The server directory
    store: FileStore,

    /// Handle bound by `/register`, set at most once
    handle: Option<Handle>,

    /// Read deadline per control line
    idle_timeout: Option<Duration>,
}

impl<R> ConnectionHandler<R>
where
    R: AsyncRead + Unpin,
{
    /// Creates a new connection handler.
    ///
    /// # Arguments
    ///
    /// * `session_id` - Unique id for this connection
    /// * `peer` - Remote address, for logging
    /// * `reader` - Read half of the framed channel
    /// * `link` - Link to the session's writer task
    /// * `registry` - Handle to the session registry
    /// * `store` - The server directory
    pub fn new(
        session_id: SessionId,
        peer: Option<SocketAddr>,
        reader: FrameReader<R>,
        link: SessionLink,
        registry: RegistryHandle,
        store: FileStore,
    ) -> Self {
        Self {
            session_id,
            peer,
            reader,
            link,
            registry,
            store,
            handle: None,
            idle_timeout: None,
        }
    }

    /// Sets the per-line read deadline. `None` waits forever.
    #[must_use]
    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Runs the connection handler until the session ends.
    ///
    /// Returns why the session ended, or `None` if it was never admitted.
    pub async fn run(mut self) -> Option<RemovalReason> {
        let info = SessionInfo::new(self.session_id, self.peer);

        match self.registry.add(info, self.link.clone()).await {
            Ok(()) => {
                debug!(session = %self.session_id, peer = ?self.peer, "New client connected");
            }
            Err(RegistryError::RegistryFull { max }) => {
                warn!(
                    session = %self.session_id,
                    peer = ?self.peer,
                    max,
                    "Rejecting client, server is full"
                );
                // Dropping the link afterwards lets the writer flush this and hang up
                let _ = self.link.send(Outbound::reply(Reply::ServerFull)).await;
                return None;
            }
            Err(e) => {
                warn!(session = %self.session_id, error = %e, "Failed to admit client");
                self.link.close();
                return None;
            }
        }

        let reason = match self.process_lines().await {
            Ok(reason) => reason,
            Err(e) => {
                debug!(
                    session = %self.session_id,
                    handle = ?self.handle,
                    error = %e,
                    "Connection closed"
                );
                e.removal_reason()
            }
        };

        self.registry.remove(self.session_id, reason).await;
        if reason.is_forced() {
            self.link.close();
        }

        info!(
            session = %self.session_id,
            handle = ?self.handle,
            reason = %reason,
            "Client disconnected"
        );
        Some(reason)
    }

    /// Main line processing loop.
    ///
    /// Reads and dispatches lines until the client leaves, the channel
    /// fails, or the session is closed from outside.
    async fn process_lines(&mut self) -> Result<RemovalReason, ConnectionError> {
        let closed = self.link.close_token();

        loop {
            let line = tokio::select! {
                _ = closed.cancelled() => return Err(ConnectionError::WriterClosed),
                line = self.read_line() => line?,
            };

            match Command::parse(&line) {
                Ok(Command::Leave) => {
                    debug!(session = %self.session_id, "Client sent /leave");
                    return Ok(RemovalReason::Left);
                }
                Ok(command) => self.dispatch(command).await?,
                Err(e) => {
                    debug!(session = %self.session_id, error = %e, "Malformed command");
                    self.reply(Reply::FormatError { tag: e.tag() }).await?;
                }
            }
        }
    }

    async fn read_line(&mut self) -> Result<String, ConnectionError> {
        match self.idle_timeout {
            Some(limit) => match timeout(limit, self.reader.receive_line()).await {
                Ok(line) => Ok(line?),
                Err(_) => Err(ConnectionError::IdleTimeout),
            },
            None => Ok(self.reader.receive_line().await?),
        }
    }

    /// Handles a single decoded command.
    async fn dispatch(&mut self, command: Command) -> Result<(), ConnectionError> {
        match command {
            Command::Register { handle } => self.handle_register(handle).await,
            Command::Store(descriptor) => self.handle_store(descriptor).await,
            Command::Dir => self.handle_dir().await,
            Command::Get { name } => self.handle_get(name).await,
            Command::Chat(text) => {
                let report = self.registry.broadcast(self.session_id, text).await;
                debug!(
                    session = %self.session_id,
                    delivered = report.delivered,
                    failed = report.failed,
                    "Relayed chat line"
                );
                Ok(())
            }
            Command::Leave => Ok(()),
        }
    }

    async fn handle_register(&mut self, handle: Handle) -> Result<(), ConnectionError> {
        if let Some(existing) = &self.handle {
            let reply = Reply::AlreadyRegistered {
                handle: existing.clone(),
            };
            return self.reply(reply).await;
        }

        match self
            .registry
            .register_handle(self.session_id, handle.clone())
            .await
        {
            Ok(()) => {
                info!(session = %self.session_id, handle = %handle, "Client registered");
                self.handle = Some(handle.clone());
                self.reply(Reply::Welcome { handle }).await
            }
            Err(RegistryError::HandleTaken(taken)) => {
                debug!(session = %self.session_id, handle = %taken, "Handle already taken");
                self.reply(Reply::RegistrationFailed).await
            }
            Err(RegistryError::AlreadyRegistered(existing)) => {
                self.handle = Some(existing.clone());
                self.reply(Reply::AlreadyRegistered { handle: existing }).await
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn handle_store(&mut self, descriptor: TransferDescriptor) -> Result<(), ConnectionError> {
        let name = descriptor.name.clone();

        match self.store.store(&descriptor, &mut self.reader).await {
            Ok(size) => {
                info!(
                    session = %self.session_id,
                    name = %name,
                    size,
                    "File received"
                );
                self.reply(Reply::Stored { name }).await
            }
            Err(StorageError::Transfer(e)) => {
                warn!(
                    session = %self.session_id,
                    name = %name,
                    error = %e,
                    "Upload aborted"
                );
                Err(e.into())
            }
            Err(e) => {
                warn!(
                    session = %self.session_id,
                    name = %name,
                    error = %e,
                    "Failed to store file"
                );
                self.reply(Reply::StoreFailed { name }).await
            }
        }
    }

    async fn handle_dir(&mut self) -> Result<(), ConnectionError> {
        let reply = match self.store.list().await {
            Ok(names) => Reply::listing(names),
            Err(e) => {
                warn!(session = %self.session_id, error = %e, "Failed to list directory");
                Reply::ListingUnavailable
            }
        };
        self.reply(reply).await
    }

    async fn handle_get(&mut self, name: FileName) -> Result<(), ConnectionError> {
        match self.store.open_file(&name).await {
            Ok(Some((file, size))) => {
                info!(session = %self.session_id, name = %name, size, "Sending file");
                let descriptor = TransferDescriptor::new(name, size);
                self.link
                    .send(Outbound::File { descriptor, file })
                    .await
                    .map_err(|_| ConnectionError::WriterClosed)
            }
            Ok(None) => self.reply(Reply::NotFound { name }).await,
            Err(e) => {
                warn!(session = %self.session_id, error = %e, "Failed to open file");
                self.reply(Reply::NotFound { name }).await
            }
        }
    }

    /// Queues a reply behind anything already queued for this session.
    async fn reply(&self, reply: Reply) -> Result<(), ConnectionError> {
        self.link
            .send(Outbound::reply(reply))
            .await
            .map_err(|_| ConnectionError::WriterClosed)
    }
}

/// Errors that end a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Read timeout")]
    IdleTimeout,

    #[error("Session writer closed")]
    WriterClosed,

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
}

impl ConnectionError {
    /// Removal reason recorded for a session ended by this error.
    pub fn removal_reason(&self) -> RemovalReason {
        match self {
            Self::IdleTimeout => RemovalReason::IdleTimeout,
            Self::WriterClosed => RemovalReason::SendFailed,
            Self::Channel(_) | Self::Registry(_) => RemovalReason::Disconnected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbound::run_writer;
    use crate::registry::spawn_registry;
    use relay_protocol::FrameWriter;
    use tokio::io::{duplex, DuplexStream};
    use tokio::task::JoinHandle;

    struct Harness {
        client_reader: FrameReader<tokio::io::ReadHalf<DuplexStream>>,
        client_writer: FrameWriter<tokio::io::WriteHalf<DuplexStream>>,
        task: JoinHandle<Option<RemovalReason>>,
        _dir: tempfile::TempDir,
    }

    /// Wires a handler and writer to one end of an in-memory duplex pipe.
    fn spawn_session(registry: &RegistryHandle, id: u64) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        let (client, server) = duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server);
        let (client_read, client_write) = tokio::io::split(client);

        let session_id = SessionId::new(id);
        let (link, queue) = SessionLink::new(16);
        tokio::spawn(run_writer(
            FrameWriter::new(server_write),
            queue,
            link.close_token(),
            session_id,
        ));

        let handler = ConnectionHandler::new(
            session_id,
            None,
            FrameReader::new(server_read),
            link,
            registry.clone(),
            store,
        );

        Harness {
            client_reader: FrameReader::new(client_read),
            client_writer: FrameWriter::new(client_write),
            task: tokio::spawn(handler.run()),
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn test_register_then_reregister() {
        let registry = spawn_registry(4);
        let mut h = spawn_session(&registry, 1);

        h.client_writer.send_line("/register alice").await.unwrap();
        assert_eq!(h.client_reader.receive_line().await.unwrap(), "Welcome alice!");

        h.client_writer.send_line("/register bob").await.unwrap();
        assert_eq!(
            h.client_reader.receive_line().await.unwrap(),
            "Error: You are already registered with handle 'alice'."
        );

        h.client_writer.send_line("/leave").await.unwrap();
        assert_eq!(h.task.await.unwrap(), Some(RemovalReason::Left));
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_format_error_keeps_session() {
        let registry = spawn_registry(4);
        let mut h = spawn_session(&registry, 1);

        h.client_writer.send_line("/store onlyonearg").await.unwrap();
        assert_eq!(
            h.client_reader.receive_line().await.unwrap(),
            "Error: Incorrect command format for /store. Usage: /store <filename> <size>"
        );

        h.client_writer.send_line("/dir").await.unwrap();
        assert_eq!(
            h.client_reader.receive_line().await.unwrap(),
            "Directory Listing: (empty)"
        );
    }

    #[tokio::test]
    async fn test_eof_removes_session() {
        let registry = spawn_registry(4);
        let mut h = spawn_session(&registry, 1);

        h.client_writer.shutdown().await.unwrap();
        assert_eq!(h.task.await.unwrap(), Some(RemovalReason::Disconnected));
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_full_registry_turns_client_away() {
        let registry = spawn_registry(1);
        let _first = spawn_session(&registry, 1);
        // Let the first session get admitted
        while registry.is_empty().await {
            tokio::task::yield_now().await;
        }

        let mut second = spawn_session(&registry, 2);
        assert_eq!(
            second.client_reader.receive_line().await.unwrap(),
            "Error: Server is full."
        );
        assert!(matches!(
            second.client_reader.receive_line().await,
            Err(ChannelError::Closed)
        ));
        assert_eq!(second.task.await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_idle_timeout() {
        let registry = spawn_registry(4);
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        let (_client, server) = duplex(1024);
        let (link, _queue) = SessionLink::new(4);
        let handler = ConnectionHandler::new(
            SessionId::new(1),
            None,
            FrameReader::new(server),
            link,
            registry.clone(),
            store,
        )
        .with_idle_timeout(Some(Duration::from_millis(50)));

        assert_eq!(handler.run().await, Some(RemovalReason::IdleTimeout));
    }

    #[test]
    fn test_connection_error_reasons() {
        assert_eq!(
            ConnectionError::Channel(ChannelError::Closed).removal_reason(),
            RemovalReason::Disconnected
        );
        assert_eq!(
            ConnectionError::IdleTimeout.removal_reason(),
            RemovalReason::IdleTimeout
        );
        assert_eq!(
            ConnectionError::WriterClosed.removal_reason(),
            RemovalReason::SendFailed
        );
    }
}
