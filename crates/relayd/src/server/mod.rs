//! TCP server for the relay daemon.
//!
//! The server:
//! - Listens on a TCP port for client connections
//! - Spawns a writer task and a `ConnectionHandler` for each client
//! - Logs registry membership events
//! - Supports graceful shutdown via CancellationToken
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   RelayServer   │
//! │                 │
//! │   TcpListener   │
//! └───────┬─────────┘
//!         │ accept()
//!         ▼
//! ┌─────────────────┐     ┌─────────────────┐
//! │ConnectionHandler│────▶│  RegistryHandle │
//! │   (read half)   │     │                 │
//! └───────┬─────────┘     └────────┬────────┘
//!         │ replies                │ broadcast
//!         ▼                        ▼
//! ┌─────────────────────────────────────────┐
//! │   SessionLink ──▶ writer task (write    │
//! │   half, one per client)                 │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Accept errors are logged and allow continued operation

mod connection;

pub use connection::{ConnectionError, ConnectionHandler};

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use relay_core::SessionId;
use relay_protocol::{FrameReader, FrameWriter};

use crate::config::ServerConfig;
use crate::outbound::{run_writer, SessionLink, OUTBOUND_BUFFER};
use crate::registry::{RegistryEvent, RegistryHandle, RemovalReason};
use crate::storage::{FileStore, StorageError};

/// TCP server for the relay daemon.
pub struct RelayServer {
    /// Bound listener
    listener: TcpListener,

    /// Address the listener actually bound (resolves port 0)
    local_addr: SocketAddr,

    /// Handle to the session registry
    registry: RegistryHandle,

    /// The server directory
    store: FileStore,

    /// Cancellation token for graceful shutdown
    cancel_token: CancellationToken,

    /// Connection counter for generating session ids
    connection_counter: AtomicU64,

    /// Per-line read deadline handed to each connection
    idle_timeout: Option<Duration>,

    /// Time in-flight sessions get to finish on shutdown
    shutdown_grace: Duration,

    /// Tracks every per-connection task
    tracker: TaskTracker,
}

impl RelayServer {
    /// Opens the server directory and binds the listener.
    ///
    /// # Arguments
    ///
    /// * `config` - Resolved server settings
    /// * `registry` - Handle to the session registry
    /// * `cancel_token` - Token for graceful shutdown
    ///
    /// # Errors
    ///
    /// - `ServerError::Storage` if the root directory is unusable
    /// - `ServerError::Bind` if the address cannot be bound
    pub async fn bind(
        config: &ServerConfig,
        registry: RegistryHandle,
        cancel_token: CancellationToken,
    ) -> Result<Self, ServerError> {
        let store = FileStore::open(&config.root)?;

        let addr = config.addr();
        let bind_error = |error| ServerError::Bind { addr, error };
        let listener = TcpListener::bind(addr).await.map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;

        Ok(Self {
            listener,
            local_addr,
            registry,
            store,
            cancel_token,
            connection_counter: AtomicU64::new(0),
            idle_timeout: config.idle_timeout,
            shutdown_grace: config.shutdown_grace,
            tracker: TaskTracker::new(),
        })
    }

    /// Returns the bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Runs the server.
    ///
    /// Accepts connections until the cancellation token is triggered, then
    /// closes the listener and gives in-flight sessions the shutdown grace
    /// period before closing whatever is left.
    pub async fn run(self) -> Result<(), ServerError> {
        info!(
            addr = %self.local_addr,
            root = %self.store.root().display(),
            "Relay server listening"
        );

        self.spawn_event_logger();

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!("Server shutdown requested");
                    break;
                }

                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => self.handle_connection(stream, peer),
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                            // Continue accepting other connections
                        }
                    }
                }
            }
        }

        drop(self.listener);
        self.tracker.close();

        if timeout(self.shutdown_grace, self.tracker.wait()).await.is_err() {
            let closed = self.registry.close_all(RemovalReason::Shutdown).await;
            info!(closed, "Closed remaining sessions");

            if timeout(self.shutdown_grace, self.tracker.wait()).await.is_err() {
                warn!(
                    remaining = self.tracker.len(),
                    "Sessions still busy after shutdown, abandoning them"
                );
            }
        }

        info!("Server stopped");
        Ok(())
    }

    /// Handles a new client connection by spawning its writer and handler.
    fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let conn_num = self.connection_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let session_id = SessionId::new(conn_num);

        if let Err(e) = stream.set_nodelay(true) {
            debug!(session = %session_id, error = %e, "Failed to set TCP_NODELAY");
        }

        let (reader, writer) = stream.into_split();
        let (link, queue) = SessionLink::new(OUTBOUND_BUFFER);

        self.tracker.spawn(run_writer(
            FrameWriter::new(writer),
            queue,
            link.close_token(),
            session_id,
        ));

        let handler = ConnectionHandler::new(
            session_id,
            Some(peer),
            FrameReader::new(reader),
            link,
            self.registry.clone(),
            self.store.clone(),
        )
        .with_idle_timeout(self.idle_timeout);

        self.tracker.spawn(handler.run());
    }

    /// Spawns the task that logs registry membership changes.
    fn spawn_event_logger(&self) {
        let mut event_rx = self.registry.subscribe();
        let cancel_token = self.cancel_token.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        debug!("Event logger shutting down");
                        break;
                    }

                    result = event_rx.recv() => {
                        match result {
                            Ok(event) => log_event(&event),
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                warn!(skipped = n, "Event logger lagged, skipped events");
                            }
                            Err(broadcast::error::RecvError::Closed) => {
                                debug!("Event channel closed");
                                break;
                            }
                        }
                    }
                }
            }
        });
    }
}

fn log_event(event: &RegistryEvent) {
    match event {
        RegistryEvent::Joined { session_id, peer } => {
            info!(session = %session_id, peer = ?peer, "Session joined");
        }
        RegistryEvent::Registered { session_id, handle } => {
            info!(session = %session_id, handle = %handle, "Session registered handle");
        }
        RegistryEvent::Left {
            session_id,
            handle,
            reason,
        } => {
            info!(
                session = %session_id,
                handle = ?handle,
                reason = %reason,
                "Session left"
            );
        }
    }
}

/// Errors that can occur in server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {error}")]
    Bind { addr: SocketAddr, error: io::Error },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}
