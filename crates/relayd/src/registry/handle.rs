//! Client interface for interacting with the RegistryActor.
//!
//! The `RegistryHandle` provides a cheap-to-clone interface for sending commands
//! to the registry actor and subscribing to membership events.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Channel errors are mapped to `RegistryError::ChannelClosed`

use tokio::sync::{broadcast, mpsc, oneshot};

use relay_core::{Handle, SessionId, SessionInfo};

use super::commands::{
    BroadcastReport, RegistryCommand, RegistryError, RegistryEvent, RemovalReason,
};
use crate::outbound::SessionLink;

// ============================================================================
// Registry Handle
// ============================================================================

/// Handle for interacting with the registry actor.
///
/// This is a cheap-to-clone handle that can be shared across tasks.
///
/// # Usage
///
/// ```ignore
/// let registry = spawn_registry(MAX_SESSIONS);
///
/// registry.add(info, link).await?;
/// registry.register_handle(session_id, handle).await?;
/// registry.broadcast(session_id, "hello".to_string()).await;
///
/// let mut events = registry.subscribe();
/// while let Ok(event) = events.recv().await {
///     // Handle event
/// }
/// ```
#[derive(Clone)]
pub struct RegistryHandle {
    /// Command sender to the actor
    sender: mpsc::Sender<RegistryCommand>,

    /// Event broadcaster for subscribing to updates
    event_sender: broadcast::Sender<RegistryEvent>,
}

impl RegistryHandle {
    /// Create a new registry handle.
    pub fn new(
        sender: mpsc::Sender<RegistryCommand>,
        event_sender: broadcast::Sender<RegistryEvent>,
    ) -> Self {
        Self {
            sender,
            event_sender,
        }
    }

    /// Admit a newly accepted session.
    ///
    /// # Errors
    ///
    /// - `RegistryError::RegistryFull` if the registry is at maximum capacity
    /// - `RegistryError::SessionAlreadyExists` if a session with this id exists
    /// - `RegistryError::ChannelClosed` if the actor has shut down
    pub async fn add(&self, info: SessionInfo, link: SessionLink) -> Result<(), RegistryError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(RegistryCommand::Add {
                info,
                link,
                respond_to: tx,
            })
            .await
            .map_err(|_| RegistryError::ChannelClosed)?;

        rx.await.map_err(|_| RegistryError::ChannelClosed)?
    }

    /// Remove a session. A forced `reason` also closes its link at once;
    /// otherwise the session's writer drains its queue before closing.
    ///
    /// Returns `true` if the session was present. Removing an absent session
    /// (or talking to a stopped actor) returns `false`.
    pub async fn remove(&self, session_id: SessionId, reason: RemovalReason) -> bool {
        let (tx, rx) = oneshot::channel();

        if self
            .sender
            .send(RegistryCommand::Remove {
                session_id,
                reason,
                respond_to: tx,
            })
            .await
            .is_err()
        {
            return false;
        }

        rx.await.unwrap_or(false)
    }

    /// Bind `handle` to a session, atomically with the uniqueness check.
    ///
    /// # Errors
    ///
    /// - `RegistryError::HandleTaken` if another live session holds the handle
    /// - `RegistryError::AlreadyRegistered` if the session already has a handle
    /// - `RegistryError::SessionNotFound` if the session was removed
    /// - `RegistryError::ChannelClosed` if the actor has shut down
    pub async fn register_handle(
        &self,
        session_id: SessionId,
        handle: Handle,
    ) -> Result<(), RegistryError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(RegistryCommand::RegisterHandle {
                session_id,
                handle,
                respond_to: tx,
            })
            .await
            .map_err(|_| RegistryError::ChannelClosed)?;

        rx.await.map_err(|_| RegistryError::ChannelClosed)?
    }

    /// Whether any live session currently holds `handle`.
    ///
    /// Only a snapshot; use [`register_handle`](Self::register_handle) to
    /// claim a handle.
    pub async fn is_handle_taken(&self, handle: Handle) -> bool {
        let (tx, rx) = oneshot::channel();

        if self
            .sender
            .send(RegistryCommand::IsHandleTaken {
                handle,
                respond_to: tx,
            })
            .await
            .is_err()
        {
            return false;
        }

        rx.await.unwrap_or(false)
    }

    /// Queue `line` to every live session except `from`.
    ///
    /// Recipients that cannot take the line are removed; the report counts
    /// both outcomes. A stopped actor yields an empty report.
    pub async fn broadcast(&self, from: SessionId, line: String) -> BroadcastReport {
        let (tx, rx) = oneshot::channel();

        if self
            .sender
            .send(RegistryCommand::Broadcast {
                from,
                line,
                respond_to: tx,
            })
            .await
            .is_err()
        {
            return BroadcastReport::default();
        }

        rx.await.unwrap_or_default()
    }

    /// Snapshot of all live sessions, ordered by connection id.
    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        let (tx, rx) = oneshot::channel();

        if self
            .sender
            .send(RegistryCommand::ListSessions { respond_to: tx })
            .await
            .is_err()
        {
            return Vec::new();
        }

        rx.await.unwrap_or_default()
    }

    /// Number of live sessions.
    pub async fn len(&self) -> usize {
        self.list_sessions().await.len()
    }

    /// Whether no sessions are live.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Close and remove every session. Returns how many were removed.
    pub async fn close_all(&self, reason: RemovalReason) -> usize {
        let (tx, rx) = oneshot::channel();

        if self
            .sender
            .send(RegistryCommand::CloseAll {
                reason,
                respond_to: tx,
            })
            .await
            .is_err()
        {
            return 0;
        }

        rx.await.unwrap_or(0)
    }

    /// Subscribe to membership events.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_sender.subscribe()
    }

    /// Whether the actor is still accepting commands.
    pub fn is_connected(&self) -> bool {
        !self.sender.is_closed()
    }
}
