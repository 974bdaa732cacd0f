//! Registry actor commands, errors, and events.
//!
//! This module defines the message types for communicating with the `RegistryActor`:
//! - `RegistryCommand`: Commands sent to the actor
//! - `RegistryError`: Errors that can occur during registry operations
//! - `RegistryEvent`: Events published by the registry for subscribers

use std::net::SocketAddr;

use relay_core::{Handle, SessionId, SessionInfo};
use thiserror::Error;
use tokio::sync::oneshot;

use crate::outbound::SessionLink;

// ============================================================================
// Registry Commands
// ============================================================================

/// Commands sent to the registry actor.
///
/// Each command carries a oneshot channel for the response. The actor
/// handles commands one at a time, so every command is atomic with respect
/// to every other one.
#[derive(Debug)]
pub enum RegistryCommand {
    /// Insert a newly accepted session.
    ///
    /// # Errors
    /// - `RegistryError::RegistryFull` if at maximum capacity
    /// - `RegistryError::SessionAlreadyExists` if the id is already present
    Add {
        info: SessionInfo,
        link: SessionLink,
        respond_to: oneshot::Sender<Result<(), RegistryError>>,
    },

    /// Remove a session, closing its link on a forced removal. Idempotent;
    /// responds with whether the session was still present.
    Remove {
        session_id: SessionId,
        reason: RemovalReason,
        respond_to: oneshot::Sender<bool>,
    },

    /// Check that no other live session holds `handle`, then bind it.
    ///
    /// # Errors
    /// - `RegistryError::HandleTaken` if another session holds it
    /// - `RegistryError::AlreadyRegistered` if this session already has one
    /// - `RegistryError::SessionNotFound` if the session is gone
    RegisterHandle {
        session_id: SessionId,
        handle: Handle,
        respond_to: oneshot::Sender<Result<(), RegistryError>>,
    },

    /// Whether any live session holds `handle`.
    IsHandleTaken {
        handle: Handle,
        respond_to: oneshot::Sender<bool>,
    },

    /// Queue `line` to every live session except `from`.
    Broadcast {
        from: SessionId,
        line: String,
        respond_to: oneshot::Sender<BroadcastReport>,
    },

    /// Snapshot of all live sessions.
    ListSessions {
        respond_to: oneshot::Sender<Vec<SessionInfo>>,
    },

    /// Close and remove every session (server shutdown).
    CloseAll {
        reason: RemovalReason,
        respond_to: oneshot::Sender<usize>,
    },
}

/// Outcome of one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Recipients the line was queued to
    pub delivered: usize,
    /// Recipients that could not take the line and were removed
    pub failed: usize,
}

// ============================================================================
// Registry Errors
// ============================================================================

/// Errors that can occur during registry operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// The registry has reached its maximum session capacity.
    #[error("registry is full (max: {max} sessions)")]
    RegistryFull {
        /// Maximum number of sessions allowed
        max: usize,
    },

    /// The requested session was not found.
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    /// A session with this id already exists.
    #[error("session already exists: {0}")]
    SessionAlreadyExists(SessionId),

    /// Another live session holds the handle.
    #[error("handle already taken: {0}")]
    HandleTaken(Handle),

    /// The session already bound a handle; handles are set at most once.
    #[error("session already registered as {0}")]
    AlreadyRegistered(Handle),

    /// The response channel was closed before receiving a response.
    ///
    /// This typically indicates the actor was shut down.
    #[error("response channel closed")]
    ChannelClosed,
}

// ============================================================================
// Registry Events
// ============================================================================

/// Events published by the registry to subscribers.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// A connection was admitted.
    Joined {
        session_id: SessionId,
        peer: Option<SocketAddr>,
    },

    /// A session bound its handle.
    Registered {
        session_id: SessionId,
        handle: Handle,
    },

    /// A session was removed.
    Left {
        session_id: SessionId,
        handle: Option<Handle>,
        reason: RemovalReason,
    },
}

/// Reason why a session was removed from the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    /// Peer closed the connection or the channel failed.
    Disconnected,

    /// Client sent `/leave`.
    Left,

    /// A queued write could not be delivered to the session.
    SendFailed,

    /// No control line arrived within the idle timeout.
    IdleTimeout,

    /// The server is shutting down.
    Shutdown,
}

impl RemovalReason {
    /// Whether the session's writer is stopped immediately.
    ///
    /// On a graceful removal the writer first flushes what is already
    /// queued, then shuts the socket down.
    #[must_use]
    pub fn is_forced(&self) -> bool {
        matches!(self, Self::SendFailed | Self::IdleTimeout | Self::Shutdown)
    }
}

impl std::fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Left => write!(f, "left"),
            Self::SendFailed => write!(f, "could not keep up with outbound messages"),
            Self::IdleTimeout => write!(f, "idle timeout"),
            Self::Shutdown => write!(f, "server shutdown"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_error_display() {
        let err = RegistryError::RegistryFull { max: 100 };
        assert_eq!(err.to_string(), "registry is full (max: 100 sessions)");

        let err = RegistryError::SessionNotFound(SessionId::new(3));
        assert_eq!(err.to_string(), "session not found: conn-3");

        let err = RegistryError::HandleTaken(Handle::new("alice").unwrap());
        assert_eq!(err.to_string(), "handle already taken: alice");

        let err = RegistryError::AlreadyRegistered(Handle::new("bob").unwrap());
        assert_eq!(err.to_string(), "session already registered as bob");

        let err = RegistryError::ChannelClosed;
        assert_eq!(err.to_string(), "response channel closed");
    }

    #[test]
    fn test_removal_reason_display() {
        assert_eq!(RemovalReason::Disconnected.to_string(), "disconnected");
        assert_eq!(RemovalReason::Left.to_string(), "left");
        assert_eq!(RemovalReason::IdleTimeout.to_string(), "idle timeout");
        assert_eq!(RemovalReason::Shutdown.to_string(), "server shutdown");
    }

    #[test]
    fn test_forced_removals() {
        assert!(!RemovalReason::Disconnected.is_forced());
        assert!(!RemovalReason::Left.is_forced());
        assert!(RemovalReason::SendFailed.is_forced());
        assert!(RemovalReason::IdleTimeout.is_forced());
        assert!(RemovalReason::Shutdown.is_forced());
    }

    #[test]
    fn test_broadcast_report_default() {
        let report = BroadcastReport::default();
        assert_eq!(report.delivered, 0);
        assert_eq!(report.failed, 0);
    }
}
