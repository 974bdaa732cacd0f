//! Error types for the relay client.
//!
//! Server-side refusals (taken handle, missing file, failed store) are
//! reported as their own variants so callers can react without matching
//! on reply text.

use std::io;

use relay_core::{DomainError, Handle};
use relay_protocol::{ChannelError, Reply};
use thiserror::Error;

// ============================================================================
// Client Error Type
// ============================================================================

/// Relay client errors.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Failed to connect to the server.
    #[error("Failed to connect to server: {0}")]
    Connect(#[source] io::Error),

    /// The framed channel failed; the connection is no longer usable.
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    /// A local file could not be read or written.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// An argument was rejected before anything was sent.
    #[error("Invalid argument: {0}")]
    InvalidArgument(#[from] DomainError),

    /// This connection already registered a handle.
    #[error("Already registered as {0}")]
    AlreadyRegistered(Handle),

    /// Another session holds the requested handle.
    #[error("Handle {0} is already taken")]
    HandleTaken(Handle),

    /// The requested file does not exist on the server.
    #[error("File {0} does not exist on the server")]
    NotFound(String),

    /// The server consumed an upload but could not save it.
    #[error("Server failed to store {0}")]
    StoreFailed(String),

    /// The server turned the connection away at capacity.
    #[error("Server is full")]
    ServerFull,

    /// Any other diagnostic reply.
    #[error("Server rejected request: {0}")]
    Rejected(Reply),
}

/// Convenience Result type alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
