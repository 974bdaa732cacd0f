//! Session identity and registration value objects.

use std::fmt;
use std::net::SocketAddr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::{DomainError, DomainResult};

/// Longest handle a session may claim.
pub const MAX_HANDLE_LEN: usize = 32;

// ============================================================================
// Type-Safe Identifiers
// ============================================================================

/// Identity of one accepted connection.
///
/// Assigned by the server from a monotonically increasing counter, so two
/// sessions never share an id even if neither has registered a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(u64);

impl SessionId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

impl From<u64> for SessionId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Display name claimed by a session via `/register`.
///
/// Never empty, never contains whitespace, at most [`MAX_HANDLE_LEN`] chars.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Handle(String);

impl Handle {
    /// Validates and wraps a handle.
    pub fn new(value: impl Into<String>) -> DomainResult<Self> {
        let value = value.into();
        if value.is_empty() {
            return Err(DomainError::handle(&value, "must not be empty"));
        }
        if value.chars().any(char::is_whitespace) {
            return Err(DomainError::handle(&value, "must not contain whitespace"));
        }
        if value.chars().count() > MAX_HANDLE_LEN {
            return Err(DomainError::handle(
                &value,
                &format!("must be at most {MAX_HANDLE_LEN} characters"),
            ));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Handle {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Handle> for String {
    fn from(handle: Handle) -> Self {
        handle.0
    }
}

impl AsRef<str> for Handle {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// Session View
// ============================================================================

/// Read-only snapshot of a live session, as held by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub handle: Option<Handle>,
    pub peer: Option<SocketAddr>,
    pub connected_at: DateTime<Utc>,
}

impl SessionInfo {
    pub fn new(id: SessionId, peer: Option<SocketAddr>) -> Self {
        Self {
            id,
            handle: None,
            peer,
            connected_at: Utc::now(),
        }
    }

    /// Whether the session has bound a handle.
    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.handle.is_some()
    }

    /// Time elapsed since the connection was accepted.
    pub fn connected_for(&self) -> Duration {
        Utc::now().signed_duration_since(self.connected_at)
    }

    /// Label used in logs: the handle if bound, otherwise the connection id.
    pub fn label(&self) -> String {
        match &self.handle {
            Some(handle) => handle.to_string(),
            None => self.id.to_string(),
        }
    }
}
