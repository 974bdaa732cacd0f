//! Relay Core - Shared types for the relay chat and file server
//!
//! This crate provides the core domain types shared between
//! the daemon (relayd), the wire protocol and the client library.
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod error;
pub mod session;
pub mod transfer;

// Re-exports for convenience
pub use error::{DomainError, DomainResult};
pub use session::{Handle, SessionId, SessionInfo, MAX_HANDLE_LEN};
pub use transfer::{FileName, TransferDescriptor};
