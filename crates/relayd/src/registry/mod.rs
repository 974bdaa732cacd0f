//! Session registry using Actor pattern.
//!
//! The registry owns the set of live sessions: who is connected, which
//! handle each one registered, and the outbound link used to reach it.
//! Connection tasks talk to it through a [`RegistryHandle`]; the actor
//! applies commands one at a time, which is what makes handle
//! registration race-free.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌──────────────────┐
//! │ Connection task │────▶│  RegistryActor  │────▶│ Broadcast Channel│
//! └─────────────────┘     └─────────────────┘     └──────────────────┘
//!         │                       │                       │
//!         │   RegistryCommand     │   RegistryEvent       │
//!         │   (mpsc channel)      │   (broadcast)         │
//!         ▼                       ▼                       ▼
//!   Add/Register/Remove     HashMap<SessionId,      Lifecycle logging
//!   Broadcast chat          Member>
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All operations in this module follow the panic-free policy:
//! - No `.unwrap()` or `.expect()` in production code
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

use tokio::sync::{broadcast, mpsc};

mod actor;
mod commands;
mod handle;

pub use actor::{RegistryActor, MAX_SESSIONS};
pub use commands::{
    BroadcastReport, RegistryCommand, RegistryError, RegistryEvent, RemovalReason,
};
pub use handle::RegistryHandle;

/// Channel buffer sizes
const COMMAND_BUFFER: usize = 100;
const EVENT_BUFFER: usize = 100;

/// Spawn the registry actor and return a handle for interaction.
///
/// The actor stops once every handle has been dropped.
///
/// # Example
///
/// ```no_run
/// use relayd::registry::{spawn_registry, MAX_SESSIONS};
///
/// #[tokio::main]
/// async fn main() {
///     let registry = spawn_registry(MAX_SESSIONS);
///     let sessions = registry.list_sessions().await;
///     assert!(sessions.is_empty());
/// }
/// ```
pub fn spawn_registry(max_sessions: usize) -> RegistryHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
    let (event_tx, _) = broadcast::channel(EVENT_BUFFER);

    let actor = RegistryActor::new(cmd_rx, event_tx.clone(), max_sessions);
    tokio::spawn(actor.run());

    RegistryHandle::new(cmd_tx, event_tx)
}
