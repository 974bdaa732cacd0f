//! Registry actor - owns the set of live sessions and processes commands.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Channel send failures are logged but don't panic

use std::collections::HashMap;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use relay_core::{Handle, SessionId, SessionInfo};

use super::commands::{BroadcastReport, RegistryCommand, RegistryError, RegistryEvent, RemovalReason};
use crate::outbound::{Outbound, SessionLink};

/// Default maximum number of live sessions.
pub const MAX_SESSIONS: usize = 100;

/// One live session as tracked by the registry.
struct Member {
    info: SessionInfo,
    link: SessionLink,
}

/// The registry actor - owns all session membership state.
///
/// Members are keyed by connection id, not by handle: a session is tracked
/// from the moment it is accepted, before it registers anything.
///
/// # Thread Safety
///
/// The actor runs in a single task and processes commands sequentially,
/// so the handle check and the handle bind in `RegisterHandle` can never be
/// split by a concurrent registration.
pub struct RegistryActor {
    /// Command receiver
    receiver: mpsc::Receiver<RegistryCommand>,

    /// Live sessions by connection id
    members: HashMap<SessionId, Member>,

    /// Capacity limit
    max_sessions: usize,

    /// Event publisher for subscribers
    event_publisher: broadcast::Sender<RegistryEvent>,
}

impl RegistryActor {
    /// Creates a new registry actor.
    ///
    /// # Arguments
    ///
    /// * `receiver` - Channel for receiving commands
    /// * `event_publisher` - Broadcast channel for publishing events
    /// * `max_sessions` - Capacity limit for live sessions
    pub fn new(
        receiver: mpsc::Receiver<RegistryCommand>,
        event_publisher: broadcast::Sender<RegistryEvent>,
        max_sessions: usize,
    ) -> Self {
        Self {
            receiver,
            members: HashMap::new(),
            max_sessions,
            event_publisher,
        }
    }

    /// Runs the actor event loop until every handle is dropped.
    pub async fn run(mut self) {
        info!(max_sessions = self.max_sessions, "Registry actor starting");

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd);
        }

        info!(sessions = self.members.len(), "Registry actor stopped");
    }

    /// Dispatches a command to the appropriate handler.
    fn handle_command(&mut self, cmd: RegistryCommand) {
        match cmd {
            RegistryCommand::Add {
                info,
                link,
                respond_to,
            } => {
                let result = self.handle_add(info, link);
                // Ignore send error - caller may have dropped the receiver
                let _ = respond_to.send(result);
            }
            RegistryCommand::Remove {
                session_id,
                reason,
                respond_to,
            } => {
                let removed = self.handle_remove(session_id, reason);
                let _ = respond_to.send(removed);
            }
            RegistryCommand::RegisterHandle {
                session_id,
                handle,
                respond_to,
            } => {
                let result = self.handle_register_handle(session_id, handle);
                let _ = respond_to.send(result);
            }
            RegistryCommand::IsHandleTaken { handle, respond_to } => {
                let _ = respond_to.send(self.is_handle_taken(&handle));
            }
            RegistryCommand::Broadcast {
                from,
                line,
                respond_to,
            } => {
                let report = self.handle_broadcast(from, &line);
                let _ = respond_to.send(report);
            }
            RegistryCommand::ListSessions { respond_to } => {
                let mut sessions: Vec<SessionInfo> =
                    self.members.values().map(|m| m.info.clone()).collect();
                sessions.sort_by_key(|info| info.id);
                let _ = respond_to.send(sessions);
            }
            RegistryCommand::CloseAll { reason, respond_to } => {
                let _ = respond_to.send(self.handle_close_all(reason));
            }
        }
    }

    // ========================================================================
    // Command Handlers
    // ========================================================================

    fn handle_add(&mut self, info: SessionInfo, link: SessionLink) -> Result<(), RegistryError> {
        if self.members.len() >= self.max_sessions {
            warn!(
                session = %info.id,
                current = self.members.len(),
                max = self.max_sessions,
                "Registry is full, rejecting session"
            );
            return Err(RegistryError::RegistryFull {
                max: self.max_sessions,
            });
        }

        if self.members.contains_key(&info.id) {
            return Err(RegistryError::SessionAlreadyExists(info.id));
        }

        let session_id = info.id;
        let peer = info.peer;
        self.members.insert(session_id, Member { info, link });
        debug!(session = %session_id, total = self.members.len(), "Session added");

        self.publish(RegistryEvent::Joined { session_id, peer });
        Ok(())
    }

    fn handle_remove(&mut self, session_id: SessionId, reason: RemovalReason) -> bool {
        let Some(member) = self.members.remove(&session_id) else {
            return false;
        };

        if reason.is_forced() {
            member.link.close();
        }
        debug!(
            session = %member.info.label(),
            reason = %reason,
            connected_secs = member.info.connected_for().num_seconds(),
            remaining = self.members.len(),
            "Session removed"
        );

        self.publish(RegistryEvent::Left {
            session_id,
            handle: member.info.handle,
            reason,
        });
        true
    }

    fn handle_register_handle(
        &mut self,
        session_id: SessionId,
        handle: Handle,
    ) -> Result<(), RegistryError> {
        if self.is_handle_taken(&handle) {
            return Err(RegistryError::HandleTaken(handle));
        }

        let member = self
            .members
            .get_mut(&session_id)
            .ok_or(RegistryError::SessionNotFound(session_id))?;

        if let Some(existing) = &member.info.handle {
            return Err(RegistryError::AlreadyRegistered(existing.clone()));
        }

        member.info.handle = Some(handle.clone());
        self.publish(RegistryEvent::Registered { session_id, handle });
        Ok(())
    }

    fn is_handle_taken(&self, handle: &Handle) -> bool {
        self.members
            .values()
            .any(|m| m.info.handle.as_ref() == Some(handle))
    }

    /// Queues `line` to every member except `from`.
    ///
    /// A recipient whose queue is full or closed is removed; delivery to
    /// the remaining recipients continues.
    fn handle_broadcast(&mut self, from: SessionId, line: &str) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let mut failed = Vec::new();

        for (id, member) in &self.members {
            if *id == from {
                continue;
            }
            match member.link.deliver(Outbound::Line(line.to_string())) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!(
                        session = %member.info.label(),
                        error = %e,
                        "Dropping session that cannot take broadcast"
                    );
                    failed.push(*id);
                }
            }
        }

        for id in failed {
            if self.handle_remove(id, RemovalReason::SendFailed) {
                report.failed += 1;
            }
        }

        report
    }

    fn handle_close_all(&mut self, reason: RemovalReason) -> usize {
        let ids: Vec<SessionId> = self.members.keys().copied().collect();
        ids.into_iter()
            .filter(|id| self.handle_remove(*id, reason))
            .count()
    }

    fn publish(&self, event: RegistryEvent) {
        // No subscribers is fine
        let _ = self.event_publisher.send(event);
    }
}
