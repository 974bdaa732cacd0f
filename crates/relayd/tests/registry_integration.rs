//! Integration tests for the Registry Actor.
//!
//! These tests verify the registry works correctly as a complete system,
//! testing the spawn_registry() function and RegistryHandle interface.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

use relay_core::{Handle, SessionId, SessionInfo};
use relayd::outbound::{Outbound, SessionLink};
use relayd::registry::{
    spawn_registry, BroadcastReport, RegistryError, RegistryEvent, RemovalReason, MAX_SESSIONS,
};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;

// ============================================================================
// Test Helpers
// ============================================================================

/// Adds a session and returns its link plus the queue its writer would drain.
async fn add_session(
    registry: &relayd::registry::RegistryHandle,
    id: u64,
) -> (SessionLink, mpsc::Receiver<Outbound>) {
    let (link, queue) = SessionLink::new(8);
    registry
        .add(SessionInfo::new(SessionId::new(id), None), link.clone())
        .await
        .expect("add should succeed");
    (link, queue)
}

fn handle(name: &str) -> Handle {
    Handle::new(name).unwrap()
}

async fn next_event(events: &mut broadcast::Receiver<RegistryEvent>) -> RegistryEvent {
    timeout(Duration::from_secs(1), events.recv())
        .await
        .expect("event should arrive")
        .unwrap()
}

fn expect_line(queue: &mut mpsc::Receiver<Outbound>) -> String {
    match queue.try_recv() {
        Ok(Outbound::Line(text)) => text,
        other => panic!("expected a queued line, got {other:?}"),
    }
}

// ============================================================================
// Basic Lifecycle Tests
// ============================================================================

#[tokio::test]
async fn test_basic_lifecycle() {
    let registry = spawn_registry(MAX_SESSIONS);
    let (_link, _queue) = add_session(&registry, 1).await;

    let sessions = registry.list_sessions().await;
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].id, SessionId::new(1));
    assert!(!sessions[0].is_registered());

    registry
        .register_handle(SessionId::new(1), handle("alice"))
        .await
        .unwrap();
    let sessions = registry.list_sessions().await;
    assert_eq!(sessions[0].handle, Some(handle("alice")));

    assert!(registry.remove(SessionId::new(1), RemovalReason::Left).await);
    assert!(registry.is_empty().await);
    assert!(registry.is_connected());
}

#[tokio::test]
async fn test_remove_is_idempotent() {
    let registry = spawn_registry(MAX_SESSIONS);
    let (_link, _queue) = add_session(&registry, 1).await;

    assert!(registry.remove(SessionId::new(1), RemovalReason::Disconnected).await);
    assert!(!registry.remove(SessionId::new(1), RemovalReason::Disconnected).await);
    assert!(!registry.remove(SessionId::new(42), RemovalReason::Left).await);
}

#[tokio::test]
async fn test_graceful_remove_leaves_link_open() {
    let registry = spawn_registry(MAX_SESSIONS);
    let (link, _queue) = add_session(&registry, 1).await;

    registry.remove(SessionId::new(1), RemovalReason::Left).await;
    assert!(!link.is_closed());

    let (forced, _queue2) = add_session(&registry, 2).await;
    registry.remove(SessionId::new(2), RemovalReason::IdleTimeout).await;
    assert!(forced.is_closed());
}

#[tokio::test]
async fn test_capacity_limit() {
    let registry = spawn_registry(2);
    let (_a, _qa) = add_session(&registry, 1).await;
    let (_b, _qb) = add_session(&registry, 2).await;

    let (link, _qc) = SessionLink::new(8);
    let err = registry
        .add(SessionInfo::new(SessionId::new(3), None), link)
        .await
        .unwrap_err();
    assert_eq!(err, RegistryError::RegistryFull { max: 2 });

    // A slot frees up once someone leaves
    registry.remove(SessionId::new(1), RemovalReason::Left).await;
    let (_c, _qc) = add_session(&registry, 3).await;
    assert_eq!(registry.len().await, 2);
}

// ============================================================================
// Handle Registration
// ============================================================================

#[tokio::test]
async fn test_concurrent_register_same_handle() {
    let registry = spawn_registry(MAX_SESSIONS);
    let mut links = Vec::new();
    for id in 1..=20 {
        links.push(add_session(&registry, id).await);
    }

    let attempts: Vec<_> = (1..=20)
        .map(|id| {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .register_handle(SessionId::new(id), handle("zoe"))
                    .await
            })
        })
        .collect();

    let mut winners = 0;
    for attempt in attempts {
        match attempt.await.unwrap() {
            Ok(()) => winners += 1,
            Err(RegistryError::HandleTaken(taken)) => assert_eq!(taken, handle("zoe")),
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(winners, 1);
    assert!(registry.is_handle_taken(handle("zoe")).await);
}

#[tokio::test]
async fn test_handle_released_on_remove() {
    let registry = spawn_registry(MAX_SESSIONS);
    let (_a, _qa) = add_session(&registry, 1).await;
    let (_b, _qb) = add_session(&registry, 2).await;

    registry
        .register_handle(SessionId::new(1), handle("alice"))
        .await
        .unwrap();
    registry.remove(SessionId::new(1), RemovalReason::Disconnected).await;
    assert!(!registry.is_handle_taken(handle("alice")).await);

    registry
        .register_handle(SessionId::new(2), handle("alice"))
        .await
        .unwrap();
}

// ============================================================================
// Broadcast Tests
// ============================================================================

#[tokio::test]
async fn test_broadcast_excludes_sender() {
    let registry = spawn_registry(MAX_SESSIONS);
    let (_a, mut qa) = add_session(&registry, 1).await;
    let (_b, mut qb) = add_session(&registry, 2).await;
    let (_c, mut qc) = add_session(&registry, 3).await;

    let report = registry.broadcast(SessionId::new(2), "hi".to_string()).await;
    assert_eq!(report, BroadcastReport { delivered: 2, failed: 0 });

    assert_eq!(expect_line(&mut qa), "hi");
    assert_eq!(expect_line(&mut qc), "hi");
    assert!(qb.try_recv().is_err());
}

#[tokio::test]
async fn test_broadcast_full_queue_drops_recipient() {
    let registry = spawn_registry(MAX_SESSIONS);
    let (_a, _qa) = add_session(&registry, 1).await;

    let (slow, _slow_queue) = SessionLink::new(1);
    registry
        .add(SessionInfo::new(SessionId::new(2), None), slow.clone())
        .await
        .unwrap();
    let (_c, mut qc) = add_session(&registry, 3).await;

    let first = registry.broadcast(SessionId::new(1), "one".to_string()).await;
    assert_eq!(first, BroadcastReport { delivered: 2, failed: 0 });

    let second = registry.broadcast(SessionId::new(1), "two".to_string()).await;
    assert_eq!(second, BroadcastReport { delivered: 1, failed: 1 });

    assert!(slow.is_closed());
    assert_eq!(registry.len().await, 2);
    assert_eq!(expect_line(&mut qc), "one");
    assert_eq!(expect_line(&mut qc), "two");
}

#[tokio::test]
async fn test_close_all() {
    let registry = spawn_registry(MAX_SESSIONS);
    let (a, _qa) = add_session(&registry, 1).await;
    let (b, _qb) = add_session(&registry, 2).await;

    assert_eq!(registry.close_all(RemovalReason::Shutdown).await, 2);
    assert!(a.is_closed());
    assert!(b.is_closed());
    assert!(registry.is_empty().await);
}

// ============================================================================
// Event Subscription
// ============================================================================

#[tokio::test]
async fn test_event_subscription() {
    let registry = spawn_registry(MAX_SESSIONS);
    let mut events = registry.subscribe();

    let (_link, _queue) = add_session(&registry, 7).await;
    registry
        .register_handle(SessionId::new(7), handle("eve"))
        .await
        .unwrap();
    registry.remove(SessionId::new(7), RemovalReason::Left).await;

    assert!(matches!(
        next_event(&mut events).await,
        RegistryEvent::Joined { session_id, .. } if session_id == SessionId::new(7)
    ));
    assert!(matches!(
        next_event(&mut events).await,
        RegistryEvent::Registered { handle: h, .. } if h == handle("eve")
    ));
    assert!(matches!(
        next_event(&mut events).await,
        RegistryEvent::Left { reason: RemovalReason::Left, handle: Some(_), .. }
    ));
}
