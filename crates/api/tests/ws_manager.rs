//! Unit tests for `WsManager`.
//!
//! These exercise the connection manager directly, without any HTTP
//! upgrade: add/remove bookkeeping, broadcast delivery and shutdown.

use axum::extract::ws::Message;
use flowgate_api::ws::WsManager;

const SUBJECT: &str = "worker:SHARED";

// ---------------------------------------------------------------------------
// Test: add/remove bookkeeping
// ---------------------------------------------------------------------------

#[tokio::test]
async fn new_manager_has_zero_connections() {
    let manager = WsManager::new();

    assert_eq!(manager.connection_count().await, 0);
}

#[tokio::test]
async fn add_and_remove_track_connection_count() {
    let manager = WsManager::new();

    let _rx = manager.add("conn-1".to_string(), SUBJECT.to_string()).await;
    assert_eq!(manager.connection_count().await, 1);

    manager.remove("conn-1").await;
    assert_eq!(manager.connection_count().await, 0);
}

#[tokio::test]
async fn remove_unknown_id_is_noop() {
    let manager = WsManager::new();

    let _rx = manager.add("conn-1".to_string(), SUBJECT.to_string()).await;
    manager.remove("nonexistent").await;

    assert_eq!(manager.connection_count().await, 1);
}

// ---------------------------------------------------------------------------
// Test: broadcast reaches every live connection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn broadcast_reaches_all_connections() {
    let manager = WsManager::new();
    let mut rx1 = manager.add("conn-1".to_string(), SUBJECT.to_string()).await;
    let mut rx2 = manager.add("conn-2".to_string(), SUBJECT.to_string()).await;

    let delivered = manager.broadcast(Message::Text("hello".into())).await;

    assert_eq!(delivered, 2);
    for rx in [&mut rx1, &mut rx2] {
        let msg = rx.try_recv().expect("should have a message");
        assert!(matches!(msg, Message::Text(ref t) if t.as_str() == "hello"));
    }
}

#[tokio::test]
async fn broadcast_skips_closed_receivers() {
    let manager = WsManager::new();
    let rx1 = manager.add("conn-1".to_string(), SUBJECT.to_string()).await;
    let _rx2 = manager.add("conn-2".to_string(), SUBJECT.to_string()).await;
    drop(rx1);

    let delivered = manager.broadcast(Message::Text("hello".into())).await;

    assert_eq!(delivered, 1);
}

// ---------------------------------------------------------------------------
// Test: shutdown_all() sends Close and clears all connections
// ---------------------------------------------------------------------------

#[tokio::test]
async fn shutdown_all_sends_close_and_clears() {
    let manager = WsManager::new();
    let mut rx1 = manager.add("conn-1".to_string(), SUBJECT.to_string()).await;
    let mut rx2 = manager.add("conn-2".to_string(), SUBJECT.to_string()).await;

    manager.shutdown_all().await;

    assert_eq!(manager.connection_count().await, 0);
    assert!(matches!(rx1.try_recv(), Ok(Message::Close(None))));
    assert!(matches!(rx2.try_recv(), Ok(Message::Close(None))));
}

#[tokio::test]
async fn ping_all_sends_ping() {
    let manager = WsManager::new();
    let mut rx = manager.add("conn-1".to_string(), SUBJECT.to_string()).await;

    manager.ping_all().await;

    assert!(matches!(rx.try_recv(), Ok(Message::Ping(_))));
}
