//! Presence lifecycle through the engine surface.
//!
//! Sessions move between Online, Away, and Offline as sweeps apply the
//! timeout rules; every transition fans out to the room. These tests
//! run against the shortened `for_testing` windows (away 50ms, offline
//! 200ms, linger 100ms) with real sleeps.

use fable_collab::{
    CollabEngine, EngineConfig, Envelope, MemoryStore, MessageBody, Operation, SessionStatus,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::{timeout, Duration};
use uuid::Uuid;

fn test_engine() -> Arc<CollabEngine> {
    Arc::new(CollabEngine::new(
        EngineConfig::for_testing(),
        Arc::new(MemoryStore::new()),
    ))
}

async fn join(engine: &CollabEngine, room_id: Uuid, user_id: Uuid, name: &str) {
    engine
        .handle(Envelope::join(room_id, user_id, name))
        .await
        .unwrap()
        .unwrap();
}

/// Receive broadcast envelopes until one is a presence change, or
/// panic after a second of silence.
async fn next_presence_change(
    rx: &mut broadcast::Receiver<Arc<Vec<u8>>>,
) -> (Uuid, SessionStatus, SessionStatus) {
    loop {
        let bytes = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("presence change within timeout")
            .expect("channel open");
        let envelope = Envelope::decode(&bytes).unwrap();
        if let MessageBody::PresenceChanged { session, old, new } = envelope.body {
            return (session.user_id, old, new);
        }
    }
}

// ─── Status lifecycle ────────────────────────────────────────────

#[tokio::test]
async fn test_full_lifecycle_under_sweeps() {
    let engine = test_engine();
    let room_id = Uuid::new_v4();
    let alice = Uuid::new_v4();

    join(&engine, room_id, alice, "Alice").await;
    let room = engine.room(room_id).await.unwrap();
    let mut rx = room.subscribe();

    // Heartbeats keep flowing but no activity: Away after 50ms.
    tokio::time::sleep(Duration::from_millis(80)).await;
    engine
        .handle(Envelope::heartbeat(room_id, alice))
        .await
        .unwrap();
    engine.sweep_rooms().await;
    let (user, old, new) = next_presence_change(&mut rx).await;
    assert_eq!(user, alice);
    assert_eq!(old, SessionStatus::Online);
    assert_eq!(new, SessionStatus::Away);

    // Heartbeats stop too: Offline after 200ms of silence.
    tokio::time::sleep(Duration::from_millis(220)).await;
    engine.sweep_rooms().await;
    let (_, _, new) = next_presence_change(&mut rx).await;
    assert_eq!(new, SessionStatus::Offline);
    assert_eq!(room.sessions().len(), 0, "offline sessions are not active");

    // Linger (100ms) expires: the session is forgotten entirely, and
    // once the last receiver detaches the room closes.
    tokio::time::sleep(Duration::from_millis(120)).await;
    engine.sweep_rooms().await;
    assert_eq!(room.session_count(), 0);

    drop(rx);
    let closed = engine.sweep_rooms().await;
    assert_eq!(closed, 1);
    assert_eq!(engine.room_count().await, 0);
}

#[tokio::test]
async fn test_heartbeat_readmits_offline_session_as_away() {
    let engine = test_engine();
    let room_id = Uuid::new_v4();
    let alice = Uuid::new_v4();

    join(&engine, room_id, alice, "Alice").await;
    let room = engine.room(room_id).await.unwrap();
    let mut rx = room.subscribe();

    // Total silence past the offline window.
    tokio::time::sleep(Duration::from_millis(220)).await;
    engine.sweep_rooms().await;
    let (_, old, new) = next_presence_change(&mut rx).await;
    assert_eq!(old, SessionStatus::Online);
    assert_eq!(new, SessionStatus::Offline);

    // The connection comes back but the participant is still idle:
    // re-admitted, not promoted.
    engine
        .handle(Envelope::heartbeat(room_id, alice))
        .await
        .unwrap();
    let (_, old, new) = next_presence_change(&mut rx).await;
    assert_eq!(old, SessionStatus::Offline);
    assert_eq!(new, SessionStatus::Away);
    assert_eq!(room.sessions().len(), 1);
    assert_eq!(room.sessions()[0].status, SessionStatus::Away);
}

#[tokio::test]
async fn test_cursor_revives_away_session() {
    let engine = test_engine();
    let room_id = Uuid::new_v4();
    let alice = Uuid::new_v4();

    join(&engine, room_id, alice, "Alice").await;
    let room = engine.room(room_id).await.unwrap();
    let mut rx = room.subscribe();

    tokio::time::sleep(Duration::from_millis(80)).await;
    engine.sweep_rooms().await;
    let (_, _, new) = next_presence_change(&mut rx).await;
    assert_eq!(new, SessionStatus::Away);

    // Moving the cursor is real activity.
    engine
        .handle(Envelope::cursor(room_id, alice, 5, None))
        .await
        .unwrap();
    let (_, old, new) = next_presence_change(&mut rx).await;
    assert_eq!(old, SessionStatus::Away);
    assert_eq!(new, SessionStatus::Online);

    // The cursor itself also went out.
    let bytes = timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    let envelope = Envelope::decode(&bytes).unwrap();
    match envelope.body {
        MessageBody::Cursor { position, .. } => assert_eq!(position, 5),
        other => panic!("expected Cursor, got {:?}", other.kind()),
    }
}

#[tokio::test]
async fn test_leave_broadcasts_offline() {
    let engine = test_engine();
    let room_id = Uuid::new_v4();
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();

    join(&engine, room_id, alice, "Alice").await;
    join(&engine, room_id, bob, "Bob").await;
    let room = engine.room(room_id).await.unwrap();
    let mut rx = room.subscribe();

    engine.handle(Envelope::leave(room_id, bob)).await.unwrap();
    let (user, old, new) = next_presence_change(&mut rx).await;
    assert_eq!(user, bob);
    assert_eq!(old, SessionStatus::Online);
    assert_eq!(new, SessionStatus::Offline);
    assert_eq!(room.session_count(), 1);
}

// ─── Roster behavior ─────────────────────────────────────────────

#[tokio::test]
async fn test_rejoin_refreshes_display_name_without_event() {
    let engine = test_engine();
    let room_id = Uuid::new_v4();
    let alice = Uuid::new_v4();

    join(&engine, room_id, alice, "Alish").await;
    let room = engine.room(room_id).await.unwrap();
    let mut rx = room.subscribe();

    join(&engine, room_id, alice, "Alice").await;
    assert_eq!(room.session_count(), 1);
    assert_eq!(room.sessions()[0].display_name, "Alice");

    // Already online; the rejoin is not a transition.
    assert!(matches!(
        rx.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    ));
}

#[tokio::test]
async fn test_presence_is_per_room() {
    let engine = test_engine();
    let room_a = Uuid::new_v4();
    let room_b = Uuid::new_v4();
    let alice = Uuid::new_v4();

    join(&engine, room_a, alice, "Alice").await;
    join(&engine, room_b, alice, "Alice").await;

    engine.handle(Envelope::leave(room_a, alice)).await.unwrap();

    assert_eq!(engine.room(room_a).await.unwrap().session_count(), 0);
    assert_eq!(engine.room(room_b).await.unwrap().session_count(), 1);
}

// ─── Engagement ──────────────────────────────────────────────────

#[tokio::test]
async fn test_engagement_grows_with_edits() {
    let engine = test_engine();
    let room_id = Uuid::new_v4();
    let alice = Uuid::new_v4();

    join(&engine, room_id, alice, "Alice").await;
    let room = engine.room(room_id).await.unwrap();

    let fresh = room.sessions()[0].engagement;

    for i in 0..30u64 {
        engine
            .handle(Envelope::change(
                room_id,
                alice,
                Operation::insert(alice, 0, "x", i),
            ))
            .await
            .unwrap();
    }

    let engaged = room.sessions()[0].engagement;
    assert!(
        engaged > fresh,
        "thirty edits should raise engagement ({fresh} -> {engaged})"
    );
    // 0.4 recency + 0.4 * 30/100 volume, plus a sliver of tenure.
    assert!((0.50..0.56).contains(&engaged), "got {engaged}");
}
