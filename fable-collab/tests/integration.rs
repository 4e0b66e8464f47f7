//! End-to-end tests through the engine surface.
//!
//! These tests drive full sessions the way a transport would: join
//! envelopes in, direct replies back, broadcast receivers pumped for
//! everything room-wide. No sockets; the engine is the system under
//! test.

use fable_collab::{
    CollabEngine, EngineConfig, Envelope, FileStore, MemoryStore, MessageBody, MessageKind,
    OpKind, Operation, RoomChannel,
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

/// Join a room and unpack the acknowledged state.
async fn join(engine: &CollabEngine, room_id: Uuid, user_id: Uuid, name: &str) -> (String, u64) {
    let reply = engine
        .handle(Envelope::join(room_id, user_id, name))
        .await
        .unwrap()
        .unwrap();
    match reply.body {
        MessageBody::JoinAck {
            content,
            head_version,
            ..
        } => (content, head_version),
        other => panic!("expected JoinAck, got {:?}", other.kind()),
    }
}

/// Receive and decode the next broadcast envelope, or panic after a
/// second of silence.
async fn recv_envelope(rx: &mut broadcast::Receiver<Arc<Vec<u8>>>) -> Envelope {
    let bytes = timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("broadcast within timeout")
        .expect("channel open");
    Envelope::decode(&bytes).unwrap()
}

// ─── Convergence ─────────────────────────────────────────────────

#[tokio::test]
async fn test_two_participants_converge() {
    let engine = test_engine();
    let room_id = Uuid::new_v4();
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();

    join(&engine, room_id, alice, "Alice").await;
    let (content, head) = join(&engine, room_id, bob, "Bob").await;
    assert_eq!(content, "");
    assert_eq!(head, 0);

    engine
        .handle(Envelope::change(
            room_id,
            alice,
            Operation::insert(alice, 0, "hello world", 0),
        ))
        .await
        .unwrap();

    // Concurrent edits, both based on version 1.
    engine
        .handle(Envelope::change(
            room_id,
            alice,
            Operation::insert(alice, 0, ">> ", 1),
        ))
        .await
        .unwrap();
    engine
        .handle(Envelope::change(
            room_id,
            bob,
            Operation::insert(bob, 5, ",", 1),
        ))
        .await
        .unwrap();

    // Bob's comma followed "hello" under Alice's prefix.
    let room = engine.room(room_id).await.unwrap();
    assert_eq!(room.content().await, ">> hello, world");
    assert_eq!(room.head_version().await, 3);
}

#[tokio::test]
async fn test_committed_stream_replays_to_server_state() {
    let engine = test_engine();
    let room_id = Uuid::new_v4();
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();

    join(&engine, room_id, alice, "Alice").await;
    join(&engine, room_id, bob, "Bob").await;
    let room = engine.room(room_id).await.unwrap();
    let mut rx = room.subscribe();

    let edits = vec![
        Envelope::change(room_id, alice, Operation::insert(alice, 0, "the quick fox", 0)),
        Envelope::change(room_id, bob, Operation::insert(bob, 9, " brown", 1)),
        Envelope::change(room_id, alice, Operation::delete(alice, 0, 4, 2)),
        Envelope::change(room_id, bob, Operation::update(bob, 6, 5, "red", 3)),
    ];
    for edit in edits {
        engine.handle(edit).await.unwrap();
    }

    // A client that splices every committed record in commit order
    // lands on the server's text.
    let mut mirror = String::new();
    let mut seen = 0;
    while seen < 4 {
        let envelope = recv_envelope(&mut rx).await;
        let ops = match envelope.body {
            MessageBody::Committed { ops } => ops,
            _ => continue,
        };
        seen += 1;
        for op in ops {
            let at = mirror
                .char_indices()
                .map(|(i, _)| i)
                .chain([mirror.len()])
                .nth(op.position)
                .unwrap();
            match op.kind {
                OpKind::Insert => mirror.insert_str(at, &op.content),
                OpKind::Delete => {
                    let end = mirror
                        .char_indices()
                        .map(|(i, _)| i)
                        .chain([mirror.len()])
                        .nth(op.position + op.length)
                        .unwrap();
                    mirror.replace_range(at..end, "");
                }
                OpKind::Update => {
                    let end = mirror
                        .char_indices()
                        .map(|(i, _)| i)
                        .chain([mirror.len()])
                        .nth(op.position + op.length)
                        .unwrap();
                    mirror.replace_range(at..end, &op.content);
                }
            }
        }
    }

    assert_eq!(mirror, room.content().await);
    assert_eq!(mirror, "quick red fox");
}

#[tokio::test]
async fn test_batch_applies_in_order() {
    let engine = test_engine();
    let room_id = Uuid::new_v4();
    let alice = Uuid::new_v4();

    join(&engine, room_id, alice, "Alice").await;
    let room = engine.room(room_id).await.unwrap();
    let mut rx = room.subscribe();

    let ops = vec![
        Operation::insert(alice, 0, "a", 0),
        Operation::insert(alice, 1, "b", 1),
        Operation::insert(alice, 2, "c", 2),
    ];
    let reply = engine
        .handle(Envelope::batch(room_id, alice, ops))
        .await
        .unwrap();
    assert!(reply.is_none());
    assert_eq!(room.content().await, "abc");

    let committed = recv_envelope(&mut rx).await;
    match committed.body {
        MessageBody::Committed { ops } => {
            assert_eq!(ops.len(), 3);
            assert_eq!(
                ops.iter().map(|op| op.global_version).collect::<Vec<_>>(),
                vec![Some(1), Some(2), Some(3)]
            );
        }
        other => panic!("expected Committed, got {:?}", other.kind()),
    }
}

// ─── Room isolation ──────────────────────────────────────────────

#[tokio::test]
async fn test_rooms_are_isolated() {
    let engine = test_engine();
    let room_a = Uuid::new_v4();
    let room_b = Uuid::new_v4();
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();

    join(&engine, room_a, alice, "Alice").await;
    join(&engine, room_b, bob, "Bob").await;

    let mut rx_a = engine.room(room_a).await.unwrap().subscribe();

    engine
        .handle(Envelope::change(
            room_b,
            bob,
            Operation::insert(bob, 0, "only room b", 0),
        ))
        .await
        .unwrap();

    let silent = timeout(Duration::from_millis(100), rx_a.recv()).await;
    assert!(silent.is_err(), "room A must not see room B's commits");
    assert_eq!(engine.room(room_a).await.unwrap().content().await, "");
}

// ─── Undo across participants ────────────────────────────────────

#[tokio::test]
async fn test_undo_reaches_other_participants() {
    let engine = test_engine();
    let room_id = Uuid::new_v4();
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();

    join(&engine, room_id, alice, "Alice").await;
    join(&engine, room_id, bob, "Bob").await;

    engine
        .handle(Envelope::change(
            room_id,
            alice,
            Operation::insert(alice, 0, "keep ", 0),
        ))
        .await
        .unwrap();
    engine
        .handle(Envelope::change(
            room_id,
            bob,
            Operation::insert(bob, 5, "drop", 1),
        ))
        .await
        .unwrap();

    let room = engine.room(room_id).await.unwrap();
    let mut rx = room.subscribe();

    // Bob reverses his own edit; Alice's stays.
    engine.undo(room_id, bob).await.unwrap();
    assert_eq!(room.content().await, "keep ");

    let committed = recv_envelope(&mut rx).await;
    assert_eq!(committed.kind(), MessageKind::Committed);
    assert_eq!(committed.sender_id, bob);

    engine.redo(room_id, bob).await.unwrap();
    assert_eq!(room.content().await, "keep drop");
}

// ─── Snapshot persistence ────────────────────────────────────────

#[tokio::test]
async fn test_snapshot_survives_engine_restart() {
    let dir = tempfile::tempdir().unwrap();
    let room_id = Uuid::new_v4();
    let alice = Uuid::new_v4();

    {
        let store = Arc::new(FileStore::new(dir.path()).unwrap());
        let engine = CollabEngine::new(EngineConfig::for_testing(), store);
        join(&engine, room_id, alice, "Alice").await;
        engine
            .handle(Envelope::change(
                room_id,
                alice,
                Operation::insert(alice, 0, "release draft", 0),
            ))
            .await
            .unwrap();
        engine.snapshot(room_id, Uuid::nil(), "v1").await.unwrap();
    }

    // A fresh engine over the same store starts the room empty but
    // can still restore the label from disk.
    let store = Arc::new(FileStore::new(dir.path()).unwrap());
    let engine = CollabEngine::new(EngineConfig::for_testing(), store);
    let (content, _) = join(&engine, room_id, alice, "Alice").await;
    assert_eq!(content, "");

    let restored = engine.restore(room_id, "v1").await.unwrap();
    let room = engine.room(room_id).await.unwrap();
    let mut rx = room.subscribe();

    // Appending at position 13 only works if the restored branch
    // really carries the persisted thirteen characters.
    let reply = engine
        .handle(Envelope::change(
            room_id,
            alice,
            Operation::insert(alice, 13, "!", 1).on_branch(restored),
        ))
        .await
        .unwrap();
    assert!(reply.is_none());
    let committed = recv_envelope(&mut rx).await;
    match committed.body {
        MessageBody::Committed { ops } => assert_eq!(ops[0].branch_id, restored),
        other => panic!("expected Committed, got {:?}", other.kind()),
    }
}

// ─── Cursors ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_cursor_flow_between_participants() {
    let engine = test_engine();
    let room_id = Uuid::new_v4();
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();

    join(&engine, room_id, alice, "Alice").await;
    join(&engine, room_id, bob, "Bob").await;
    let room = engine.room(room_id).await.unwrap();
    let mut rx = room.subscribe();

    engine
        .handle(Envelope::cursor(room_id, alice, 7, Some((7, 12))))
        .await
        .unwrap();

    let cursor = recv_envelope(&mut rx).await;
    assert_eq!(cursor.sender_id, alice);
    match cursor.body {
        MessageBody::Cursor {
            position,
            selection,
        } => {
            assert_eq!(position, 7);
            assert_eq!(selection, Some((7, 12)));
        }
        other => panic!("expected Cursor, got {:?}", other.kind()),
    }
}

// ─── Throughput ──────────────────────────────────────────────────

#[tokio::test]
async fn test_fan_out_throughput() {
    let channel = RoomChannel::new(2048);
    let mut receivers = Vec::new();
    for _ in 0..100 {
        receivers.push(channel.subscribe());
    }

    let encoded = Arc::new(
        Envelope::cursor(Uuid::new_v4(), Uuid::new_v4(), 42, None)
            .encode()
            .unwrap(),
    );

    let start = std::time::Instant::now();
    for _ in 0..1_000 {
        let reached = channel.fan_out(encoded.clone());
        assert_eq!(reached, 100);
    }
    let elapsed = start.elapsed();

    // Generous limit for CI.
    assert!(
        elapsed.as_millis() < 100,
        "1000 fan-outs to 100 subscribers took {elapsed:?}, expected <100ms"
    );
    assert_eq!(channel.stats().envelopes_sent, 1_000);
}

// ─── Wire efficiency ─────────────────────────────────────────────

#[tokio::test]
async fn test_wire_size_efficiency() {
    let room = Uuid::new_v4();
    let user = Uuid::new_v4();

    let heartbeat = Envelope::heartbeat(room, user).encode().unwrap();
    assert!(
        heartbeat.len() < 56,
        "heartbeat should be <56 bytes, got {}",
        heartbeat.len()
    );

    let cursor = Envelope::cursor(room, user, 120, None).encode().unwrap();
    assert!(
        cursor.len() < 64,
        "cursor should be <64 bytes, got {}",
        cursor.len()
    );

    let change = Envelope::change(room, user, Operation::insert(user, 0, "x", 0))
        .encode()
        .unwrap();
    assert!(
        change.len() < 160,
        "single-char change should be <160 bytes, got {}",
        change.len()
    );
}
