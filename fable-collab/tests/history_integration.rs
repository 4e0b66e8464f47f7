//! Branch, merge, undo, and snapshot flows through the engine surface.
//!
//! Documents here are built by routing real envelopes, then the history
//! calls (`create_branch`, `merge`, `undo`, `snapshot`, `restore`) are
//! exercised against the room they produced.

use fable_collab::{
    CollabEngine, EngineConfig, EngineError, Envelope, HistoryError, MemoryStore, MessageBody,
    Operation,
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

async fn change(engine: &CollabEngine, room_id: Uuid, user_id: Uuid, op: Operation) {
    let reply = engine
        .handle(Envelope::change(room_id, user_id, op))
        .await
        .unwrap();
    assert!(reply.is_none(), "change should commit: {reply:?}");
}

async fn recv_envelope(rx: &mut broadcast::Receiver<Arc<Vec<u8>>>) -> Envelope {
    let bytes = timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("broadcast within timeout")
        .expect("channel open");
    Envelope::decode(&bytes).unwrap()
}

// ─── Branching and merging ───────────────────────────────────────

#[tokio::test]
async fn test_branch_workflow_merges_into_root() {
    let engine = test_engine();
    let room_id = Uuid::new_v4();
    // Pinned author ids: the merge ties bob's position-0 insert against
    // the insert half of alice's committed update, and the (author_id, id)
    // tie-break must put bob first for "say: " to land ahead of "howdy".
    let alice = Uuid::from_u128(2);
    let bob = Uuid::from_u128(1);

    join(&engine, room_id, alice, "Alice").await;
    join(&engine, room_id, bob, "Bob").await;
    change(
        &engine,
        room_id,
        alice,
        Operation::insert(alice, 0, "hello world", 0),
    )
    .await;

    let feature = engine
        .create_branch(room_id, "feature", Uuid::nil(), 1)
        .await
        .unwrap();

    // The root moves on while the branch is edited.
    change(
        &engine,
        room_id,
        alice,
        Operation::update(alice, 0, 5, "howdy", 1),
    )
    .await;
    change(
        &engine,
        room_id,
        bob,
        Operation::insert(bob, 11, "!", 1).on_branch(feature),
    )
    .await;
    change(
        &engine,
        room_id,
        bob,
        Operation::insert(bob, 0, "say: ", 2).on_branch(feature),
    )
    .await;

    let room = engine.room(room_id).await.unwrap();
    assert_eq!(room.content().await, "howdy world");
    assert_eq!(
        room.branch_content(feature).await.unwrap(),
        "say: hello world!"
    );

    let mut rx = room.subscribe();
    let report = engine.merge(room_id, feature, Uuid::nil()).await.unwrap();
    assert_eq!(report.replayed, 2);
    assert_eq!(report.annulled, 0);
    assert_eq!(room.content().await, "say: howdy world!");
    assert_eq!(room.head_version().await, 4);

    // A merge landing on the root refreshes every peer.
    let envelope = recv_envelope(&mut rx).await;
    match envelope.body {
        MessageBody::SyncState {
            content,
            head_version,
            ..
        } => {
            assert_eq!(content, "say: howdy world!");
            assert_eq!(head_version, 4);
        }
        other => panic!("expected SyncState, got {:?}", other.kind()),
    }
}

#[tokio::test]
async fn test_merge_conflict_leaves_both_branches_intact() {
    let engine = test_engine();
    let room_id = Uuid::new_v4();
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();

    join(&engine, room_id, alice, "Alice").await;
    join(&engine, room_id, bob, "Bob").await;
    change(
        &engine,
        room_id,
        alice,
        Operation::insert(alice, 0, "hello world", 0),
    )
    .await;
    let feature = engine
        .create_branch(room_id, "feature", Uuid::nil(), 1)
        .await
        .unwrap();

    // Both sides replace the same word.
    change(&engine, room_id, alice, Operation::delete(alice, 0, 5, 1)).await;
    change(
        &engine,
        room_id,
        bob,
        Operation::delete(bob, 0, 5, 1).on_branch(feature),
    )
    .await;
    change(
        &engine,
        room_id,
        bob,
        Operation::insert(bob, 0, "HOWDY", 2).on_branch(feature),
    )
    .await;

    let err = engine
        .merge(room_id, feature, Uuid::nil())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::History(HistoryError::MergeConflict { .. })
    ));

    // Nothing moved: the root kept its own replacement and the branch
    // keeps taking edits.
    let room = engine.room(room_id).await.unwrap();
    assert_eq!(room.content().await, " world");
    assert_eq!(room.branch_content(feature).await.unwrap(), "HOWDY world");
    change(
        &engine,
        room_id,
        bob,
        Operation::insert(bob, 11, "!", 3).on_branch(feature),
    )
    .await;
    assert_eq!(room.branch_content(feature).await.unwrap(), "HOWDY world!");
}

#[tokio::test]
async fn test_merge_requires_parent_child_relationship() {
    let engine = test_engine();
    let room_id = Uuid::new_v4();
    let alice = Uuid::new_v4();

    join(&engine, room_id, alice, "Alice").await;
    change(
        &engine,
        room_id,
        alice,
        Operation::insert(alice, 0, "base text", 0),
    )
    .await;
    let one = engine
        .create_branch(room_id, "one", Uuid::nil(), 1)
        .await
        .unwrap();
    let two = engine
        .create_branch(room_id, "two", Uuid::nil(), 1)
        .await
        .unwrap();

    let err = engine.merge(room_id, one, two).await.unwrap_err();
    match err {
        EngineError::History(HistoryError::UnrelatedBranches { source, target }) => {
            assert_eq!(source, one);
            assert_eq!(target, two);
        }
        other => panic!("expected UnrelatedBranches, got {other}"),
    }
}

// ─── Undo and redo ───────────────────────────────────────────────

#[tokio::test]
async fn test_undo_is_per_participant() {
    let engine = test_engine();
    let room_id = Uuid::new_v4();
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();

    join(&engine, room_id, alice, "Alice").await;
    join(&engine, room_id, bob, "Bob").await;
    change(&engine, room_id, alice, Operation::insert(alice, 0, "aaa", 0)).await;
    change(&engine, room_id, bob, Operation::insert(bob, 3, "bbb", 1)).await;

    let room = engine.room(room_id).await.unwrap();
    assert_eq!(room.content().await, "aaabbb");

    // Alice's undo reverses her own edit, leaving Bob's text alone.
    engine.undo(room_id, alice).await.unwrap();
    assert_eq!(room.content().await, "bbb");

    engine.undo(room_id, bob).await.unwrap();
    assert_eq!(room.content().await, "");

    // Alice already spent her only record.
    let err = engine.undo(room_id, alice).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::History(HistoryError::NothingToUndo)
    ));
}

#[tokio::test]
async fn test_undo_depth_evicts_oldest_record() {
    let config = EngineConfig {
        undo_depth: 2,
        ..EngineConfig::for_testing()
    };
    let engine = Arc::new(CollabEngine::new(config, Arc::new(MemoryStore::new())));
    let room_id = Uuid::new_v4();
    let alice = Uuid::new_v4();

    join(&engine, room_id, alice, "Alice").await;
    change(&engine, room_id, alice, Operation::insert(alice, 0, "a", 0)).await;
    change(&engine, room_id, alice, Operation::insert(alice, 1, "b", 1)).await;
    change(&engine, room_id, alice, Operation::insert(alice, 2, "c", 2)).await;

    let room = engine.room(room_id).await.unwrap();
    engine.undo(room_id, alice).await.unwrap();
    engine.undo(room_id, alice).await.unwrap();
    assert_eq!(room.content().await, "a");

    // The first insert's record was evicted at depth two.
    let err = engine.undo(room_id, alice).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::History(HistoryError::NothingToUndo)
    ));
}

// ─── Snapshots ───────────────────────────────────────────────────

#[tokio::test]
async fn test_restore_unknown_label_fails() {
    let engine = test_engine();
    let room_id = Uuid::new_v4();
    let alice = Uuid::new_v4();

    join(&engine, room_id, alice, "Alice").await;
    let err = engine.restore(room_id, "missing").await.unwrap_err();
    match err {
        EngineError::History(HistoryError::SnapshotNotFound(label)) => {
            assert_eq!(label, "missing");
        }
        other => panic!("expected SnapshotNotFound, got {other}"),
    }
}

#[tokio::test]
async fn test_restored_branch_merges_clean_after_edits() {
    let engine = test_engine();
    let room_id = Uuid::new_v4();
    let alice = Uuid::new_v4();

    join(&engine, room_id, alice, "Alice").await;
    change(
        &engine,
        room_id,
        alice,
        Operation::insert(alice, 0, "first draft", 0),
    )
    .await;
    engine.snapshot(room_id, Uuid::nil(), "v1").await.unwrap();
    change(
        &engine,
        room_id,
        alice,
        Operation::update(alice, 0, 5, "final", 1),
    )
    .await;

    let room = engine.room(room_id).await.unwrap();
    assert_eq!(room.content().await, "final draft");

    // A restored branch carries content but no operations, so merging
    // it straight back changes nothing.
    let restored = engine.restore(room_id, "v1").await.unwrap();
    assert_eq!(
        room.branch_content(restored).await.unwrap(),
        "first draft"
    );
    let report = engine.merge(room_id, restored, Uuid::nil()).await.unwrap();
    assert_eq!(report.replayed, 0);
    assert_eq!(room.content().await, "final draft");

    // Fresh edits on the restored branch do merge back.
    change(
        &engine,
        room_id,
        alice,
        Operation::insert(alice, 11, "!", 1).on_branch(restored),
    )
    .await;
    let report = engine.merge(room_id, restored, Uuid::nil()).await.unwrap();
    assert_eq!(report.replayed, 1);
    assert_eq!(room.content().await, "final draft!");
}

#[tokio::test]
async fn test_snapshot_labels_restore_independently() {
    let engine = test_engine();
    let room_id = Uuid::new_v4();
    let alice = Uuid::new_v4();

    join(&engine, room_id, alice, "Alice").await;
    change(
        &engine,
        room_id,
        alice,
        Operation::insert(alice, 0, "alpha", 0),
    )
    .await;
    engine.snapshot(room_id, Uuid::nil(), "one").await.unwrap();
    change(
        &engine,
        room_id,
        alice,
        Operation::insert(alice, 5, " beta", 1),
    )
    .await;
    engine.snapshot(room_id, Uuid::nil(), "two").await.unwrap();

    let room = engine.room(room_id).await.unwrap();
    let from_one = engine.restore(room_id, "one").await.unwrap();
    let from_two = engine.restore(room_id, "two").await.unwrap();

    assert_ne!(from_one, from_two);
    assert_eq!(room.branch_content(from_one).await.unwrap(), "alpha");
    assert_eq!(room.branch_content(from_two).await.unwrap(), "alpha beta");
    // Root plus the two restore branches.
    assert_eq!(room.branch_ids().await.len(), 3);
}
