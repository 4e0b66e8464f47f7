//! Edit history: per-participant undo/redo, branch merges, snapshot
//! persistence, and operation batches.
//!
//! Undo is modeled as ordinary operations flowing back through the
//! transform pipeline rather than as state rollback:
//!
//! ```text
//!   committed record ──▶ UndoHistory::record ──▶ undo stack (per user)
//!                                                      │ undo()
//!                                                      ▼
//!   Document::apply_operation ◀──── inverse operation (undo_of link)
//! ```
//!
//! An inverse is based at the version right after its original
//! committed, so undoing under later concurrent edits repositions the
//! inverse exactly the way any remote operation would. A merge replays
//! the source branch's operations onto the target through the same
//! transform rules, on a scratch copy, so a conflict aborts without
//! touching either branch.
//!
//! Reference: Prakash & Knister, "A framework for undoing actions in
//! collaborative systems".

use std::collections::{HashMap, VecDeque};

use uuid::Uuid;

use crate::document::{AppliedOp, ApplyError, ApplyReport, Document, Snapshot};
use crate::operation::{char_len, OpKind, Operation};
use crate::storage::{snapshot_key, SnapshotStore, StoreError};
use crate::transform::{
    sequence_siblings, transform, transform_run, ConcurrentInsertPolicy, Transformed,
    TransformError,
};

/// Retained inverses per participant before the oldest is evicted.
pub const DEFAULT_UNDO_DEPTH: usize = 100;

// ───────────────────────────────────────────────────────────────────
// Undo / redo
// ───────────────────────────────────────────────────────────────────

/// What one committed record did, captured so it can be inverted
/// later. Positions and text are the record's final (post-transform)
/// values.
#[derive(Debug, Clone)]
struct UndoRecord {
    /// Operation the next inverse will link to.
    target: Uuid,
    kind: OpKind,
    position: usize,
    /// Text the record added.
    inserted: String,
    /// Text the record removed.
    removed: String,
    /// Branch head right after the record committed.
    after_version: u64,
    branch_id: Uuid,
}

impl UndoRecord {
    fn from_applied(applied: &AppliedOp, target: Uuid) -> Self {
        Self {
            target,
            kind: applied.op.kind,
            position: applied.op.position,
            inserted: applied.op.content.clone(),
            removed: applied.removed.clone().unwrap_or_default(),
            after_version: applied.op.global_version.unwrap_or(0),
            branch_id: applied.op.branch_id,
        }
    }

    /// Build the operation that reverses this record, based at the
    /// version where the record was the newest commit.
    fn inverse(&self, author: Uuid) -> Operation {
        let op = match self.kind {
            OpKind::Insert => Operation::delete(
                author,
                self.position,
                char_len(&self.inserted),
                self.after_version,
            ),
            OpKind::Delete => {
                Operation::insert(author, self.position, self.removed.clone(), self.after_version)
            }
            OpKind::Update => {
                // An update spans at least one character, so a record
                // that inserted nothing reverses as a plain insert of
                // the removed text instead.
                if self.inserted.is_empty() {
                    Operation::insert(
                        author,
                        self.position,
                        self.removed.clone(),
                        self.after_version,
                    )
                } else {
                    Operation::update(
                        author,
                        self.position,
                        char_len(&self.inserted),
                        self.removed.clone(),
                        self.after_version,
                    )
                }
            }
        };
        op.on_branch(self.branch_id)
    }
}

#[derive(Debug, Default)]
struct UserHistory {
    undo: VecDeque<UndoRecord>,
    redo: VecDeque<UndoRecord>,
}

/// Per-participant undo and redo stacks for one document.
///
/// Reports from [`undo`](Self::undo) and [`redo`](Self::redo) are
/// tracked internally; feeding them back through
/// [`record`](Self::record) is a no-op because their operations carry
/// `undo_of` / `redo_of` links.
#[derive(Debug)]
pub struct UndoHistory {
    stacks: HashMap<Uuid, UserHistory>,
    depth: usize,
}

impl Default for UndoHistory {
    fn default() -> Self {
        Self::new(DEFAULT_UNDO_DEPTH)
    }
}

impl UndoHistory {
    pub fn new(depth: usize) -> Self {
        Self {
            stacks: HashMap::new(),
            depth: depth.max(1),
        }
    }

    /// Track freshly committed records for their author. A fresh edit
    /// invalidates that author's redo stack.
    pub fn record(&mut self, report: &ApplyReport) {
        for applied in &report.committed {
            if applied.op.undo_of.is_some() || applied.op.redo_of.is_some() {
                continue;
            }
            let history = self.stacks.entry(applied.op.author_id).or_default();
            history.redo.clear();
            history
                .undo
                .push_back(UndoRecord::from_applied(applied, applied.op.id));
            if history.undo.len() > self.depth {
                history.undo.pop_front();
            }
        }
    }

    pub fn can_undo(&self, author: Uuid) -> bool {
        self.stacks
            .get(&author)
            .is_some_and(|h| !h.undo.is_empty())
    }

    pub fn can_redo(&self, author: Uuid) -> bool {
        self.stacks
            .get(&author)
            .is_some_and(|h| !h.redo.is_empty())
    }

    /// Reverse `author`'s most recent record by applying its inverse
    /// through the normal transform pipeline.
    ///
    /// The record moves to the redo stack on success. If the inverse
    /// fails to apply, the record is restored and the error surfaces;
    /// if it is annulled (the text it would touch is already gone) the
    /// record is consumed and the report says so.
    pub fn undo(
        &mut self,
        doc: &mut Document,
        author: Uuid,
        policy: ConcurrentInsertPolicy,
    ) -> Result<ApplyReport, HistoryError> {
        let history = self
            .stacks
            .get_mut(&author)
            .ok_or(HistoryError::NothingToUndo)?;
        let record = history.undo.pop_back().ok_or(HistoryError::NothingToUndo)?;

        let inverse = record.inverse(author).as_undo_of(record.target);
        match doc.apply_operation(inverse, policy) {
            Ok(report) => {
                for applied in &report.committed {
                    history
                        .redo
                        .push_back(UndoRecord::from_applied(applied, record.target));
                    if history.redo.len() > self.depth {
                        history.redo.pop_front();
                    }
                }
                Ok(report)
            }
            Err(err) => {
                history.undo.push_back(record);
                Err(HistoryError::Apply(err))
            }
        }
    }

    /// Re-apply `author`'s most recently undone record.
    pub fn redo(
        &mut self,
        doc: &mut Document,
        author: Uuid,
        policy: ConcurrentInsertPolicy,
    ) -> Result<ApplyReport, HistoryError> {
        let history = self
            .stacks
            .get_mut(&author)
            .ok_or(HistoryError::NothingToRedo)?;
        let record = history.redo.pop_back().ok_or(HistoryError::NothingToRedo)?;

        let inverse = record.inverse(author).as_redo_of(record.target);
        match doc.apply_operation(inverse, policy) {
            Ok(report) => {
                for applied in &report.committed {
                    history
                        .undo
                        .push_back(UndoRecord::from_applied(applied, applied.op.id));
                    if history.undo.len() > self.depth {
                        history.undo.pop_front();
                    }
                }
                Ok(report)
            }
            Err(err) => {
                history.redo.push_back(record);
                Err(HistoryError::Apply(err))
            }
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Branch merge
// ───────────────────────────────────────────────────────────────────

/// Outcome of a completed merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeReport {
    /// Source operations that landed on the target.
    pub replayed: usize,
    /// Source operations annulled during replay.
    pub annulled: usize,
    /// Target head after the merge.
    pub new_head: u64,
}

/// Collapse point of a fully annulled source delete, watched for a
/// follow-up insert that would mean a divergent replacement.
struct DeadSpan {
    at: usize,
    annulled_by: Uuid,
}

struct BridgeCrossing {
    survivors: Vec<Operation>,
    bridge: Vec<Operation>,
    annulled_by: Option<Uuid>,
}

/// Replay `source_id`'s operations onto its parent `target_id`.
///
/// Each source operation is transformed across the target's divergent
/// segment and committed as a new record with `derived_from` pointing
/// at the source original. The replay runs on a scratch copy; the
/// target branch and version vector are swapped in only after every
/// operation lands. The source branch itself is left untouched.
///
/// A conflict is reported when a source delete is wholly annulled by a
/// target edit and the next source operation inserts at the collapse
/// point. Both sides replaced the same text, and picking one silently
/// would drop the other's words.
pub fn merge_branch(
    doc: &mut Document,
    source_id: Uuid,
    target_id: Uuid,
    policy: ConcurrentInsertPolicy,
) -> Result<MergeReport, HistoryError> {
    let source = doc
        .branch(source_id)
        .cloned()
        .ok_or(HistoryError::UnknownBranch(source_id))?;
    let target = doc
        .branch(target_id)
        .cloned()
        .ok_or(HistoryError::UnknownBranch(target_id))?;
    if source.parent != Some(target_id) {
        return Err(HistoryError::UnrelatedBranches {
            source: source_id,
            target: target_id,
        });
    }

    let mut scratch = doc.clone();
    // Target operations the source has never seen, kept repositioned
    // into the source's current frame as the replay advances.
    let mut bridge: Vec<Operation> = target.ops_since(source.fork_version).to_vec();
    let mut replayed = 0usize;
    let mut annulled = 0usize;
    let mut dead: Option<DeadSpan> = None;

    for src in source.ops() {
        if let Some(d) = &dead {
            if src.kind == OpKind::Insert && src.position == d.at {
                return Err(HistoryError::MergeConflict {
                    source_op: src.id,
                    committed_op: d.annulled_by,
                });
            }
        }
        dead = None;

        let replay = Operation {
            id: Uuid::new_v4(),
            global_version: None,
            branch_id: target_id,
            derived_from: Some(src.id),
            ..src.clone()
        };
        let crossing = cross_bridge(&bridge, replay, policy)?;
        bridge = crossing.bridge;

        if crossing.survivors.is_empty() {
            annulled += 1;
            if src.kind == OpKind::Delete {
                if let Some(by) = crossing.annulled_by {
                    dead = Some(DeadSpan {
                        at: src.position,
                        annulled_by: by,
                    });
                }
            }
            continue;
        }

        for mut record in crossing.survivors {
            record.base_version = scratch
                .branch(target_id)
                .map(|b| b.head_version)
                .unwrap_or(0);
            scratch.apply_operation(record, policy)?;
        }
        replayed += 1;
    }

    let merged = scratch
        .branch(target_id)
        .cloned()
        .ok_or(HistoryError::UnknownBranch(target_id))?;
    let new_head = merged.head_version;
    let vector = scratch.vector().clone();
    doc.install_branch(merged);
    doc.set_vector(vector);
    Ok(MergeReport {
        replayed,
        annulled,
        new_head,
    })
}

/// One lattice step of the replay: `incoming` crosses the whole bridge
/// while every bridge operation crosses `incoming`, keeping both sides
/// in each other's frame for the next source operation.
fn cross_bridge(
    bridge: &[Operation],
    incoming: Operation,
    policy: ConcurrentInsertPolicy,
) -> Result<BridgeCrossing, TransformError> {
    let mut pieces = vec![incoming];
    let mut next_bridge = Vec::with_capacity(bridge.len());
    let mut annulled_by = None;

    for (i, foreign) in bridge.iter().enumerate() {
        if pieces.is_empty() {
            next_bridge.extend_from_slice(&bridge[i..]);
            break;
        }

        // The bridge op crosses the incoming effect as sequenced so
        // far; the pieces then cross the bridge op.
        let (effect, _) = sequence_siblings(pieces.clone(), policy)?;
        let crossed = transform_run(&effect, foreign, policy)?;
        next_bridge.extend(crossed.records);

        let mut surviving = Vec::with_capacity(pieces.len());
        for piece in pieces {
            match transform(foreign, &piece, policy)? {
                Transformed::One(p) => surviving.push(p),
                Transformed::Two(a, b) => {
                    surviving.push(a);
                    surviving.push(b);
                }
                Transformed::Annulled => annulled_by = Some(foreign.id),
            }
        }
        pieces = surviving;
    }

    let (survivors, seq_annul) = sequence_siblings(pieces, policy)?;
    Ok(BridgeCrossing {
        survivors,
        bridge: next_bridge,
        annulled_by: seq_annul.or(annulled_by),
    })
}

// ───────────────────────────────────────────────────────────────────
// Snapshots
// ───────────────────────────────────────────────────────────────────

/// Capture a branch's current content under `label` and write it
/// through to `store` as compressed bytes.
pub fn create_snapshot(
    doc: &mut Document,
    branch_id: Uuid,
    label: &str,
    store: &dyn SnapshotStore,
) -> Result<Snapshot, HistoryError> {
    let snapshot = doc.record_snapshot(label, branch_id)?;
    let blob = encode_snapshot(&snapshot)?;
    store.put(&snapshot_key(doc.id, label), &blob)?;
    Ok(snapshot)
}

/// Bring a snapshot back as a fresh branch forked at the snapshot's
/// version. Current branches are never rewound; the caller gets the
/// new branch id and decides what to do with it.
///
/// Misses in the in-memory cache fall back to `store`, so a document
/// rebuilt after a restart can still restore labels written by an
/// earlier run.
pub fn restore_snapshot(
    doc: &mut Document,
    label: &str,
    store: &dyn SnapshotStore,
) -> Result<Uuid, HistoryError> {
    let snapshot = match doc.snapshot(label) {
        Some(s) => s.clone(),
        None => {
            let blob = store.get(&snapshot_key(doc.id, label)).map_err(|e| match e {
                StoreError::NotFound(_) => HistoryError::SnapshotNotFound(label.to_string()),
                other => HistoryError::Store(other),
            })?;
            let snapshot = decode_snapshot(&blob)?;
            doc.cache_snapshot(label, snapshot.clone());
            snapshot
        }
    };

    let branch_id = doc.create_branch_with_content(
        format!("restore-{label}"),
        snapshot.branch_id,
        snapshot.version,
        snapshot.content.clone(),
    )?;
    Ok(branch_id)
}

fn encode_snapshot(snapshot: &Snapshot) -> Result<Vec<u8>, StoreError> {
    let bytes = bincode::serde::encode_to_vec(snapshot, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(lz4_flex::compress_prepend_size(&bytes))
}

fn decode_snapshot(blob: &[u8]) -> Result<Snapshot, StoreError> {
    let bytes = lz4_flex::decompress_size_prepended(blob)
        .map_err(|e| StoreError::Corrupt(e.to_string()))?;
    let (snapshot, _) = bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
        .map_err(|e| StoreError::Corrupt(e.to_string()))?;
    Ok(snapshot)
}

// ───────────────────────────────────────────────────────────────────
// Batches
// ───────────────────────────────────────────────────────────────────

/// Per-batch tallies. `failed` carries the index of the first
/// operation that hard-failed; everything committed before it stays
/// committed.
#[derive(Debug, Default)]
pub struct BatchSummary {
    pub applied: usize,
    pub annulled: usize,
    pub failed: Option<(usize, ApplyError)>,
    /// Reports for the operations that went through, in order.
    pub reports: Vec<ApplyReport>,
}

/// Apply `ops` in list order. Annulled operations are counted and
/// skipped over; the first hard failure stops the batch.
pub fn apply_batch(
    doc: &mut Document,
    ops: Vec<Operation>,
    policy: ConcurrentInsertPolicy,
) -> BatchSummary {
    let mut summary = BatchSummary::default();
    for (index, op) in ops.into_iter().enumerate() {
        match doc.apply_operation(op, policy) {
            Ok(report) => {
                if report.committed.is_empty() {
                    summary.annulled += 1;
                } else {
                    summary.applied += 1;
                }
                summary.reports.push(report);
            }
            Err(err) => {
                summary.failed = Some((index, err));
                break;
            }
        }
    }
    summary
}

// ───────────────────────────────────────────────────────────────────
// Errors
// ───────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum HistoryError {
    NothingToUndo,
    NothingToRedo,
    UnknownBranch(Uuid),
    /// Merge source was not forked from the given target.
    UnrelatedBranches { source: Uuid, target: Uuid },
    /// Both branches replaced the same text; neither side can win
    /// silently.
    MergeConflict { source_op: Uuid, committed_op: Uuid },
    SnapshotNotFound(String),
    Apply(ApplyError),
    Store(StoreError),
}

impl std::fmt::Display for HistoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NothingToUndo => write!(f, "nothing to undo for this participant"),
            Self::NothingToRedo => write!(f, "nothing to redo for this participant"),
            Self::UnknownBranch(id) => write!(f, "unknown branch: {id}"),
            Self::UnrelatedBranches { source, target } => {
                write!(f, "branch {source} was not forked from {target}")
            }
            Self::MergeConflict {
                source_op,
                committed_op,
            } => write!(
                f,
                "merge conflict: {source_op} replaces text already replaced by {committed_op}; \
                 manual resolution required"
            ),
            Self::SnapshotNotFound(label) => write!(f, "snapshot not found: {label}"),
            Self::Apply(e) => write!(f, "apply failed: {e}"),
            Self::Store(e) => write!(f, "snapshot store: {e}"),
        }
    }
}

impl std::error::Error for HistoryError {}

impl From<ApplyError> for HistoryError {
    fn from(e: ApplyError) -> Self {
        Self::Apply(e)
    }
}

impl From<StoreError> for HistoryError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl From<TransformError> for HistoryError {
    fn from(e: TransformError) -> Self {
        Self::Apply(ApplyError::Transform(e))
    }
}

// ===================================================================
// Tests
// ===================================================================
