//! Operational transform — repositioning concurrent edits so every
//! replica converges on the same content.
//!
//! When two participants edit the same base version, the operation that
//! commits second must be shifted past the one that committed first. The
//! transform is pairwise: the apply pipeline walks an incoming operation
//! across every committed operation it did not see, one step at a time.
//!
//! ```text
//!   committed \ incoming │ Insert            │ Delete
//!   ─────────────────────┼───────────────────┼──────────────────────────
//!   Insert               │ shift / tie-break │ shift, or grow/split when
//!                        │ on (author, id)   │ the insert lands inside
//!   Delete               │ shift / collapse  │ trim overlap, annul when
//!                        │ to span start     │ fully subsumed
//! ```
//!
//! Updates decompose into a delete plus an insert at the same position,
//! pass through the table above, and recompose afterwards. An update
//! whose entire span was deleted concurrently degenerates into a plain
//! insert — the replacement text is author intent worth keeping.
//!
//! Output positions are a deterministic function of the two records, so
//! the single commit authority per document is enough for convergence.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 5

use uuid::Uuid;

use crate::operation::{OpKind, Operation};

/// What to do when an insert lands inside a span a concurrent
/// operation is deleting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcurrentInsertPolicy {
    /// The deletion grows to cover the concurrently inserted text.
    ExtendDelete,
    /// The inserted text survives; the deletion splits into two
    /// operations around it.
    Coexist,
}

impl Default for ConcurrentInsertPolicy {
    fn default() -> Self {
        Self::ExtendDelete
    }
}

/// Result of transforming one incoming operation across one committed
/// operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Transformed {
    /// The operation survives as a single record.
    One(Operation),
    /// The operation split in two. Both records are positioned against
    /// the same state (the content after the committed operation); the
    /// commit path sequences the second against the first.
    Two(Operation, Operation),
    /// The operation has nothing left to do. A legal no-op, not an
    /// error: it commits nothing and consumes no version number.
    Annulled,
}

/// Transform `incoming` so it applies after `committed`.
///
/// Both operations must target the same branch and address the same
/// base content; neither input is mutated. When the result differs from
/// `incoming`, its `derived_from` records the committed operation id.
pub fn transform(
    committed: &Operation,
    incoming: &Operation,
    policy: ConcurrentInsertPolicy,
) -> Result<Transformed, TransformError> {
    if committed.branch_id != incoming.branch_id {
        return Err(TransformError::BranchMismatch {
            committed: committed.branch_id,
            incoming: incoming.branch_id,
        });
    }
    Ok(match incoming.kind {
        OpKind::Insert => Transformed::One(transform_insert(committed, incoming)),
        OpKind::Delete => transform_delete(committed, incoming, policy),
        OpKind::Update => transform_update(committed, incoming, policy),
    })
}

// ───────────────────────────────────────────────────────────────────
// Per-kind pipelines
// ───────────────────────────────────────────────────────────────────

/// Inserts survive every committed operation; only the position moves.
fn transform_insert(committed: &Operation, ins: &Operation) -> Operation {
    match committed.kind {
        OpKind::Insert => insert_vs_insert(committed, ins),
        OpKind::Delete => delete_vs_insert(committed, ins),
        OpKind::Update => {
            // A committed update acts as its delete half, then its
            // insert half at the collapsed position.
            let mid = delete_vs_insert(&delete_half(committed), ins);
            insert_vs_insert(&insert_half(committed), &mid)
        }
    }
}

fn transform_delete(
    committed: &Operation,
    del: &Operation,
    policy: ConcurrentInsertPolicy,
) -> Transformed {
    match committed.kind {
        OpKind::Insert => insert_vs_delete(committed, del, policy),
        OpKind::Delete => {
            delete_vs_delete(committed, del).map_or(Transformed::Annulled, Transformed::One)
        }
        OpKind::Update => match delete_vs_delete(&delete_half(committed), del) {
            None => Transformed::Annulled,
            Some(mid) => insert_vs_delete(&insert_half(committed), &mid, policy),
        },
    }
}

/// Updates transform as their delete half plus their insert half, then
/// recompose. The halves share the update's identity, so tie-breaks and
/// audit trails stay coherent.
fn transform_update(
    committed: &Operation,
    upd: &Operation,
    policy: ConcurrentInsertPolicy,
) -> Transformed {
    let span = Operation {
        kind: OpKind::Delete,
        content: String::new(),
        ..upd.clone()
    };
    let text = Operation {
        kind: OpKind::Insert,
        length: upd.content_len(),
        ..upd.clone()
    };
    let landed = transform_insert(committed, &text);

    match transform_delete(committed, &span, policy) {
        Transformed::Annulled => {
            // The replaced span is already gone; keep the replacement
            // text as a plain insert at the collapse point. An update
            // that carried no replacement text has nothing left to say.
            if upd.content.is_empty() {
                return Transformed::Annulled;
            }
            Transformed::One(Operation {
                kind: OpKind::Insert,
                position: landed.position,
                length: upd.content_len(),
                derived_from: Some(committed.id),
                ..upd.clone()
            })
        }
        Transformed::One(span2) => Transformed::One(Operation {
            kind: OpKind::Update,
            position: span2.position,
            length: span2.length,
            content: upd.content.clone(),
            derived_from: span2.derived_from,
            ..upd.clone()
        }),
        Transformed::Two(head, tail) => {
            // Concurrent insert survives inside the span (Coexist): the
            // replacement text attaches to the leading segment, the
            // trailing segment stays a bare delete.
            let head = Operation {
                kind: OpKind::Update,
                position: head.position,
                length: head.length,
                content: upd.content.clone(),
                derived_from: head.derived_from,
                ..upd.clone()
            };
            Transformed::Two(head, tail)
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Pairwise rules
// ───────────────────────────────────────────────────────────────────

fn insert_vs_insert(c: &Operation, b: &Operation) -> Operation {
    let earlier = c.position < b.position || (c.position == b.position && c.precedes(b));
    if earlier {
        shifted(b, b.position + c.content_len(), c.id)
    } else {
        b.clone()
    }
}

fn delete_vs_insert(c: &Operation, b: &Operation) -> Operation {
    if b.position <= c.position {
        b.clone()
    } else if b.position >= c.end() {
        shifted(b, b.position - c.length, c.id)
    } else {
        // Inside the deleted span: the insert lands where the span
        // collapsed to.
        shifted(b, c.position, c.id)
    }
}

fn insert_vs_delete(c: &Operation, b: &Operation, policy: ConcurrentInsertPolicy) -> Transformed {
    let inserted = c.content_len();
    if c.position <= b.position {
        Transformed::One(shifted(b, b.position + inserted, c.id))
    } else if c.position >= b.end() {
        Transformed::One(b.clone())
    } else {
        // The insert landed strictly inside the span being deleted.
        match policy {
            ConcurrentInsertPolicy::ExtendDelete => {
                let mut grown = b.clone();
                grown.length += inserted;
                grown.derived_from = Some(c.id);
                Transformed::One(grown)
            }
            ConcurrentInsertPolicy::Coexist => {
                let mut head = b.clone();
                head.length = c.position - b.position;
                head.derived_from = Some(c.id);

                let mut tail = b.clone();
                tail.id = Uuid::new_v4();
                tail.position = c.position + inserted;
                tail.length = b.end() - c.position;
                tail.derived_from = Some(c.id);

                Transformed::Two(head, tail)
            }
        }
    }
}

/// Delete against delete. `None` means `b` was fully subsumed.
fn delete_vs_delete(c: &Operation, b: &Operation) -> Option<Operation> {
    let overlap_start = c.position.max(b.position);
    let overlap_end = c.end().min(b.end());

    if overlap_end <= overlap_start {
        // Disjoint spans.
        return Some(if c.end() <= b.position {
            shifted(b, b.position - c.length, c.id)
        } else {
            b.clone()
        });
    }
    if c.position <= b.position && b.end() <= c.end() {
        // Everything b wanted to remove is already gone.
        return None;
    }

    let trimmed = overlap_end - overlap_start;
    let mut survivor = b.clone();
    survivor.position = b.position.min(c.position);
    survivor.length = b.length - trimmed;
    survivor.derived_from = Some(c.id);
    Some(survivor)
}

fn shifted(b: &Operation, position: usize, committed_id: Uuid) -> Operation {
    let mut out = b.clone();
    if position != b.position {
        out.position = position;
        out.derived_from = Some(committed_id);
    }
    out
}

// ───────────────────────────────────────────────────────────────────
// Runs — one operation across a committed segment
// ───────────────────────────────────────────────────────────────────

/// Result of crossing an operation over a committed segment: the
/// surviving records in commit order, already sequenced against each
/// other. `annulled_by` names the last record that annulled a piece,
/// which matters when `records` comes back empty.
#[derive(Debug, Clone)]
pub(crate) struct RunOutcome {
    pub records: Vec<Operation>,
    pub annulled_by: Option<Uuid>,
}

/// Transform `incoming` across `segment` (committed operations in
/// version order), then sequence any split siblings so the output can
/// be committed records back to back.
pub(crate) fn transform_run(
    segment: &[Operation],
    incoming: &Operation,
    policy: ConcurrentInsertPolicy,
) -> Result<RunOutcome, TransformError> {
    // Pieces of a split share a frame, so each crosses the next
    // committed operation independently.
    let mut pending = vec![incoming.clone()];
    let mut annulled_by = None;
    for committed in segment {
        let mut next = Vec::with_capacity(pending.len());
        for piece in pending {
            match transform(committed, &piece, policy)? {
                Transformed::One(p) => next.push(p),
                Transformed::Two(a, b) => {
                    next.push(a);
                    next.push(b);
                }
                Transformed::Annulled => annulled_by = Some(committed.id),
            }
        }
        pending = next;
        if pending.is_empty() {
            break;
        }
    }

    let (records, seq_annul) = sequence_siblings(pending, policy)?;
    Ok(RunOutcome {
        records,
        annulled_by: seq_annul.or(annulled_by),
    })
}

/// Turn same-frame sibling pieces into consecutive records: each piece
/// is transformed past the ones sequenced before it. `skip` counts the
/// already-crossed predecessors for pieces re-queued by a split.
pub(crate) fn sequence_siblings(
    pieces: Vec<Operation>,
    policy: ConcurrentInsertPolicy,
) -> Result<(Vec<Operation>, Option<Uuid>), TransformError> {
    use std::collections::VecDeque;

    let mut out: Vec<Operation> = Vec::with_capacity(pieces.len());
    let mut annulled_by = None;
    let mut work: VecDeque<(Operation, usize)> = pieces.into_iter().map(|p| (p, 0)).collect();

    while let Some((mut piece, skip)) = work.pop_front() {
        let mut idx = skip;
        let mut alive = true;
        while idx < out.len() {
            match transform(&out[idx], &piece, policy)? {
                Transformed::One(p) => piece = p,
                Transformed::Two(a, b) => {
                    work.push_front((b, idx + 1));
                    piece = a;
                }
                Transformed::Annulled => {
                    annulled_by = Some(out[idx].id);
                    alive = false;
                    break;
                }
            }
            idx += 1;
        }
        if alive {
            out.push(piece);
        }
    }
    Ok((out, annulled_by))
}

fn delete_half(upd: &Operation) -> Operation {
    Operation {
        kind: OpKind::Delete,
        content: String::new(),
        ..upd.clone()
    }
}

fn insert_half(upd: &Operation) -> Operation {
    Operation {
        kind: OpKind::Insert,
        length: upd.content_len(),
        ..upd.clone()
    }
}

// ───────────────────────────────────────────────────────────────────
// Errors
// ───────────────────────────────────────────────────────────────────

/// Transform failures.
#[derive(Debug, Clone, PartialEq)]
pub enum TransformError {
    /// Operations from different branches never transform against each
    /// other; divergence is reconciled by explicit merge only.
    BranchMismatch { committed: Uuid, incoming: Uuid },
}

impl std::fmt::Display for TransformError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BranchMismatch {
                committed,
                incoming,
            } => write!(
                f,
                "Branch mismatch: committed operation on {committed}, incoming on {incoming}"
            ),
        }
    }
}

impl std::error::Error for TransformError {}

// ===================================================================
// Tests
// ===================================================================
