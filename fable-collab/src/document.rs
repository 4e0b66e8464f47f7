//! Shared document state: branch map, committed logs, apply pipeline.
//!
//! A document is a map of branches. The root branch (`Uuid::nil()`)
//! carries the canonical content; other branches fork from an ancestor
//! at a fixed version and hold only the operations committed after the
//! fork. Content is always materialized — replaying the ancestor
//! chain's log reproduces it exactly, which is the invariant every
//! mutation path must preserve.
//!
//! ```text
//!       Envelope(Change)
//!             │
//!             ▼
//!   Document::apply_operation ── validate ── transform chain ── commit
//!             │                                                   │
//!             │  base == head: append directly                    ▼
//!             │  base <  fork: stale, resync               log + content
//!             └─────────────────────────────────────────── + version vector
//! ```
//!
//! All mutation flows through [`Document::apply_operation`]; nothing
//! assigns content or versions directly.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::operation::{Operation, OperationError};
use crate::transform::{transform_run, ConcurrentInsertPolicy, TransformError};
use crate::version::VersionVector;

/// Name given to the root branch of every document.
pub const ROOT_BRANCH_NAME: &str = "main";

/// A line of history: fork point, committed segment, materialized
/// content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Branch {
    pub id: Uuid,
    pub name: String,
    /// Ancestor branch; `None` only for the root.
    pub parent: Option<Uuid>,
    /// Version this branch diverged at. The log before it is shared
    /// with the ancestor chain and is not copied.
    pub fork_version: u64,
    /// Highest committed version on this branch.
    pub head_version: u64,
    /// Materialized content at `head_version`.
    pub content: String,
    /// Committed operations after the fork, in version order.
    ops: Vec<Operation>,
}

impl Branch {
    fn root() -> Self {
        Self {
            id: Uuid::nil(),
            name: ROOT_BRANCH_NAME.to_string(),
            parent: None,
            fork_version: 0,
            head_version: 0,
            content: String::new(),
            ops: Vec::new(),
        }
    }

    /// Committed operations with versions in `(after, head]`.
    ///
    /// `after` must be at or past the fork point; the segment before
    /// the fork belongs to the ancestor chain.
    pub fn ops_since(&self, after: u64) -> &[Operation] {
        let start = (after.saturating_sub(self.fork_version)) as usize;
        if start >= self.ops.len() {
            &[]
        } else {
            &self.ops[start..]
        }
    }

    /// All operations committed on this branch since its fork.
    pub fn ops(&self) -> &[Operation] {
        &self.ops
    }
}

/// Point-in-time capture of a branch's content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub content: String,
    pub version: u64,
    pub branch_id: Uuid,
}

/// One committed record plus the text it removed, captured at apply
/// time so undo can invert it without replaying the log.
#[derive(Debug, Clone)]
pub struct AppliedOp {
    pub op: Operation,
    pub removed: Option<String>,
}

/// Outcome of one `apply_operation` call.
///
/// `committed` holds the canonical records in commit order — empty when
/// the operation was annulled outright. `annulled_by` then names the
/// committed operation that subsumed it.
#[derive(Debug, Clone, Default)]
pub struct ApplyReport {
    pub committed: Vec<AppliedOp>,
    pub annulled_by: Option<Uuid>,
}

impl ApplyReport {
    /// Whether the operation was fully annulled (an idempotent no-op).
    pub fn is_annulled(&self) -> bool {
        self.committed.is_empty() && self.annulled_by.is_some()
    }

    /// Version of the last record committed by this call, if any.
    pub fn head_after(&self) -> Option<u64> {
        self.committed.last().and_then(|a| a.op.global_version)
    }
}

/// A shared document: branches, version vector, named snapshots.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: Uuid,
    branches: HashMap<Uuid, Branch>,
    vector: VersionVector,
    snapshots: HashMap<String, Snapshot>,
}

impl Document {
    /// Create an empty document with a root branch at version 0.
    pub fn new(id: Uuid) -> Self {
        let root = Branch::root();
        let mut branches = HashMap::new();
        branches.insert(root.id, root);
        Self {
            id,
            branches,
            vector: VersionVector::new(),
            snapshots: HashMap::new(),
        }
    }

    // ── Read access ──────────────────────────────────────────────

    /// Root branch content.
    pub fn content(&self) -> &str {
        self.branches
            .get(&Uuid::nil())
            .map(|b| b.content.as_str())
            .unwrap_or("")
    }

    /// Root branch head version.
    pub fn head_version(&self) -> u64 {
        self.branches
            .get(&Uuid::nil())
            .map(|b| b.head_version)
            .unwrap_or(0)
    }

    pub fn branch(&self, id: Uuid) -> Option<&Branch> {
        self.branches.get(&id)
    }

    pub fn branch_ids(&self) -> Vec<Uuid> {
        self.branches.keys().copied().collect()
    }

    pub fn vector(&self) -> &VersionVector {
        &self.vector
    }

    pub fn snapshot(&self, label: &str) -> Option<&Snapshot> {
        self.snapshots.get(label)
    }

    pub fn snapshot_labels(&self) -> Vec<String> {
        self.snapshots.keys().cloned().collect()
    }

    pub fn has_snapshots(&self) -> bool {
        !self.snapshots.is_empty()
    }

    // ── Apply pipeline ───────────────────────────────────────────

    /// Validate, transform, and commit one operation.
    ///
    /// Three paths:
    /// 1. `base_version == head` — commits directly.
    /// 2. `base_version <  fork` — the retained log cannot reposition
    ///    it faithfully; the caller must sync and resubmit.
    /// 3. Otherwise the operation is transformed across every committed
    ///    operation in `(base, head]` in commit order, then committed.
    ///
    /// A split commits in order, each record with its own version; an
    /// annulled operation commits nothing and consumes no version.
    /// Rejection is all-or-nothing: when any record of a run fails
    /// validation, the branch keeps its content, log, and head.
    pub fn apply_operation(
        &mut self,
        op: Operation,
        policy: ConcurrentInsertPolicy,
    ) -> Result<ApplyReport, ApplyError> {
        op.validate_shape()?;

        let branch = self
            .branches
            .get_mut(&op.branch_id)
            .ok_or(ApplyError::UnknownBranch(op.branch_id))?;

        if op.base_version > branch.head_version {
            return Err(ApplyError::FutureBase {
                base_version: op.base_version,
                head_version: branch.head_version,
            });
        }
        if op.base_version < branch.fork_version {
            return Err(ApplyError::Stale {
                base_version: op.base_version,
                horizon: branch.fork_version,
            });
        }

        // Reposition across everything committed since the base,
        // sequencing any split siblings into consecutive records.
        let missed: Vec<Operation> = branch.ops_since(op.base_version).to_vec();
        let run = transform_run(&missed, &op, policy)?;

        // Rehearse the whole run against scratch content before any
        // state changes: a split commits all of its records or none.
        let mut staged = Vec::with_capacity(run.records.len());
        let mut scratch = branch.content.clone();
        for piece in &run.records {
            let removed = piece.removed_text(&scratch);
            scratch = piece.apply_to(&scratch)?;
            staged.push((scratch.clone(), removed));
        }

        let mut report = ApplyReport {
            committed: Vec::new(),
            annulled_by: run.annulled_by,
        };
        for (mut piece, (content, removed)) in run.records.into_iter().zip(staged) {
            branch.head_version += 1;
            piece.global_version = Some(branch.head_version);
            branch.content = content;
            branch.ops.push(piece.clone());
            self.vector.advance(piece.author_id);
            report.committed.push(AppliedOp { op: piece, removed });
        }
        Ok(report)
    }

    // ── Branching ────────────────────────────────────────────────

    /// Fork a new branch at `fork_version` on `parent_id`.
    ///
    /// The log prefix is shared, not copied; only the content at the
    /// fork point is materialized by replay.
    pub fn create_branch(
        &mut self,
        name: impl Into<String>,
        parent_id: Uuid,
        fork_version: u64,
    ) -> Result<Uuid, ApplyError> {
        let content = self.materialize(parent_id, fork_version)?;
        self.insert_branch(name, parent_id, fork_version, content)
    }

    /// Fork a new branch with pre-materialized content.
    ///
    /// Used by snapshot restore, where the captured content is exact
    /// and replay would be wasted work.
    pub fn create_branch_with_content(
        &mut self,
        name: impl Into<String>,
        parent_id: Uuid,
        fork_version: u64,
        content: String,
    ) -> Result<Uuid, ApplyError> {
        if !self.branches.contains_key(&parent_id) {
            return Err(ApplyError::UnknownBranch(parent_id));
        }
        self.insert_branch(name, parent_id, fork_version, content)
    }

    fn insert_branch(
        &mut self,
        name: impl Into<String>,
        parent_id: Uuid,
        fork_version: u64,
        content: String,
    ) -> Result<Uuid, ApplyError> {
        let id = Uuid::new_v4();
        self.branches.insert(
            id,
            Branch {
                id,
                name: name.into(),
                parent: Some(parent_id),
                fork_version,
                head_version: fork_version,
                content,
                ops: Vec::new(),
            },
        );
        Ok(id)
    }

    /// Replace a branch wholesale. Merge commits its scratch copy back
    /// through here after a successful replay.
    pub(crate) fn install_branch(&mut self, branch: Branch) {
        self.branches.insert(branch.id, branch);
    }

    pub(crate) fn set_vector(&mut self, vector: VersionVector) {
        self.vector = vector;
    }

    /// Content of `branch_id` as of `version`, reproduced by replaying
    /// the ancestor chain. The replay invariant makes this exact.
    pub fn materialize(&self, branch_id: Uuid, version: u64) -> Result<String, ApplyError> {
        let branch = self
            .branches
            .get(&branch_id)
            .ok_or(ApplyError::UnknownBranch(branch_id))?;

        if version > branch.head_version {
            return Err(ApplyError::FutureBase {
                base_version: version,
                head_version: branch.head_version,
            });
        }
        if version < branch.fork_version {
            return Err(ApplyError::Stale {
                base_version: version,
                horizon: branch.fork_version,
            });
        }
        if version == branch.head_version {
            return Ok(branch.content.clone());
        }

        let mut content = match branch.parent {
            Some(parent) => self.materialize(parent, branch.fork_version)?,
            None => String::new(),
        };
        let take = (version - branch.fork_version) as usize;
        for op in &branch.ops[..take] {
            content = op.apply_to(&content)?;
        }
        Ok(content)
    }

    // ── Snapshots ────────────────────────────────────────────────

    /// Capture `branch_id`'s current content under `label`.
    ///
    /// Overwrites an existing label. The snapshot store write-through
    /// happens in the history layer; this records the in-memory copy.
    pub fn record_snapshot(
        &mut self,
        label: impl Into<String>,
        branch_id: Uuid,
    ) -> Result<Snapshot, ApplyError> {
        let branch = self
            .branches
            .get(&branch_id)
            .ok_or(ApplyError::UnknownBranch(branch_id))?;
        let snapshot = Snapshot {
            content: branch.content.clone(),
            version: branch.head_version,
            branch_id,
        };
        self.snapshots.insert(label.into(), snapshot.clone());
        Ok(snapshot)
    }

    pub(crate) fn cache_snapshot(&mut self, label: impl Into<String>, snapshot: Snapshot) {
        self.snapshots.insert(label.into(), snapshot);
    }
}

// ───────────────────────────────────────────────────────────────────
// Errors
// ───────────────────────────────────────────────────────────────────

/// Failures from the apply pipeline. Each is local to the attempted
/// operation — the log is never extended on an error path.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyError {
    /// Rejected at the model boundary.
    Validation(OperationError),
    /// No such branch on this document.
    UnknownBranch(Uuid),
    /// Based before the branch's retained horizon; sync and resubmit.
    Stale { base_version: u64, horizon: u64 },
    /// Based on a version this branch has not reached.
    FutureBase { base_version: u64, head_version: u64 },
    /// Cross-branch transform attempt.
    Transform(TransformError),
}

impl From<OperationError> for ApplyError {
    fn from(e: OperationError) -> Self {
        Self::Validation(e)
    }
}

impl From<TransformError> for ApplyError {
    fn from(e: TransformError) -> Self {
        Self::Transform(e)
    }
}

impl std::fmt::Display for ApplyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(e) => write!(f, "Invalid operation: {e}"),
            Self::UnknownBranch(id) => write!(f, "Unknown branch {id}"),
            Self::Stale {
                base_version,
                horizon,
            } => write!(
                f,
                "Stale operation: base version {base_version} is before the retained \
                 horizon {horizon}; sync and resubmit"
            ),
            Self::FutureBase {
                base_version,
                head_version,
            } => write!(
                f,
                "Base version {base_version} is ahead of head {head_version}"
            ),
            Self::Transform(e) => write!(f, "Transform failed: {e}"),
        }
    }
}

impl std::error::Error for ApplyError {}

// ===================================================================
// Tests
// ===================================================================
