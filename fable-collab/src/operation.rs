//! Immutable operation records — the unit of change for shared documents.
//!
//! Every edit is described as an insert, delete, or update positioned
//! against the document version the author last saw (`base_version`).
//! Records are append-only: once the engine assigns a `global_version`
//! the record is never mutated or removed. Corrections happen by
//! appending new operations (undo produces an inverse, merge produces
//! transformed copies).
//!
//! Positions and lengths are counted in Unicode scalar values, not
//! bytes, so concurrent edits over multi-byte text transform cleanly.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 5

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The three edit kinds carried by an [`Operation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpKind {
    /// Insert `content` at `position`.
    Insert,
    /// Remove `length` scalar values starting at `position`.
    Delete,
    /// Replace `length` scalar values at `position` with `content`.
    Update,
}

/// A single edit to a shared document.
///
/// Operations are created by participants against the document state
/// they last observed and are repositioned by the transform engine
/// before they commit. The record itself is immutable — transformation
/// produces new records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Unique operation identity.
    pub id: Uuid,
    /// Edit kind.
    pub kind: OpKind,
    /// Offset in scalar values into the content at `base_version`.
    pub position: usize,
    /// Inserted or replacement text (empty for deletes).
    pub content: String,
    /// Scalar values affected: span length for delete/update,
    /// inserted length for insert.
    pub length: usize,
    /// Author identity.
    pub author_id: Uuid,
    /// Document version this edit was computed against.
    pub base_version: u64,
    /// Version assigned on acceptance. `None` until committed.
    pub global_version: Option<u64>,
    /// Branch this operation targets. Root branch is `Uuid::nil()`.
    pub branch_id: Uuid,
    /// Set when this operation reverses a prior one.
    pub undo_of: Option<Uuid>,
    /// Set when this operation re-applies an undone one.
    pub redo_of: Option<Uuid>,
    /// Last committed operation this record was transformed against.
    pub derived_from: Option<Uuid>,
}

impl Operation {
    /// Create an insert targeting the root branch.
    pub fn insert(
        author_id: Uuid,
        position: usize,
        content: impl Into<String>,
        base_version: u64,
    ) -> Self {
        let content = content.into();
        let length = char_len(&content);
        Self {
            id: Uuid::new_v4(),
            kind: OpKind::Insert,
            position,
            content,
            length,
            author_id,
            base_version,
            global_version: None,
            branch_id: Uuid::nil(),
            undo_of: None,
            redo_of: None,
            derived_from: None,
        }
    }

    /// Create a delete targeting the root branch.
    pub fn delete(author_id: Uuid, position: usize, length: usize, base_version: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: OpKind::Delete,
            position,
            content: String::new(),
            length,
            author_id,
            base_version,
            global_version: None,
            branch_id: Uuid::nil(),
            undo_of: None,
            redo_of: None,
            derived_from: None,
        }
    }

    /// Create an update (replace `length` scalars with `content`).
    pub fn update(
        author_id: Uuid,
        position: usize,
        length: usize,
        content: impl Into<String>,
        base_version: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: OpKind::Update,
            position,
            content: content.into(),
            length,
            author_id,
            base_version,
            global_version: None,
            branch_id: Uuid::nil(),
            undo_of: None,
            redo_of: None,
            derived_from: None,
        }
    }

    /// Rebase this operation onto a newer observed version, as when
    /// resubmitting after a resync.
    pub fn with_base(mut self, base_version: u64) -> Self {
        self.base_version = base_version;
        self
    }

    /// Retarget this operation at a branch.
    pub fn on_branch(mut self, branch_id: Uuid) -> Self {
        self.branch_id = branch_id;
        self
    }

    /// Mark this operation as the inverse of a prior one.
    pub fn as_undo_of(mut self, original: Uuid) -> Self {
        self.undo_of = Some(original);
        self
    }

    /// Mark this operation as a re-application of an undone one.
    pub fn as_redo_of(mut self, original: Uuid) -> Self {
        self.redo_of = Some(original);
        self
    }

    /// Length of `content` in scalar values.
    pub fn content_len(&self) -> usize {
        char_len(&self.content)
    }

    /// One past the last scalar affected by a delete/update span.
    pub fn end(&self) -> usize {
        match self.kind {
            OpKind::Insert => self.position,
            OpKind::Delete | OpKind::Update => self.position + self.length,
        }
    }

    /// Whether a `global_version` has been assigned.
    pub fn is_committed(&self) -> bool {
        self.global_version.is_some()
    }

    /// Deterministic ordering for concurrent inserts at equal positions.
    ///
    /// Compares `(author_id, id)` lexicographically; every replica
    /// agrees on which insert lands first regardless of arrival order.
    pub fn precedes(&self, other: &Operation) -> bool {
        (self.author_id, self.id) < (other.author_id, other.id)
    }

    /// Content-independent validity: inserts carry text, spans cover
    /// something. Checked before any branch state is touched.
    pub fn validate_shape(&self) -> Result<(), OperationError> {
        match self.kind {
            OpKind::Insert => {
                if self.content.is_empty() {
                    return Err(OperationError::EmptyInsert);
                }
            }
            OpKind::Delete | OpKind::Update => {
                if self.length == 0 {
                    return Err(OperationError::ZeroLengthSpan);
                }
            }
        }
        Ok(())
    }

    /// Validate this operation against the current content length.
    ///
    /// Rejections happen here, at the model boundary — nothing invalid
    /// reaches the transform engine or the log.
    pub fn validate(&self, content_len: usize) -> Result<(), OperationError> {
        self.validate_shape()?;
        if self.position > content_len {
            return Err(OperationError::PositionOutOfBounds {
                position: self.position,
                content_len,
            });
        }
        if matches!(self.kind, OpKind::Delete | OpKind::Update)
            && self.position + self.length > content_len
        {
            return Err(OperationError::SpanOutOfBounds {
                position: self.position,
                length: self.length,
                content_len,
            });
        }
        Ok(())
    }

    /// Apply this operation to `content`, producing the new content.
    ///
    /// Validates first; the input string is never left half-edited.
    pub fn apply_to(&self, content: &str) -> Result<String, OperationError> {
        let len = char_len(content);
        self.validate(len)?;
        Ok(match self.kind {
            OpKind::Insert => splice(content, self.position, 0, &self.content),
            OpKind::Delete => splice(content, self.position, self.length, ""),
            OpKind::Update => splice(content, self.position, self.length, &self.content),
        })
    }

    /// Text this operation removes from `content` (deletes and updates).
    ///
    /// Captured at apply time so the inverse can be reconstructed for
    /// undo without replaying the log.
    pub fn removed_text(&self, content: &str) -> Option<String> {
        match self.kind {
            OpKind::Insert => None,
            OpKind::Delete | OpKind::Update => {
                Some(slice_chars(content, self.position, self.length))
            }
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Scalar-value string helpers
// ───────────────────────────────────────────────────────────────────

/// Content length in Unicode scalar values.
pub(crate) fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Byte offset of scalar index `idx`; clamps to the end of the string.
pub(crate) fn byte_offset(s: &str, idx: usize) -> usize {
    s.char_indices().nth(idx).map(|(b, _)| b).unwrap_or(s.len())
}

/// Extract `len` scalars starting at scalar index `start`.
pub(crate) fn slice_chars(s: &str, start: usize, len: usize) -> String {
    let begin = byte_offset(s, start);
    let end = byte_offset(s, start + len);
    s[begin..end].to_string()
}

/// Replace `remove` scalars at scalar index `at` with `insert`.
fn splice(s: &str, at: usize, remove: usize, insert: &str) -> String {
    let begin = byte_offset(s, at);
    let end = byte_offset(s, at + remove);
    let mut out = String::with_capacity(s.len() - (end - begin) + insert.len());
    out.push_str(&s[..begin]);
    out.push_str(insert);
    out.push_str(&s[end..]);
    out
}

// ───────────────────────────────────────────────────────────────────
// Errors
// ───────────────────────────────────────────────────────────────────

/// Validation failures raised at the operation boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationError {
    /// Position past the end of the content.
    PositionOutOfBounds { position: usize, content_len: usize },
    /// Delete/update span runs past the end of the content.
    SpanOutOfBounds {
        position: usize,
        length: usize,
        content_len: usize,
    },
    /// Insert with no text.
    EmptyInsert,
    /// Delete/update covering nothing.
    ZeroLengthSpan,
}

impl std::fmt::Display for OperationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PositionOutOfBounds {
                position,
                content_len,
            } => write!(
                f,
                "Position {position} out of bounds (content length {content_len})"
            ),
            Self::SpanOutOfBounds {
                position,
                length,
                content_len,
            } => write!(
                f,
                "Span {position}..{} out of bounds (content length {content_len})",
                position + length
            ),
            Self::EmptyInsert => write!(f, "Insert carries no content"),
            Self::ZeroLengthSpan => write!(f, "Delete/update affects zero scalars"),
        }
    }
}

impl std::error::Error for OperationError {}

// ===================================================================
// Tests
// ===================================================================
