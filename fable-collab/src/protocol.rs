//! Binary room protocol carrying operations, presence, and sync.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬───────────┬────────────────────┐
//! │ room_id  │ sender_id │ timestamp │ body (tagged enum) │
//! │ 16 bytes │ 16 bytes  │ 8 bytes   │ variable           │
//! └──────────┴───────────┴───────────┴────────────────────┘
//! ```
//!
//! | Kind            | Direction       | Carries                       |
//! |-----------------|-----------------|-------------------------------|
//! | Join            | client → server | display name                  |
//! | Leave           | client → server | nothing                       |
//! | Change          | client → server | one operation                 |
//! | Batch           | client → server | operations in submit order    |
//! | Cursor          | both            | cursor + optional selection   |
//! | Sync            | client → server | nothing                       |
//! | Heartbeat       | client → server | nothing                       |
//! | JoinAck         | server → client | content, head, vector, roster |
//! | SyncState       | server → client | content, head, vector         |
//! | Committed       | server → room   | committed records             |
//! | Annulled        | server → room   | no-op notice                  |
//! | PresenceChanged | server → room   | session + old/new status      |
//! | HeartbeatAck    | server → client | nothing                       |
//! | Rejected        | server → client | reason                        |
//!
//! Server-originated envelopes use a nil `sender_id` unless the
//! message is about one particular participant.
//!
//! Reference: Kleppmann, Chapter 4 — Encoding and Evolution

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::operation::Operation;
use crate::presence::{SessionSnapshot, SessionStatus};
use crate::version::VersionVector;

/// Discriminant for routing and logging without matching the full
/// body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageKind {
    Join = 1,
    Leave = 2,
    Change = 3,
    Batch = 4,
    Cursor = 5,
    Sync = 6,
    Heartbeat = 7,
    JoinAck = 8,
    SyncState = 9,
    Committed = 10,
    Annulled = 11,
    PresenceChanged = 12,
    HeartbeatAck = 13,
    Rejected = 14,
}

/// Typed message payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum MessageBody {
    /// Enter the room and ask for the current state.
    Join { display_name: String },
    /// Clean disconnect.
    Leave,
    /// One operation to validate, transform, and commit.
    Change { op: Operation },
    /// Operations applied in submit order, stopping at the first hard
    /// failure.
    Batch { ops: Vec<Operation> },
    /// Cursor move with optional selection, throttled server-side.
    Cursor {
        position: usize,
        selection: Option<(usize, usize)>,
    },
    /// Ask for a fresh copy of the document state.
    Sync,
    /// Liveness signal.
    Heartbeat,

    /// Reply to `Join`: everything needed to start editing.
    JoinAck {
        content: String,
        head_version: u64,
        vector: VersionVector,
        sessions: Vec<SessionSnapshot>,
        branch_id: Uuid,
    },
    /// Reply to `Sync`.
    SyncState {
        content: String,
        head_version: u64,
        vector: VersionVector,
    },
    /// Records committed by one submission, in commit order.
    Committed { ops: Vec<Operation> },
    /// A submission that was transformed away entirely.
    Annulled { op_id: Uuid, annulled_by: Uuid },
    /// A session changed visibility.
    PresenceChanged {
        session: SessionSnapshot,
        old: SessionStatus,
        new: SessionStatus,
    },
    /// Reply to `Heartbeat`.
    HeartbeatAck,
    /// A submission the room refused, with the reason.
    Rejected { reason: String },
}

impl MessageBody {
    pub fn kind(&self) -> MessageKind {
        match self {
            MessageBody::Join { .. } => MessageKind::Join,
            MessageBody::Leave => MessageKind::Leave,
            MessageBody::Change { .. } => MessageKind::Change,
            MessageBody::Batch { .. } => MessageKind::Batch,
            MessageBody::Cursor { .. } => MessageKind::Cursor,
            MessageBody::Sync => MessageKind::Sync,
            MessageBody::Heartbeat => MessageKind::Heartbeat,
            MessageBody::JoinAck { .. } => MessageKind::JoinAck,
            MessageBody::SyncState { .. } => MessageKind::SyncState,
            MessageBody::Committed { .. } => MessageKind::Committed,
            MessageBody::Annulled { .. } => MessageKind::Annulled,
            MessageBody::PresenceChanged { .. } => MessageKind::PresenceChanged,
            MessageBody::HeartbeatAck => MessageKind::HeartbeatAck,
            MessageBody::Rejected { .. } => MessageKind::Rejected,
        }
    }
}

/// Top-level wire frame: which room, who sent it, when, and what.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub room_id: Uuid,
    pub sender_id: Uuid,
    /// Sender wall clock, milliseconds since the Unix epoch. Carried
    /// for diagnostics; ordering always comes from versions.
    pub timestamp: u64,
    pub body: MessageBody,
}

impl Envelope {
    pub fn new(room_id: Uuid, sender_id: Uuid, body: MessageBody) -> Self {
        Self {
            room_id,
            sender_id,
            timestamp: now_millis(),
            body,
        }
    }

    // ── Client-side constructors ─────────────────────────────────

    pub fn join(room_id: Uuid, sender_id: Uuid, display_name: impl Into<String>) -> Self {
        Self::new(
            room_id,
            sender_id,
            MessageBody::Join {
                display_name: display_name.into(),
            },
        )
    }

    pub fn leave(room_id: Uuid, sender_id: Uuid) -> Self {
        Self::new(room_id, sender_id, MessageBody::Leave)
    }

    pub fn change(room_id: Uuid, sender_id: Uuid, op: Operation) -> Self {
        Self::new(room_id, sender_id, MessageBody::Change { op })
    }

    pub fn batch(room_id: Uuid, sender_id: Uuid, ops: Vec<Operation>) -> Self {
        Self::new(room_id, sender_id, MessageBody::Batch { ops })
    }

    pub fn cursor(
        room_id: Uuid,
        sender_id: Uuid,
        position: usize,
        selection: Option<(usize, usize)>,
    ) -> Self {
        Self::new(
            room_id,
            sender_id,
            MessageBody::Cursor {
                position,
                selection,
            },
        )
    }

    pub fn sync(room_id: Uuid, sender_id: Uuid) -> Self {
        Self::new(room_id, sender_id, MessageBody::Sync)
    }

    pub fn heartbeat(room_id: Uuid, sender_id: Uuid) -> Self {
        Self::new(room_id, sender_id, MessageBody::Heartbeat)
    }

    // ── Server-side constructors ─────────────────────────────────

    pub fn committed(room_id: Uuid, author_id: Uuid, ops: Vec<Operation>) -> Self {
        Self::new(room_id, author_id, MessageBody::Committed { ops })
    }

    pub fn annulled(room_id: Uuid, author_id: Uuid, op_id: Uuid, annulled_by: Uuid) -> Self {
        Self::new(
            room_id,
            author_id,
            MessageBody::Annulled { op_id, annulled_by },
        )
    }

    pub fn presence_changed(
        room_id: Uuid,
        session: SessionSnapshot,
        old: SessionStatus,
        new: SessionStatus,
    ) -> Self {
        let user_id = session.user_id;
        Self::new(
            room_id,
            user_id,
            MessageBody::PresenceChanged { session, old, new },
        )
    }

    pub fn rejected(room_id: Uuid, sender_id: Uuid, reason: impl Into<String>) -> Self {
        Self::new(
            room_id,
            sender_id,
            MessageBody::Rejected {
                reason: reason.into(),
            },
        )
    }

    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }

    /// Serialize to the binary wire format.
    #[inline(always)]
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from the binary wire format.
    #[inline(always)]
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (envelope, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(envelope)
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

// ===================================================================
// Tests
// ===================================================================
