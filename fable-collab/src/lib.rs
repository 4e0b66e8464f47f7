//! # fable-collab — Collaborative synchronization engine
//!
//! Multi-participant text editing with operational transformation:
//! concurrent edits are transformed against everything they missed,
//! so every participant converges on the same document without locks
//! or turn-taking.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   Envelope (bincode)   ┌──────────────┐
//! │ Client A   │ ─────────────────────▶ │ CollabEngine │
//! │ Client B   │ ◀───────────────────── │  (rooms)     │
//! └────────────┘     broadcast rx       └──────┬───────┘
//!                                              │
//!                              ┌───────────────┼───────────────┐
//!                              ▼               ▼               ▼
//!                       ┌────────────┐  ┌─────────────┐  ┌───────────┐
//!                       │ Document   │  │ Presence    │  │ Snapshot  │
//!                       │ + History  │  │ Tracker     │  │ Store     │
//!                       └────────────┘  └─────────────┘  └───────────┘
//! ```
//!
//! ## Modules
//!
//! - [`operation`] — Insert/Delete/Update edits with version lineage
//! - [`transform`] — Pairwise operational transformation
//! - [`version`] — Per-author version vectors and causal ordering
//! - [`document`] — Branches, the transform pipeline, snapshots
//! - [`history`] — Per-participant undo/redo, merges, batches
//! - [`presence`] — Session liveness, cursors, engagement
//! - [`protocol`] — Binary envelope codec
//! - [`broadcast`] — Per-room fan-out with backpressure
//! - [`room`] — Room multiplexing and the engine surface
//! - [`storage`] — Snapshot persistence (memory and file-backed)
//!
//! ## Guarantees
//!
//! | Property | How |
//! |----------|-----|
//! | Convergence | every commit is transformed across all missed operations |
//! | Intention preservation | positions shift, text never silently relocates |
//! | Deterministic ties | same-position inserts ordered by (author, id) |
//! | Undo safety | inverses ride the same transform pipeline as edits |

pub mod broadcast;
pub mod document;
pub mod history;
pub mod operation;
pub mod presence;
pub mod protocol;
pub mod room;
pub mod storage;
pub mod transform;
pub mod version;

// Re-exports for convenience
pub use broadcast::{ChannelStats, RoomChannel};
pub use document::{AppliedOp, ApplyError, ApplyReport, Branch, Document, Snapshot};
pub use history::{
    apply_batch, create_snapshot, merge_branch, restore_snapshot, BatchSummary, HistoryError,
    MergeReport, UndoHistory, DEFAULT_UNDO_DEPTH,
};
pub use operation::{OpKind, Operation, OperationError};
pub use presence::{
    compute_engagement, ActivityType, PresenceConfig, PresenceTracker, SessionSnapshot,
    SessionStatus, SweepReport,
};
pub use protocol::{Envelope, MessageBody, MessageKind, ProtocolError};
pub use room::{CollabEngine, EngineConfig, EngineError, EngineStats, Room};
pub use storage::{snapshot_key, FileStore, MemoryStore, SnapshotStore, StoreError};
pub use transform::{ConcurrentInsertPolicy, TransformError, Transformed};
pub use version::{CausalOrder, VersionVector};
