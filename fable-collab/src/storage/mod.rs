//! Snapshot persistence behind a narrow trait.
//!
//! Architecture:
//! ```text
//! ┌──────────────┐  "{doc_id}:{label}"  ┌─────────────────┐
//! │ CollabEngine │ ───────────────────► │  SnapshotStore  │
//! │ (in-memory)  │   compressed bytes   │   MemoryStore   │
//! └──────────────┘                      │   FileStore     │
//!                                       └─────────────────┘
//! ```
//!
//! The engine treats the store as a blob sink: keys name a document
//! plus a label, values are lz4-compressed bincode. A backend only has
//! to honor two calls, so swapping it never touches engine code.

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use uuid::Uuid;

/// Key for a labeled snapshot of one document.
pub fn snapshot_key(doc_id: Uuid, label: &str) -> String {
    format!("{doc_id}:{label}")
}

/// Durable home for snapshot blobs.
///
/// Implementations must tolerate calls from multiple rooms at once;
/// the engine shares one store across every document.
pub trait SnapshotStore: Send + Sync {
    /// Persist `blob` under `key`, replacing any previous value.
    fn put(&self, key: &str, blob: &[u8]) -> Result<(), StoreError>;

    /// Fetch the blob stored under `key`.
    fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;
}

/// Store errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// No blob under the requested key
    NotFound(String),
    /// Underlying I/O failed
    Io(String),
    /// Encoding a blob failed
    Serialization(String),
    /// A stored blob failed to decode or verify
    Corrupt(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound(key) => write!(f, "no snapshot stored under {key}"),
            StoreError::Io(e) => write!(f, "store I/O error: {e}"),
            StoreError::Serialization(e) => write!(f, "store serialization error: {e}"),
            StoreError::Corrupt(e) => write!(f, "corrupt snapshot blob: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}
