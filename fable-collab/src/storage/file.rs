//! File-backed snapshot store.
//!
//! Each key maps to one file named by the FNV-1a hash of the key:
//! `<root>/<hash as hex>.snap`, each file a bincode frame of
//! [`StoredBlob`]. The frame carries the key itself and the key is
//! checked on read, so a hash collision surfaces as corruption instead
//! of silently returning another document's snapshot.
//!
//! Writes go through a sibling temp file and a rename; readers never
//! observe a half-written frame.

use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::{SnapshotStore, StoreError};

/// On-disk frame around a snapshot payload.
#[derive(Debug, Serialize, Deserialize)]
struct StoredBlob {
    /// Store key the payload was written under
    key: String,
    /// Opaque snapshot bytes
    payload: Vec<u8>,
}

/// One-file-per-snapshot store rooted at a directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)
            .map_err(|e| StoreError::Io(format!("create {}: {e}", root.display())))?;
        Ok(Self { root })
    }

    fn blob_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{:016x}.snap", fnv1a(key)))
    }
}

impl SnapshotStore for FileStore {
    fn put(&self, key: &str, blob: &[u8]) -> Result<(), StoreError> {
        let frame = StoredBlob {
            key: key.to_string(),
            payload: blob.to_vec(),
        };
        let bytes = bincode::serde::encode_to_vec(&frame, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let path = self.blob_path(key);
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &bytes)
            .map_err(|e| StoreError::Io(format!("write {}: {e}", tmp.display())))?;
        fs::rename(&tmp, &path)
            .map_err(|e| StoreError::Io(format!("rename {}: {e}", path.display())))?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.blob_path(key);
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(key.to_string()));
            }
            Err(e) => return Err(StoreError::Io(format!("read {}: {e}", path.display()))),
        };

        let (frame, _): (StoredBlob, _) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                .map_err(|e| StoreError::Corrupt(format!("{}: {e}", path.display())))?;
        if frame.key != key {
            return Err(StoreError::Corrupt(format!(
                "key mismatch in {}: expected {key}, found {}",
                path.display(),
                frame.key
            )));
        }
        Ok(frame.payload)
    }
}

/// FNV-1a over the key bytes; names the blob file.
fn fnv1a(key: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325; // FNV offset basis
    for byte in key.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3); // FNV prime
    }
    hash
}

// ===================================================================
// Tests
// ===================================================================
