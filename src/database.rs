//! Database abstraction for PoI snapshots.
//!
//! Snapshots are persisted as canonical JSON blobs under a prefixed key so
//! that any blob key-value store can serve as a backend:
//! - Memory-based for testing
//! - MDBX or other persistent storage for production

use super::{PoiConfig, PoiError, Snapshot};
use alloy_primitives::B256;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Database key prefix for PoI snapshots.
pub const POI_SNAPSHOT_PREFIX: &[u8] = b"poi-";

/// Build the storage key for a snapshot at the given block hash.
pub fn snapshot_key(hash: B256) -> Vec<u8> {
    let mut key = Vec::with_capacity(POI_SNAPSHOT_PREFIX.len() + hash.len());
    key.extend_from_slice(POI_SNAPSHOT_PREFIX);
    key.extend_from_slice(hash.as_slice());
    key
}

/// Trait for snapshot database operations.
///
/// Loaded snapshots carry a default configuration; the engine overwrites it
/// with its own before use.
pub trait SnapshotDatabase: Send + Sync {
    /// Load a snapshot by block hash.
    fn load_snapshot(&self, hash: B256) -> Result<Option<Snapshot>, PoiError>;

    /// Store a snapshot.
    fn store_snapshot(&self, snapshot: &Snapshot) -> Result<(), PoiError>;

    /// Delete a snapshot by block hash.
    fn delete_snapshot(&self, hash: B256) -> Result<(), PoiError>;

    /// Check if a snapshot exists.
    fn has_snapshot(&self, hash: B256) -> Result<bool, PoiError>;
}

/// Memory-based snapshot database for testing.
///
/// Stores the serialized blobs rather than live values, exercising the same
/// encode/decode path a persistent backend would.
#[derive(Debug, Default)]
pub struct MemorySnapshotDatabase {
    blobs: RwLock<HashMap<Vec<u8>, Vec<u8>>>,
}

impl MemorySnapshotDatabase {
    /// Create a new memory database.
    pub fn new() -> Self {
        Self {
            blobs: RwLock::new(HashMap::new()),
        }
    }

    /// Create a new memory database wrapped in Arc.
    pub fn new_arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Get the number of stored snapshots.
    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    /// Check if the database is empty.
    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }

    /// Clear all snapshots.
    pub fn clear(&self) {
        self.blobs.write().clear();
    }

    /// Overwrite the raw blob for a hash. Test helper for corruption cases.
    #[cfg(test)]
    pub(crate) fn put_raw(&self, hash: B256, blob: Vec<u8>) {
        self.blobs.write().insert(snapshot_key(hash), blob);
    }
}

impl SnapshotDatabase for MemorySnapshotDatabase {
    fn load_snapshot(&self, hash: B256) -> Result<Option<Snapshot>, PoiError> {
        let blobs = self.blobs.read();
        let Some(blob) = blobs.get(&snapshot_key(hash)) else {
            return Ok(None);
        };
        Snapshot::decode(PoiConfig::default(), blob).map(Some)
    }

    fn store_snapshot(&self, snapshot: &Snapshot) -> Result<(), PoiError> {
        let blob = snapshot.encode()?;
        self.blobs.write().insert(snapshot_key(snapshot.hash), blob);
        Ok(())
    }

    fn delete_snapshot(&self, hash: B256) -> Result<(), PoiError> {
        self.blobs.write().remove(&snapshot_key(hash));
        Ok(())
    }

    fn has_snapshot(&self, hash: B256) -> Result<bool, PoiError> {
        Ok(self.blobs.read().contains_key(&snapshot_key(hash)))
    }
}

/// A no-op database that doesn't persist anything.
/// Useful for scenarios where snapshot caching is handled externally.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSnapshotDatabase;

impl SnapshotDatabase for NoopSnapshotDatabase {
    fn load_snapshot(&self, _hash: B256) -> Result<Option<Snapshot>, PoiError> {
        Ok(None)
    }

    fn store_snapshot(&self, _snapshot: &Snapshot) -> Result<(), PoiError> {
        Ok(())
    }

    fn delete_snapshot(&self, _hash: B256) -> Result<(), PoiError> {
        Ok(())
    }

    fn has_snapshot(&self, _hash: B256) -> Result<bool, PoiError> {
        Ok(false)
    }
}
