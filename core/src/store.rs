//! Storage abstraction for the invitation metadata store
//!
//! Persistent invitations survive process restart; the manager writes
//! them through this backend keyed by invitation id.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Storage errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Unified storage trait for metadata persistence.
pub trait StorageBackend: Send + Sync {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError>;
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;
    fn remove(&self, key: &[u8]) -> Result<(), StoreError>;
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError>;
    fn flush(&self) -> Result<(), StoreError>;
}

/// In-memory storage useful for testing and ephemeral profiles.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    data: Arc<RwLock<HashMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for MemoryStorage {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.data.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.data.read().get(key).cloned())
    }

    fn remove(&self, key: &[u8]) -> Result<(), StoreError> {
        self.data.write().remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let mut results = Vec::new();
        for (key, value) in self.data.read().iter() {
            if key.starts_with(prefix) {
                results.push((key.clone(), value.clone()));
            }
        }
        Ok(results)
    }

    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Sled-backed storage for durable profiles.
pub struct SledStorage {
    db: sled::Db,
}

impl SledStorage {
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let db = sled::open(path).map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(Self { db })
    }
}

impl StorageBackend for SledStorage {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.db
            .insert(key, value)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let value = self
            .db
            .get(key)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(value.map(|ivec| ivec.to_vec()))
    }

    fn remove(&self, key: &[u8]) -> Result<(), StoreError> {
        self.db
            .remove(key)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let mut results = Vec::new();
        for entry in self.db.scan_prefix(prefix) {
            let (key, value) = entry.map_err(|e| StoreError::Backend(e.to_string()))?;
            results.push((key.to_vec(), value.to_vec()));
        }
        Ok(results)
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.db
            .flush()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise_backend(store: &dyn StorageBackend) {
        store.put(b"invitation/a", b"1").unwrap();
        store.put(b"invitation/b", b"2").unwrap();
        store.put(b"other/c", b"3").unwrap();

        assert_eq!(store.get(b"invitation/a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.get(b"missing").unwrap(), None);

        let rows = store.scan_prefix(b"invitation/").unwrap();
        assert_eq!(rows.len(), 2);

        store.remove(b"invitation/a").unwrap();
        assert_eq!(store.get(b"invitation/a").unwrap(), None);
        store.flush().unwrap();
    }

    #[test]
    fn test_memory_storage() {
        exercise_backend(&MemoryStorage::new());
    }

    #[test]
    fn test_sled_storage() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledStorage::open(dir.path().to_str().unwrap()).unwrap();
        exercise_backend(&store);
    }
}
