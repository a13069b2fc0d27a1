//! In-memory blob store
//!
//! Thread-safe via `RwLock`. Not durable — data lost when dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use super::{check_ceiling, BlobStore, StoreError, DEFAULT_MAX_BLOB_BYTES};

/// In-memory blob store enforcing the same ceiling as durable stores
pub struct MemoryStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
    max_blob_bytes: usize,
    writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_ceiling(DEFAULT_MAX_BLOB_BYTES)
    }

    pub fn with_ceiling(max_blob_bytes: usize) -> Self {
        Self {
            blobs: RwLock::new(HashMap::new()),
            max_blob_bytes,
            writes: AtomicUsize::new(0),
        }
    }

    /// Number of successful `put` calls so far
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BlobStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let blobs = self
            .blobs
            .read()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(blobs.get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        check_ceiling(key, value, self.max_blob_bytes)?;

        let mut blobs = self
            .blobs
            .write()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        blobs.insert(key.to_string(), value.to_vec());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut blobs = self
            .blobs
            .write()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        blobs.remove(key);
        Ok(())
    }

    fn max_blob_bytes(&self) -> usize {
        self.max_blob_bytes
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemoryStore::new();
        store.put("a", b"1").unwrap();
        assert_eq!(store.get("a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.write_count(), 1);
    }

    #[test]
    fn test_memory_store_ceiling() {
        let store = MemoryStore::with_ceiling(4);
        let err = store.put("a", b"12345").unwrap_err();
        assert_eq!(
            err,
            StoreError::TooLarge {
                key: "a".to_string(),
                size: 5,
                limit: 4
            }
        );
        assert_eq!(store.write_count(), 0);
    }

    #[test]
    fn test_trait_object() {
        let store: Box<dyn BlobStore> = Box::new(MemoryStore::new());
        assert_eq!(store.backend_name(), "memory");
        store.put("k", b"v").unwrap();
        store.remove("k").unwrap();
        assert_eq!(store.get("k").unwrap(), None);
    }
}
