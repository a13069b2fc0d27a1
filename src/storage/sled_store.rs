//! Sled-backed blob store

use std::path::Path;
use std::sync::Arc;

use super::{check_ceiling, BlobStore, StoreError};

/// Durable blob store on a sled database
#[derive(Clone)]
pub struct SledStore {
    db: Arc<sled::Db>,
    max_blob_bytes: usize,
}

impl SledStore {
    /// Open or create the store at `path`
    pub fn open<P: AsRef<Path>>(path: P, max_blob_bytes: usize) -> Result<Self, StoreError> {
        let path_ref = path.as_ref();
        let db = sled::open(path_ref).map_err(|e| StoreError::Backend(e.to_string()))?;

        tracing::info!(path = %path_ref.display(), max_blob_bytes, "Telemetry store opened");

        Ok(Self {
            db: Arc::new(db),
            max_blob_bytes,
        })
    }

    /// Keys currently present in the store
    pub fn keys(&self) -> Vec<String> {
        self.db
            .iter()
            .keys()
            .filter_map(Result::ok)
            .map(|k| String::from_utf8_lossy(&k).into_owned())
            .collect()
    }
}

impl BlobStore for SledStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.db
            .get(key)
            .map(|v| v.map(|ivec| ivec.to_vec()))
            .map_err(|e| StoreError::Backend(e.to_string()))
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        check_ceiling(key, value, self.max_blob_bytes)?;

        // Single-key insert is atomic in sled; flush makes it durable
        self.db
            .insert(key, value)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        self.db
            .flush()
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        tracing::trace!(key, size_bytes = value.len(), "Blob written");
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.db
            .remove(key)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        self.db
            .flush()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    fn max_blob_bytes(&self) -> usize {
        self.max_blob_bytes
    }

    fn backend_name(&self) -> &'static str {
        "sled"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_and_get() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SledStore::open(tmp.path(), 1024).unwrap();

        store.put("k", b"[1,2,3]").unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some(&b"[1,2,3]"[..]));
        assert_eq!(store.get("missing").unwrap(), None);
    }

    #[test]
    fn test_ceiling_rejects_without_writing() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SledStore::open(tmp.path(), 8).unwrap();

        store.put("k", b"small").unwrap();
        let err = store.put("k", b"this is far too large").unwrap_err();
        assert!(err.is_capacity());
        // Previous value survives the refused write
        assert_eq!(store.get("k").unwrap().as_deref(), Some(&b"small"[..]));
    }

    #[test]
    fn test_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let store = SledStore::open(tmp.path(), 1024).unwrap();
            store.put("crash_reports_offline", b"[]").unwrap();
        }
        let store = SledStore::open(tmp.path(), 1024).unwrap();
        assert_eq!(store.keys(), vec!["crash_reports_offline".to_string()]);
    }

    #[test]
    fn test_remove() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SledStore::open(tmp.path(), 1024).unwrap();
        store.put("k", b"v").unwrap();
        store.remove("k").unwrap();
        assert_eq!(store.get("k").unwrap(), None);
        store.remove("k").unwrap();
    }
}
