//! Local blob storage for offline telemetry
//!
//! Each stream persists its whole buffer as one blob under a stable key.
//! The host store enforces a hard per-key size ceiling; writes above it are
//! refused with `StoreError::TooLarge` instead of being attempted.
//!
//! - `SledStore`: durable sled-backed store
//! - `MemoryStore`: in-process store for tests and ephemeral hosts

mod memory;
mod sled_store;

pub use memory::MemoryStore;
pub use sled_store::SledStore;

/// Default per-key blob ceiling (bytes).
pub const DEFAULT_MAX_BLOB_BYTES: usize = 1024 * 1024;

/// Trait for pluggable blob stores
///
/// Implementations must be thread-safe (Send + Sync) for shared access
/// across async tasks. `put` must replace the value atomically: a reader
/// (or a restart) observes either the previous blob or the new one.
pub trait BlobStore: Send + Sync {
    /// Read the blob stored under `key`
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Replace the blob stored under `key`
    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    /// Delete the blob stored under `key` (no-op if absent)
    fn remove(&self, key: &str) -> Result<(), StoreError>;

    /// Per-key size ceiling enforced by this store
    fn max_blob_bytes(&self) -> usize;

    /// Backend name for logging
    fn backend_name(&self) -> &'static str;
}

/// Blob store errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("blob for '{key}' is {size} bytes, store limit is {limit}")]
    TooLarge { key: String, size: usize, limit: usize },
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Whether this error is a capacity (row/blob too big) failure
    pub const fn is_capacity(&self) -> bool {
        matches!(self, Self::TooLarge { .. })
    }
}

fn check_ceiling(key: &str, value: &[u8], limit: usize) -> Result<(), StoreError> {
    if value.len() > limit {
        return Err(StoreError::TooLarge {
            key: key.to_string(),
            size: value.len(),
            limit,
        });
    }
    Ok(())
}
