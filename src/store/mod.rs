#![forbid(unsafe_code)]

// Store module - network-addressable key-value state shared by every gateway process

pub mod memory;
pub mod redis_store;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

use async_trait::async_trait;
use thiserror::Error;

/// Errors raised by a key-value backend
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Corrupt record at {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A value together with the version it was written at.
///
/// Versions start at 1 for the first write; 0 stands for "no record".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub version: u64,
    pub value: String,
}

/// Versioned key-value store.
///
/// Writers read a record, mutate it locally and write it back with
/// `compare_and_swap` against the version they read, so two processes
/// racing on the same key can never silently overwrite each other.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<Versioned>>;

    /// Writes `value` only if the stored version equals `expected_version`
    /// (0 = key must be absent). Returns `false` on a version mismatch.
    async fn compare_and_swap(&self, key: &str, expected_version: u64, value: String) -> StoreResult<bool>;

    /// Deletes the key only if it is still at `expected_version`
    async fn compare_and_delete(&self, key: &str, expected_version: u64) -> StoreResult<bool>;

    async fn delete(&self, key: &str) -> StoreResult<()>;
}
