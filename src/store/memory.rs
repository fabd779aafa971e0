#![forbid(unsafe_code)]

// In-process store used for single-node deployments and tests

use super::{KeyValueStore, StoreResult, Versioned};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

/// `KeyValueStore` backed by a mutex-guarded map
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Versioned>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Versioned>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn compare_and_swap(&self, key: &str, expected_version: u64, value: String) -> StoreResult<bool> {
        let mut entries = self.entries.lock();
        let current = entries.get(key).map_or(0, |v| v.version);
        if current != expected_version {
            return Ok(false);
        }
        entries.insert(key.to_string(), Versioned {
            version: expected_version + 1,
            value,
        });
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, expected_version: u64) -> StoreResult<bool> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(v) if v.version == expected_version => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cas_rejects_stale_version() {
        let store = MemoryStore::new();
        assert!(store.compare_and_swap("k", 0, "one".into()).await.unwrap());
        assert!(!store.compare_and_swap("k", 0, "two".into()).await.unwrap());

        let current = store.get("k").await.unwrap().unwrap();
        assert_eq!(current.version, 1);
        assert_eq!(current.value, "one");

        assert!(store.compare_and_swap("k", 1, "two".into()).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().unwrap().version, 2);
    }

    #[tokio::test]
    async fn compare_and_delete_checks_version() {
        let store = MemoryStore::new();
        store.compare_and_swap("k", 0, "v".into()).await.unwrap();

        assert!(!store.compare_and_delete("k", 7).await.unwrap());
        assert!(store.compare_and_delete("k", 1).await.unwrap());
        assert!(store.get("k").await.unwrap().is_none());
        assert!(store.is_empty());
    }
}
