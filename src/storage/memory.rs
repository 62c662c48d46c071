// SPDX-License-Identifier: MIT
//! In-memory object store.
//!
//! Backs tests and low-latency presence data — not durability. Also the
//! failure-injection point for storage-outage tests: `set_failing` makes
//! every call return a backend error until cleared.

use super::{ObjectStore, StoreError, StoreResult};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
    failing: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle simulated outage: while failing, every operation returns
    /// [`StoreError::Backend`].
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> StoreResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(StoreError::Backend("simulated outage".to_string()))
        } else {
            Ok(())
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Vec<u8>> {
        self.check()?;
        self.entries
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> StoreResult<()> {
        self.check()?;
        self.entries
            .write()
            .await
            .insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<String>> {
        self.check()?;
        Ok(self
            .entries
            .read()
            .await
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.check()?;
        self.entries.write().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn list_uses_prefix_not_equality() {
        let store = MemoryStore::new();
        store.put("a/1", b"x").await.unwrap();
        store.put("a/2", b"y").await.unwrap();
        store.put("ab/1", b"z").await.unwrap();
        assert_eq!(store.list("a/").await.unwrap(), vec!["a/1", "a/2"]);
        assert_eq!(store.list("a").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn outage_toggle_fails_every_call() {
        let store = MemoryStore::new();
        store.put("k", b"v").await.unwrap();
        store.set_failing(true);
        assert!(matches!(store.get("k").await, Err(StoreError::Backend(_))));
        assert!(store.put("k2", b"v").await.is_err());
        store.set_failing(false);
        assert_eq!(store.get("k").await.unwrap(), b"v");
    }
}
