// SPDX-License-Identifier: MIT
//! File-system-backed object store.
//!
//! Keys map straight onto paths under the root directory. Puts write to a
//! temp file and rename into place so a crash mid-write never leaves a
//! half-written snapshot where a reader can find it.

use super::{ObjectStore, StoreError, StoreResult};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> StoreResult<PathBuf> {
        // Keys are internal (never user-supplied paths), but reject
        // traversal anyway.
        if key.split('/').any(|part| part == ".." || part.is_empty()) {
            return Err(StoreError::Backend(format!("invalid key: {key}")));
        }
        Ok(self.root.join(key))
    }
}

fn io_err(key: &str, e: std::io::Error) -> StoreError {
    if e.kind() == std::io::ErrorKind::NotFound {
        StoreError::NotFound(key.to_string())
    } else {
        StoreError::Backend(format!("{key}: {e}"))
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn get(&self, key: &str) -> StoreResult<Vec<u8>> {
        let path = self.path_for(key)?;
        tokio::fs::read(&path).await.map_err(|e| io_err(key, e))
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> StoreResult<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_err(key, e))?;
        }
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| io_err(key, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| io_err(key, e))
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let dir = self.root.join(prefix.trim_end_matches('/'));
        let mut out = Vec::new();
        collect_keys(&self.root, &dir, &mut out)
            .await
            .map_err(|e| io_err(prefix, e))?;
        // Prefix semantics, not directory semantics: "snapshot/p" must not
        // match "snapshot/p2".
        out.retain(|k| k.starts_with(prefix));
        Ok(out)
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(key, e)),
        }
    }
}

/// Walk `dir` recursively, pushing keys relative to `root`.
/// Not async-recursive (boxed) — labeling stores are at most a few levels deep.
async fn collect_keys(
    root: &Path,
    dir: &Path,
    out: &mut Vec<String>,
) -> std::io::Result<()> {
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let mut entries = match tokio::fs::read_dir(&current).await {
            Ok(e) => e,
            // A prefix with no writes yet just lists empty.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                pending.push(path);
            } else if path.extension().map_or(true, |ext| ext != "tmp") {
                if let Ok(rel) = path.strip_prefix(root) {
                    out.push(rel.to_string_lossy().replace('\\', "/"));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_delete_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        store.put("project/p/meta", b"{\"n\":1}").await.unwrap();
        assert_eq!(store.get("project/p/meta").await.unwrap(), b"{\"n\":1}");
        store.delete("project/p/meta").await.unwrap();
        assert!(matches!(
            store.get("project/p/meta").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn missing_key_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        assert!(matches!(
            store.get("nope").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn list_returns_only_matching_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        store.put("snapshot/p/0/00000001", b"a").await.unwrap();
        store.put("snapshot/p/0/00000002", b"b").await.unwrap();
        store.put("snapshot/p/1/00000001", b"c").await.unwrap();
        let mut keys = store.list("snapshot/p/0/").await.unwrap();
        keys.sort();
        assert_eq!(
            keys,
            vec!["snapshot/p/0/00000001", "snapshot/p/0/00000002"]
        );
        assert!(store.list("snapshot/q/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn traversal_keys_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        assert!(store.put("../escape", b"x").await.is_err());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        store.delete("never/written").await.unwrap();
    }
}
