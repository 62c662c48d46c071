// SPDX-License-Identifier: MIT
//! Storage adapter — one capability interface over every durable backend.
//!
//! The engine never talks to a backend directly: snapshots and project
//! metadata go through [`ObjectStore`], so a deployment can point the daemon
//! at the local file system, an HTTP blob service, or (for tests and
//! presence data) plain memory without touching the hub.

pub mod http;
pub mod local;
pub mod memory;

use crate::action::TaskKey;
use crate::state::TaskState;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

pub use http::HttpStore;
pub use local::LocalStore;
pub use memory::MemoryStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("key not found: {0}")]
    NotFound(String),
    /// Backend failure — transient as far as the engine is concerned;
    /// callers retry with backoff.
    #[error("storage backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Uniform get/put/list/delete over blob-shaped backends.
///
/// All writes are to fresh or versioned keys, never in-place mutation of
/// historical data, so the store is safely shared by concurrent readers and
/// writers.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Vec<u8>>;
    async fn put(&self, key: &str, bytes: &[u8]) -> StoreResult<()>;
    /// Keys under `prefix`, in unspecified order.
    async fn list(&self, prefix: &str) -> StoreResult<Vec<String>>;
    async fn delete(&self, key: &str) -> StoreResult<()>;
}

// ─── Key scheme ──────────────────────────────────────────────────────────────

/// `snapshot/{project}/{index}/{seq}` with the seq zero-padded so that
/// lexicographic key order equals numeric seq order.
pub fn snapshot_key(task: &TaskKey, seq: u64) -> String {
    format!("snapshot/{}/{}/{seq:020}", task.project, task.index)
}

pub fn snapshot_prefix(task: &TaskKey) -> String {
    format!("snapshot/{}/{}/", task.project, task.index)
}

pub fn project_meta_key(project: &str) -> String {
    format!("project/{project}/meta")
}

fn seq_of_key(key: &str) -> Option<u64> {
    key.rsplit('/').next()?.parse().ok()
}

// ─── Snapshots ───────────────────────────────────────────────────────────────

/// Durable serialization of a task's state plus the action count it
/// reflects. A fresh session replays the latest snapshot and the log tail
/// after it, never the whole history.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub task_id: String,
    pub seq: u64,
    pub written_at: DateTime<Utc>,
    /// SHA-256 hex digest of the serialized `state` field.
    pub checksum: String,
    pub state: TaskState,
}

impl Snapshot {
    pub fn of(task: &TaskKey, state: TaskState) -> Self {
        let seq = state.session_status;
        let checksum = state_checksum(&state);
        Self {
            task_id: task.to_string(),
            seq,
            written_at: Utc::now(),
            checksum,
            state,
        }
    }

    pub fn verify(&self) -> bool {
        state_checksum(&self.state) == self.checksum
    }
}

fn state_checksum(state: &TaskState) -> String {
    let bytes = serde_json::to_vec(state).unwrap_or_default();
    format!("{:x}", Sha256::digest(&bytes))
}

/// Snapshot reads/writes with the monotonic-snapshot invariant on top of a
/// plain [`ObjectStore`]: every seq gets its own versioned key, and a write
/// for seq ≤ the newest stored seq is dropped, so a stale writer can never
/// shadow a newer snapshot.
#[derive(Clone)]
pub struct SnapshotStore {
    store: Arc<dyn ObjectStore>,
    /// Snapshots kept per task before pruning (older ones are deleted).
    keep: usize,
}

impl SnapshotStore {
    pub fn new(store: Arc<dyn ObjectStore>, keep: usize) -> Self {
        Self {
            store,
            keep: keep.max(1),
        }
    }

    pub fn backing(&self) -> Arc<dyn ObjectStore> {
        self.store.clone()
    }

    /// Highest stored seq for the task, if any.
    pub async fn latest_seq(&self, task: &TaskKey) -> StoreResult<Option<u64>> {
        let keys = self.store.list(&snapshot_prefix(task)).await?;
        Ok(keys.iter().filter_map(|k| seq_of_key(k)).max())
    }

    /// Write a snapshot unless a newer (or equal) one already exists.
    /// Returns true when the write happened.
    pub async fn save(&self, task: &TaskKey, snapshot: &Snapshot) -> StoreResult<bool> {
        if let Some(latest) = self.latest_seq(task).await? {
            if snapshot.seq <= latest {
                debug!(task = %task, seq = snapshot.seq, latest, "snapshot not newer than stored — skipped");
                return Ok(false);
            }
        }
        let bytes = serde_json::to_vec(snapshot)
            .map_err(|e| StoreError::Backend(format!("snapshot encode: {e}")))?;
        self.store
            .put(&snapshot_key(task, snapshot.seq), &bytes)
            .await?;
        self.prune(task).await;
        Ok(true)
    }

    /// Load the newest snapshot whose checksum verifies. A corrupt newest
    /// snapshot falls back to the one before it rather than failing the
    /// whole task load.
    pub async fn load_latest(&self, task: &TaskKey) -> StoreResult<Option<Snapshot>> {
        let mut keys = self.store.list(&snapshot_prefix(task)).await?;
        keys.sort();
        for key in keys.iter().rev() {
            let bytes = match self.store.get(key).await {
                Ok(b) => b,
                Err(StoreError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            match serde_json::from_slice::<Snapshot>(&bytes) {
                Ok(snapshot) if snapshot.verify() => return Ok(Some(snapshot)),
                Ok(snapshot) => {
                    warn!(key = %key, seq = snapshot.seq, "snapshot checksum mismatch — trying older");
                }
                Err(e) => {
                    warn!(key = %key, err = %e, "undecodable snapshot — trying older");
                }
            }
        }
        Ok(None)
    }

    /// Best-effort deletion of snapshots beyond the keep window. Pruning
    /// failures are logged, never propagated.
    async fn prune(&self, task: &TaskKey) {
        let Ok(mut keys) = self.store.list(&snapshot_prefix(task)).await else {
            return;
        };
        keys.sort();
        if keys.len() <= self.keep {
            return;
        }
        let excess = keys.len() - self.keep;
        for key in keys.into_iter().take(excess) {
            if let Err(e) = self.store.delete(&key).await {
                warn!(key = %key, err = %e, "snapshot prune failed");
            }
        }
    }
}
