// SPDX-License-Identifier: MIT
//! Project metadata — the registry of labeling projects and their tasks.
//!
//! A project is a named collection of tasks; each task owns an ordered list
//! of items to annotate. Metadata lives at `project/{name}/meta` in the
//! object store. Tasks have no durable record of their own until the first
//! snapshot is written: opening task `i` of a project with `i < task_count`
//! materializes it from the empty state.

use crate::action::TaskKey;
use crate::error::{SyncError, SyncResult};
use crate::storage::{project_meta_key, snapshot_prefix, ObjectStore, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMeta {
    pub index: u32,
    /// Number of items (images / frames) in the task.
    pub item_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectMeta {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub tasks: Vec<TaskMeta>,
}

impl ProjectMeta {
    pub fn new(name: &str, items_per_task: &[usize]) -> Self {
        Self {
            name: name.to_string(),
            created_at: Utc::now(),
            tasks: items_per_task
                .iter()
                .enumerate()
                .map(|(index, &item_count)| TaskMeta {
                    index: index as u32,
                    item_count,
                })
                .collect(),
        }
    }

    pub fn task(&self, index: u32) -> Option<&TaskMeta> {
        self.tasks.iter().find(|t| t.index == index)
    }
}

pub struct ProjectRegistry {
    store: Arc<dyn ObjectStore>,
}

impl ProjectRegistry {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    pub async fn create(&self, meta: &ProjectMeta) -> SyncResult<()> {
        let key = project_meta_key(&meta.name);
        match self.store.get(&key).await {
            Ok(_) => return Err(SyncError::ProjectExists(meta.name.clone())),
            Err(StoreError::NotFound(_)) => {}
            Err(e) => return Err(SyncError::StorageUnavailable(e.to_string())),
        }
        let bytes = serde_json::to_vec(meta)
            .map_err(|e| SyncError::StorageUnavailable(format!("meta encode: {e}")))?;
        self.store
            .put(&key, &bytes)
            .await
            .map_err(|e| SyncError::StorageUnavailable(e.to_string()))?;
        info!(project = %meta.name, tasks = meta.tasks.len(), "project created");
        Ok(())
    }

    pub async fn load(&self, name: &str) -> SyncResult<ProjectMeta> {
        let bytes = match self.store.get(&project_meta_key(name)).await {
            Ok(b) => b,
            Err(StoreError::NotFound(_)) => return Err(SyncError::ProjectNotFound(name.to_string())),
            Err(e) => return Err(SyncError::StorageUnavailable(e.to_string())),
        };
        serde_json::from_slice(&bytes)
            .map_err(|e| SyncError::StorageUnavailable(format!("meta decode: {e}")))
    }

    pub async fn list(&self) -> SyncResult<Vec<String>> {
        let keys = self
            .store
            .list("project/")
            .await
            .map_err(|e| SyncError::StorageUnavailable(e.to_string()))?;
        let mut names: Vec<String> = keys
            .iter()
            .filter_map(|k| k.strip_prefix("project/")?.strip_suffix("/meta"))
            .map(str::to_string)
            .collect();
        names.sort();
        Ok(names)
    }

    /// Item count for a task, failing when the project or index is unknown.
    pub async fn task_items(&self, task: &TaskKey) -> SyncResult<usize> {
        let meta = self.load(&task.project).await?;
        meta.task(task.index)
            .map(|t| t.item_count)
            .ok_or_else(|| SyncError::TaskNotFound(task.to_string()))
    }

    /// Explicit project deletion — the only way a task and its snapshots are
    /// ever destroyed.
    pub async fn delete(&self, name: &str) -> SyncResult<()> {
        let meta = self.load(name).await?;
        for task in &meta.tasks {
            let key = TaskKey::new(name, task.index);
            let keys = self
                .store
                .list(&snapshot_prefix(&key))
                .await
                .map_err(|e| SyncError::StorageUnavailable(e.to_string()))?;
            for k in keys {
                self.store
                    .delete(&k)
                    .await
                    .map_err(|e| SyncError::StorageUnavailable(e.to_string()))?;
            }
        }
        self.store
            .delete(&project_meta_key(name))
            .await
            .map_err(|e| SyncError::StorageUnavailable(e.to_string()))?;
        info!(project = %name, "project deleted");
        Ok(())
    }
}
