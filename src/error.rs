// SPDX-License-Identifier: MIT
//! Error taxonomy for the synchronization engine.
//!
//! Per-connection errors ([`SyncError::Validation`], [`SyncError::Auth`])
//! never affect other connections. Per-task fatal errors
//! ([`SyncError::OrderingGap`], [`SyncError::LeaseLost`]) are isolated to
//! their task and force a resync of that task's sessions only.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Malformed action or batch — rejected to the sender, no state change.
    #[error("invalid action batch: {0}")]
    Validation(String),

    /// Dense-sequence invariant broken for a task. Fatal for the task:
    /// every session of that task must resync from the latest snapshot.
    #[error("ordering gap in task {task}: expected seq {expected}, found {found}")]
    OrderingGap {
        task: String,
        expected: u64,
        found: u64,
    },

    /// Durable storage is failing. Retried with backoff; live broadcast
    /// proceeds from memory regardless.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// This instance no longer holds the write lease for the task.
    /// Appends must stop and live connections get a resync-required close.
    #[error("write lease lost for task {0}")]
    LeaseLost(String),

    /// Identity token rejected — connection refused before reaching Live.
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("unknown task: {0}")]
    TaskNotFound(String),

    #[error("unknown project: {0}")]
    ProjectNotFound(String),

    #[error("project already exists: {0}")]
    ProjectExists(String),
}

impl SyncError {
    /// True when the error is fatal for the whole task (all of its sessions
    /// must resync), as opposed to affecting only the offending sender.
    pub fn is_task_fatal(&self) -> bool {
        matches!(self, SyncError::OrderingGap { .. } | SyncError::LeaseLost(_))
    }

    /// Stable wire code reported to clients. Clients are told to resync,
    /// never shown raw internals.
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::Validation(_) => "invalidBatch",
            SyncError::OrderingGap { .. } => "resyncRequired",
            SyncError::StorageUnavailable(_) => "storageUnavailable",
            SyncError::LeaseLost(_) => "resyncRequired",
            SyncError::Auth(_) => "unauthorized",
            SyncError::TaskNotFound(_) => "taskNotFound",
            SyncError::ProjectNotFound(_) => "projectNotFound",
            SyncError::ProjectExists(_) => "projectExists",
        }
    }
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_fatal_classification() {
        assert!(SyncError::OrderingGap {
            task: "p/0".into(),
            expected: 4,
            found: 6
        }
        .is_task_fatal());
        assert!(SyncError::LeaseLost("p/0".into()).is_task_fatal());
        assert!(!SyncError::Validation("bad".into()).is_task_fatal());
        assert!(!SyncError::StorageUnavailable("io".into()).is_task_fatal());
    }

    #[test]
    fn fatal_errors_map_to_resync_code() {
        let gap = SyncError::OrderingGap {
            task: "p/0".into(),
            expected: 1,
            found: 3,
        };
        assert_eq!(gap.code(), "resyncRequired");
        assert_eq!(SyncError::LeaseLost("p/0".into()).code(), "resyncRequired");
    }
}
