// SPDX-License-Identifier: MIT
//! Session registry — who is connected to which task, and which hub holds
//! append authority for it.
//!
//! One registry instance per daemon, created at service start and owned by
//! the `AppContext` (never ambient global state). It answers two questions:
//! when a task's in-memory log/state may be evicted (no active sessions past
//! the idle window), and whether this hub may append at all — appends
//! require a live write lease, which is how the single-writer-per-task
//! invariant survives restarts and takeover.

use crate::action::TaskKey;
use crate::error::{SyncError, SyncResult};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use uuid::Uuid;

// ─── Sessions ────────────────────────────────────────────────────────────────

/// One live connection. Ephemeral: created on connect, destroyed on
/// disconnect or timeout. Several sessions may carry the same `user_id`
/// (multiple tabs); each has its own action stream.
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub user_id: String,
    pub task: TaskKey,
    pub connected_at: DateTime<Utc>,
    /// Bot sessions participate like any client but are flagged so their
    /// in-flight computations can be cancelled on unregister.
    pub bot: bool,
}

impl Session {
    pub fn new(user_id: &str, task: TaskKey, bot: bool) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            task,
            connected_at: Utc::now(),
            bot,
        }
    }
}

// ─── Leases ──────────────────────────────────────────────────────────────────

/// Time-bounded append authority for one task. A holder must renew before
/// `expires_at`; an expired lease is free for any holder to take.
#[derive(Debug, Clone)]
pub struct Lease {
    pub lease_id: String,
    pub holder: String,
    pub expires_at: Instant,
}

impl Lease {
    fn live(&self) -> bool {
        self.expires_at > Instant::now()
    }
}

// ─── Registry ────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, Session>,
    leases: HashMap<TaskKey, Lease>,
    /// Last moment each task had any session or append activity.
    last_active: HashMap<TaskKey, Instant>,
}

pub struct SessionRegistry {
    inner: RwLock<Inner>,
    lease_ttl: Duration,
}

impl SessionRegistry {
    pub fn new(lease_ttl: Duration) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            lease_ttl,
        }
    }

    // ─── Session lifecycle ───────────────────────────────────────────────────

    pub async fn register(&self, session: Session) {
        let mut inner = self.inner.write().await;
        inner.last_active.insert(session.task.clone(), Instant::now());
        inner.sessions.insert(session.session_id.clone(), session);
    }

    pub async fn unregister(&self, session_id: &str) -> Option<Session> {
        let mut inner = self.inner.write().await;
        let session = inner.sessions.remove(session_id);
        if let Some(s) = &session {
            inner.last_active.insert(s.task.clone(), Instant::now());
        }
        session
    }

    pub async fn is_registered(&self, session_id: &str) -> bool {
        self.inner.read().await.sessions.contains_key(session_id)
    }

    pub async fn list_active(&self, task: &TaskKey) -> Vec<Session> {
        self.inner
            .read()
            .await
            .sessions
            .values()
            .filter(|s| &s.task == task)
            .cloned()
            .collect()
    }

    pub async fn session_count(&self) -> usize {
        self.inner.read().await.sessions.len()
    }

    /// Record append activity so the idle sweep does not evict a task that
    /// is being written.
    pub async fn touch(&self, task: &TaskKey) {
        self.inner
            .write()
            .await
            .last_active
            .insert(task.clone(), Instant::now());
    }

    /// Tasks with zero active human sessions whose last activity is older
    /// than `idle_window`. Candidates for snapshot-and-evict. Bot sessions
    /// are ignored here — the hub registers one for a task's whole lifetime,
    /// and counting it would keep every bot-enabled task open forever.
    pub async fn idle_tasks(&self, idle_window: Duration) -> Vec<TaskKey> {
        let inner = self.inner.read().await;
        let cutoff = Instant::now() - idle_window;
        inner
            .last_active
            .iter()
            .filter(|(task, last)| {
                **last < cutoff && !inner.sessions.values().any(|s| &s.task == *task && !s.bot)
            })
            .map(|(task, _)| task.clone())
            .collect()
    }

    /// Forget idle bookkeeping for an evicted task.
    pub async fn forget_task(&self, task: &TaskKey) {
        self.inner.write().await.last_active.remove(task);
    }

    // ─── Write leases ────────────────────────────────────────────────────────

    /// Acquire the write lease for a task. Succeeds when the task has no
    /// lease, the existing lease expired, or `holder` already holds it
    /// (re-acquire extends). Fails with [`SyncError::LeaseLost`] while
    /// another holder's lease is live — a new hub instance must wait for
    /// expiry or explicit release before taking over.
    pub async fn acquire_lease(&self, task: &TaskKey, holder: &str) -> SyncResult<Lease> {
        let mut inner = self.inner.write().await;
        if let Some(existing) = inner.leases.get(task) {
            if existing.live() && existing.holder != holder {
                return Err(SyncError::LeaseLost(task.to_string()));
            }
        }
        let lease = Lease {
            lease_id: Uuid::new_v4().to_string(),
            holder: holder.to_string(),
            expires_at: Instant::now() + self.lease_ttl,
        };
        inner.leases.insert(task.clone(), lease.clone());
        Ok(lease)
    }

    /// Extend a held lease. Fails when the lease was lost (expired and
    /// re-acquired by someone else, or revoked).
    pub async fn renew_lease(&self, task: &TaskKey, lease_id: &str) -> SyncResult<Lease> {
        let mut inner = self.inner.write().await;
        match inner.leases.get_mut(task) {
            Some(lease) if lease.lease_id == lease_id && lease.live() => {
                lease.expires_at = Instant::now() + self.lease_ttl;
                Ok(lease.clone())
            }
            _ => Err(SyncError::LeaseLost(task.to_string())),
        }
    }

    /// True while `lease_id` is the live lease for the task. Checked on
    /// every append.
    pub async fn verify_lease(&self, task: &TaskKey, lease_id: &str) -> bool {
        self.inner
            .read()
            .await
            .leases
            .get(task)
            .map(|l| l.lease_id == lease_id && l.live())
            .unwrap_or(false)
    }

    pub async fn release_lease(&self, task: &TaskKey, lease_id: &str) {
        let mut inner = self.inner.write().await;
        if inner
            .leases
            .get(task)
            .map(|l| l.lease_id == lease_id)
            .unwrap_or(false)
        {
            inner.leases.remove(task);
        }
    }

    /// Forcibly drop a task's lease regardless of holder. Takeover path:
    /// used after the prior instance is confirmed gone, and by tests
    /// simulating lease loss.
    pub async fn revoke_lease(&self, task: &TaskKey) {
        self.inner.write().await.leases.remove(task);
    }
}
