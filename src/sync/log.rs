// SPDX-License-Identifier: MIT
//! Append-only, strictly ordered action log — the single source of truth for
//! a task's state. One log per task; logs of distinct tasks never interact.

use crate::action::{OrderedAction, ProposedAction, TaskKey};
use crate::error::{SyncError, SyncResult};

/// In-memory ordered log for one task.
///
/// Sequence numbers are dense and gap-free starting at 1. The head of the
/// log may be compacted away once a durable snapshot covers it; `base_seq`
/// tracks how much was dropped so seq arithmetic stays stable.
#[derive(Debug)]
pub struct ActionLog {
    task: TaskKey,
    /// Seq of the last action compacted away (0 = nothing compacted).
    base_seq: u64,
    /// Tail of the log: actions with seq in `base_seq+1 ..= head_seq()`.
    tail: Vec<OrderedAction>,
}

impl ActionLog {
    pub fn new(task: TaskKey) -> Self {
        Self {
            task,
            base_seq: 0,
            tail: Vec::new(),
        }
    }

    /// Resume a log whose prefix up to `base_seq` lives in a snapshot.
    pub fn resumed(task: TaskKey, base_seq: u64) -> Self {
        Self {
            task,
            base_seq,
            tail: Vec::new(),
        }
    }

    /// Seq of the newest appended action (0 when the task has none).
    pub fn head_seq(&self) -> u64 {
        self.tail.last().map(|a| a.seq).unwrap_or(self.base_seq)
    }

    pub fn base_seq(&self) -> u64 {
        self.base_seq
    }

    pub fn tail_len(&self) -> usize {
        self.tail.len()
    }

    /// Append one proposed action, assigning the next dense seq. This is the
    /// single-task serialization point: callers hold the task's critical
    /// section, and nothing in here blocks or awaits.
    pub fn append(&mut self, session_id: &str, action: ProposedAction) -> SyncResult<OrderedAction> {
        action.validate().map_err(SyncError::Validation)?;
        let seq = self.head_seq() + 1;
        let ordered = action.into_ordered(seq, session_id, &self.task);
        self.tail.push(ordered.clone());
        Ok(ordered)
    }

    /// Ordered actions with seq strictly greater than `since_seq`.
    ///
    /// Fails with [`SyncError::OrderingGap`] when `since_seq` predates the
    /// compacted head — the caller must replay from a snapshot instead —
    /// and verifies density over the returned range. A gap in the tail
    /// itself indicates corruption and is fatal for the task's sessions.
    pub fn read_from(&self, since_seq: u64) -> SyncResult<Vec<OrderedAction>> {
        if since_seq < self.base_seq {
            return Err(SyncError::OrderingGap {
                task: self.task.to_string(),
                expected: since_seq + 1,
                found: self.base_seq + 1,
            });
        }
        let mut expected = since_seq + 1;
        let mut out = Vec::new();
        for action in self.tail.iter().filter(|a| a.seq > since_seq) {
            if action.seq != expected {
                return Err(SyncError::OrderingGap {
                    task: self.task.to_string(),
                    expected,
                    found: action.seq,
                });
            }
            expected += 1;
            out.push(action.clone());
        }
        Ok(out)
    }

    /// Drop actions with seq ≤ `upto_seq`. Only called after a durable
    /// snapshot at `upto_seq` exists, so no information is lost.
    pub fn compact(&mut self, upto_seq: u64) {
        if upto_seq <= self.base_seq || upto_seq > self.head_seq() {
            return;
        }
        self.tail.retain(|a| a.seq > upto_seq);
        self.base_seq = upto_seq;
    }
}
