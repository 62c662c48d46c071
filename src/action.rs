// SPDX-License-Identifier: MIT
//! Action records — the immutable, ordered edit events of a task.
//!
//! Payloads stay opaque (`serde_json::Value`) keyed by a `kind` string so
//! that action types introduced by newer clients survive the round trip
//! through the log and broadcast unchanged. The reducer decides which kinds
//! it understands; the log only cares about well-formedness and order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Hard cap on a single serialized action payload (1 MB). Oversized payloads
/// are rejected as malformed rather than clogging broadcast fan-out.
pub const MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

// ─── Task identity ───────────────────────────────────────────────────────────

/// A task is addressed by project name plus task index within the project.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskKey {
    pub project: String,
    pub index: u32,
}

impl TaskKey {
    pub fn new(project: impl Into<String>, index: u32) -> Self {
        Self {
            project: project.into(),
            index,
        }
    }

    /// Parse `"{project}/{index}"` as used on the wire and in storage keys.
    pub fn parse(s: &str) -> Option<Self> {
        let (project, index) = s.rsplit_once('/')?;
        if project.is_empty() {
            return None;
        }
        Some(Self {
            project: project.to_string(),
            index: index.parse().ok()?,
        })
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.project, self.index)
    }
}

// ─── Actions ─────────────────────────────────────────────────────────────────

/// An action as submitted by a client, before the hub assigns its sequence
/// number. `kind` is the type tag the reducer dispatches on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposedAction {
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

/// An action after the hub has accepted it: sequence number assigned,
/// provenance recorded. Never mutated once appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderedAction {
    /// Dense, gap-free sequence number, monotonic within the task. The
    /// first accepted action of a task has seq 1.
    pub seq: u64,
    pub kind: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    /// Session that submitted the action.
    pub session_id: String,
    pub task_id: String,
}

impl ProposedAction {
    /// Well-formedness check — domain validation of the payload is out of
    /// scope, but an action with no kind or an oversized payload never
    /// reaches the log.
    pub fn validate(&self) -> Result<(), String> {
        if self.kind.trim().is_empty() {
            return Err("action kind must be non-empty".to_string());
        }
        let size = serde_json::to_vec(&self.payload).map_or(0, |v| v.len());
        if size > MAX_PAYLOAD_BYTES {
            return Err(format!(
                "payload of {size} bytes exceeds the {MAX_PAYLOAD_BYTES} byte limit"
            ));
        }
        Ok(())
    }

    /// Promote to an ordered action. Only the task authority calls this,
    /// inside its serialization critical section.
    pub fn into_ordered(self, seq: u64, session_id: &str, task: &TaskKey) -> OrderedAction {
        OrderedAction {
            seq,
            kind: self.kind,
            payload: self.payload,
            timestamp: Utc::now(),
            session_id: session_id.to_string(),
            task_id: task.to_string(),
        }
    }
}

/// Action kinds the built-in reducer understands. Free-form strings on the
/// wire; constants here so the reducer and tests agree on spelling.
pub mod kind {
    pub const ADD_LABEL: &str = "addLabel";
    pub const CHANGE_LABEL: &str = "changeLabel";
    pub const DELETE_LABEL: &str = "deleteLabel";
    pub const SUBMIT_TASK: &str = "submitTask";
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn task_key_round_trips_through_display() {
        let key = TaskKey::new("street-scenes", 42);
        assert_eq!(key.to_string(), "street-scenes/42");
        assert_eq!(TaskKey::parse("street-scenes/42"), Some(key));
    }

    #[test]
    fn task_key_parse_rejects_garbage() {
        assert_eq!(TaskKey::parse("no-index"), None);
        assert_eq!(TaskKey::parse("/7"), None);
        assert_eq!(TaskKey::parse("proj/notanumber"), None);
    }

    #[test]
    fn empty_kind_is_malformed() {
        let action = ProposedAction {
            kind: "  ".to_string(),
            payload: json!({}),
        };
        assert!(action.validate().is_err());
    }

    #[test]
    fn ordered_action_serializes_camel_case() {
        let action = ProposedAction {
            kind: kind::ADD_LABEL.to_string(),
            payload: json!({"itemIndex": 0}),
        }
        .into_ordered(1, "sess-1", &TaskKey::new("p", 0));
        let text = serde_json::to_string(&action).unwrap();
        assert!(text.contains("\"sessionId\""));
        assert!(text.contains("\"taskId\":\"p/0\""));
        assert!(text.contains("\"seq\":1"));
    }
}
