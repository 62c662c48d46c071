// SPDX-License-Identifier: MIT
//! Wire protocol between clients and the synchronization hub.
//!
//! One JSON object per WebSocket text frame, tagged by `type`. Bots speak
//! exactly the same protocol as human editors — there is no privileged path.

use crate::action::{OrderedAction, ProposedAction};
use crate::state::TaskState;
use serde::{Deserialize, Serialize};

// ─── Error codes (stable strings, shared with the web client) ────────────────
//
// unauthorized        — bad identity token; connection is closed
// invalidBatch        — malformed action batch; rejected to the sender only
// taskNotFound        — project/index does not resolve to a task
// projectNotFound / projectExists — project surface
// storageUnavailable  — durable write/read failing; retried server-side
// resyncRequired      — task-fatal (ordering gap or lease lost): drop local
//                       state and register again from the snapshot

// ─── Client → hub ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    /// First message on every connection: the identity token minted by the
    /// identity layer.
    Auth { token: String },

    /// Open a session on a task. The hub replies with `registered`, then the
    /// replay (`snapshot` + `actions`), then `syncComplete` — only after
    /// that does the connection go live.
    #[serde(rename_all = "camelCase")]
    Register {
        task_id: String,
        /// Resume cursor: the highest seq the client already has. The hub
        /// skips the snapshot when the cursor is recent enough.
        #[serde(default)]
        since_seq: Option<u64>,
        /// Marks a bot session (model-driven client).
        #[serde(default)]
        bot: bool,
    },

    /// A batch of actions for the session's task. `idempotency_key` makes
    /// redelivery after a dropped ack safe: the hub answers a duplicate with
    /// the original ack and appends nothing.
    #[serde(rename_all = "camelCase")]
    Submit {
        task_id: String,
        session_id: String,
        idempotency_key: String,
        actions: Vec<ProposedAction>,
    },
}

// ─── Hub → client ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    Authenticated { user_id: String },

    #[serde(rename_all = "camelCase")]
    Registered { session_id: String, task_id: String },

    /// Replay, part 1: the newest durable snapshot (omitted when the client
    /// cursor is at or past it).
    #[serde(rename_all = "camelCase")]
    Snapshot {
        task_id: String,
        seq: u64,
        state: TaskState,
    },

    /// Ordered actions: replay tail during `Syncing`, live broadcast after.
    /// `from_seq` is the seq of the first action in the batch; the batch is
    /// dense, so a client can detect a hole and re-register.
    #[serde(rename_all = "camelCase")]
    Actions {
        task_id: String,
        from_seq: u64,
        actions: Vec<OrderedAction>,
    },

    /// Replay done — everything up to `head_seq` was delivered in order.
    /// Live actions for this connection only start after this marker.
    #[serde(rename_all = "camelCase")]
    SyncComplete { task_id: String, head_seq: u64 },

    /// Batch accepted: `count` actions appended starting at `from_seq`.
    #[serde(rename_all = "camelCase")]
    Ack {
        idempotency_key: String,
        from_seq: u64,
        count: usize,
    },

    /// Request-scoped failure. The connection stays open.
    #[serde(rename_all = "camelCase")]
    Error {
        code: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        idempotency_key: Option<String>,
    },

    /// Task-fatal condition: the client must drop local state and register
    /// again. Sent before the hub closes the connection.
    #[serde(rename_all = "camelCase")]
    ResyncRequired { task_id: String, reason: String },
}

impl ServerMessage {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code: code.to_string(),
            message: message.into(),
            idempotency_key: None,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}
