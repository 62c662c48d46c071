// SPDX-License-Identifier: MIT
//! Materialized task state and the pure reducer that drives it.
//!
//! The whole engine is a deterministic state machine replicated by
//! log-shipping: `reduce` is the only way state changes, both on the live
//! path and during replay, so reducing the same ordered log always produces
//! the same state on any replica.

use crate::action::{kind, OrderedAction};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::warn;

// ─── Labels ──────────────────────────────────────────────────────────────────

/// One annotation on one item. `shape` and `attributes` are opaque to the
/// engine — domain validation happens in the clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Label {
    pub id: String,
    pub category: String,
    #[serde(default)]
    pub shape: Value,
    #[serde(default)]
    pub attributes: Value,
}

/// One item (image / frame / point cloud) of a task.
/// Labels are keyed by id in a BTreeMap so serialization order is stable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemState {
    pub labels: BTreeMap<String, Label>,
}

// ─── Task state ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskState {
    pub project: String,
    pub task_index: u32,
    pub items: Vec<ItemState>,
    /// Monotonic version marker: the number of actions applied so far.
    /// Equals the seq of the last applied action.
    pub session_status: u64,
    pub submitted: bool,
}

impl TaskState {
    /// The empty state every replay starts from.
    pub fn empty(project: &str, task_index: u32, item_count: usize) -> Self {
        Self {
            project: project.to_string(),
            task_index,
            items: vec![ItemState::default(); item_count],
            session_status: 0,
            submitted: false,
        }
    }

    pub fn label_count(&self) -> usize {
        self.items.iter().map(|i| i.labels.len()).sum()
    }
}

// ─── Typed payloads ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddLabel {
    item_index: usize,
    label: Label,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChangeLabel {
    item_index: usize,
    label_id: String,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    shape: Option<Value>,
    #[serde(default)]
    attributes: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteLabel {
    item_index: usize,
    label_id: String,
}

// ─── Reducer ─────────────────────────────────────────────────────────────────

/// Apply one ordered action to the state, returning the new state.
///
/// Unknown action kinds and undecodable payloads are recoverable: the action
/// stays in the log (it was already ordered and broadcast) but does not
/// mutate labels — only the `session_status` marker advances, keeping the
/// version equal to the count of applied actions. This tolerates action
/// kinds from newer clients without desyncing older replicas.
pub fn reduce(mut state: TaskState, action: &OrderedAction) -> TaskState {
    state.session_status = action.seq;

    match action.kind.as_str() {
        kind::ADD_LABEL => match serde_json::from_value::<AddLabel>(action.payload.clone()) {
            Ok(add) => {
                if let Some(item) = state.items.get_mut(add.item_index) {
                    item.labels.insert(add.label.id.clone(), add.label);
                } else {
                    warn!(seq = action.seq, item = add.item_index, "addLabel to out-of-range item — skipped");
                }
            }
            Err(e) => warn!(seq = action.seq, err = %e, "undecodable addLabel payload — skipped"),
        },
        kind::CHANGE_LABEL => match serde_json::from_value::<ChangeLabel>(action.payload.clone()) {
            Ok(change) => {
                let label = state
                    .items
                    .get_mut(change.item_index)
                    .and_then(|item| item.labels.get_mut(&change.label_id));
                match label {
                    Some(label) => {
                        if let Some(category) = change.category {
                            label.category = category;
                        }
                        if let Some(shape) = change.shape {
                            label.shape = shape;
                        }
                        if let Some(attributes) = change.attributes {
                            label.attributes = attributes;
                        }
                    }
                    // Concurrent delete may have won; order agreement means
                    // every replica skips the same way.
                    None => warn!(
                        seq = action.seq,
                        label = %change.label_id,
                        "changeLabel for absent label — skipped"
                    ),
                }
            }
            Err(e) => warn!(seq = action.seq, err = %e, "undecodable changeLabel payload — skipped"),
        },
        kind::DELETE_LABEL => match serde_json::from_value::<DeleteLabel>(action.payload.clone()) {
            Ok(del) => {
                let removed = state
                    .items
                    .get_mut(del.item_index)
                    .and_then(|item| item.labels.remove(&del.label_id));
                if removed.is_none() {
                    warn!(seq = action.seq, label = %del.label_id, "deleteLabel for absent label — skipped");
                }
            }
            Err(e) => warn!(seq = action.seq, err = %e, "undecodable deleteLabel payload — skipped"),
        },
        kind::SUBMIT_TASK => {
            state.submitted = true;
        }
        other => {
            warn!(seq = action.seq, kind = %other, "unknown action kind — logged but not applied");
        }
    }

    state
}

/// Fold a slice of ordered actions. Equal by construction to sequential
/// single-action reduction; used by replay and by tests asserting it.
pub fn reduce_all(state: TaskState, actions: &[OrderedAction]) -> TaskState {
    actions.iter().fold(state, reduce)
}
