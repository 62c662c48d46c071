//! Property-based tests for the reducer and the action log.
//!
//! 1. Reducing the same ordered log always produces the same state, however
//!    the fold is split — the replica-agreement property.
//! 2. The version marker always equals the seq of the last applied action.
//! 3. A log built from arbitrary batches stays dense and replays cleanly
//!    from any cursor.
//!
//! Run with: cargo test --test proptest_reducer

use labeld::action::{OrderedAction, ProposedAction, TaskKey};
use labeld::state::{reduce, reduce_all, TaskState};
use labeld::sync::ActionLog;
use proptest::prelude::*;
use serde_json::json;

const ITEMS: usize = 3;

/// One arbitrary action, described compactly so shrinking stays readable.
#[derive(Debug, Clone)]
enum Op {
    Add { item: usize, id: u8 },
    Change { item: usize, id: u8 },
    Delete { item: usize, id: u8 },
    Submit,
    Unknown,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..ITEMS, any::<u8>()).prop_map(|(item, id)| Op::Add { item, id }),
        (0..ITEMS, any::<u8>()).prop_map(|(item, id)| Op::Change { item, id }),
        (0..ITEMS, any::<u8>()).prop_map(|(item, id)| Op::Delete { item, id }),
        Just(Op::Submit),
        Just(Op::Unknown),
    ]
}

fn proposed(op: &Op) -> ProposedAction {
    match op {
        Op::Add { item, id } => ProposedAction {
            kind: "addLabel".to_string(),
            payload: json!({
                "itemIndex": item,
                "label": {"id": format!("l{id}"), "category": "car", "shape": {}, "attributes": {}}
            }),
        },
        Op::Change { item, id } => ProposedAction {
            kind: "changeLabel".to_string(),
            payload: json!({
                "itemIndex": item,
                "labelId": format!("l{id}"),
                "category": "truck"
            }),
        },
        Op::Delete { item, id } => ProposedAction {
            kind: "deleteLabel".to_string(),
            payload: json!({"itemIndex": item, "labelId": format!("l{id}")}),
        },
        Op::Submit => ProposedAction {
            kind: "submitTask".to_string(),
            payload: json!({}),
        },
        Op::Unknown => ProposedAction {
            kind: "futureKind".to_string(),
            payload: json!({"anything": true}),
        },
    }
}

fn ordered_log(ops: &[Op]) -> Vec<OrderedAction> {
    let task = TaskKey::new("p", 0);
    ops.iter()
        .enumerate()
        .map(|(i, op)| proposed(op).into_ordered(i as u64 + 1, "sess", &task))
        .collect()
}

proptest! {
    /// Splitting the fold at any point gives the same state as one pass —
    /// replicas that consume the log in different batch sizes agree.
    #[test]
    fn fold_is_split_invariant(
        ops in prop::collection::vec(op_strategy(), 0..60),
        split in any::<prop::sample::Index>(),
    ) {
        let actions = ordered_log(&ops);
        let empty = TaskState::empty("p", 0, ITEMS);

        let whole = reduce_all(empty.clone(), &actions);

        let at = if actions.is_empty() { 0 } else { split.index(actions.len()) };
        let first = reduce_all(empty, &actions[..at]);
        let rest = reduce_all(first, &actions[at..]);

        prop_assert_eq!(whole, rest);
    }

    /// The version marker is exactly the last applied seq, for any mix of
    /// applied, skipped, and unknown actions.
    #[test]
    fn version_tracks_last_seq(ops in prop::collection::vec(op_strategy(), 1..60)) {
        let actions = ordered_log(&ops);
        let state = reduce_all(TaskState::empty("p", 0, ITEMS), &actions);
        prop_assert_eq!(state.session_status, actions.len() as u64);
    }

    /// Reducing twice from the same input is byte-identical — no hidden
    /// nondeterminism (map ordering, timestamps) leaks into the state.
    #[test]
    fn reduction_is_deterministic(ops in prop::collection::vec(op_strategy(), 0..60)) {
        let actions = ordered_log(&ops);
        let a = reduce_all(TaskState::empty("p", 0, ITEMS), &actions);
        let b = reduce_all(TaskState::empty("p", 0, ITEMS), &actions);
        prop_assert_eq!(
            serde_json::to_vec(&a).unwrap(),
            serde_json::to_vec(&b).unwrap()
        );
    }

    /// Appending arbitrary batches yields a dense log, and reading from any
    /// in-range cursor returns exactly the actions past it.
    #[test]
    fn log_stays_dense_from_any_cursor(
        ops in prop::collection::vec(op_strategy(), 1..40),
        cursor in any::<prop::sample::Index>(),
    ) {
        let task = TaskKey::new("p", 0);
        let mut log = ActionLog::new(task.clone());
        for op in &ops {
            log.append("sess", proposed(op)).unwrap();
        }
        prop_assert_eq!(log.head_seq(), ops.len() as u64);

        let since = cursor.index(ops.len() + 1) as u64; // 0..=head
        let tail = log.read_from(since).unwrap();
        let seqs: Vec<u64> = tail.iter().map(|a| a.seq).collect();
        let expected: Vec<u64> = (since + 1..=ops.len() as u64).collect();
        prop_assert_eq!(seqs, expected);
    }

    /// A state folded incrementally matches a replay of the full log — the
    /// exact check a client performs against a snapshot after reconnect.
    #[test]
    fn incremental_state_matches_full_replay(
        ops in prop::collection::vec(op_strategy(), 1..40),
        split in any::<prop::sample::Index>(),
    ) {
        let actions = ordered_log(&ops);
        let at = split.index(actions.len());

        // "Snapshot" taken at `at`, then the tail applied on top.
        let snapshot_state = reduce_all(TaskState::empty("p", 0, ITEMS), &actions[..at]);
        let resumed = reduce_all(snapshot_state, &actions[at..]);

        let replayed = reduce_all(TaskState::empty("p", 0, ITEMS), &actions);
        prop_assert_eq!(resumed, replayed);
    }
}

/// `reduce` must not mutate its input beyond the returned value — callers
/// clone state under a lock and rely on the old value staying intact.
#[test]
fn reduce_takes_ownership_cleanly() {
    let task = TaskKey::new("p", 0);
    let action = ProposedAction {
        kind: "addLabel".to_string(),
        payload: json!({
            "itemIndex": 0,
            "label": {"id": "l1", "category": "car", "shape": {}, "attributes": {}}
        }),
    }
    .into_ordered(1, "sess", &task);

    let before = TaskState::empty("p", 0, 1);
    let kept = before.clone();
    let after = reduce(before, &action);
    assert_eq!(kept.label_count(), 0);
    assert_eq!(after.label_count(), 1);
}
