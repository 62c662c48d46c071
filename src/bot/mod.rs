// SPDX-License-Identifier: MIT
//! Bot adapter — a model-driven client wrapped as a regular session.
//!
//! The bot subscribes to a task's live stream like any editor, asks the
//! model service for candidate actions (which may take arbitrarily long),
//! and submits them back through the same append path — no privileged
//! bypass of ordering, validation, or the idempotency check. A computation
//! whose session was unregistered before it finished is discarded, never
//! queued.

use crate::action::ProposedAction;
use crate::hub::task::{TaskAuthority, TaskEvent};
use crate::registry::{Session, SessionRegistry};
use crate::state::TaskState;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::TryRecvError;
use tracing::{debug, info, warn};
use uuid::Uuid;

// ─── Model client ────────────────────────────────────────────────────────────

/// The labeling model behind the bot. One call per (debounced) burst of
/// editor activity; the returned actions are proposals like any client's.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn predict(&self, state: &TaskState) -> Result<Vec<ProposedAction>>;
}

/// Model service over HTTP: POST the task state as JSON, receive proposed
/// actions.
pub struct HttpModelClient {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpModelClient {
    pub fn new(endpoint: &str, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            endpoint: endpoint.to_string(),
        }
    }
}

#[async_trait]
impl ModelClient for HttpModelClient {
    async fn predict(&self, state: &TaskState) -> Result<Vec<ProposedAction>> {
        let resp = self
            .client
            .post(&self.endpoint)
            .json(state)
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }
}

// ─── Bot session ─────────────────────────────────────────────────────────────

pub struct BotSession;

impl BotSession {
    /// Drive one bot session until its task closes or resyncs. Spawned by
    /// the hub when it opens a task with bots enabled; the caller registers
    /// the session beforehand and aborts this future when the task closes.
    pub async fn run(
        session: Session,
        authority: Arc<TaskAuthority>,
        registry: Arc<SessionRegistry>,
        model: Arc<dyn ModelClient>,
        debounce: Duration,
    ) {
        let mut events = authority.subscribe();
        info!(session = %session.session_id, task = %authority.task(), "bot session started");

        loop {
            match events.recv().await {
                // Only editor activity triggers inference; the bot's own
                // submissions must not feed back into it.
                Ok(TaskEvent::Actions { origin, .. }) if origin != session.session_id => {
                    // Debounce a burst of edits into one model call, bailing
                    // out if a resync arrives meanwhile.
                    tokio::time::sleep(debounce).await;
                    if !Self::drain_burst(&mut events, &session.session_id) {
                        break;
                    }

                    let state = authority.current_state();
                    let predictions = match model.predict(&state).await {
                        Ok(p) => p,
                        Err(e) => {
                            warn!(task = %authority.task(), err = %e, "model call failed — skipping burst");
                            continue;
                        }
                    };

                    // The computation may have outlived the session: a task
                    // close or unregister mid-inference means the result is
                    // discarded, not queued.
                    if !registry.is_registered(&session.session_id).await {
                        info!(session = %session.session_id, "bot unregistered mid-computation — result discarded");
                        break;
                    }
                    if predictions.is_empty() {
                        continue;
                    }

                    let key = format!("bot-{}", Uuid::new_v4());
                    match authority
                        .append_batch(&session.session_id, &key, predictions)
                        .await
                    {
                        Ok(ack) => {
                            debug!(session = %session.session_id, from_seq = ack.from_seq, count = ack.count, "bot actions appended");
                        }
                        Err(e) if e.is_task_fatal() => {
                            warn!(task = %authority.task(), err = %e, "task fatal — bot stopping");
                            break;
                        }
                        Err(e) => {
                            warn!(task = %authority.task(), err = %e, "bot batch rejected");
                        }
                    }
                }
                Ok(TaskEvent::Actions { .. }) => {}
                Ok(TaskEvent::Resync { .. }) => break,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    debug!(skipped = n, "bot lagged behind the stream — continuing from current state");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
        registry.unregister(&session.session_id).await;
        info!(session = %session.session_id, "bot session stopped");
    }

    /// Swallow events that accumulated during the debounce window (the model
    /// sees the state after the whole burst). Returns false when a resync
    /// arrived and the bot must stop.
    fn drain_burst(
        events: &mut tokio::sync::broadcast::Receiver<TaskEvent>,
        _own_session: &str,
    ) -> bool {
        loop {
            match events.try_recv() {
                Ok(TaskEvent::Actions { .. }) => {}
                Ok(TaskEvent::Resync { .. }) => return false,
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Lagged(_)) => {}
                Err(TryRecvError::Closed) => return false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{kind, TaskKey};
    use crate::storage::{MemoryStore, SnapshotStore};
    use crate::sync::backoff::BackoffConfig;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    struct StubModel {
        calls: AtomicUsize,
        /// When set, predict blocks until notified — lets tests unregister
        /// the bot mid-computation.
        gate: Option<Arc<Notify>>,
    }

    #[async_trait]
    impl ModelClient for StubModel {
        async fn predict(&self, state: &TaskState) -> Result<Vec<ProposedAction>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            let n = state.session_status;
            Ok(vec![ProposedAction {
                kind: kind::ADD_LABEL.to_string(),
                payload: json!({
                    "itemIndex": 0,
                    "label": {"id": format!("bot-{n}"), "category": "car", "shape": {}, "attributes": {}}
                }),
            }])
        }
    }

    async fn setup() -> (Arc<TaskAuthority>, Arc<SessionRegistry>, Session) {
        let registry = Arc::new(SessionRegistry::new(Duration::from_secs(30)));
        let authority = TaskAuthority::open(
            TaskKey::new("p", 0),
            1,
            "hub-test",
            registry.clone(),
            SnapshotStore::new(Arc::new(MemoryStore::new()), 3),
            BackoffConfig::fast(),
        )
        .await
        .unwrap();
        let session = Session::new("bot", TaskKey::new("p", 0), true);
        registry.register(session.clone()).await;
        (authority, registry, session)
    }

    fn editor_action(n: u32) -> ProposedAction {
        ProposedAction {
            kind: kind::ADD_LABEL.to_string(),
            payload: json!({
                "itemIndex": 0,
                "label": {"id": format!("e{n}"), "category": "person", "shape": {}, "attributes": {}}
            }),
        }
    }

    #[tokio::test]
    async fn bot_reacts_to_editor_actions_through_append_path() {
        let (authority, registry, session) = setup().await;
        let model = Arc::new(StubModel {
            calls: AtomicUsize::new(0),
            gate: None,
        });
        let bot = tokio::spawn(BotSession::run(
            session,
            authority.clone(),
            registry,
            model.clone(),
            Duration::from_millis(1),
        ));

        authority
            .append_batch("editor-1", "k1", vec![editor_action(1)])
            .await
            .unwrap();

        // Wait for the bot's prediction to land in the log.
        for _ in 0..100 {
            if authority.head_seq() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(authority.head_seq() >= 2, "bot never appended");
        assert!(model.calls.load(Ordering::SeqCst) >= 1);
        assert_eq!(authority.current_state().label_count(), 2);
        bot.abort();
    }

    #[tokio::test]
    async fn late_result_after_unregister_is_discarded() {
        let (authority, registry, session) = setup().await;
        let gate = Arc::new(Notify::new());
        let model = Arc::new(StubModel {
            calls: AtomicUsize::new(0),
            gate: Some(gate.clone()),
        });
        let session_id = session.session_id.clone();
        let bot = tokio::spawn(BotSession::run(
            session,
            authority.clone(),
            registry.clone(),
            model.clone(),
            Duration::from_millis(1),
        ));

        authority
            .append_batch("editor-1", "k1", vec![editor_action(1)])
            .await
            .unwrap();

        // Let the bot enter the (gated) model call, then pull its session.
        for _ in 0..100 {
            if model.calls.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        registry.unregister(&session_id).await;
        gate.notify_one();

        bot.await.unwrap();
        // The editor action is the only one in the log.
        assert_eq!(authority.head_seq(), 1);
        assert_eq!(authority.current_state().label_count(), 1);
    }
}
