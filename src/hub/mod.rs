// SPDX-License-Identifier: MIT
//! Synchronization hub — the network-facing component.
//!
//! Accepts WebSocket connections, walks each one through
//! Connecting → Authenticating → Syncing → Live → Closed, and routes accepted
//! action batches through the owning [`TaskAuthority`]. Everything a client
//! observes about a task goes through that authority's critical section, so
//! all live connections of a task agree on one total order.

pub mod auth;
pub mod protocol;
pub mod task;

use crate::action::TaskKey;
use crate::bot::{BotSession, HttpModelClient};
use crate::config::DaemonConfig;
use crate::error::SyncError;
use crate::project::ProjectRegistry;
use crate::registry::{Session, SessionRegistry};
use crate::storage::SnapshotStore;
use anyhow::Result;
use auth::TokenVerifier;
use futures_util::{SinkExt, StreamExt};
use protocol::{ClientMessage, ServerMessage};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use task::{TaskAuthority, TaskEvent};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

type WsSink = futures_util::stream::SplitSink<WebSocketStream<TcpStream>, Message>;
type WsStream = futures_util::stream::SplitStream<WebSocketStream<TcpStream>>;

/// How long a connection may sit in Authenticating or Syncing before the
/// hub gives up on it.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

struct TaskHandle {
    authority: Arc<TaskAuthority>,
    loops: Vec<JoinHandle<()>>,
}

pub struct Hub {
    pub config: Arc<DaemonConfig>,
    pub registry: Arc<SessionRegistry>,
    pub projects: ProjectRegistry,
    snapshots: SnapshotStore,
    verifier: TokenVerifier,
    /// Stable id of this hub instance — the lease holder name.
    instance_id: String,
    tasks: RwLock<HashMap<TaskKey, TaskHandle>>,
    shutdown: watch::Sender<bool>,
    started_at: Instant,
}

impl Hub {
    pub fn new(
        config: Arc<DaemonConfig>,
        registry: Arc<SessionRegistry>,
        projects: ProjectRegistry,
        snapshots: SnapshotStore,
    ) -> Arc<Self> {
        let verifier = TokenVerifier::new(&config.auth_secret);
        if !verifier.enabled() {
            warn!("auth secret is empty — identity tokens are NOT verified");
        }
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            verifier,
            instance_id: format!("hub-{}", Uuid::new_v4()),
            config,
            registry,
            projects,
            snapshots,
            tasks: RwLock::new(HashMap::new()),
            shutdown,
            started_at: Instant::now(),
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub async fn task_count(&self) -> usize {
        self.tasks.read().await.len()
    }

    // ─── Task authorities ────────────────────────────────────────────────────

    /// Resolve the authority for a task, opening it on first use: lease
    /// acquisition, snapshot load, background lease/snapshot loops, and the
    /// bot session when one is configured.
    pub async fn get_or_open(self: &Arc<Self>, task: &TaskKey) -> Result<Arc<TaskAuthority>, SyncError> {
        let cached = self
            .tasks
            .read()
            .await
            .get(task)
            .map(|h| h.authority.clone());
        if let Some(authority) = cached {
            if !authority.is_poisoned() {
                return Ok(authority);
            }
            // A poisoned authority rejects every replay and append, so a
            // client answering the resync close would reconnect into the
            // same dead end. Evict it; the open below re-acquires the lease
            // and reloads the latest snapshot.
            warn!(task = %task, "evicting poisoned task before reopen");
            self.close_task(task).await;
        }

        let item_count = self.projects.task_items(task).await?;

        let mut tasks = self.tasks.write().await;
        // Lost the race — someone opened it while we resolved the project.
        if let Some(handle) = tasks.get(task) {
            if !handle.authority.is_poisoned() {
                return Ok(handle.authority.clone());
            }
            // Raced with another reopen that also hit the poisoned handle.
            drop(tasks);
            self.close_task(task).await;
            tasks = self.tasks.write().await;
            if let Some(handle) = tasks.get(task) {
                return Ok(handle.authority.clone());
            }
        }

        let authority = TaskAuthority::open(
            task.clone(),
            item_count,
            &self.instance_id,
            self.registry.clone(),
            self.snapshots.clone(),
            self.config.snapshot.backoff(),
        )
        .await?;

        let mut loops = vec![
            tokio::spawn(
                authority
                    .clone()
                    .run_lease_loop(self.config.lease_ttl(), self.shutdown.subscribe()),
            ),
            tokio::spawn(
                authority
                    .clone()
                    .run_snapshot_loop(self.config.snapshot.interval(), self.shutdown.subscribe()),
            ),
        ];

        if self.config.bot.enabled {
            let model = Arc::new(HttpModelClient::new(
                &self.config.bot.endpoint,
                self.config.bot.timeout(),
            ));
            let session = Session::new(&self.config.bot.user_id, task.clone(), true);
            self.registry.register(session.clone()).await;
            loops.push(tokio::spawn(BotSession::run(
                session,
                authority.clone(),
                self.registry.clone(),
                model,
                self.config.bot.debounce(),
            )));
        }

        info!(task = %task, instance = %self.instance_id, "task opened");
        tasks.insert(
            task.clone(),
            TaskHandle {
                authority: authority.clone(),
                loops,
            },
        );
        Ok(authority)
    }

    /// Snapshot and drop one task authority. Used by the idle sweep and by
    /// project deletion.
    pub async fn close_task(&self, task: &TaskKey) {
        let Some(handle) = self.tasks.write().await.remove(task) else {
            return;
        };
        handle.authority.snapshot_now().await;
        for l in handle.loops {
            l.abort();
        }
        for session in self.registry.list_active(task).await {
            self.registry.unregister(&session.session_id).await;
        }
        self.registry.forget_task(task).await;
        info!(task = %task, "task closed");
    }

    /// Background sweep: snapshot-and-evict tasks with no sessions past the
    /// idle window.
    pub async fn run_idle_sweep(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let window = self.config.idle_task_window();
        let period = (window / 4).max(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(period) => {}
            }
            for task in self.registry.idle_tasks(window).await {
                debug!(task = %task, "idle window elapsed — evicting");
                self.close_task(&task).await;
            }
        }
    }

    // ─── Server ──────────────────────────────────────────────────────────────

    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = format!("{}:{}", self.config.bind_address, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        info!(addr = %listener.local_addr()?, "sync hub listening (WebSocket + HTTP health on same port)");
        Ok(listener)
    }

    /// Accept loop. Returns after [`Hub::begin_shutdown`], once sessions are
    /// drained and every dirty task has had a final snapshot flush.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    info!("shutdown — draining sessions and flushing snapshots");
                    break;
                }

                conn = listener.accept() => {
                    let (stream, peer) = match conn {
                        Ok(c) => c,
                        Err(e) => {
                            error!(err = %e, "accept error");
                            continue;
                        }
                    };
                    debug!(peer = %peer, "new connection");
                    let hub = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = hub.handle_connection(stream).await {
                            warn!(peer = %peer, err = %e, "connection error");
                        }
                    });
                }
            }
        }
        self.drain().await;
        info!("sync hub stopped");
        Ok(())
    }

    pub fn begin_shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    async fn drain(&self) {
        let tasks: Vec<TaskKey> = self.tasks.read().await.keys().cloned().collect();
        for task in tasks {
            self.close_task(&task).await;
        }
    }

    // ─── Connection state machine ────────────────────────────────────────────

    async fn handle_connection(self: Arc<Self>, stream: TcpStream) -> Result<()> {
        // HTTP health checks share the port with WebSocket upgrades; peek at
        // the request line to tell them apart.
        let mut peek_buf = [0u8; 12];
        let n = stream.peek(&mut peek_buf).await.unwrap_or(0);
        if n >= 11 && &peek_buf[..11] == b"GET /health" {
            return self.handle_health_check(stream).await;
        }

        let ws = accept_async(stream).await?;
        let (mut sink, mut stream) = ws.split();

        // ── Authenticating ───────────────────────────────────────────────────
        let user_id = match self.authenticate(&mut sink, &mut stream).await? {
            Some(uid) => uid,
            None => return Ok(()),
        };

        // ── Waiting for register ─────────────────────────────────────────────
        let register = tokio::time::timeout(HANDSHAKE_TIMEOUT, stream.next()).await;
        let (task, since_seq, bot) = match register {
            Ok(Some(Ok(Message::Text(text)))) => match serde_json::from_str(&text) {
                Ok(ClientMessage::Register {
                    task_id,
                    since_seq,
                    bot,
                }) => match TaskKey::parse(&task_id) {
                    Some(task) => (task, since_seq, bot),
                    None => {
                        let msg = ServerMessage::error("taskNotFound", format!("bad task id: {task_id}"));
                        let _ = sink.send(Message::Text(msg.to_json())).await;
                        return Ok(());
                    }
                },
                _ => {
                    let msg = ServerMessage::error("invalidBatch", "expected register");
                    let _ = sink.send(Message::Text(msg.to_json())).await;
                    return Ok(());
                }
            },
            _ => return Ok(()),
        };

        let authority = match self.get_or_open(&task).await {
            Ok(a) => a,
            Err(e) => {
                let msg = ServerMessage::error(e.code(), e.to_string());
                let _ = sink.send(Message::Text(msg.to_json())).await;
                return Ok(());
            }
        };

        let session = Session::new(&user_id, task.clone(), bot);
        let session_id = session.session_id.clone();
        self.registry.register(session).await;
        info!(session = %session_id, user = %user_id, task = %task, "session registered");

        // ── Syncing ──────────────────────────────────────────────────────────
        // Subscribe before assembling the replay so nothing appended in
        // between is lost; anything the replay already covers is dropped by
        // the seq filter in the live loop.
        let events = authority.subscribe();
        let synced_to = match self.send_replay(&mut sink, &authority, &task, &session_id, since_seq).await {
            Ok(seq) => seq,
            Err(e) => {
                self.registry.unregister(&session_id).await;
                return Err(e);
            }
        };

        // ── Live ─────────────────────────────────────────────────────────────
        let result = self
            .live_loop(&mut sink, &mut stream, &authority, &session_id, events, synced_to)
            .await;

        // ── Closed ───────────────────────────────────────────────────────────
        self.registry.unregister(&session_id).await;
        info!(session = %session_id, task = %task, "session closed");
        result
    }

    async fn authenticate(
        &self,
        sink: &mut WsSink,
        stream: &mut WsStream,
    ) -> Result<Option<String>> {
        let first = tokio::time::timeout(HANDSHAKE_TIMEOUT, stream.next()).await;
        let text = match first {
            Ok(Some(Ok(Message::Text(t)))) => t,
            // Timeout, closed, or non-text frame — drop silently.
            _ => return Ok(None),
        };
        let token = match serde_json::from_str(&text) {
            Ok(ClientMessage::Auth { token }) => token,
            _ => {
                let msg = ServerMessage::error("unauthorized", "first message must be auth");
                let _ = sink.send(Message::Text(msg.to_json())).await;
                return Ok(None);
            }
        };
        match self.verifier.verify(&token) {
            Ok(user_id) => {
                let msg = ServerMessage::Authenticated {
                    user_id: user_id.clone(),
                };
                sink.send(Message::Text(msg.to_json())).await?;
                debug!(user = %user_id, "client authenticated");
                Ok(Some(user_id))
            }
            Err(e) => {
                warn!(err = %e, "authentication failed");
                let msg = ServerMessage::error("unauthorized", "invalid identity token");
                let _ = sink.send(Message::Text(msg.to_json())).await;
                Ok(None)
            }
        }
    }

    /// Send `registered`, the snapshot and/or dense tail, and the
    /// `syncComplete` marker. Returns the seq the connection is synced to.
    async fn send_replay(
        &self,
        sink: &mut WsSink,
        authority: &TaskAuthority,
        task: &TaskKey,
        session_id: &str,
        since_seq: Option<u64>,
    ) -> Result<u64> {
        let replay = match authority.replay(since_seq) {
            Ok(r) => r,
            Err(e) => {
                let msg = ServerMessage::ResyncRequired {
                    task_id: task.to_string(),
                    reason: e.code().to_string(),
                };
                sink.send(Message::Text(msg.to_json())).await?;
                anyhow::bail!("replay failed: {e}");
            }
        };

        sink.send(Message::Text(
            ServerMessage::Registered {
                session_id: session_id.to_string(),
                task_id: task.to_string(),
            }
            .to_json(),
        ))
        .await?;

        if let Some(snapshot) = replay.snapshot {
            sink.send(Message::Text(
                ServerMessage::Snapshot {
                    task_id: task.to_string(),
                    seq: snapshot.seq,
                    state: snapshot.state,
                }
                .to_json(),
            ))
            .await?;
        }
        if !replay.tail.is_empty() {
            let from_seq = replay.tail[0].seq;
            sink.send(Message::Text(
                ServerMessage::Actions {
                    task_id: task.to_string(),
                    from_seq,
                    actions: replay.tail,
                }
                .to_json(),
            ))
            .await?;
        }
        sink.send(Message::Text(
            ServerMessage::SyncComplete {
                task_id: task.to_string(),
                head_seq: replay.head_seq,
            }
            .to_json(),
        ))
        .await?;
        Ok(replay.head_seq)
    }

    async fn live_loop(
        &self,
        sink: &mut WsSink,
        stream: &mut WsStream,
        authority: &TaskAuthority,
        session_id: &str,
        mut events: tokio::sync::broadcast::Receiver<TaskEvent>,
        mut synced_to: u64,
    ) -> Result<()> {
        let idle_timeout = self.config.idle_connection_timeout();
        let mut last_client_msg = Instant::now();
        let mut shutdown = self.shutdown.subscribe();

        loop {
            let idle_deadline = last_client_msg + idle_timeout;
            tokio::select! {
                _ = shutdown.changed() => {
                    debug!(session = %session_id, "closing connection for shutdown");
                    break;
                }

                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(idle_deadline)) => {
                    info!(session = %session_id, "idle timeout — closing");
                    break;
                }

                msg = stream.next() => {
                    last_client_msg = Instant::now();
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(reply) = self.handle_client_text(&text, authority, session_id).await {
                                let fatal = matches!(reply, ServerMessage::ResyncRequired { .. });
                                sink.send(Message::Text(reply.to_json())).await?;
                                if fatal {
                                    break;
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            let _ = sink.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            warn!(session = %session_id, err = %e, "ws error");
                            break;
                        }
                        _ => {}
                    }
                }

                event = events.recv() => {
                    match event {
                        Ok(TaskEvent::Actions { origin, actions, .. }) => {
                            let fresh: Vec<_> = actions
                                .iter()
                                .filter(|a| a.seq > synced_to)
                                .cloned()
                                .collect();
                            let Some(first) = fresh.first() else { continue };
                            if first.seq != synced_to + 1 {
                                // Hole between replay and live stream — the
                                // client must not observe out-of-order state.
                                error!(session = %session_id, expected = synced_to + 1, found = first.seq, "broadcast gap");
                                self.send_resync(sink, authority, "orderingGap").await?;
                                break;
                            }
                            synced_to = fresh.last().map(|a| a.seq).unwrap_or(synced_to);
                            // The submitter already got its ack; everyone
                            // else gets the batch.
                            if origin != session_id {
                                let msg = ServerMessage::Actions {
                                    task_id: authority.task().to_string(),
                                    from_seq: first.seq,
                                    actions: fresh,
                                };
                                sink.send(Message::Text(msg.to_json())).await?;
                            }
                        }
                        Ok(TaskEvent::Resync { reason }) => {
                            self.send_resync(sink, authority, &reason).await?;
                            break;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!(session = %session_id, skipped = n, "broadcast lagged — forcing resync");
                            self.send_resync(sink, authority, "broadcastLagged").await?;
                            break;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
        Ok(())
    }

    async fn send_resync(
        &self,
        sink: &mut WsSink,
        authority: &TaskAuthority,
        reason: &str,
    ) -> Result<()> {
        let msg = ServerMessage::ResyncRequired {
            task_id: authority.task().to_string(),
            reason: reason.to_string(),
        };
        sink.send(Message::Text(msg.to_json())).await?;
        Ok(())
    }

    /// Handle one Live-state client frame. Returns the reply, if any.
    async fn handle_client_text(
        &self,
        text: &str,
        authority: &TaskAuthority,
        session_id: &str,
    ) -> Option<ServerMessage> {
        let msg: ClientMessage = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(e) => return Some(ServerMessage::error("invalidBatch", format!("parse error: {e}"))),
        };
        match msg {
            ClientMessage::Submit {
                task_id,
                session_id: claimed,
                idempotency_key,
                actions,
            } => {
                if claimed != session_id || task_id != authority.task().to_string() {
                    return Some(ServerMessage::error(
                        "invalidBatch",
                        "submit does not match this connection's session",
                    ));
                }
                match authority.append_batch(session_id, &idempotency_key, actions).await {
                    Ok(ack) => Some(ServerMessage::Ack {
                        idempotency_key,
                        from_seq: ack.from_seq,
                        count: ack.count,
                    }),
                    Err(e) if e.is_task_fatal() => Some(ServerMessage::ResyncRequired {
                        task_id: authority.task().to_string(),
                        reason: e.code().to_string(),
                    }),
                    Err(e) => Some(ServerMessage::Error {
                        code: e.code().to_string(),
                        message: e.to_string(),
                        idempotency_key: Some(idempotency_key),
                    }),
                }
            }
            // Auth and register are handshake-state messages.
            ClientMessage::Auth { .. } | ClientMessage::Register { .. } => Some(
                ServerMessage::error("invalidBatch", "connection is already live"),
            ),
        }
    }

    // ─── Health ──────────────────────────────────────────────────────────────

    async fn handle_health_check(&self, mut stream: TcpStream) -> Result<()> {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let mut req_buf = vec![0u8; 2048];
        let _ = stream.read(&mut req_buf).await;

        let body = serde_json::json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "uptime": self.started_at.elapsed().as_secs(),
            "activeSessions": self.registry.session_count().await,
            "openTasks": self.task_count().await,
            "port": self.config.port,
        });
        let body_str = body.to_string();
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body_str.len(),
            body_str
        );
        stream.write_all(response.as_bytes()).await?;
        Ok(())
    }
}
