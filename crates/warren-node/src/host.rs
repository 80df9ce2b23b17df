// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The instance host — resolves `(class, name)` to a live actor.
//!
//! # Design
//!
//! ```text
//!   HTTP handler ──┐
//!                  ├──► mpsc::Sender<InstanceCmd> ──► instance actor
//!   WS handler   ──┘         (one per instance)        owns InstanceCore
//!                                                      runs handlers
//!   AlarmSupervisor ──► wake channel ──► host ──► cmd  sequentially
//! ```
//!
//! Each instance is one actor task draining a command mailbox — that mailbox
//! IS the cooperative single-writer lock.  Sockets are owned by the host
//! (they outlive the actor); the actor reaches them through the
//! [`FrameSink`] port.
//!
//! # Hibernation
//!
//! An actor that sits idle with nothing running breaks out of its loop and
//! drops its `InstanceCore` (and SQLite handle).  The next command — or an
//! alarm firing for a schedule it left behind — respawns it from durable
//! state.  `same_channel` guards the map cleanup against racing a respawn.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use warren_config::Config;
use warren_core::{
    AlarmPort, ApproveBody, Attachment, ChatMessage, ChatPayload, ChildResultBody, ChildRouter,
    Error, EventRecord, FrameSink, IncomingFrame, InstanceCore, InstanceKey, InvokeAck,
    InvokeRequest, OutgoingFrame, Result, SharedCancel, SharedStreamKill, StreamLive,
    StreamReplay,
};
use warren_model::ModelProvider;
use warren_scheduler::AlarmSupervisor;
use warren_store::InstanceStore;

/// Commands accepted by an instance actor.  Every command is handled to
/// completion before the next is taken.
pub enum InstanceCmd {
    Connect {
        conn_id: String,
        attach: Attachment,
        reply: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        conn_id: String,
    },
    Frame {
        conn_id: String,
        frame: IncomingFrame,
    },
    Invoke {
        req: InvokeRequest,
        reply: oneshot::Sender<Result<InvokeAck>>,
    },
    Approve {
        body: ApproveBody,
        reply: oneshot::Sender<Result<InvokeAck>>,
    },
    CancelRun {
        reply: oneshot::Sender<Result<()>>,
    },
    GetState {
        reply: oneshot::Sender<Value>,
    },
    GetEvents {
        reply: oneshot::Sender<Vec<EventRecord>>,
    },
    GetMessages {
        reply: oneshot::Sender<Result<Vec<ChatMessage>>>,
    },
    ClearMessages {
        reply: oneshot::Sender<Result<()>>,
    },
    Chat {
        payload: ChatPayload,
        reply: oneshot::Sender<Result<StreamReplay>>,
    },
    StreamRead {
        stream_id: String,
        reply: oneshot::Sender<Result<StreamReplay>>,
    },
    StreamStatus {
        stream_id: String,
        reply: oneshot::Sender<Result<(u64, bool)>>,
    },
    StreamCancel {
        stream_id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    ChildResult {
        body: ChildResultBody,
        reply: oneshot::Sender<Result<()>>,
    },
    Alarm,
}

/// Cheap-to-clone handle to one instance actor.
#[derive(Clone)]
pub struct InstanceHandle {
    pub cmd_tx: mpsc::Sender<InstanceCmd>,
    pub cancel: SharedCancel,
    pub stream_kill: SharedStreamKill,
}

impl InstanceHandle {
    pub async fn send(&self, cmd: InstanceCmd) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| Error::Transient("instance actor is restarting".into()))
    }

    /// Cancel the active run without waiting for the mailbox — a tick may be
    /// mid-model-call for a while.
    pub fn cancel_now(&self) {
        self.cancel.lock().unwrap().cancel();
    }

    /// Flag a stream canceled so an in-flight producer stops appending
    /// before the queued cancel command lands.
    pub fn kill_stream(&self, stream_id: &str) {
        self.stream_kill
            .lock()
            .unwrap()
            .insert(stream_id.to_string());
    }
}

/// Node-wide state shared by the HTTP edge and the actors.
pub struct NodeState {
    pub config: Arc<Config>,
    data_dir: PathBuf,
    model: Arc<dyn ModelProvider>,
    instances: DashMap<InstanceKey, InstanceHandle>,
    /// Socket outbound channels, keyed by connection id.  Owned here so
    /// sockets survive instance hibernation.
    conns: Arc<DashMap<String, mpsc::UnboundedSender<OutgoingFrame>>>,
    alarms: Arc<AlarmSupervisor<InstanceKey>>,
}

impl NodeState {
    pub fn new(config: Arc<Config>, model: Arc<dyn ModelProvider>) -> Arc<Self> {
        let data_dir = config
            .runtime
            .data_dir
            .clone()
            .unwrap_or_else(warren_config::default_data_dir);

        let (wake_tx, mut wake_rx) = mpsc::unbounded_channel::<InstanceKey>();
        let alarms = Arc::new(AlarmSupervisor::new(move |key: InstanceKey| {
            let _ = wake_tx.send(key);
        }));

        let node = Arc::new(Self {
            config,
            data_dir,
            model,
            instances: DashMap::new(),
            conns: Arc::new(DashMap::new()),
            alarms,
        });

        // Alarm pump: a firing alarm wakes (respawning if needed) the
        // instance and hands it the dispatch.
        let pump = Arc::clone(&node);
        tokio::spawn(async move {
            while let Some(key) = wake_rx.recv().await {
                // The actor can hibernate between resolving the handle and
                // the send landing; one respawn retry closes that window.
                let mut delivered = false;
                for _ in 0..2 {
                    match pump.handle(&key) {
                        Ok(h) => {
                            if h.send(InstanceCmd::Alarm).await.is_ok() {
                                delivered = true;
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(instance = %key, "alarm wake failed: {e}");
                            break;
                        }
                    }
                }
                if !delivered {
                    warn!(instance = %key, "alarm wake lost; actor unavailable");
                }
            }
        });

        node
    }

    pub fn register_conn(&self, conn_id: &str, tx: mpsc::UnboundedSender<OutgoingFrame>) {
        self.conns.insert(conn_id.to_string(), tx);
    }

    pub fn unregister_conn(&self, conn_id: &str) {
        self.conns.remove(conn_id);
    }

    fn store_path(&self, key: &InstanceKey) -> PathBuf {
        self.data_dir
            .join(&key.class)
            .join(format!("{}.db", key.name))
    }

    /// Resolve the actor handle for `key`, spawning (or respawning after
    /// hibernation) as needed.
    pub fn handle(self: &Arc<Self>, key: &InstanceKey) -> Result<InstanceHandle> {
        if let Some(h) = self.instances.get(key) {
            if !h.cmd_tx.is_closed() {
                return Ok(h.clone());
            }
        }
        match self.instances.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut o) => {
                if o.get().cmd_tx.is_closed() {
                    let h = self.spawn_instance(key)?;
                    *o.get_mut() = h.clone();
                    Ok(h)
                } else {
                    Ok(o.get().clone())
                }
            }
            dashmap::mapref::entry::Entry::Vacant(v) => {
                let h = self.spawn_instance(key)?;
                v.insert(h.clone());
                Ok(h)
            }
        }
    }

    fn spawn_instance(self: &Arc<Self>, key: &InstanceKey) -> Result<InstanceHandle> {
        let store = InstanceStore::open(self.store_path(key))?;
        let class_cfg = self
            .config
            .agents
            .get(&key.class)
            .cloned()
            .unwrap_or_default();

        let builtin: Arc<dyn warren_core::Middleware> = Arc::new(warren_core::Toolbox::new(
            "builtin",
            vec![warren_core::task_tool(), warren_core::schedule_tool()],
        ));
        let gate: Arc<dyn warren_core::Middleware> = Arc::new(warren_core::ApprovalGate::new(
            class_cfg.confirm_tools.iter().cloned(),
        ));
        let middlewares = vec![builtin, gate];

        let cancel: SharedCancel = Arc::new(std::sync::Mutex::new(CancellationToken::new()));
        let stream_kill: SharedStreamKill =
            Arc::new(std::sync::Mutex::new(std::collections::HashSet::new()));
        let core = InstanceCore::load(
            key.clone(),
            store,
            Arc::clone(&self.model),
            middlewares,
            self.config.runner.clone(),
            class_cfg,
            self.config.runtime.event_ring_capacity,
            Arc::new(NodeSink {
                conns: Arc::clone(&self.conns),
            }),
            Arc::new(NodeAlarms {
                supervisor: Arc::clone(&self.alarms),
            }),
            Arc::new(NodeRouter {
                node: Arc::downgrade(self),
            }),
            Arc::clone(&cancel),
            Arc::clone(&stream_kill),
        )?;

        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let handle = InstanceHandle {
            cmd_tx: cmd_tx.clone(),
            cancel,
            stream_kill,
        };
        let idle = Duration::from_secs(self.config.runtime.hibernate_after_secs.max(1));
        let node = Arc::clone(self);
        let key = key.clone();
        tokio::spawn(run_actor(core, cmd_rx, cmd_tx, node, key, idle));
        Ok(handle)
    }

    /// Re-arm every persisted alarm after a process restart by scanning the
    /// data directory.  Instances themselves stay hibernated; the alarm
    /// firing is what wakes them.
    pub fn restore_alarms(self: &Arc<Self>) -> Result<()> {
        let Ok(classes) = std::fs::read_dir(&self.data_dir) else {
            return Ok(());
        };
        for class_dir in classes.flatten() {
            if !class_dir.path().is_dir() {
                continue;
            }
            let class = class_dir.file_name().to_string_lossy().to_string();
            let Ok(names) = std::fs::read_dir(class_dir.path()) else {
                continue;
            };
            for db in names.flatten() {
                let path = db.path();
                if path.extension().and_then(|e| e.to_str()) != Some("db") {
                    continue;
                }
                let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                let key = InstanceKey::new(class.clone(), name);
                match InstanceStore::open(&path).and_then(|s| s.min_next_run()) {
                    Ok(Some(at)) => {
                        debug!(instance = %key, at, "restoring alarm after restart");
                        self.alarms.set(key, Some(at));
                    }
                    Ok(None) => {}
                    Err(e) => warn!(instance = %key, "could not restore alarm: {e}"),
                }
            }
        }
        Ok(())
    }

    pub fn shutdown(&self) {
        self.alarms.clear_all();
    }
}

/// The per-instance actor loop: drain commands sequentially, hibernate on
/// idle.
async fn run_actor(
    mut core: InstanceCore,
    mut cmd_rx: mpsc::Receiver<InstanceCmd>,
    cmd_tx: mpsc::Sender<InstanceCmd>,
    node: Arc<NodeState>,
    key: InstanceKey,
    idle: Duration,
) {
    loop {
        let cmd = tokio::select! {
            biased;
            cmd = cmd_rx.recv() => cmd,
            _ = tokio::time::sleep(idle) => {
                if !core.can_hibernate() {
                    continue;
                }
                // Refuse new sends, then drain whatever raced the idle
                // timer before dropping the instance.
                cmd_rx.close();
                while let Some(cmd) = cmd_rx.recv().await {
                    handle_cmd(&mut core, &node, cmd).await;
                }
                info!(instance = %key, "hibernating after idle");
                break;
            }
        };
        let Some(cmd) = cmd else { break };
        handle_cmd(&mut core, &node, cmd).await;
    }
    // Remove our own map entry unless a respawn already replaced it.
    node.instances
        .remove_if(&key, |_, h| h.cmd_tx.same_channel(&cmd_tx));
}

async fn handle_cmd(core: &mut InstanceCore, node: &Arc<NodeState>, cmd: InstanceCmd) {
    match cmd {
        InstanceCmd::Connect {
            conn_id,
            attach,
            reply,
        } => {
            let _ = reply.send(core.on_connect(&conn_id, attach));
        }
        InstanceCmd::Disconnect { conn_id } => {
            if let Err(e) = core.on_disconnect(&conn_id) {
                warn!(instance = %core.key, "disconnect cleanup failed: {e}");
            }
        }
        InstanceCmd::Frame { conn_id, frame } => handle_frame(core, node, conn_id, frame).await,
        InstanceCmd::Invoke { req, reply } => {
            let _ = reply.send(core.invoke(req));
        }
        InstanceCmd::Approve { body, reply } => {
            let _ = reply.send(core.approve(body));
        }
        InstanceCmd::CancelRun { reply } => {
            let _ = reply.send(core.cancel_run());
        }
        InstanceCmd::GetState { reply } => {
            let _ = reply.send(core.state_doc());
        }
        InstanceCmd::GetEvents { reply } => {
            let _ = reply.send(core.events_snapshot());
        }
        InstanceCmd::GetMessages { reply } => {
            let _ = reply.send(core.messages());
        }
        InstanceCmd::ClearMessages { reply } => {
            let _ = reply.send(core.clear_messages());
        }
        InstanceCmd::Chat { payload, reply } => {
            let _ = reply.send(core.chat(payload));
        }
        InstanceCmd::StreamRead { stream_id, reply } => {
            let _ = reply.send(core.stream_read(&stream_id));
        }
        InstanceCmd::StreamStatus { stream_id, reply } => {
            let _ = reply.send(core.stream_status(&stream_id));
        }
        InstanceCmd::StreamCancel { stream_id, reply } => {
            let _ = reply.send(core.stream_cancel(&stream_id));
        }
        InstanceCmd::ChildResult { body, reply } => {
            let _ = reply.send(core.on_child_result(body).await);
        }
        InstanceCmd::Alarm => {
            if let Err(e) = core.on_alarm().await {
                warn!(instance = %core.key, "alarm dispatch failed: {e}");
            }
        }
    }
}

/// Route one parsed client frame.  Parse failures never reach here — the
/// socket loop drops undecodable frames silently and keeps the connection.
async fn handle_frame(
    core: &mut InstanceCore,
    node: &Arc<NodeState>,
    conn_id: String,
    frame: IncomingFrame,
) {
    match frame {
        IncomingFrame::State { state } => {
            // Readonly rejection already answered the client with a
            // cf_agent_state_error frame; nothing else to do.
            if let Err(e) = core.set_state_from_conn(&conn_id, state) {
                debug!(instance = %core.key, conn = %conn_id, "state write rejected: {e}");
            }
        }
        IncomingFrame::ChatMessages { messages } => {
            if let Err(e) = core.persist_incoming_messages(&messages) {
                warn!(instance = %core.key, "persisting chat messages failed: {e}");
            }
        }
        IncomingFrame::ToolResult {
            tool_call_id,
            output,
            ..
        } => {
            if let Err(e) = core.on_tool_result(&tool_call_id, output).await {
                warn!(instance = %core.key, "tool result handling failed: {e}");
            }
        }
        IncomingFrame::Rpc { id, method, args } => {
            let frame = match core.handle_rpc(&conn_id, &method, args).await {
                Ok(result) => OutgoingFrame::RpcResponse {
                    id,
                    success: true,
                    result: Some(result),
                    error: None,
                },
                Err(e) => OutgoingFrame::RpcResponse {
                    id,
                    success: false,
                    result: None,
                    error: Some(e.to_string()),
                },
            };
            core.send_frame(&conn_id, &frame);
        }
        IncomingFrame::UseChatRequest { id, init } => {
            let payload = chat_payload_from_init(init);
            match core.chat(payload) {
                Ok(replay) => {
                    spawn_use_chat_forwarder(node, conn_id, id, replay);
                }
                Err(e) => {
                    core.send_frame(
                        &conn_id,
                        &OutgoingFrame::UseChatResponse {
                            id,
                            body: serde_json::json!({ "error": e.to_string() }).to_string(),
                            done: true,
                        },
                    );
                }
            }
        }
    }
}

/// `init` mirrors a fetch init: the chat payload may ride in a JSON-encoded
/// `body` field or be the object itself.
fn chat_payload_from_init(init: Value) -> ChatPayload {
    if let Some(body) = init.get("body").and_then(|b| b.as_str()) {
        if let Ok(payload) = serde_json::from_str(body) {
            return payload;
        }
    }
    serde_json::from_value(init).unwrap_or_default()
}

/// Forward a chat run's live deltas to the requesting socket as
/// `cf_agent_use_chat_response` frames.  Runs detached: the actor keeps
/// ticking while the socket drains.
fn spawn_use_chat_forwarder(
    node: &Arc<NodeState>,
    conn_id: String,
    request_id: String,
    mut replay: StreamReplay,
) {
    let conns = Arc::clone(&node.conns);
    tokio::spawn(async move {
        let send = |body: String, done: bool| {
            if let Some(tx) = conns.get(&conn_id) {
                let _ = tx.send(OutgoingFrame::UseChatResponse {
                    id: request_id.clone(),
                    body,
                    done,
                });
            }
        };
        let replayed = replay.chunks.len();
        for chunk in &replay.chunks {
            send(delta_frame(chunk), false);
        }
        if let Some(mut live) = replay.live.take() {
            while let Ok(ev) = live.recv().await {
                match ev {
                    StreamLive::Chunk { seq, text } if seq >= replayed => {
                        send(delta_frame(&text), false);
                    }
                    StreamLive::Chunk { .. } => {}
                    StreamLive::End => break,
                }
            }
        }
        send(String::new(), true);
    });
}

pub(crate) fn delta_frame(text: &str) -> String {
    serde_json::json!({ "type": "text-delta", "delta": text }).to_string()
}

// ─── Port implementations ─────────────────────────────────────────────────────

struct NodeSink {
    conns: Arc<DashMap<String, mpsc::UnboundedSender<OutgoingFrame>>>,
}

impl FrameSink for NodeSink {
    fn send(&self, conn_id: &str, frame: &OutgoingFrame) {
        if let Some(tx) = self.conns.get(conn_id) {
            let _ = tx.send(frame.clone());
        }
    }
}

struct NodeAlarms {
    supervisor: Arc<AlarmSupervisor<InstanceKey>>,
}

impl AlarmPort for NodeAlarms {
    fn set_alarm(&self, key: &InstanceKey, at: Option<i64>) {
        self.supervisor.set(key.clone(), at);
    }
}

/// Cross-instance addressing.  Only ever *enqueues* onto the target's
/// mailbox — executing the target inline from inside another instance's
/// handler would deadlock a parent/child pair.
struct NodeRouter {
    node: std::sync::Weak<NodeState>,
}

#[async_trait]
impl ChildRouter for NodeRouter {
    async fn invoke(&self, key: InstanceKey, req: InvokeRequest) -> Result<()> {
        let node = self
            .node
            .upgrade()
            .ok_or_else(|| Error::Internal("node is shutting down".into()))?;
        let handle = node.handle(&key)?;
        let (reply, rx) = oneshot::channel();
        handle.send(InstanceCmd::Invoke { req, reply }).await?;
        // Surface child-start failures in the log without blocking the
        // caller's write lock on the child's handler.
        tokio::spawn(async move {
            match rx.await {
                Ok(Err(e)) => warn!(instance = %key, "sub-agent invoke failed: {e}"),
                Err(_) => warn!(instance = %key, "sub-agent invoke reply dropped"),
                Ok(Ok(_)) => {}
            }
        });
        Ok(())
    }

    async fn child_result(&self, key: InstanceKey, body: ChildResultBody) -> Result<()> {
        let node = self
            .node
            .upgrade()
            .ok_or_else(|| Error::Internal("node is shutting down".into()))?;
        let handle = node.handle(&key)?;
        let (reply, rx) = oneshot::channel();
        handle.send(InstanceCmd::ChildResult { body, reply }).await?;
        tokio::spawn(async move {
            if let Ok(Err(e)) = rx.await {
                warn!(instance = %key, "child result rejected: {e}");
            }
        });
        Ok(())
    }
}
