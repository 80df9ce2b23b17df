// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The agent instance: a logical singleton addressed by `(class, name)` that
//! exclusively owns its state, history, streams, schedules, tasks, and
//! connection attachments.
//!
//! # Single-writer discipline
//!
//! Every method on [`InstanceCore`] takes `&mut self` and is invoked from one
//! actor task per instance — no two handlers for the same instance ever
//! interleave writes.  The hosting layer provides three ports:
//!
//! - [`FrameSink`] — delivers outgoing protocol frames to connections (the
//!   sockets outlive the in-memory instance, so they are owned by the host);
//! - [`AlarmPort`] — rewrites the single next-fire alarm pointer;
//! - [`ChildRouter`] — addresses other instances (sub-agent spawn/join).
//!
//! # Hibernation
//!
//! The instance may be dropped from memory between any two handler
//! invocations.  Everything needed to resume — the checkpoint blob, message
//! history, streams, schedules, connection attachments — is already durable
//! by then; [`InstanceCore::load`] rebuilds the in-memory picture and re-arms
//! the alarm pointer.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use warren_config::{AgentClassConfig, RunnerConfig};
use warren_model::ModelProvider;
use warren_scheduler::{now_ms, Schedule, ScheduleKind};
use warren_store::InstanceStore;

use crate::error::{Error, Result};
use crate::events::{EventKind, EventRecord, EventRing};
use crate::history;
use crate::message::{ChatMessage, ChatRole, Part, ToolPart, ToolPartState};
use crate::middleware::Middleware;
use crate::persist::{
    checkpoint_hash, ParentRef, Persisted, RunState, RunStatus, ToolCallRequest,
};
use crate::protocol::{Attachment, McpServerInfo, OutgoingFrame};
use crate::task::TaskRecord;

/// Instance address.  `(class, name)` is the identity; storage and
/// connections are namespaced by it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceKey {
    pub class: String,
    pub name: String,
}

impl InstanceKey {
    pub fn new(class: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.class, self.name)
    }
}

// ─── Host ports ───────────────────────────────────────────────────────────────

/// Delivers one outgoing frame to one connection.  Unknown connection ids are
/// dropped silently (the socket closed under us).
pub trait FrameSink: Send + Sync {
    fn send(&self, conn_id: &str, frame: &OutgoingFrame);
}

/// Rewrites the instance's single physical alarm.
pub trait AlarmPort: Send + Sync {
    fn set_alarm(&self, key: &InstanceKey, at: Option<i64>);
}

/// Cross-instance addressing for sub-agent spawn and join.
///
/// Implementations enqueue onto the target instance's mailbox and return —
/// they must never execute the target's handler inline, or a parent/child
/// pair could deadlock on each other's write locks.
#[async_trait]
pub trait ChildRouter: Send + Sync {
    async fn invoke(&self, key: InstanceKey, req: InvokeRequest) -> Result<()>;
    async fn child_result(&self, key: InstanceKey, body: ChildResultBody) -> Result<()>;
}

// ─── Request/response bodies ──────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvokeRequest {
    /// Convenience single user message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Full messages to persist before the run starts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<ChatMessage>>,
    #[serde(default, rename = "systemPrompt", skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, rename = "streamId", skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<InvokeMeta>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvokeMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ParentRef>,
    #[serde(default)]
    pub depth: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokeAck {
    pub run_id: String,
    pub status: RunStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApproveBody {
    #[serde(default)]
    pub approved: Option<bool>,
    #[serde(default, rename = "modifiedToolCalls")]
    pub modified_tool_calls: Option<Vec<ModifiedToolCall>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModifiedToolCall {
    #[serde(default, rename = "toolCallId", skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChildResultBody {
    pub token: String,
    #[serde(rename = "childThreadId")]
    pub child_thread_id: String,
    pub report: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatPayload {
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default, rename = "streamId", skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<String>,
    #[serde(default, rename = "includeMessages", skip_serializing_if = "Option::is_none")]
    pub include_messages: Option<bool>,
}

/// Live tail of a stream, fanned out to concurrent readers.
#[derive(Debug, Clone)]
pub enum StreamLive {
    /// `seq` is the chunk index; readers replaying the persisted prefix use
    /// it to drop duplicates at the splice point.
    Chunk { seq: usize, text: String },
    End,
}

/// Everything a reader needs to serve a stream: the durable prefix plus an
/// optional live subscription.
#[derive(Debug)]
pub struct StreamReplay {
    pub stream_id: String,
    pub chunks: Vec<String>,
    pub terminal: bool,
    pub live: Option<broadcast::Receiver<StreamLive>>,
    /// Message snapshot, when the chat turn asked for one.
    pub messages: Option<Vec<ChatMessage>>,
}

/// Shared handle the host uses to cancel a run without going through the
/// mailbox (a tick may be mid-model-call for seconds).
pub type SharedCancel = Arc<std::sync::Mutex<CancellationToken>>;

/// Stream ids flagged for cancellation outside the mailbox.  The producer
/// checks this set before every append, so a cancel takes effect mid-tick;
/// the queued cancel command then makes the flag durable.
pub type SharedStreamKill = Arc<std::sync::Mutex<std::collections::HashSet<String>>>;

// ─── The instance ─────────────────────────────────────────────────────────────

pub struct InstanceCore {
    pub key: InstanceKey,
    pub(crate) store: InstanceStore,
    pub(crate) persisted: Persisted,
    pub(crate) ring: EventRing,
    /// Connection capability cache, lazily rebuilt from storage after a wake.
    connections: HashMap<String, Attachment>,
    pub(crate) live_streams: HashMap<String, broadcast::Sender<StreamLive>>,
    mcp_servers: Vec<McpServerInfo>,
    tasks: HashMap<String, TaskRecord>,
    pub(crate) model: Arc<dyn ModelProvider>,
    pub(crate) middlewares: Vec<Arc<dyn Middleware>>,
    pub(crate) runner_cfg: RunnerConfig,
    pub(crate) class_cfg: AgentClassConfig,
    sink: Arc<dyn FrameSink>,
    alarms: Arc<dyn AlarmPort>,
    pub(crate) router: Arc<dyn ChildRouter>,
    pub(crate) cancel: SharedCancel,
    stream_kill: SharedStreamKill,
}

impl InstanceCore {
    /// Load (or lazily create) the instance from durable storage and re-arm
    /// its alarm pointer.  This is the once-per-wake `on_start` hook.
    #[allow(clippy::too_many_arguments)]
    pub fn load(
        key: InstanceKey,
        store: InstanceStore,
        model: Arc<dyn ModelProvider>,
        middlewares: Vec<Arc<dyn Middleware>>,
        runner_cfg: RunnerConfig,
        class_cfg: AgentClassConfig,
        event_ring_capacity: usize,
        sink: Arc<dyn FrameSink>,
        alarms: Arc<dyn AlarmPort>,
        router: Arc<dyn ChildRouter>,
        cancel: SharedCancel,
        stream_kill: SharedStreamKill,
    ) -> Result<Self> {
        let mut persisted: Persisted = match store.kv_get("persist")? {
            Some(blob) => serde_json::from_value(blob)?,
            None => Persisted::default(),
        };
        if persisted.thread_id.is_none() {
            persisted.thread_id = Some(key.name.clone());
        }
        let ring = EventRing::restore(
            event_ring_capacity,
            persisted.events.clone(),
            persisted.events_seq,
        );
        let mcp_servers: Vec<McpServerInfo> = match store.kv_get("mcp_servers")? {
            Some(v) => serde_json::from_value(v)?,
            None => Vec::new(),
        };
        let tasks: HashMap<String, TaskRecord> = match store.kv_get("tasks")? {
            Some(v) => serde_json::from_value(v)?,
            None => HashMap::new(),
        };

        let mut core = Self {
            key,
            store,
            persisted,
            ring,
            connections: HashMap::new(),
            live_streams: HashMap::new(),
            mcp_servers,
            tasks,
            model,
            middlewares,
            runner_cfg,
            class_cfg,
            sink,
            alarms,
            router,
            cancel,
            stream_kill,
        };

        // Restore the alarm pointer.  A run left in the running state with no
        // pending schedule (crash between persist and alarm write) would
        // stall forever, so nudge it with an immediate tick.
        let run_needs_tick = core
            .persisted
            .run
            .as_ref()
            .is_some_and(|r| r.status == RunStatus::Running);
        if run_needs_tick && core.store.min_next_run()?.is_none() {
            core.schedule_run_tick()?;
        } else {
            core.rewrite_alarm()?;
        }
        info!(instance = %core.key, "instance loaded");
        Ok(core)
    }

    pub fn thread_id(&self) -> String {
        self.persisted
            .thread_id
            .clone()
            .unwrap_or_else(|| self.key.name.clone())
    }

    // ── Persistence ───────────────────────────────────────────────────────────

    pub(crate) fn persist(&mut self) -> Result<()> {
        self.persisted.events = self.ring.snapshot();
        self.persisted.events_seq = self.ring.next_seq();
        self.store
            .kv_put("persist", &serde_json::to_value(&self.persisted)?)?;
        Ok(())
    }

    /// Tick-end checkpoint: hash, persist, announce.
    pub(crate) fn checkpoint(&mut self, step: u32) -> Result<()> {
        self.persisted.events = self.ring.snapshot();
        self.persisted.events_seq = self.ring.next_seq();
        let hash = checkpoint_hash(&self.persisted);
        self.store
            .kv_put("persist", &serde_json::to_value(&self.persisted)?)?;
        self.push_event(EventKind::CheckpointSaved, json!({ "hash": hash, "step": step }));
        self.persist()?;
        Ok(())
    }

    fn persist_tasks(&mut self) -> Result<()> {
        self.store
            .kv_put("tasks", &serde_json::to_value(&self.tasks)?)?;
        Ok(())
    }

    // ── Events ────────────────────────────────────────────────────────────────

    /// Retain an event and fan it out to protocol-enabled connections.
    pub(crate) fn push_event(&mut self, kind: EventKind, data: Value) -> EventRecord {
        let record = self.ring.push(kind, data, self.persisted.thread_id.clone());
        let frame = OutgoingFrame::Event {
            event: record.clone(),
        };
        for (conn_id, attach) in &self.connections {
            if attach.wants_protocol() {
                self.sink.send(conn_id, &frame);
            }
        }
        record
    }

    pub fn events_snapshot(&self) -> Vec<EventRecord> {
        self.ring.snapshot()
    }

    // ── Connections ───────────────────────────────────────────────────────────

    /// Accept a connection.  The attachment is made durable *before* the
    /// handshake frames go out; if persisting fails the socket is rejected
    /// and nothing was sent.
    pub fn on_connect(&mut self, conn_id: &str, attach: Attachment) -> Result<()> {
        self.store
            .put_attachment(conn_id, &serde_json::to_value(&attach)?)?;
        self.connections.insert(conn_id.to_string(), attach.clone());
        debug!(instance = %self.key, conn = %conn_id, readonly = attach.readonly, "connection accepted");

        if attach.wants_protocol() {
            self.sink.send(
                conn_id,
                &OutgoingFrame::Identity {
                    class: self.key.class.clone(),
                    name: self.key.name.clone(),
                    connection_id: conn_id.to_string(),
                },
            );
            self.sink.send(
                conn_id,
                &OutgoingFrame::State {
                    state: self.persisted.state.clone(),
                },
            );
            self.sink.send(
                conn_id,
                &OutgoingFrame::McpServers {
                    servers: self.mcp_servers.clone(),
                },
            );
        }
        Ok(())
    }

    pub fn on_disconnect(&mut self, conn_id: &str) -> Result<()> {
        self.connections.remove(conn_id);
        self.store.delete_attachment(conn_id)?;
        Ok(())
    }

    /// Capability flags for a connection.  Falls back to storage when the
    /// in-memory cache was lost to hibernation — the durable attachment is
    /// the source of truth.
    pub fn attachment(&mut self, conn_id: &str) -> Result<Option<Attachment>> {
        if let Some(a) = self.connections.get(conn_id) {
            return Ok(Some(a.clone()));
        }
        match self.store.get_attachment(conn_id)? {
            Some(v) => {
                let attach: Attachment = serde_json::from_value(v)?;
                self.connections
                    .insert(conn_id.to_string(), attach.clone());
                Ok(Some(attach))
            }
            None => Ok(None),
        }
    }

    pub fn send_frame(&self, conn_id: &str, frame: &OutgoingFrame) {
        self.sink.send(conn_id, frame);
    }

    /// `true` when the instance may be dropped from memory: nothing is
    /// mid-run and no live stream has attached readers.  Durable state makes
    /// the next wake lossless.
    pub fn can_hibernate(&self) -> bool {
        let running = self
            .persisted
            .run
            .as_ref()
            .is_some_and(|r| r.status == RunStatus::Running);
        !running && self.live_streams.is_empty()
    }

    fn broadcast_state(&self) {
        let frame = OutgoingFrame::State {
            state: self.persisted.state.clone(),
        };
        for (conn_id, attach) in &self.connections {
            if attach.wants_protocol() && !attach.readonly {
                self.sink.send(conn_id, &frame);
            }
        }
    }

    pub(crate) fn broadcast_message_updated(&self, message: &ChatMessage) {
        let frame = OutgoingFrame::MessageUpdated {
            message: message.clone(),
        };
        for (conn_id, attach) in &self.connections {
            if attach.wants_protocol() {
                self.sink.send(conn_id, &frame);
            }
        }
    }

    // ── State document ────────────────────────────────────────────────────────

    pub fn state_doc(&self) -> Value {
        self.persisted.state.clone()
    }

    /// Serialized write + broadcast.  The caller has already enforced the
    /// readonly check for connection-originated writes.
    pub fn set_state(&mut self, state: Value) -> Result<()> {
        self.persisted.state = state;
        self.persist()?;
        self.broadcast_state();
        Ok(())
    }

    /// A state write arriving over a connection.  Readonly connections are
    /// rejected with a dedicated error frame and the state is left untouched.
    pub fn set_state_from_conn(&mut self, conn_id: &str, state: Value) -> Result<()> {
        let attach = self.attachment(conn_id)?.unwrap_or_default();
        if attach.readonly {
            self.send_frame(
                conn_id,
                &OutgoingFrame::StateError {
                    error: Error::ReadonlyViolation.to_string(),
                },
            );
            return Err(Error::ReadonlyViolation);
        }
        self.set_state(state)
    }

    // ── MCP servers ───────────────────────────────────────────────────────────

    pub fn mcp_servers(&self) -> &[McpServerInfo] {
        &self.mcp_servers
    }

    pub fn add_mcp_server(&mut self, name: String, url: String) -> Result<McpServerInfo> {
        let info = McpServerInfo {
            id: Uuid::new_v4().to_string(),
            name,
            url,
            state: "ready".to_string(),
        };
        self.mcp_servers.push(info.clone());
        self.store
            .kv_put("mcp_servers", &serde_json::to_value(&self.mcp_servers)?)?;
        let frame = OutgoingFrame::McpServers {
            servers: self.mcp_servers.clone(),
        };
        for (conn_id, attach) in &self.connections {
            if attach.wants_protocol() {
                self.sink.send(conn_id, &frame);
            }
        }
        Ok(info)
    }

    // ── Schedules ─────────────────────────────────────────────────────────────

    pub fn create_schedule(
        &mut self,
        callback: &str,
        kind: ScheduleKind,
        payload: Value,
    ) -> Result<Schedule> {
        let schedule = Schedule::new(callback, kind, payload, now_ms())?;
        self.store.put_schedule(&schedule.to_row())?;
        self.rewrite_alarm()?;
        Ok(schedule)
    }

    pub fn cancel_schedule(&mut self, id: &str) -> Result<bool> {
        let existed = self.store.delete_schedule(id)?;
        self.rewrite_alarm()?;
        Ok(existed)
    }

    pub fn list_schedules(&self) -> Result<Vec<Schedule>> {
        self.store
            .list_schedules()?
            .iter()
            .map(Schedule::from_row)
            .map(|r| r.map_err(Into::into))
            .collect()
    }

    pub fn schedules_by_type(&self, kind: &str) -> Result<Vec<Schedule>> {
        self.store
            .schedules_by_kind(kind)?
            .iter()
            .map(Schedule::from_row)
            .map(|r| r.map_err(Into::into))
            .collect()
    }

    /// Rewrite the physical alarm to `min(next_run)` (or clear it).
    pub(crate) fn rewrite_alarm(&mut self) -> Result<()> {
        let min = self.store.min_next_run()?;
        self.alarms.set_alarm(&self.key, min);
        Ok(())
    }

    pub(crate) fn schedule_run_tick(&mut self) -> Result<()> {
        self.create_schedule("run_tick", ScheduleKind::Delayed { delay_ms: 0 }, json!({}))?;
        Ok(())
    }

    /// The alarm fired: dispatch every due schedule, then re-arm.
    ///
    /// One-shot schedules are removed *before* their callback runs, so a
    /// throwing callback deletes the schedule exactly as success would.
    /// Recurring schedules are likewise rescheduled up front and survive
    /// callback failures.
    pub async fn on_alarm(&mut self) -> Result<()> {
        let now = now_ms();
        let due = self.store.due_schedules(now)?;
        for row in due {
            let schedule = match Schedule::from_row(&row) {
                Ok(s) => s,
                Err(e) => {
                    warn!(instance = %self.key, id = %row.id, "dropping malformed schedule: {e}");
                    self.store.delete_schedule(&row.id)?;
                    continue;
                }
            };

            match schedule.kind.reschedule_after_fire(now) {
                Ok(None) => {
                    self.store.delete_schedule(&schedule.id)?;
                }
                Ok(Some(next)) => {
                    let mut updated = row.clone();
                    updated.next_run = next;
                    self.store.put_schedule(&updated)?;
                }
                Err(e) => {
                    warn!(instance = %self.key, id = %schedule.id, "unschedulable, deleting: {e}");
                    self.store.delete_schedule(&schedule.id)?;
                }
            }

            if let Err(e) = self.dispatch_callback(&schedule).await {
                warn!(
                    instance = %self.key,
                    callback = %schedule.callback,
                    "schedule callback failed: {e}"
                );
                self.push_event(
                    EventKind::AgentError,
                    json!({ "scheduleId": schedule.id, "callback": schedule.callback, "error": e.to_string() }),
                );
                self.persist()?;
            }
        }
        self.rewrite_alarm()?;
        Ok(())
    }

    async fn dispatch_callback(&mut self, schedule: &Schedule) -> Result<()> {
        match schedule.callback.as_str() {
            "run_tick" => self.run_tick().await,
            "prompt" => {
                let prompt = schedule.payload["prompt"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string();
                self.on_scheduled_prompt(prompt).await
            }
            "task_deadline" => {
                let task_id = schedule.payload["taskId"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string();
                self.on_task_deadline(&task_id)
            }
            "subagent_timeout" => {
                let token = schedule.payload["token"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string();
                self.on_subagent_timeout(&token).await
            }
            other => {
                warn!(instance = %self.key, callback = %other, "unknown schedule callback");
                Ok(())
            }
        }
    }

    /// A scheduled prompt fires: persist it as a user message and start a run
    /// unless one is already active (then the message waits for the next
    /// turn).
    async fn on_scheduled_prompt(&mut self, prompt: String) -> Result<()> {
        if prompt.is_empty() {
            return Ok(());
        }
        let msg = ChatMessage::text(Uuid::new_v4().to_string(), ChatRole::User, prompt);
        history::persist_messages(&self.store, &[msg])?;
        let active = self.persisted.run.as_ref().is_some_and(RunState::is_active);
        if !active {
            self.start_run(InvokeRequest::default())?;
        }
        Ok(())
    }

    // ── Runs ──────────────────────────────────────────────────────────────────

    pub fn run_snapshot(&self) -> Option<RunState> {
        self.persisted.run.clone()
    }

    /// Start (or reject) a run.  Exactly zero-or-one active run per instance.
    pub fn invoke(&mut self, req: InvokeRequest) -> Result<InvokeAck> {
        if let Some(run) = &self.persisted.run {
            if run.is_active() {
                return Err(Error::Conflict("a run is already active".into()));
            }
        }
        if let Some(messages) = &req.messages {
            history::persist_messages(&self.store, messages)?;
        }
        if let Some(text) = &req.message {
            let msg = ChatMessage::text(Uuid::new_v4().to_string(), ChatRole::User, text);
            history::persist_messages(&self.store, &[msg])?;
        }
        self.start_run(req)
    }

    fn start_run(&mut self, req: InvokeRequest) -> Result<InvokeAck> {
        let meta = req.meta.unwrap_or_default();
        let mut run = RunState::new(Uuid::new_v4().to_string());
        run.system_prompt = req
            .system_prompt
            .or_else(|| self.class_cfg.system_prompt.clone());
        run.model = req.model.or_else(|| self.class_cfg.model.clone());
        run.stream_id = req.stream_id;
        run.depth = meta.depth;
        if let Some(parent) = meta.parent {
            self.persisted.parent = Some(parent);
        }

        let run_id = run.id.clone();
        // Fresh cancellation scope for this run.
        *self.cancel.lock().unwrap() = CancellationToken::new();

        self.persisted.run = Some(run);
        self.push_event(EventKind::RunStarted, json!({ "runId": run_id }));
        self.persist()?;
        self.schedule_run_tick()?;
        Ok(InvokeAck {
            run_id,
            status: RunStatus::Running,
        })
    }

    /// HITL resume: replace pending calls with the modified list (when given)
    /// and set the run back to running.  A rejection (`approved: false`) is
    /// recorded in events but clears nothing by itself — pass an empty list
    /// to drop the calls.
    pub fn approve(&mut self, body: ApproveBody) -> Result<InvokeAck> {
        let Some(mut run) = self.persisted.run.take() else {
            return Err(Error::InvalidApproval("no run".into()));
        };
        if run.pending_tool_calls.is_empty() || run.status != RunStatus::Paused {
            let err = Err(Error::InvalidApproval("no pending tool calls".into()));
            self.persisted.run = Some(run);
            return err;
        }

        let approved = body.approved.unwrap_or(true);
        if let Some(mods) = body.modified_tool_calls {
            // A modified call without an explicit id takes the id of the
            // pending call at the same position, so results still bind to
            // the assistant message written at proposal time.
            let original = std::mem::take(&mut run.pending_tool_calls);
            let mut replaced = Vec::with_capacity(mods.len());
            for (i, m) in mods.into_iter().enumerate() {
                let tool_call_id = m
                    .tool_call_id
                    .or_else(|| original.get(i).map(|tc| tc.tool_call_id.clone()))
                    .unwrap_or_else(|| run.next_tool_call_id());
                replaced.push(ToolCallRequest {
                    tool_call_id,
                    name: m.name,
                    args: m.args,
                });
            }
            run.pending_tool_calls = replaced;
        }

        run.status = RunStatus::Running;
        run.reason = None;
        let run_id = run.id.clone();
        self.persisted.run = Some(run);

        self.push_event(EventKind::HitlResume, json!({ "approved": approved }));
        self.push_event(EventKind::RunResumed, json!({ "runId": run_id }));
        self.persist()?;
        self.schedule_run_tick()?;
        Ok(InvokeAck {
            run_id,
            status: RunStatus::Running,
        })
    }

    /// Cancel the active run.  Non-blocking and idempotent; in-flight tool
    /// handlers see the cancellation token, the next tick short-circuits.
    pub fn cancel_run(&mut self) -> Result<()> {
        self.cancel.lock().unwrap().cancel();
        let Some(run) = self.persisted.run.as_mut() else {
            return Ok(());
        };
        if !run.is_active() {
            return Ok(());
        }
        run.status = RunStatus::Canceled;
        run.reason = None;
        let run_id = run.id.clone();
        let stream = run.stream_id.clone();
        self.push_event(EventKind::RunCanceled, json!({ "runId": run_id }));
        if let Some(stream_id) = stream {
            self.finish_stream(&stream_id)?;
        }
        self.persist()?;
        Ok(())
    }

    // ── Chat & streams ────────────────────────────────────────────────────────

    /// Begin a chat turn: persist the incoming messages, allocate the stream,
    /// and start a run that writes its model deltas into it.
    pub fn chat(&mut self, payload: ChatPayload) -> Result<StreamReplay> {
        if let Some(run) = &self.persisted.run {
            if run.is_active() {
                return Err(Error::Conflict("a run is already active".into()));
            }
        }
        history::persist_messages(&self.store, &payload.messages)?;

        let stream_id = payload
            .stream_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        if self.store.get_stream(&stream_id)?.is_some() {
            return Err(Error::Conflict(format!("stream id in use: {stream_id}")));
        }
        self.store.create_stream(&stream_id)?;
        let (tx, rx) = broadcast::channel(256);
        self.live_streams.insert(stream_id.clone(), tx);

        self.start_run(InvokeRequest {
            stream_id: Some(stream_id.clone()),
            ..Default::default()
        })?;

        let messages = if payload.include_messages.unwrap_or(false) {
            Some(history::load_messages(&self.store)?)
        } else {
            None
        };
        Ok(StreamReplay {
            stream_id,
            chunks: Vec::new(),
            terminal: false,
            live: Some(rx),
            messages,
        })
    }

    /// Replay a stream from position zero, with a live tail when the
    /// producer is still writing.
    pub fn stream_read(&mut self, stream_id: &str) -> Result<StreamReplay> {
        let rec = self
            .store
            .get_stream(stream_id)?
            .ok_or_else(|| Error::NotFound("Stream".into()))?;
        let terminal = rec.is_terminal();
        let live = if terminal {
            None
        } else {
            self.live_streams.get(stream_id).map(|tx| tx.subscribe())
        };
        Ok(StreamReplay {
            stream_id: stream_id.to_string(),
            chunks: rec.chunks,
            terminal,
            live,
            messages: None,
        })
    }

    pub fn stream_status(&self, stream_id: &str) -> Result<(u64, bool)> {
        self.store
            .stream_status(stream_id)?
            .ok_or_else(|| Error::NotFound("Stream".into()))
    }

    /// Mark a stream terminal.  Idempotent; persisted deltas stay readable.
    pub fn stream_cancel(&mut self, stream_id: &str) -> Result<()> {
        self.store.cancel_stream(stream_id)?;
        self.stream_kill.lock().unwrap().remove(stream_id);
        if let Some(tx) = self.live_streams.remove(stream_id) {
            let _ = tx.send(StreamLive::End);
        }
        Ok(())
    }

    /// Durably append a model delta, then fan it out to live readers.  The
    /// persist happens first: a delta a reader has seen is always replayable.
    pub(crate) fn emit_stream_delta(&mut self, stream_id: &str, text: &str) -> Result<()> {
        // A cancel may have been flagged while this tick held the write
        // lock; honor it before appending anything further.
        if self.stream_kill.lock().unwrap().contains(stream_id) {
            return self.stream_cancel(stream_id);
        }
        let Some(rec) = self.store.get_stream(stream_id)? else {
            return Ok(());
        };
        if rec.is_terminal() {
            return Ok(());
        }
        let seq = rec.chunks.len();
        self.store.append_stream_chunk(stream_id, text)?;
        if let Some(tx) = self.live_streams.get(stream_id) {
            let _ = tx.send(StreamLive::Chunk {
                seq,
                text: text.to_string(),
            });
        }
        Ok(())
    }

    pub(crate) fn finish_stream(&mut self, stream_id: &str) -> Result<()> {
        self.store.complete_stream(stream_id)?;
        if let Some(tx) = self.live_streams.remove(stream_id) {
            let _ = tx.send(StreamLive::End);
        }
        Ok(())
    }

    // ── Messages ──────────────────────────────────────────────────────────────

    pub fn messages(&self) -> Result<Vec<ChatMessage>> {
        history::load_messages(&self.store)
    }

    pub fn persist_incoming_messages(&mut self, messages: &[ChatMessage]) -> Result<()> {
        history::persist_messages(&self.store, messages)?;
        Ok(())
    }

    /// Clear messages and every stream.
    pub fn clear_messages(&mut self) -> Result<()> {
        history::clear_history(&self.store)?;
        for (_, tx) in self.live_streams.drain() {
            let _ = tx.send(StreamLive::End);
        }
        Ok(())
    }

    /// A client-executed tool finished: merge the output into the original
    /// assistant message (never append), announce the update, and resume the
    /// loop so the model sees the result.
    pub async fn on_tool_result(&mut self, tool_call_id: &str, output: Value) -> Result<()> {
        let Some(updated) = history::apply_tool_result(&self.store, tool_call_id, output)? else {
            debug!(instance = %self.key, tool_call_id, "tool result for unknown call dropped");
            return Ok(());
        };
        self.broadcast_message_updated(&updated);

        let mut resume = false;
        if let Some(run) = self.persisted.run.as_mut() {
            run.pending_tool_calls
                .retain(|tc| tc.tool_call_id != tool_call_id);
            if run.status == RunStatus::Paused && run.pending_tool_calls.is_empty() {
                run.status = RunStatus::Running;
                run.reason = None;
                resume = true;
            }
        }
        if resume {
            self.push_event(EventKind::RunResumed, json!({ "via": "toolResult" }));
            self.persist()?;
            self.schedule_run_tick()?;
        } else {
            self.persist()?;
        }
        Ok(())
    }

    // ── Sub-agent join ────────────────────────────────────────────────────────

    /// A child instance reported back.  Runs under this (the parent's) write
    /// lock.
    pub async fn on_child_result(&mut self, body: ChildResultBody) -> Result<()> {
        let Some(mut run) = self.persisted.run.take() else {
            return Err(Error::InvalidApproval("unknown sub-agent token".into()));
        };
        let Some(pos) = run.waiters.iter().position(|w| w.token == body.token) else {
            self.persisted.run = Some(run);
            return Err(Error::InvalidApproval("unknown sub-agent token".into()));
        };
        let waiter = run.waiters.remove(pos);

        let msg = ChatMessage {
            id: Uuid::new_v4().to_string(),
            role: ChatRole::Tool,
            parts: vec![Part::Tool(ToolPart {
                tool_name: "task".into(),
                tool_call_id: waiter.tool_call_id.clone(),
                state: ToolPartState::OutputAvailable,
                input: None,
                output: Some(body.report.clone()),
                error_text: None,
                call_provider_metadata: None,
            })],
            metadata: None,
        };
        history::persist_messages(&self.store, &[msg])?;

        let last = run.waiters.is_empty();
        if last && run.status == RunStatus::Paused {
            run.status = RunStatus::Running;
            run.reason = None;
        }
        self.persisted.run = Some(run);

        self.push_event(
            EventKind::SubagentCompleted,
            json!({
                "childThreadId": body.child_thread_id,
                "toolCallId": waiter.tool_call_id,
            }),
        );
        if last {
            self.push_event(EventKind::RunResumed, json!({ "via": "subagent" }));
            self.persist()?;
            self.schedule_run_tick()?;
        } else {
            self.persist()?;
        }
        Ok(())
    }

    /// A sub-agent join timed out: synthesize an error report so the parent
    /// is not wedged forever on a dead child.
    async fn on_subagent_timeout(&mut self, token: &str) -> Result<()> {
        let waiter_exists = self
            .persisted
            .run
            .as_ref()
            .is_some_and(|r| r.waiters.iter().any(|w| w.token == token));
        if !waiter_exists {
            return Ok(());
        }
        let child_thread_id = self
            .persisted
            .run
            .as_ref()
            .and_then(|r| r.waiters.iter().find(|w| w.token == token))
            .map(|w| w.child_thread_id.clone())
            .unwrap_or_default();
        self.on_child_result(ChildResultBody {
            token: token.to_string(),
            child_thread_id,
            report: json!({ "error": "sub-agent timed out" }),
        })
        .await
    }

    // ── Tasks ─────────────────────────────────────────────────────────────────

    pub fn create_task(&mut self, deadline_ms: Option<i64>) -> Result<TaskRecord> {
        let id = Uuid::new_v4().to_string();
        let task = TaskRecord::new(id.clone(), deadline_ms);
        self.tasks.insert(id.clone(), task.clone());
        self.persist_tasks()?;
        if let Some(at) = deadline_ms {
            self.create_schedule(
                "task_deadline",
                ScheduleKind::Absolute { at },
                json!({ "taskId": id }),
            )?;
        }
        Ok(task)
    }

    pub fn get_task(&self, id: &str) -> Result<TaskRecord> {
        self.tasks
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound("Task".into()))
    }

    pub fn with_task<R>(
        &mut self,
        id: &str,
        f: impl FnOnce(&mut TaskRecord) -> Result<R>,
    ) -> Result<R> {
        let task = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| Error::NotFound("Task".into()))?;
        let out = f(task)?;
        self.persist_tasks()?;
        Ok(out)
    }

    fn on_task_deadline(&mut self, task_id: &str) -> Result<()> {
        if let Some(task) = self.tasks.get_mut(task_id) {
            task.abort_timed_out();
            self.persist_tasks()?;
        }
        Ok(())
    }

    // ── RPC ───────────────────────────────────────────────────────────────────

    /// Generic method dispatch.  Mutating methods honor the connection's
    /// readonly flag; everything runs under the instance write lock.
    pub async fn handle_rpc(&mut self, conn_id: &str, method: &str, args: Value) -> Result<Value> {
        let readonly = self
            .attachment(conn_id)?
            .map(|a| a.readonly)
            .unwrap_or(false);
        let deny_write = || -> Result<Value> { Err(Error::ReadonlyViolation) };

        match method {
            "get_state" => Ok(self.persisted.state.clone()),
            "set_state" => {
                if readonly {
                    return deny_write();
                }
                self.set_state(args["state"].clone())?;
                Ok(json!({ "ok": true }))
            }
            "list_schedules" => Ok(serde_json::to_value(self.list_schedules()?)?),
            "get_schedules_by_type" => {
                let kind = args["type"]
                    .as_str()
                    .ok_or_else(|| Error::InvalidRequest("missing 'type'".into()))?;
                Ok(serde_json::to_value(self.schedules_by_type(kind)?)?)
            }
            "schedule" => {
                if readonly {
                    return deny_write();
                }
                let callback = args["callback"].as_str().unwrap_or("prompt").to_string();
                let kind: ScheduleKind = serde_json::from_value(args["when"].clone())
                    .map_err(|e| Error::InvalidRequest(format!("bad 'when': {e}")))?;
                let schedule = self.create_schedule(&callback, kind, args["payload"].clone())?;
                Ok(json!({ "id": schedule.id, "nextRun": schedule.next_run }))
            }
            "cancel_schedule" => {
                if readonly {
                    return deny_write();
                }
                let id = args["id"]
                    .as_str()
                    .ok_or_else(|| Error::InvalidRequest("missing 'id'".into()))?;
                Ok(json!(self.cancel_schedule(id)?))
            }
            "add_mcp_server" => {
                if readonly {
                    return deny_write();
                }
                let name = args["name"].as_str().unwrap_or("unnamed").to_string();
                let url = args["url"]
                    .as_str()
                    .ok_or_else(|| Error::InvalidRequest("missing 'url'".into()))?
                    .to_string();
                Ok(serde_json::to_value(self.add_mcp_server(name, url)?)?)
            }
            "create_task" => {
                if readonly {
                    return deny_write();
                }
                let deadline = args["deadlineMs"].as_i64();
                Ok(serde_json::to_value(self.create_task(deadline)?)?)
            }
            "start_task" => {
                if readonly {
                    return deny_write();
                }
                let id = rpc_id(&args)?;
                self.with_task(&id, |t| t.start())?;
                Ok(serde_json::to_value(self.get_task(&id)?)?)
            }
            "set_task_progress" => {
                if readonly {
                    return deny_write();
                }
                let id = rpc_id(&args)?;
                let progress = args["progress"].as_u64().unwrap_or(0) as u8;
                self.with_task(&id, |t| t.set_progress(progress))?;
                Ok(serde_json::to_value(self.get_task(&id)?)?)
            }
            "complete_task" => {
                if readonly {
                    return deny_write();
                }
                let id = rpc_id(&args)?;
                let result = args["result"].clone();
                self.with_task(&id, |t| t.complete(result))?;
                Ok(serde_json::to_value(self.get_task(&id)?)?)
            }
            "get_task" => {
                let id = rpc_id(&args)?;
                Ok(serde_json::to_value(self.get_task(&id)?)?)
            }
            other => Err(Error::NotFound(format!("rpc method {other}"))),
        }
    }
}

fn rpc_id(args: &Value) -> Result<String> {
    args["id"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| Error::InvalidRequest("missing 'id'".into()))
}

// ─── Test support ─────────────────────────────────────────────────────────────

/// A sink that records every frame, for assertions on ordering and
/// suppression.
#[derive(Default)]
pub struct RecordingSink {
    pub frames: std::sync::Mutex<Vec<(String, OutgoingFrame)>>,
}

impl FrameSink for RecordingSink {
    fn send(&self, conn_id: &str, frame: &OutgoingFrame) {
        self.frames
            .lock()
            .unwrap()
            .push((conn_id.to_string(), frame.clone()));
    }
}

/// An alarm port that records pointer rewrites.
#[derive(Default)]
pub struct RecordingAlarms {
    pub set_to: std::sync::Mutex<Vec<Option<i64>>>,
}

impl AlarmPort for RecordingAlarms {
    fn set_alarm(&self, _key: &InstanceKey, at: Option<i64>) {
        self.set_to.lock().unwrap().push(at);
    }
}

/// A router that records outgoing invocations and child results.
#[derive(Default)]
pub struct RecordingRouter {
    pub invokes: std::sync::Mutex<Vec<(InstanceKey, InvokeRequest)>>,
    pub child_results: std::sync::Mutex<Vec<(InstanceKey, ChildResultBody)>>,
}

#[async_trait]
impl ChildRouter for RecordingRouter {
    async fn invoke(&self, key: InstanceKey, req: InvokeRequest) -> Result<()> {
        self.invokes.lock().unwrap().push((key, req));
        Ok(())
    }

    async fn child_result(&self, key: InstanceKey, body: ChildResultBody) -> Result<()> {
        self.child_results.lock().unwrap().push((key, body));
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use warren_model::MockProvider;

    fn frame_type(frame: &OutgoingFrame) -> &'static str {
        match frame {
            OutgoingFrame::Identity { .. } => "identity",
            OutgoingFrame::State { .. } => "state",
            OutgoingFrame::StateError { .. } => "state_error",
            OutgoingFrame::McpServers { .. } => "mcp_servers",
            OutgoingFrame::MessageUpdated { .. } => "message_updated",
            OutgoingFrame::UseChatResponse { .. } => "use_chat_response",
            OutgoingFrame::Event { .. } => "event",
            OutgoingFrame::RpcResponse { .. } => "rpc",
        }
    }

    fn core_with_deps() -> (InstanceCore, Arc<RecordingSink>, Arc<RecordingAlarms>) {
        let sink = Arc::new(RecordingSink::default());
        let alarms = Arc::new(RecordingAlarms::default());
        let core = InstanceCore::load(
            InstanceKey::new("agent", "test"),
            InstanceStore::open_in_memory().unwrap(),
            Arc::new(MockProvider),
            vec![],
            RunnerConfig::default(),
            AgentClassConfig::default(),
            100,
            sink.clone(),
            alarms.clone(),
            Arc::new(RecordingRouter::default()),
            Arc::new(std::sync::Mutex::new(CancellationToken::new())),
            Arc::new(std::sync::Mutex::new(std::collections::HashSet::new())),
        )
        .unwrap();
        (core, sink, alarms)
    }

    fn frames_for(sink: &RecordingSink, conn: &str) -> Vec<&'static str> {
        sink.frames
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == conn)
            .map(|(_, f)| frame_type(f))
            .collect()
    }

    #[tokio::test]
    async fn handshake_is_identity_state_mcp_in_order() {
        let (mut core, sink, _alarms) = core_with_deps();
        core.on_connect("c1", Attachment::default()).unwrap();
        assert_eq!(frames_for(&sink, "c1"), vec!["identity", "state", "mcp_servers"]);
    }

    #[tokio::test]
    async fn no_protocol_connection_receives_no_handshake() {
        let (mut core, sink, _alarms) = core_with_deps();
        core.on_connect(
            "c2",
            Attachment {
                no_protocol: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert!(frames_for(&sink, "c2").is_empty());

        // RPC still answers on that connection.
        let result = core.handle_rpc("c2", "get_state", json!({})).await.unwrap();
        assert_eq!(result, Value::Null);
    }

    #[tokio::test]
    async fn state_broadcast_skips_readonly_and_no_protocol() {
        let (mut core, sink, _alarms) = core_with_deps();
        core.on_connect("writer", Attachment::default()).unwrap();
        core.on_connect(
            "viewer",
            Attachment {
                readonly: true,
                ..Default::default()
            },
        )
        .unwrap();
        core.on_connect(
            "silent",
            Attachment {
                no_protocol: true,
                ..Default::default()
            },
        )
        .unwrap();
        sink.frames.lock().unwrap().clear();

        core.set_state(json!({"n": 1})).unwrap();
        assert_eq!(frames_for(&sink, "writer"), vec!["state"]);
        assert!(frames_for(&sink, "viewer").is_empty());
        assert!(frames_for(&sink, "silent").is_empty());
    }

    #[tokio::test]
    async fn readonly_state_write_is_rejected_and_state_unchanged() {
        let (mut core, sink, _alarms) = core_with_deps();
        core.on_connect(
            "ro",
            Attachment {
                readonly: true,
                ..Default::default()
            },
        )
        .unwrap();
        sink.frames.lock().unwrap().clear();

        let err = core
            .set_state_from_conn("ro", json!({"count": 999}))
            .unwrap_err();
        assert!(matches!(err, Error::ReadonlyViolation));
        assert_eq!(core.state_doc(), Value::Null);
        assert_eq!(frames_for(&sink, "ro"), vec!["state_error"]);
    }

    #[tokio::test]
    async fn attachment_readable_from_storage_after_cache_loss() {
        let (mut core, _sink, _alarms) = core_with_deps();
        core.on_connect(
            "c1",
            Attachment {
                readonly: true,
                tags: vec!["room=blue".into()],
                ..Default::default()
            },
        )
        .unwrap();
        // Simulate hibernation: the in-memory cache vanishes, storage stays.
        core.connections.clear();

        let attach = core.attachment("c1").unwrap().unwrap();
        assert!(attach.readonly);
        assert_eq!(attach.tags, vec!["room=blue"]);
    }

    #[tokio::test]
    async fn alarm_pointer_always_equals_min_next_run() {
        let (mut core, _sink, alarms) = core_with_deps();
        let far = core
            .create_schedule("prompt", ScheduleKind::Delayed { delay_ms: 60_000 }, json!({}))
            .unwrap();
        let near = core
            .create_schedule("prompt", ScheduleKind::Delayed { delay_ms: 10_000 }, json!({}))
            .unwrap();
        assert_eq!(*alarms.set_to.lock().unwrap().last().unwrap(), Some(near.next_run));

        assert!(core.cancel_schedule(&near.id).unwrap());
        assert_eq!(*alarms.set_to.lock().unwrap().last().unwrap(), Some(far.next_run));

        assert!(core.cancel_schedule(&far.id).unwrap());
        assert_eq!(*alarms.set_to.lock().unwrap().last().unwrap(), None);

        assert!(!core.cancel_schedule("no-such-id").unwrap());
    }

    #[tokio::test]
    async fn task_deadline_schedule_aborts_task() {
        let (mut core, _sink, _alarms) = core_with_deps();
        let task = core.create_task(Some(now_ms() - 1)).unwrap();
        core.with_task(&task.id, |t| t.start()).unwrap();

        // The deadline is already due; one alarm dispatch aborts it.
        core.on_alarm().await.unwrap();
        let task = core.get_task(&task.id).unwrap();
        assert_eq!(task.status, crate::task::TaskStatus::Aborted);
        assert_eq!(task.error.as_deref(), Some("timed out"));
    }

    #[tokio::test]
    async fn interval_schedule_survives_unknown_callback() {
        let (mut core, _sink, _alarms) = core_with_deps();
        // An interval pointing at an unknown callback: dispatch warns but the
        // schedule must remain, rescheduled one period ahead.
        let schedule = core
            .create_schedule("does_not_exist", ScheduleKind::Interval { period_ms: 60_000 }, json!({}))
            .unwrap();
        // Force it due.
        let mut row = schedule.to_row();
        row.next_run = now_ms() - 10;
        core.store.put_schedule(&row).unwrap();

        core.on_alarm().await.unwrap();
        let remaining = core.list_schedules().unwrap();
        assert_eq!(remaining.len(), 1);
        assert!(remaining[0].next_run > now_ms());
    }

    #[tokio::test]
    async fn rpc_unknown_method_is_not_found() {
        let (mut core, _sink, _alarms) = core_with_deps();
        let err = core
            .handle_rpc("c1", "frobnicate", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn readonly_connection_cannot_mutate_via_rpc() {
        let (mut core, _sink, _alarms) = core_with_deps();
        core.on_connect(
            "ro",
            Attachment {
                readonly: true,
                ..Default::default()
            },
        )
        .unwrap();
        let err = core
            .handle_rpc("ro", "set_state", json!({"state": {"n": 1}}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ReadonlyViolation));
        // Reads still work.
        assert!(core.handle_rpc("ro", "get_state", json!({})).await.is_ok());
    }
}
