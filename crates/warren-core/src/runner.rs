// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The bounded-tick run engine.
//!
//! A tick is one scheduler-driven handler invocation: drain up to
//! `tools_per_tick` pending tool calls (in parallel), make at most one model
//! call, then settle a verdict — continue (reschedule immediately), pause
//! (HITL or sub-agent join), complete, or error.  Every tick ends with a
//! checkpoint, so the instance can hibernate between any two ticks and
//! resume from durable state alone.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::StreamExt;
use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use warren_model::{CompletionRequest, Message, ResponseEvent};
use warren_scheduler::ScheduleKind;

use crate::error::{Error, Result};
use crate::events::EventKind;
use crate::history;
use crate::instance::{InstanceCore, InstanceKey, InvokeMeta, InvokeRequest};
use crate::message::{ChatMessage, ChatRole, Part, ToolPart, ToolPartState};
use crate::middleware::{collect_tools, Jump, ModelOutcome, TickContext, ToolCtx, ToolDef};
use crate::persist::{ParentRef, PauseReason, RunState, RunStatus, ToolCallRequest, Waiter};
use crate::tools::{parse_schedule_intent, parse_spawn_intent, SpawnIntent};

/// What a finished tick decided about the run.
enum Verdict {
    /// Assistant proposed tool calls; reschedule the next tick immediately.
    Continue,
    /// Waiting on an external event (approval or sub-agent report).
    Paused(PauseReason),
    Done { text: String },
    Canceled,
    Error(String),
}

impl InstanceCore {
    /// One bounded tick of the active run.  No-op when there is no run or the
    /// run is not in the running state.
    pub async fn run_tick(&mut self) -> Result<()> {
        let Some(mut run) = self.persisted.run.take() else {
            return Ok(());
        };
        if run.status != RunStatus::Running {
            self.persisted.run = Some(run);
            return Ok(());
        }

        run.step += 1;
        let step = run.step;
        self.push_event(EventKind::RunTick, json!({ "step": step }));

        let verdict = if run.step > self.runner_cfg.max_steps {
            Verdict::Error(format!(
                "step budget exhausted ({} ticks)",
                self.runner_cfg.max_steps
            ))
        } else {
            match self.drive_tick(&mut run).await {
                Ok(v) => v,
                Err(e) => Verdict::Error(e.to_string()),
            }
        };

        self.settle(&mut run, verdict).await?;
        self.persisted.run = Some(run);
        self.checkpoint(step)?;
        Ok(())
    }

    /// The body of a tick: pending-tool drain, middleware chain, model call.
    async fn drive_tick(&mut self, run: &mut RunState) -> Result<Verdict> {
        let cancel = self.cancel.lock().unwrap().clone();
        if cancel.is_cancelled() {
            return Ok(Verdict::Canceled);
        }

        let tool_defs = collect_tools(&self.middlewares)?;

        // Phase 1: drain pending tool calls, bounded per tick.
        if !run.pending_tool_calls.is_empty() {
            let take = self.runner_cfg.tools_per_tick.min(run.pending_tool_calls.len());
            let batch: Vec<ToolCallRequest> = run.pending_tool_calls.drain(..take).collect();
            let spawns = self.execute_tool_batch(&tool_defs, batch).await?;

            if !spawns.is_empty() {
                self.spawn_subagents(run, spawns).await?;
                return Ok(Verdict::Paused(PauseReason::Subagent));
            }
            if !run.pending_tool_calls.is_empty() {
                // Tool quota spent; the model call waits for the next tick.
                return Ok(Verdict::Continue);
            }
        }

        // Phase 2: beforeModel chain, declared order.
        let mut cx = TickContext {
            state: self.persisted.state.clone(),
            thread_id: self.thread_id(),
            step: run.step,
        };
        let middlewares = self.middlewares.clone();
        for mw in &middlewares {
            match mw.before_model(&mut cx).await? {
                Some(Jump::End) => {
                    self.persisted.state = cx.state;
                    return Ok(Verdict::Done {
                        text: String::new(),
                    });
                }
                Some(Jump::Tools) => {
                    self.persisted.state = cx.state;
                    return Ok(Verdict::Continue);
                }
                None => {}
            }
        }

        // Phase 3: compose the request — history minus system-role messages,
        // the run's system prompt, the chain's tool schemas.
        let messages = compose_model_messages(&history::load_messages(&self.store)?);
        let mut req = CompletionRequest {
            messages,
            system: run.system_prompt.clone(),
            tools: tool_defs.iter().map(ToolDef::schema).collect(),
            stream: true,
            model: run.model.clone(),
        };
        for mw in &middlewares {
            mw.modify_model_request(&cx, &mut req).await?;
        }

        // Phase 4: the model call.
        let outcome = match self.invoke_model(run, req, &cancel).await? {
            Some(outcome) => outcome,
            None => return Ok(Verdict::Canceled),
        };

        let mut outcome = outcome;
        // Phase 5: afterModel chain, reverse order.
        for mw in middlewares.iter().rev() {
            mw.after_model(&mut cx, &mut outcome).await?;
        }
        self.persisted.state = cx.state;

        // Persist the assistant turn, tool parts carrying their stable ids so
        // results bind to them across hibernation.
        if !outcome.text.is_empty() || !outcome.tool_calls.is_empty() {
            let mut parts: Vec<Part> = Vec::new();
            if !outcome.text.is_empty() {
                parts.push(Part::text(outcome.text.clone()));
            }
            for tc in &outcome.tool_calls {
                parts.push(Part::Tool(ToolPart {
                    tool_name: tc.name.clone(),
                    tool_call_id: tc.tool_call_id.clone(),
                    state: ToolPartState::InputAvailable,
                    input: Some(tc.args.clone()),
                    output: None,
                    error_text: None,
                    call_provider_metadata: None,
                }));
            }
            let msg = ChatMessage {
                id: Uuid::new_v4().to_string(),
                role: ChatRole::Assistant,
                parts,
                metadata: None,
            };
            history::persist_messages(&self.store, &[msg])?;
        }

        // Phase 6: verdict.
        if outcome.tool_calls.is_empty() {
            return Ok(Verdict::Done { text: outcome.text });
        }
        run.pending_tool_calls = outcome.tool_calls;
        if outcome.interrupt {
            self.push_event(
                EventKind::HitlInterrupt,
                json!({ "pendingToolCalls": run.pending_tool_calls }),
            );
            return Ok(Verdict::Paused(PauseReason::Hitl));
        }
        Ok(Verdict::Continue)
    }

    /// Apply a verdict to the run record and emit the matching events.
    async fn settle(&mut self, run: &mut RunState, verdict: Verdict) -> Result<()> {
        match verdict {
            Verdict::Continue => {
                self.schedule_run_tick()?;
            }
            Verdict::Paused(reason) => {
                run.status = RunStatus::Paused;
                run.reason = Some(reason);
                self.push_event(
                    EventKind::RunPaused,
                    json!({ "reason": reason, "step": run.step }),
                );
                if let Some(stream_id) = run.stream_id.clone() {
                    self.finish_stream(&stream_id)?;
                }
            }
            Verdict::Done { text } => {
                run.status = RunStatus::Completed;
                self.push_event(EventKind::AgentCompleted, json!({ "text": text }));
                if let Some(stream_id) = run.stream_id.clone() {
                    self.finish_stream(&stream_id)?;
                }
                self.report_to_parent(&text).await;
            }
            Verdict::Canceled => {
                run.status = RunStatus::Canceled;
                self.push_event(EventKind::RunCanceled, json!({ "runId": run.id }));
                if let Some(stream_id) = run.stream_id.clone() {
                    self.finish_stream(&stream_id)?;
                }
            }
            Verdict::Error(message) => {
                run.status = RunStatus::Error;
                run.error = Some(message.clone());
                self.push_event(EventKind::AgentError, json!({ "error": message }));
                if let Some(stream_id) = run.stream_id.clone() {
                    self.finish_stream(&stream_id)?;
                }
            }
        }
        Ok(())
    }

    /// Deliver the completion report to a waiting parent, if this instance
    /// was spawned as a sub-agent.
    async fn report_to_parent(&mut self, text: &str) {
        let Some(parent) = self.persisted.parent.clone() else {
            return;
        };
        let router = Arc::clone(&self.router);
        let body = crate::instance::ChildResultBody {
            token: parent.token.clone(),
            child_thread_id: self.thread_id(),
            report: json!(text),
        };
        let key = InstanceKey::new(parent.class.clone(), parent.name.clone());
        if let Err(e) = router.child_result(key, body).await {
            warn!(instance = %self.key, "failed to deliver sub-agent report: {e}");
        }
    }

    /// Execute one batch of tool calls in parallel, appending a `role=tool`
    /// message per call.  Spawn intents are collected, not executed here.
    async fn execute_tool_batch(
        &mut self,
        tool_defs: &[ToolDef],
        batch: Vec<ToolCallRequest>,
    ) -> Result<Vec<(String, SpawnIntent)>> {
        let cancel = self.cancel.lock().unwrap().clone();
        let by_name: HashMap<&str, &ToolDef> =
            tool_defs.iter().map(|d| (d.name.as_str(), d)).collect();

        // Phase 1: announce, then dispatch everything concurrently.  Each
        // task owns its handler Arc; a panic in one is isolated by the join.
        let mut handles = Vec::with_capacity(batch.len());
        for tc in &batch {
            self.push_event(
                EventKind::ToolStarted,
                json!({ "name": tc.name, "toolCallId": tc.tool_call_id }),
            );
            let ctx = ToolCtx {
                tool_call_id: tc.tool_call_id.clone(),
                thread_id: self.thread_id(),
                cancel: cancel.clone(),
            };
            match by_name.get(tc.name.as_str()) {
                Some(def) => {
                    let handler = Arc::clone(&def.handler);
                    let args = tc.args.clone();
                    handles.push(Some(tokio::spawn(
                        async move { handler.call(args, ctx).await },
                    )));
                }
                None => handles.push(None),
            }
        }

        // Phase 2: collect results in order; append tool messages serially
        // under the write lock.
        let mut spawns = Vec::new();
        for (tc, handle) in batch.iter().zip(handles) {
            let result: std::result::Result<Value, String> = match handle {
                None => Err(format!("unknown tool: {}", tc.name)),
                Some(h) => match h.await {
                    Ok(r) => r,
                    Err(e) => Err(format!("tool panicked: {e}")),
                },
            };

            match result {
                Ok(output) => {
                    if let Some(intent) = parse_spawn_intent(&output) {
                        spawns.push((tc.tool_call_id.clone(), intent));
                        continue;
                    }
                    let output = if let Some(intent) = parse_schedule_intent(&output) {
                        let schedule = self.create_schedule(
                            "prompt",
                            intent.kind,
                            json!({ "prompt": intent.prompt }),
                        )?;
                        json!({ "scheduled": true, "id": schedule.id, "nextRun": schedule.next_run })
                    } else {
                        output
                    };
                    self.push_event(
                        EventKind::ToolOutput,
                        json!({ "name": tc.name, "toolCallId": tc.tool_call_id, "output": output }),
                    );
                    self.append_tool_message(tc, Ok(output))?;
                }
                Err(message) => {
                    self.push_event(
                        EventKind::ToolError,
                        json!({ "name": tc.name, "toolCallId": tc.tool_call_id, "error": message }),
                    );
                    self.append_tool_message(tc, Err(message))?;
                }
            }
        }
        Ok(spawns)
    }

    fn append_tool_message(
        &mut self,
        tc: &ToolCallRequest,
        result: std::result::Result<Value, String>,
    ) -> Result<()> {
        let part = match result {
            Ok(output) => ToolPart {
                tool_name: tc.name.clone(),
                tool_call_id: tc.tool_call_id.clone(),
                state: ToolPartState::OutputAvailable,
                input: Some(tc.args.clone()),
                output: Some(output),
                error_text: None,
                call_provider_metadata: None,
            },
            Err(message) => ToolPart {
                tool_name: tc.name.clone(),
                tool_call_id: tc.tool_call_id.clone(),
                state: ToolPartState::Error,
                input: Some(tc.args.clone()),
                output: None,
                error_text: Some(message),
                call_provider_metadata: None,
            },
        };
        let msg = ChatMessage {
            id: Uuid::new_v4().to_string(),
            role: ChatRole::Tool,
            parts: vec![Part::Tool(part)],
            metadata: None,
        };
        history::persist_messages(&self.store, &[msg])?;
        Ok(())
    }

    /// Create waiters and address the child instances.  The parent pauses
    /// until the last waiter clears.
    async fn spawn_subagents(
        &mut self,
        run: &mut RunState,
        spawns: Vec<(String, SpawnIntent)>,
    ) -> Result<()> {
        let router = Arc::clone(&self.router);
        for (tool_call_id, intent) in spawns {
            if run.depth + 1 > self.runner_cfg.max_subagent_depth {
                let message = format!(
                    "maximum sub-agent depth ({}) reached",
                    self.runner_cfg.max_subagent_depth
                );
                self.push_event(
                    EventKind::ToolError,
                    json!({ "name": "task", "toolCallId": tool_call_id, "error": message }),
                );
                self.append_tool_message(
                    &ToolCallRequest {
                        tool_call_id,
                        name: "task".into(),
                        args: json!({}),
                    },
                    Err(message),
                )?;
                continue;
            }

            let child_thread_id = Uuid::new_v4().to_string();
            let token = Uuid::new_v4().to_string();
            run.waiters.push(Waiter {
                token: token.clone(),
                child_thread_id: child_thread_id.clone(),
                tool_call_id: tool_call_id.clone(),
            });

            let descriptor = self
                .class_cfg
                .subagents
                .get(&intent.subagent_type)
                .cloned()
                .unwrap_or_default();

            router
                .invoke(
                    InstanceKey::new(self.key.class.clone(), child_thread_id.clone()),
                    InvokeRequest {
                        message: Some(intent.description.clone()),
                        system_prompt: descriptor.system_prompt.clone(),
                        model: descriptor.model.clone(),
                        meta: Some(InvokeMeta {
                            parent: Some(ParentRef {
                                class: self.key.class.clone(),
                                name: self.key.name.clone(),
                                thread_id: self.thread_id(),
                                token: token.clone(),
                            }),
                            depth: run.depth + 1,
                        }),
                        ..Default::default()
                    },
                )
                .await?;

            self.push_event(
                EventKind::SubagentSpawned,
                json!({
                    "childThreadId": child_thread_id,
                    "toolCallId": tool_call_id,
                    "subagentType": intent.subagent_type,
                }),
            );

            if let Some(timeout_ms) = intent.timeout_ms.or_else(|| descriptor.timeout_ms()) {
                self.create_schedule(
                    "subagent_timeout",
                    ScheduleKind::Delayed {
                        delay_ms: timeout_ms,
                    },
                    json!({ "token": token }),
                )?;
            }
        }
        Ok(())
    }

    /// Drive one streaming model call, appending deltas to the run's stream
    /// and accumulating tool calls by parallel-call index.  Returns `None`
    /// when the run was canceled mid-stream.
    async fn invoke_model(
        &mut self,
        run: &mut RunState,
        req: CompletionRequest,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<Option<ModelOutcome>> {
        self.push_event(EventKind::ModelStarted, json!({ "step": run.step }));

        let model = Arc::clone(&self.model);
        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(None),
            res = model.complete(req) => res.map_err(|e| Error::Provider(e.to_string()))?,
        };

        let mut text = String::new();
        let mut pending: HashMap<u32, PendingToolCall> = HashMap::new();
        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(None),
                ev = stream.next() => ev,
            };
            let Some(event) = event else { break };
            match event.map_err(|e| Error::Provider(e.to_string()))? {
                ResponseEvent::TextDelta(delta) if !delta.is_empty() => {
                    if let Some(stream_id) = run.stream_id.clone() {
                        self.emit_stream_delta(&stream_id, &delta)?;
                    }
                    self.push_event(EventKind::ModelDelta, json!({ "delta": delta }));
                    text.push_str(&delta);
                }
                ResponseEvent::TextDelta(_) => {}
                ResponseEvent::ToolCall {
                    index,
                    name,
                    arguments,
                    ..
                } => {
                    // The provider's own call id is discarded — the run
                    // assigns stable `call_N` ids below so results match
                    // across resume.
                    let slot = pending.entry(index).or_default();
                    if !name.is_empty() {
                        slot.name = name;
                    }
                    slot.args_buf.push_str(&arguments);
                }
                ResponseEvent::Usage {
                    input_tokens,
                    output_tokens,
                } => {
                    debug!(
                        instance = %self.key,
                        input_tokens, output_tokens, "model usage"
                    );
                }
                ResponseEvent::Error(message) => {
                    warn!(instance = %self.key, "model stream error: {message}");
                }
                ResponseEvent::Done => break,
            }
        }

        // Flush accumulated parallel tool calls ordered by index, assigning
        // the run's stable ids.  Calls with no name cannot be dispatched and
        // are dropped.
        let mut slots: Vec<(u32, PendingToolCall)> = pending.into_iter().collect();
        slots.sort_by_key(|(idx, _)| *idx);
        let mut tool_calls = Vec::new();
        for (_, slot) in slots {
            if slot.name.is_empty() {
                warn!(instance = %self.key, "dropping tool call with empty name from model");
                continue;
            }
            let args = slot.parse_args();
            tool_calls.push(ToolCallRequest {
                tool_call_id: run.next_tool_call_id(),
                name: slot.name,
                args,
            });
        }

        self.push_event(
            EventKind::ModelCompleted,
            json!({ "textLength": text.len(), "toolCalls": tool_calls.len() }),
        );
        Ok(Some(ModelOutcome {
            text,
            tool_calls,
            interrupt: false,
        }))
    }
}

#[derive(Default)]
struct PendingToolCall {
    name: String,
    args_buf: String,
}

impl PendingToolCall {
    /// Always resolve to a JSON object; invalid or empty argument buffers
    /// degrade to `{}` rather than poisoning the conversation history.
    fn parse_args(&self) -> Value {
        if self.args_buf.is_empty() {
            return Value::Object(Default::default());
        }
        match serde_json::from_str(&self.args_buf) {
            Ok(v) => v,
            Err(e) => {
                warn!(tool = %self.name, "invalid tool arguments from model ({e}); substituting {{}}");
                Value::Object(Default::default())
            }
        }
    }
}

/// Convert stored chat history into provider wire messages, dropping
/// system-role entries (the system prompt travels separately).
///
/// Assistant tool parts become tool-call entries.  A part already completed
/// client-side (output-available with no separate `role=tool` message) also
/// yields its result inline, so the model sees the output either way.
pub(crate) fn compose_model_messages(messages: &[ChatMessage]) -> Vec<Message> {
    let resolved: HashSet<&str> = messages
        .iter()
        .filter(|m| m.role == ChatRole::Tool)
        .flat_map(|m| m.tool_parts().map(|tp| tp.tool_call_id.as_str()))
        .collect();

    let mut out = Vec::new();
    for msg in messages {
        match msg.role {
            ChatRole::System => continue,
            ChatRole::User => {
                let text = msg.text_content();
                if !text.is_empty() {
                    out.push(Message::user(text));
                }
            }
            ChatRole::Assistant => {
                let text = msg.text_content();
                if !text.is_empty() {
                    out.push(Message::assistant(text));
                }
                for tp in msg.tool_parts() {
                    let args = tp
                        .input
                        .as_ref()
                        .map(|v| v.to_string())
                        .unwrap_or_else(|| "{}".to_string());
                    out.push(Message::tool_call(&tp.tool_call_id, &tp.tool_name, args));
                    if tp.state == ToolPartState::OutputAvailable
                        && !resolved.contains(tp.tool_call_id.as_str())
                    {
                        let content = tp
                            .output
                            .as_ref()
                            .map(|v| v.to_string())
                            .unwrap_or_default();
                        out.push(Message::tool_result(&tp.tool_call_id, content));
                    }
                }
            }
            ChatRole::Tool => {
                for tp in msg.tool_parts() {
                    let content = match (&tp.output, &tp.error_text) {
                        (_, Some(err)) => format!("Error: {err}"),
                        (Some(output), None) => output.to_string(),
                        (None, None) => String::new(),
                    };
                    out.push(Message::tool_result(&tp.tool_call_id, content));
                }
            }
        }
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
