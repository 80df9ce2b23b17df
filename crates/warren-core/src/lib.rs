// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The agent execution substrate: per-instance single-writer runtime with
//! bounded-tick runs, durable chat history, resumable streams, schedules,
//! and the client wire protocol.

mod error;
mod events;
mod history;
mod instance;
mod message;
mod middleware;
mod persist;
mod protocol;
mod retry;
mod runner;
mod task;
mod tools;

pub use error::{Error, Result};
pub use events::{EventKind, EventRecord, EventRing};
pub use history::{
    apply_tool_result, clear_history, find_assistant_with_tool_call, load_messages,
    persist_messages,
};
pub use instance::{
    AlarmPort, ApproveBody, ChatPayload, ChildResultBody, ChildRouter, FrameSink, InstanceCore,
    InstanceKey, InvokeAck, InvokeMeta, InvokeRequest, ModifiedToolCall, RecordingAlarms,
    RecordingRouter, RecordingSink, SharedCancel, SharedStreamKill, StreamLive, StreamReplay,
};
pub use message::{ChatMessage, ChatRole, Part, ToolPart, ToolPartState};
pub use middleware::{
    collect_tools, ApprovalGate, Jump, Middleware, ModelOutcome, TickContext, ToolCtx, ToolDef,
    ToolFuture, ToolHandler, Toolbox,
};
pub use persist::{
    checkpoint_hash, ParentRef, PauseReason, Persisted, RunState, RunStatus, ToolCallRequest,
    Waiter,
};
pub use protocol::{Attachment, IncomingFrame, McpServerInfo, OutgoingFrame};
pub use retry::{backoff_delay_ms, try_n, RetryOpts};
pub use task::{TaskRecord, TaskStatus};
pub use tools::{
    parse_schedule_intent, parse_spawn_intent, schedule_tool, task_tool, ScheduleIntent,
    SpawnIntent,
};
