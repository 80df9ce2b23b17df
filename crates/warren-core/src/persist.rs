// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::events::EventRecord;

/// The single durable checkpoint blob for one instance.
///
/// Stored under the `persist` key of the instance's kv table; rewritten
/// whole after each tick and after every state write.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Persisted {
    /// Instance-wide JSON state document.
    #[serde(default)]
    pub state: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<RunState>,
    #[serde(default)]
    pub events: Vec<EventRecord>,
    #[serde(default)]
    pub events_seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    /// Set on sub-agent instances: where to deliver the completion report.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ParentRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Paused,
    Completed,
    Canceled,
    Error,
}

/// Why a run paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PauseReason {
    Hitl,
    Subagent,
}

/// One tool invocation proposed by the model, with its stable id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    #[serde(rename = "toolCallId")]
    pub tool_call_id: String,
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

/// A sub-agent the run is waiting on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Waiter {
    pub token: String,
    #[serde(rename = "childThreadId")]
    pub child_thread_id: String,
    #[serde(rename = "toolCallId")]
    pub tool_call_id: String,
}

/// Address of a parent instance awaiting a sub-agent report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParentRef {
    pub class: String,
    pub name: String,
    #[serde(rename = "threadId")]
    pub thread_id: String,
    pub token: String,
}

/// The resumable run record.  At most one per instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub id: String,
    pub status: RunStatus,
    pub step: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<PauseReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, rename = "nextAlarmAt", skip_serializing_if = "Option::is_none")]
    pub next_alarm_at: Option<i64>,
    /// Tool calls awaiting execution (or HITL approval while paused).
    #[serde(default, rename = "pendingToolCalls")]
    pub pending_tool_calls: Vec<ToolCallRequest>,
    /// Outstanding sub-agent joins.
    #[serde(default)]
    pub waiters: Vec<Waiter>,
    /// Counter backing the stable `call_N` id assignment.
    #[serde(default, rename = "toolCallSeq")]
    pub tool_call_seq: u32,
    #[serde(default, rename = "systemPrompt", skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Stream receiving this run's model deltas, when driven by a chat turn.
    #[serde(default, rename = "streamId", skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<String>,
    /// Sub-agent nesting depth; 0 for user-initiated runs.
    #[serde(default)]
    pub depth: u32,
}

impl RunState {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: RunStatus::Running,
            step: 0,
            reason: None,
            error: None,
            next_alarm_at: None,
            pending_tool_calls: Vec::new(),
            waiters: Vec::new(),
            tool_call_seq: 0,
            system_prompt: None,
            model: None,
            stream_id: None,
            depth: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.status, RunStatus::Running | RunStatus::Paused)
    }

    /// Allocate the next stable tool call id (`call_0`, `call_1`, …).
    pub fn next_tool_call_id(&mut self) -> String {
        let id = format!("call_{}", self.tool_call_seq);
        self.tool_call_seq += 1;
        id
    }
}

/// SHA-256 hex digest of the serialized checkpoint, for observability.
pub fn checkpoint_hash(persisted: &Persisted) -> String {
    let bytes = serde_json::to_vec(persisted).unwrap_or_default();
    let digest = Sha256::digest(&bytes);
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
