// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Wire protocol between agent instances and their WebSocket clients.
//!
//! Framed JSON with a `type` tag.  Per-connection capabilities are
//! negotiated via query parameters at upgrade time:
//!
//! - `readonly=true` — the connection may read state but not write it;
//! - `protocol=false` — suppress every protocol frame (RPC still works).
//!
//! # Connect ordering
//!
//! The first frames a protocol-enabled connection observes are, in order:
//! `cf_agent_identity`, the initial `cf_agent_state` snapshot, and
//! `cf_agent_mcp_servers` (possibly empty).  No client frame is processed
//! before that handshake is written.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::events::EventRecord;
use crate::message::ChatMessage;

/// Frames a client may send.
///
/// Unknown `type` tags fail to parse; the transport drops them silently and
/// keeps the connection open.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum IncomingFrame {
    /// Replace the instance state document.
    #[serde(rename = "cf_agent_state")]
    State { state: Value },

    /// Replace/extend the persisted message list.
    #[serde(rename = "cf_agent_chat_messages")]
    ChatMessages { messages: Vec<ChatMessage> },

    /// Begin a chat turn over the socket; replies stream back as
    /// [`OutgoingFrame::UseChatResponse`] frames sharing `id`.
    #[serde(rename = "cf_agent_use_chat_request")]
    UseChatRequest { id: String, init: Value },

    /// Supply the result for an assistant tool call awaiting input.
    #[serde(rename = "cf_agent_tool_result")]
    ToolResult {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(rename = "toolName", default)]
        tool_name: Option<String>,
        output: Value,
    },

    /// Generic method call.
    #[serde(rename = "rpc")]
    Rpc {
        id: String,
        method: String,
        #[serde(default)]
        args: Value,
    },
}

/// Frames the server may send.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OutgoingFrame {
    #[serde(rename = "cf_agent_identity")]
    Identity {
        class: String,
        name: String,
        #[serde(rename = "connectionId")]
        connection_id: String,
    },

    #[serde(rename = "cf_agent_state")]
    State { state: Value },

    #[serde(rename = "cf_agent_state_error")]
    StateError { error: String },

    #[serde(rename = "cf_agent_mcp_servers")]
    McpServers { servers: Vec<McpServerInfo> },

    /// A stored message changed in place (e.g. a tool part completed).
    #[serde(rename = "cf_agent_message_updated")]
    MessageUpdated { message: ChatMessage },

    /// Streaming reply to a `cf_agent_use_chat_request`.
    #[serde(rename = "cf_agent_use_chat_response")]
    UseChatResponse {
        id: String,
        body: String,
        done: bool,
    },

    /// A retained lifecycle event, fanned out as it happens.
    #[serde(rename = "cf_agent_event")]
    Event { event: EventRecord },

    #[serde(rename = "rpc")]
    RpcResponse {
        id: String,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// A known external tool server, as surfaced to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpServerInfo {
    pub id: String,
    pub name: String,
    pub url: String,
    /// `"ready"` | `"connecting"` | `"failed"`.
    pub state: String,
}

/// Per-connection capability attachment.
///
/// Serialized onto the connection's durable record at accept time.  After a
/// hibernation wake these flags are read back from storage, never from an
/// in-memory table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(default)]
    pub readonly: bool,
    #[serde(default, rename = "noProtocol")]
    pub no_protocol: bool,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Attachment {
    /// Parse capability flags from upgrade query parameters.  Unrecognized
    /// parameters become free-form tags.
    pub fn from_query_pairs<'a>(pairs: impl Iterator<Item = (&'a str, &'a str)>) -> Self {
        let mut attach = Attachment::default();
        for (key, value) in pairs {
            match key {
                "readonly" => attach.readonly = value == "true",
                "protocol" => attach.no_protocol = value == "false",
                _ => attach.tags.push(format!("{key}={value}")),
            }
        }
        attach
    }

    /// Protocol frames are delivered unless the client opted out.
    pub fn wants_protocol(&self) -> bool {
        !self.no_protocol
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
