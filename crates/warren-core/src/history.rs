// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Chat history persistence.
//!
//! The rules exist to keep one invariant intact: an assistant message whose
//! tool part carries `toolCallId = T` is unique across the whole history.
//! When a client executes a tool and sends the completed part back as a new
//! message, that part must fold into the original assistant message instead
//! of appending a duplicate.

use serde_json::Value;
use tracing::debug;
use warren_store::InstanceStore;

use crate::error::Result;
use crate::message::{ChatMessage, ChatRole, ToolPartState};

/// Persist a batch of messages, applying per message, in order:
///
/// 1. same `id` already stored → **upsert** (overwrite the row);
/// 2. assistant message that is exactly one completed tool part whose
///    `toolCallId` matches a stored assistant message → **merge** the part
///    into the stored message, keeping the stored id;
/// 3. otherwise → insert as new.
///
/// Provider item identifiers are stripped before every write.
pub fn persist_messages(store: &InstanceStore, msgs: &[ChatMessage]) -> Result<Vec<ChatMessage>> {
    let mut touched = Vec::new();
    for msg in msgs {
        let mut msg = msg.clone();
        msg.strip_provider_item_ids();

        // Rule 1: upsert by id.
        if store.get_message(&msg.id)?.is_some() {
            store.upsert_message(&msg.id, &serde_json::to_value(&msg)?)?;
            touched.push(msg);
            continue;
        }

        // Rule 2: merge a lone completed tool part into the assistant
        // message that originally proposed the call.
        if msg.role == ChatRole::Assistant {
            if let Some(incoming_part) = msg.single_completed_tool_part() {
                if let Some(mut stored) =
                    find_assistant_with_tool_call(store, &incoming_part.tool_call_id)?
                {
                    if stored.id != msg.id {
                        debug!(
                            tool_call_id = %incoming_part.tool_call_id,
                            into = %stored.id,
                            "merging completed tool part into original assistant message"
                        );
                        let incoming_part = incoming_part.clone();
                        if let Some(part) = stored.find_tool_part_mut(&incoming_part.tool_call_id)
                        {
                            *part = incoming_part;
                        }
                        store.upsert_message(&stored.id, &serde_json::to_value(&stored)?)?;
                        touched.push(stored);
                        continue;
                    }
                }
            }
        }

        // Rule 3: plain insert.
        store.upsert_message(&msg.id, &serde_json::to_value(&msg)?)?;
        touched.push(msg);
    }
    Ok(touched)
}

/// The stored assistant message containing a tool part bound to
/// `tool_call_id`, if any.
pub fn find_assistant_with_tool_call(
    store: &InstanceStore,
    tool_call_id: &str,
) -> Result<Option<ChatMessage>> {
    for payload in store.list_messages()? {
        let msg: ChatMessage = serde_json::from_value(payload)?;
        if msg.role == ChatRole::Assistant && msg.has_tool_call(tool_call_id) {
            return Ok(Some(msg));
        }
    }
    Ok(None)
}

/// Apply a client-supplied tool result: flip the matching tool part to
/// `output-available` in place.  Returns the updated message, or `None` when
/// no stored assistant message has the call.  Never creates a new message.
pub fn apply_tool_result(
    store: &InstanceStore,
    tool_call_id: &str,
    output: Value,
) -> Result<Option<ChatMessage>> {
    let Some(mut stored) = find_assistant_with_tool_call(store, tool_call_id)? else {
        return Ok(None);
    };
    if let Some(part) = stored.find_tool_part_mut(tool_call_id) {
        part.state = ToolPartState::OutputAvailable;
        part.output = Some(output);
        part.error_text = None;
    }
    store.upsert_message(&stored.id, &serde_json::to_value(&stored)?)?;
    Ok(Some(stored))
}

/// Load the full history in insertion order.
pub fn load_messages(store: &InstanceStore) -> Result<Vec<ChatMessage>> {
    let mut out = Vec::new();
    for payload in store.list_messages()? {
        out.push(serde_json::from_value(payload)?);
    }
    Ok(out)
}

/// Clear all messages **and** all streams for the instance.
pub fn clear_history(store: &InstanceStore) -> Result<()> {
    store.delete_all_messages()?;
    store.delete_all_streams()?;
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
