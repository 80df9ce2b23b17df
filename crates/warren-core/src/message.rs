// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Chat message model.
//!
//! Messages are lists of typed parts.  A part is either plain text or a tool
//! part; tool parts carry the wire tag `tool-<name>` and a lifecycle state
//! (`input-available` → `output-available` | `error`).  Because the tag is
//! dynamic, `Part` implements serde by hand.

use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
    Tool,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ToolPartState {
    #[serde(rename = "input-available")]
    InputAvailable,
    #[serde(rename = "output-available")]
    OutputAvailable,
    #[serde(rename = "error")]
    Error,
}

/// A tool invocation embedded in an assistant (or tool) message.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolPart {
    pub tool_name: String,
    pub tool_call_id: String,
    pub state: ToolPartState,
    pub input: Option<Value>,
    pub output: Option<Value>,
    pub error_text: Option<String>,
    pub call_provider_metadata: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Part {
    Text {
        text: String,
        provider_metadata: Option<Value>,
    },
    Tool(ToolPart),
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text {
            text: text.into(),
            provider_metadata: None,
        }
    }

    pub fn as_tool(&self) -> Option<&ToolPart> {
        match self {
            Part::Tool(tp) => Some(tp),
            Part::Text { .. } => None,
        }
    }

    fn from_value(v: &Value) -> Result<Self, String> {
        let ty = v["type"]
            .as_str()
            .ok_or_else(|| "part missing type".to_string())?;
        if ty == "text" {
            return Ok(Part::Text {
                text: v["text"].as_str().unwrap_or_default().to_string(),
                provider_metadata: non_null(v.get("providerMetadata")),
            });
        }
        if let Some(tool_name) = ty.strip_prefix("tool-") {
            let state: ToolPartState = serde_json::from_value(v["state"].clone())
                .map_err(|e| format!("bad tool part state: {e}"))?;
            return Ok(Part::Tool(ToolPart {
                tool_name: tool_name.to_string(),
                tool_call_id: v["toolCallId"].as_str().unwrap_or_default().to_string(),
                state,
                input: non_null(v.get("input")),
                output: non_null(v.get("output")),
                error_text: v["errorText"].as_str().map(str::to_string),
                call_provider_metadata: non_null(v.get("callProviderMetadata")),
            }));
        }
        Err(format!("unknown part type: {ty}"))
    }
}

fn non_null(v: Option<&Value>) -> Option<Value> {
    v.filter(|v| !v.is_null()).cloned()
}

impl Serialize for Part {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        match self {
            Part::Text {
                text,
                provider_metadata,
            } => {
                map.serialize_entry("type", "text")?;
                map.serialize_entry("text", text)?;
                if let Some(pm) = provider_metadata {
                    map.serialize_entry("providerMetadata", pm)?;
                }
            }
            Part::Tool(tp) => {
                map.serialize_entry("type", &format!("tool-{}", tp.tool_name))?;
                map.serialize_entry("toolCallId", &tp.tool_call_id)?;
                map.serialize_entry("state", &tp.state)?;
                if let Some(input) = &tp.input {
                    map.serialize_entry("input", input)?;
                }
                if let Some(output) = &tp.output {
                    map.serialize_entry("output", output)?;
                }
                if let Some(err) = &tp.error_text {
                    map.serialize_entry("errorText", err)?;
                }
                if let Some(meta) = &tp.call_provider_metadata {
                    map.serialize_entry("callProviderMetadata", meta)?;
                }
            }
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Part {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let v = Value::deserialize(deserializer)?;
        Part::from_value(&v).map_err(serde::de::Error::custom)
    }
}

/// One message in an instance's chat history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub role: ChatRole,
    pub parts: Vec<Part>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl ChatMessage {
    pub fn text(id: impl Into<String>, role: ChatRole, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role,
            parts: vec![Part::text(text)],
            metadata: None,
        }
    }

    /// All tool parts of this message.
    pub fn tool_parts(&self) -> impl Iterator<Item = &ToolPart> {
        self.parts.iter().filter_map(Part::as_tool)
    }

    /// `true` if any part references `tool_call_id`.
    pub fn has_tool_call(&self, tool_call_id: &str) -> bool {
        self.tool_parts().any(|tp| tp.tool_call_id == tool_call_id)
    }

    pub fn find_tool_part_mut(&mut self, tool_call_id: &str) -> Option<&mut ToolPart> {
        self.parts.iter_mut().find_map(|p| match p {
            Part::Tool(tp) if tp.tool_call_id == tool_call_id => Some(tp),
            _ => None,
        })
    }

    /// The single completed tool part, if this message consists of exactly
    /// one tool part in the output-available state.  This is the shape a
    /// client-executed tool result arrives in.
    pub fn single_completed_tool_part(&self) -> Option<&ToolPart> {
        let mut tools = self.tool_parts();
        let first = tools.next()?;
        if tools.next().is_some() {
            return None;
        }
        if self.parts.iter().any(|p| matches!(p, Part::Text { .. })) {
            return None;
        }
        (first.state == ToolPartState::OutputAvailable).then_some(first)
    }

    /// Concatenated text content of all text parts.
    pub fn text_content(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::Text { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// Remove provider item identifiers from all metadata, preserving every
    /// sibling key.
    ///
    /// Stored history is the canonical input replayed to the provider on the
    /// next turn, and item ids are only valid within the response that minted
    /// them — replaying one triggers duplicate-item rejections upstream.
    pub fn strip_provider_item_ids(&mut self) {
        if let Some(meta) = &mut self.metadata {
            strip_item_ids(meta);
        }
        for part in &mut self.parts {
            match part {
                Part::Text {
                    provider_metadata: Some(pm),
                    ..
                } => strip_item_ids(pm),
                Part::Tool(tp) => {
                    if let Some(meta) = &mut tp.call_provider_metadata {
                        strip_item_ids(meta);
                    }
                }
                _ => {}
            }
        }
    }
}

/// Remove `itemId` keys from a provider-metadata object: at the top level and
/// one level down (the per-provider namespaces, e.g. `{"openai": {...}}`).
fn strip_item_ids(meta: &mut Value) {
    if let Some(obj) = meta.as_object_mut() {
        obj.remove("itemId");
        for nested in obj.values_mut() {
            if let Some(inner) = nested.as_object_mut() {
                inner.remove("itemId");
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
