// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! OpenAI-compatible chat completion driver.
//!
//! Many hosted and local servers speak the same `/chat/completions` SSE
//! streaming wire format; this single driver covers all of them.  Auth is
//! plain `Authorization: Bearer <key>`; local servers may omit the key.

use anyhow::{bail, Context};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::{provider::ResponseStream, CompletionRequest, Message, MessageContent, ResponseEvent, Role};

/// OpenAI-compatible chat completion provider.
pub struct OpenAICompatProvider {
    /// Model id forwarded to the API.
    model: String,
    /// API key (pre-resolved from config or env).  `None` for local servers.
    api_key: Option<String>,
    /// Full chat completions URL.
    chat_url: String,
    max_tokens: u32,
    temperature: f32,
    client: reqwest::Client,
}

impl OpenAICompatProvider {
    /// Construct a provider.  `base_url` ends **before** `/chat/completions`,
    /// e.g. `https://api.openai.com/v1`.
    pub fn new(
        model: String,
        api_key: Option<String>,
        base_url: &str,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
    ) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            model,
            api_key,
            chat_url: format!("{base}/chat/completions"),
            max_tokens: max_tokens.unwrap_or(4096),
            temperature: temperature.unwrap_or(0.2),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl crate::ModelProvider for OpenAICompatProvider {
    fn name(&self) -> &str {
        "openai_compat"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        let mut messages: Vec<Value> = Vec::new();
        if let Some(system) = &req.system {
            messages.push(json!({ "role": "system", "content": system }));
        }
        messages.extend(build_wire_messages(&req.messages));

        let tools: Vec<Value> = req
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect();

        let model = req.model.as_deref().unwrap_or(&self.model);
        let mut body = json!({
            "model": model,
            "messages": messages,
            "stream": req.stream,
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
            "stream_options": { "include_usage": true },
        });
        if !tools.is_empty() {
            body["tools"] = json!(tools);
        }

        debug!(
            model = %model,
            tool_count = tools.len(),
            message_count = messages.len(),
            "sending completion request"
        );

        let mut http_req = self.client.post(&self.chat_url).json(&body);
        if let Some(key) = self.api_key.as_deref() {
            http_req = http_req.bearer_auth(key);
        }

        let resp = http_req.send().await.context("completion request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("provider error {status}: {text}");
        }

        let byte_stream = resp.bytes_stream();
        // SSE events can be split across multiple TCP packets.  Maintain a
        // line buffer across chunks; emit events only for complete lines.
        let event_stream = byte_stream
            .scan(String::new(), |buf, chunk| {
                let events: Vec<anyhow::Result<ResponseEvent>> = match chunk {
                    Ok(b) => {
                        buf.push_str(&String::from_utf8_lossy(&b));
                        drain_complete_sse_lines(buf)
                    }
                    Err(e) => vec![Err(anyhow::anyhow!(e))],
                };
                std::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(event_stream))
    }
}

/// Parse a single complete SSE `data:` line into a [`ResponseEvent`].
///
/// Returns `None` for empty lines, comment lines, or unparseable data.
fn parse_sse_data_line(line: &str) -> Option<anyhow::Result<ResponseEvent>> {
    let data = line.strip_prefix("data: ")?.trim();
    if data.is_empty() {
        return None;
    }
    if data == "[DONE]" {
        return Some(Ok(ResponseEvent::Done));
    }
    let v: Value = serde_json::from_str(data).ok()?;
    Some(Ok(parse_sse_chunk(&v)))
}

/// Drain all complete `\n`-terminated SSE lines from `buf`.
///
/// Any trailing incomplete line (bytes not yet terminated by `\n`) is left
/// in `buf` so it can be extended by the next TCP chunk.
fn drain_complete_sse_lines(buf: &mut String) -> Vec<anyhow::Result<ResponseEvent>> {
    let mut events = Vec::new();
    while let Some(nl_pos) = buf.find('\n') {
        // Strip the optional Windows-style \r before \n.
        let line = buf[..nl_pos].trim_end_matches('\r').to_string();
        // Advance buffer past the consumed line including the \n.
        *buf = buf[nl_pos + 1..].to_string();
        if let Some(ev) = parse_sse_data_line(&line) {
            events.push(ev);
        }
    }
    events
}

fn parse_sse_chunk(v: &Value) -> ResponseEvent {
    // Usage-only chunk (emitted when stream_options.include_usage = true)
    if let Some(usage) = v.get("usage").filter(|u| !u.is_null()) {
        return ResponseEvent::Usage {
            input_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            output_tokens: usage["completion_tokens"].as_u64().unwrap_or(0) as u32,
        };
    }

    let delta = &v["choices"][0]["delta"];

    // Tool call delta — parallel tool calls are identified by an "index"
    // field; each SSE chunk carries exactly one tool-call delta in practice.
    if let Some(tc) = delta.get("tool_calls").and_then(|t| t.get(0)) {
        let index = tc["index"].as_u64().unwrap_or(0) as u32;
        let id = tc["id"].as_str().unwrap_or("").to_string();
        let name = tc["function"]["name"].as_str().unwrap_or("").to_string();
        let args = tc["function"]["arguments"].as_str().unwrap_or("").to_string();
        return ResponseEvent::ToolCall {
            index,
            id,
            name,
            arguments: args,
        };
    }

    // Text delta
    if let Some(text) = delta.get("content").and_then(|c| c.as_str()) {
        return ResponseEvent::TextDelta(text.to_string());
    }

    ResponseEvent::TextDelta(String::new())
}

/// Convert messages into the OpenAI wire-format JSON array.
///
/// Extracted as a free function so it can be unit-tested without making HTTP
/// requests.  All tool calls from one assistant turn must appear inside a
/// *single* assistant message as a `tool_calls` array, so consecutive
/// `ToolCall` messages are merged into one JSON object before sending.
fn build_wire_messages(messages: &[Message]) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::with_capacity(messages.len());
    let mut pending_tool_calls: Vec<Value> = Vec::new();

    let flush = |out: &mut Vec<Value>, pending: &mut Vec<Value>| {
        if !pending.is_empty() {
            out.push(json!({
                "role": "assistant",
                "content": Value::Null,
                "tool_calls": std::mem::take(pending),
            }));
        }
    };

    for msg in messages {
        match &msg.content {
            MessageContent::ToolCall {
                tool_call_id,
                function,
            } if msg.role == Role::Assistant => {
                pending_tool_calls.push(json!({
                    "id": tool_call_id,
                    "type": "function",
                    "function": {
                        "name": function.name,
                        "arguments": function.arguments,
                    }
                }));
            }
            MessageContent::ToolResult {
                tool_call_id,
                content,
            } => {
                flush(&mut out, &mut pending_tool_calls);
                out.push(json!({
                    "role": "tool",
                    "tool_call_id": tool_call_id,
                    "content": content,
                }));
            }
            MessageContent::Text(text) => {
                flush(&mut out, &mut pending_tool_calls);
                out.push(json!({ "role": role_str(msg.role), "content": text }));
            }
            MessageContent::ToolCall { .. } => {
                // Non-assistant tool call messages are malformed; skip.
            }
        }
    }
    flush(&mut out, &mut pending_tool_calls);
    out
}

fn role_str(r: Role) -> &'static str {
    match r {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
