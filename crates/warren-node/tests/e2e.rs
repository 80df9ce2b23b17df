// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! End-to-end tests over real HTTP and WebSocket connections.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use warren_config::{AgentClassConfig, Config};
use warren_model::{
    CompletionRequest, ModelProvider, ResponseEvent, ResponseStream, ScriptedMockProvider,
};
use warren_node::spawn_with_model;

const FULL_TEXT: &str = "This is a much longer response that will be streamed in multiple \
                         chunks to test resumable streaming scenarios.";

/// Streams `FULL_TEXT` in fixed-size chunks with a gap between each, so
/// tests can interrupt mid-stream.
struct SlowChunks {
    chunk_len: usize,
    gap_ms: u64,
}

#[async_trait]
impl ModelProvider for SlowChunks {
    fn name(&self) -> &str {
        "slow-mock"
    }
    fn model_name(&self) -> &str {
        "slow-mock-model"
    }

    async fn complete(&self, _req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        let chunks: Vec<String> = FULL_TEXT
            .as_bytes()
            .chunks(self.chunk_len)
            .map(|c| String::from_utf8_lossy(c).to_string())
            .collect();
        let gap = Duration::from_millis(self.gap_ms);
        let stream = async_stream::stream! {
            for chunk in chunks {
                tokio::time::sleep(gap).await;
                yield Ok(ResponseEvent::TextDelta(chunk));
            }
            yield Ok(ResponseEvent::Done);
        };
        Ok(Box::pin(stream))
    }
}

fn test_config(dir: &std::path::Path) -> Config {
    let mut cfg = Config::default();
    cfg.http.bind = "127.0.0.1:0".to_string();
    cfg.runtime.data_dir = Some(dir.to_path_buf());
    cfg
}

async fn start_in(
    model: impl ModelProvider + 'static,
    dir: &tempfile::TempDir,
) -> SocketAddr {
    let cfg = test_config(dir.path());
    let (addr, _node) = spawn_with_model(cfg, Arc::new(model)).await.unwrap();
    addr
}

fn http() -> reqwest::Client {
    reqwest::Client::new()
}

/// Split an SSE byte buffer into the JSON payloads of its `data:` frames.
fn sse_payloads(buf: &str) -> Vec<String> {
    buf.split("\n\n")
        .filter_map(|frame| frame.strip_prefix("data: "))
        .map(str::to_string)
        .collect()
}

fn deltas(payloads: &[String]) -> String {
    payloads
        .iter()
        .filter_map(|p| serde_json::from_str::<Value>(p).ok())
        .filter(|v| v["type"] == "text-delta")
        .filter_map(|v| v["delta"].as_str().map(str::to_string))
        .collect()
}

/// Poll `url` until `pred` holds on the JSON body, or panic after 5s.
async fn poll_json(url: &str, pred: impl Fn(&Value) -> bool) -> Value {
    let client = http();
    for _ in 0..200 {
        if let Ok(resp) = client.get(url).send().await {
            if let Ok(body) = resp.json::<Value>().await {
                if pred(&body) {
                    return body;
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not reached for {url}");
}

fn has_event(events: &Value, kind: &str) -> bool {
    events
        .as_array()
        .map(|evs| evs.iter().any(|e| e["type"] == kind))
        .unwrap_or(false)
}

// ── Streaming scenarios ───────────────────────────────────────────────────────

#[tokio::test]
async fn resume_after_interrupt_replays_full_text() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_in(
        SlowChunks {
            chunk_len: 16,
            gap_ms: 20,
        },
        &dir,
    )
    .await;
    let base = format!("http://{addr}/agent/alpha");

    // Start the chat turn and read only the first two data frames.
    let resp = http()
        .post(format!("{base}/chat"))
        .json(&json!({ "messages": [], "streamId": "resume-1" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.headers()["x-stream-id"], "resume-1");

    let mut body = resp.bytes_stream();
    let mut buf = String::new();
    while buf.matches("\n\n").count() < 2 {
        let chunk = body.next().await.expect("stream ended early").unwrap();
        buf.push_str(&String::from_utf8_lossy(&chunk));
    }
    let partial = deltas(&sse_payloads(&buf));
    assert!(!partial.is_empty());
    assert!(FULL_TEXT.starts_with(&partial));
    drop(body); // interrupt the reader

    // The producer keeps going; wait for completion, then resume from zero.
    poll_json(&format!("{base}/stream/resume-1/status"), |v| {
        v["completed"] == true
    })
    .await;

    let resp = http()
        .get(format!("{base}/stream/resume-1"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.headers()["x-stream-id"], "resume-1");
    assert_eq!(resp.headers()["x-stream-complete"], "true");
    let text = resp.text().await.unwrap();
    let replayed = deltas(&sse_payloads(&text));
    assert_eq!(replayed, FULL_TEXT);
    assert!(replayed.starts_with(&partial));
}

#[tokio::test]
async fn cancel_while_streaming_freezes_the_log() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_in(
        SlowChunks {
            chunk_len: 8,
            gap_ms: 50,
        },
        &dir,
    )
    .await;
    let base = format!("http://{addr}/agent/beta");

    let resp = http()
        .post(format!("{base}/chat"))
        .json(&json!({ "messages": [], "streamId": "cancel-1" }))
        .send()
        .await
        .unwrap();
    let mut body = resp.bytes_stream();
    let mut buf = String::new();
    while buf.matches("\n\n").count() < 2 {
        let chunk = body.next().await.expect("stream ended early").unwrap();
        buf.push_str(&String::from_utf8_lossy(&chunk));
    }
    let observed = deltas(&sse_payloads(&buf));
    drop(body);

    let resp = http()
        .post(format!("{base}/stream/cancel-1/cancel"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let status = poll_json(&format!("{base}/stream/cancel-1/status"), |v| {
        v["completed"] == true
    })
    .await;
    let frozen_position = status["position"].as_u64().unwrap();

    // Resume replays only what was persisted before the cancel landed —
    // possibly a little more than any one reader observed, never less.
    let resp = http()
        .get(format!("{base}/stream/cancel-1"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.headers()["x-stream-complete"], "true");
    let text = resp.text().await.unwrap();
    let replayed = deltas(&sse_payloads(&text));
    assert!(replayed.starts_with(&observed));
    assert!(FULL_TEXT.starts_with(&replayed));
    assert_eq!(replayed.len() as u64, frozen_position);

    // The position stays frozen even after the producer's remaining chunks
    // would have arrived.
    tokio::time::sleep(Duration::from_millis(400)).await;
    let status = http()
        .get(format!("{base}/stream/cancel-1/status"))
        .send()
        .await
        .unwrap()
        .json::<Value>()
        .await
        .unwrap();
    assert_eq!(status["position"].as_u64().unwrap(), frozen_position);
}

#[tokio::test]
async fn clearing_messages_wipes_all_streams() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_in(ScriptedMockProvider::new(vec![
        vec![ResponseEvent::TextDelta("one".into()), ResponseEvent::Done],
        vec![ResponseEvent::TextDelta("two".into()), ResponseEvent::Done],
    ]), &dir)
    .await;
    let base = format!("http://{addr}/agent/gamma");

    for sid in ["s-1", "s-2"] {
        let resp = http()
            .post(format!("{base}/chat"))
            .json(&json!({ "messages": [], "streamId": sid }))
            .send()
            .await
            .unwrap();
        let _ = resp.text().await.unwrap(); // drain to completion
        poll_json(&format!("{base}/stream/{sid}/status"), |v| {
            v["completed"] == true
        })
        .await;
    }

    let resp = http()
        .delete(format!("{base}/messages"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    for sid in ["s-1", "s-2"] {
        let resp = http()
            .get(format!("{base}/stream/{sid}/status"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body, json!({ "error": "Stream not found" }));
    }
    let messages: Value = http()
        .get(format!("{base}/messages"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(messages.as_array().unwrap().len(), 0);
}

// ── Run lifecycle over HTTP ───────────────────────────────────────────────────

#[tokio::test]
async fn invoke_runs_to_completion_and_records_events() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_in(ScriptedMockProvider::always_text("all done"), &dir).await;
    let base = format!("http://{addr}/agent/runner");

    let resp = http()
        .post(format!("{base}/invoke"))
        .json(&json!({ "message": "hello there" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);
    let ack: Value = resp.json().await.unwrap();
    assert_eq!(ack["status"], "running");
    assert!(ack["run_id"].as_str().is_some());

    let events = poll_json(&format!("{base}/events"), |v| {
        has_event(v, "agent.completed")
    })
    .await;
    assert!(has_event(&events, "run.started"));
    assert!(has_event(&events, "run.tick"));
    assert!(has_event(&events, "checkpoint.saved"));

    // seq strictly increasing
    let seqs: Vec<u64> = events
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["seq"].as_u64().unwrap())
        .collect();
    assert!(seqs.windows(2).all(|w| w[0] < w[1]));

    let messages: Value = http()
        .get(format!("{base}/messages"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let msgs = messages.as_array().unwrap();
    assert_eq!(msgs.len(), 2);
    assert_eq!(msgs[1]["role"], "assistant");
    assert_eq!(msgs[1]["parts"][0]["text"], "all done");
}

#[tokio::test]
async fn hitl_pause_approve_modified_and_resume() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = test_config(dir.path());
    cfg.agents.insert(
        "agent".to_string(),
        AgentClassConfig {
            confirm_tools: vec!["schedule".to_string()],
            ..Default::default()
        },
    );
    let provider = ScriptedMockProvider::tool_then_text(
        "schedule",
        r#"{"prompt": "original", "delay_seconds": 3600}"#,
        "scheduled it",
    );
    let (addr, _node) = spawn_with_model(cfg, Arc::new(provider)).await.unwrap();
    let base = format!("http://{addr}/agent/hitl");

    let resp = http()
        .post(format!("{base}/invoke"))
        .json(&json!({ "message": "Do X" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);

    let events = poll_json(&format!("{base}/events"), |v| {
        has_event(v, "hitl.interrupt")
    })
    .await;
    assert!(has_event(&events, "run.paused"));

    // Approve with modified args; the call keeps its stable id.
    let resp = http()
        .post(format!("{base}/approve"))
        .json(&json!({
            "approved": true,
            "modifiedToolCalls": [
                { "name": "schedule", "args": { "prompt": "modified", "delay_seconds": 3600 } }
            ]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    poll_json(&format!("{base}/events"), |v| {
        has_event(v, "agent.completed")
    })
    .await;

    let messages: Value = http()
        .get(format!("{base}/messages"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let tool_msg = messages
        .as_array()
        .unwrap()
        .iter()
        .find(|m| m["role"] == "tool")
        .expect("tool message present");
    let part = &tool_msg["parts"][0];
    assert_eq!(part["toolCallId"], "call_0");
    assert_eq!(part["state"], "output-available");
    assert_eq!(part["input"]["prompt"], "modified");
    assert_eq!(part["output"]["scheduled"], true);
}

#[tokio::test]
async fn approve_without_run_is_400() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_in(ScriptedMockProvider::always_text("x"), &dir).await;
    let resp = http()
        .post(format!("http://{addr}/agent/fresh/approve"))
        .json(&json!({ "approved": true }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("no run"));
}

#[tokio::test]
async fn cancel_endpoint_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_in(ScriptedMockProvider::always_text("x"), &dir).await;
    let url = format!("http://{addr}/agent/cancelme/cancel");
    for _ in 0..2 {
        let resp = http().post(&url).send().await.unwrap();
        assert_eq!(resp.status(), 200);
    }
}

#[tokio::test]
async fn create_thread_allocates_ids() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_in(ScriptedMockProvider::always_text("x"), &dir).await;
    let resp = http()
        .post(format!("http://{addr}/threads"))
        .json(&json!({ "class": "support" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let body: Value = resp.json().await.unwrap();
    assert!(body["id"].as_str().is_some());
    assert_eq!(body["class"], "support");
}

// ── WebSocket protocol ────────────────────────────────────────────────────────

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn ws_connect(addr: SocketAddr, path: &str) -> WsStream {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}{path}"))
        .await
        .unwrap();
    ws
}

async fn ws_next_json(ws: &mut WsStream) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("socket closed")
            .unwrap();
        if let WsMessage::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn ws_send_json(ws: &mut WsStream, v: Value) {
    ws.send(WsMessage::Text(v.to_string())).await.unwrap();
}

#[tokio::test]
async fn first_three_frames_are_identity_state_mcp() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_in(ScriptedMockProvider::always_text("x"), &dir).await;
    let mut ws = ws_connect(addr, "/agent/order").await;

    let first = ws_next_json(&mut ws).await;
    let second = ws_next_json(&mut ws).await;
    let third = ws_next_json(&mut ws).await;
    assert_eq!(first["type"], "cf_agent_identity");
    assert_eq!(first["class"], "agent");
    assert_eq!(first["name"], "order");
    assert_eq!(second["type"], "cf_agent_state");
    assert_eq!(third["type"], "cf_agent_mcp_servers");
    assert_eq!(third["servers"], json!([]));
}

#[tokio::test]
async fn readonly_write_rejected_writable_allowed() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_in(ScriptedMockProvider::always_text("x"), &dir).await;
    let base = format!("http://{addr}/agent/rw");

    // Readonly connection: handshake still arrives, writes bounce.
    let mut ro = ws_connect(addr, "/agent/rw?readonly=true").await;
    for _ in 0..3 {
        ws_next_json(&mut ro).await;
    }
    ws_send_json(
        &mut ro,
        json!({ "type": "cf_agent_state", "state": { "count": 999 } }),
    )
    .await;
    let err = ws_next_json(&mut ro).await;
    assert_eq!(err["type"], "cf_agent_state_error");
    assert_eq!(err["error"], "Connection is readonly");

    let state: Value = http().get(format!("{base}/state")).send().await.unwrap().json().await.unwrap();
    assert_eq!(state, Value::Null, "state unchanged by the rejected write");

    // Writable connection observes the snapshot and can write.
    let mut rw = ws_connect(addr, "/agent/rw?readonly=false").await;
    for _ in 0..3 {
        ws_next_json(&mut rw).await;
    }
    ws_send_json(
        &mut rw,
        json!({ "type": "cf_agent_state", "state": { "count": 5 } }),
    )
    .await;
    let broadcast = ws_next_json(&mut rw).await;
    assert_eq!(broadcast["type"], "cf_agent_state");
    assert_eq!(broadcast["state"]["count"], 5);

    let state: Value = http().get(format!("{base}/state")).send().await.unwrap().json().await.unwrap();
    assert_eq!(state["count"], 5);
}

#[tokio::test]
async fn no_protocol_connection_gets_rpc_only() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_in(ScriptedMockProvider::always_text("x"), &dir).await;
    let mut ws = ws_connect(addr, "/agent/quiet?protocol=false").await;

    ws_send_json(
        &mut ws,
        json!({ "type": "rpc", "id": "1", "method": "get_state", "args": {} }),
    )
    .await;
    // The FIRST frame this connection ever sees is the RPC reply — no
    // identity, state, or mcp_servers, even though the handshake ran.
    let frame = ws_next_json(&mut ws).await;
    assert_eq!(frame["type"], "rpc");
    assert_eq!(frame["id"], "1");
    assert_eq!(frame["success"], true);
}

#[tokio::test]
async fn client_tool_result_merges_into_original_assistant() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_in(ScriptedMockProvider::always_text("x"), &dir).await;
    let base = format!("http://{addr}/agent/merge");
    let mut ws = ws_connect(addr, "/agent/merge").await;
    for _ in 0..3 {
        ws_next_json(&mut ws).await;
    }

    // Persist an assistant message proposing a client-executed tool call.
    ws_send_json(
        &mut ws,
        json!({
            "type": "cf_agent_chat_messages",
            "messages": [{
                "id": "A",
                "role": "assistant",
                "parts": [{
                    "type": "tool-risky",
                    "toolCallId": "X",
                    "state": "input-available",
                    "input": { "target": "db" }
                }]
            }]
        }),
    )
    .await;

    // The client executed the tool and reports the output.
    ws_send_json(
        &mut ws,
        json!({
            "type": "cf_agent_tool_result",
            "toolCallId": "X",
            "toolName": "risky",
            "output": { "ok": true }
        }),
    )
    .await;

    let updated = ws_next_json(&mut ws).await;
    assert_eq!(updated["type"], "cf_agent_message_updated");
    assert_eq!(updated["message"]["id"], "A");
    assert_eq!(updated["message"]["parts"][0]["state"], "output-available");
    assert_eq!(updated["message"]["parts"][0]["output"]["ok"], true);

    let messages: Value = http().get(format!("{base}/messages")).send().await.unwrap().json().await.unwrap();
    let msgs = messages.as_array().unwrap();
    let assistants: Vec<_> = msgs.iter().filter(|m| m["role"] == "assistant").collect();
    assert_eq!(assistants.len(), 1, "exactly one assistant message");
    assert_eq!(assistants[0]["id"], "A");
    assert_eq!(assistants[0]["parts"][0]["state"], "output-available");
    assert_eq!(assistants[0]["parts"][0]["output"]["ok"], true);
}

#[tokio::test]
async fn rpc_schedule_fires_prompt_and_lists() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_in(warren_model::MockProvider, &dir).await;
    let base = format!("http://{addr}/agent/clock");
    let mut ws = ws_connect(addr, "/agent/clock").await;
    for _ in 0..3 {
        ws_next_json(&mut ws).await;
    }

    ws_send_json(
        &mut ws,
        json!({
            "type": "rpc", "id": "s1", "method": "schedule",
            "args": {
                "callback": "prompt",
                "when": { "type": "delayed", "delay_ms": 100 },
                "payload": { "prompt": "check the oven" }
            }
        }),
    )
    .await;
    // Skip protocol frames until the rpc reply arrives.
    let reply = loop {
        let frame = ws_next_json(&mut ws).await;
        if frame["type"] == "rpc" {
            break frame;
        }
    };
    assert_eq!(reply["success"], true);
    let schedule_id = reply["result"]["id"].as_str().unwrap().to_string();

    ws_send_json(
        &mut ws,
        json!({ "type": "rpc", "id": "s2", "method": "list_schedules", "args": {} }),
    )
    .await;
    let listing = loop {
        let frame = ws_next_json(&mut ws).await;
        if frame["type"] == "rpc" && frame["id"] == "s2" {
            break frame;
        }
    };
    let schedules = listing["result"].as_array().unwrap();
    assert_eq!(schedules.len(), 1);
    assert_eq!(schedules[0]["id"], schedule_id);

    // The schedule fires, delivers the prompt, and the run completes; the
    // one-shot row is gone afterwards.
    let messages = poll_json(&format!("{base}/messages"), |v| {
        v.as_array().map(|m| m.len() >= 2).unwrap_or(false)
    })
    .await;
    let msgs = messages.as_array().unwrap();
    assert_eq!(msgs[0]["parts"][0]["text"], "check the oven");
    assert_eq!(msgs[1]["parts"][0]["text"], "MOCK: check the oven");

    ws_send_json(
        &mut ws,
        json!({ "type": "rpc", "id": "s3", "method": "list_schedules", "args": {} }),
    )
    .await;
    let listing = loop {
        let frame = ws_next_json(&mut ws).await;
        if frame["type"] == "rpc" && frame["id"] == "s3" {
            break frame;
        }
    };
    assert_eq!(listing["result"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn use_chat_request_streams_responses_over_the_socket() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_in(warren_model::MockProvider, &dir).await;
    let mut ws = ws_connect(addr, "/agent/socketchat").await;
    for _ in 0..3 {
        ws_next_json(&mut ws).await;
    }

    let body = json!({
        "messages": [{ "id": "u1", "role": "user", "parts": [{ "type": "text", "text": "hi there" }] }],
        "streamId": "ws-turn-1"
    })
    .to_string();
    ws_send_json(
        &mut ws,
        json!({ "type": "cf_agent_use_chat_request", "id": "req-1", "init": { "body": body } }),
    )
    .await;

    // Collect the streamed reply, skipping interleaved event frames.
    let mut streamed = String::new();
    loop {
        let frame = ws_next_json(&mut ws).await;
        if frame["type"] != "cf_agent_use_chat_response" || frame["id"] != "req-1" {
            continue;
        }
        if frame["done"] == true {
            break;
        }
        let delta: Value = serde_json::from_str(frame["body"].as_str().unwrap()).unwrap();
        if delta["type"] == "text-delta" {
            streamed.push_str(delta["delta"].as_str().unwrap());
        }
    }
    assert_eq!(streamed, "MOCK: hi there");

    // The same turn is resumable over HTTP by its stream id.
    let resp = http()
        .get(format!("http://{addr}/agent/socketchat/stream/ws-turn-1"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.headers()["x-stream-complete"], "true");
    let text = resp.text().await.unwrap();
    assert_eq!(deltas(&sse_payloads(&text)), "MOCK: hi there");
}

#[tokio::test]
async fn unknown_stream_resume_is_404() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_in(ScriptedMockProvider::always_text("x"), &dir).await;
    let resp = http()
        .get(format!("http://{addr}/agent/nobody/stream/ghost"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body, json!({ "error": "Stream not found" }));
}

#[tokio::test]
async fn readonly_connection_does_not_receive_state_broadcasts() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_in(ScriptedMockProvider::always_text("x"), &dir).await;

    let mut ro = ws_connect(addr, "/agent/quietstate?readonly=true").await;
    for _ in 0..3 {
        ws_next_json(&mut ro).await;
    }
    let mut rw = ws_connect(addr, "/agent/quietstate").await;
    for _ in 0..3 {
        ws_next_json(&mut rw).await;
    }

    ws_send_json(
        &mut rw,
        json!({ "type": "cf_agent_state", "state": { "n": 1 } }),
    )
    .await;
    // The writer sees the broadcast...
    let frame = ws_next_json(&mut rw).await;
    assert_eq!(frame["type"], "cf_agent_state");
    // ...the readonly connection stays silent.
    let silent = tokio::time::timeout(Duration::from_millis(300), ro.next()).await;
    assert!(silent.is_err(), "readonly connection must not receive state broadcasts");
}

#[tokio::test]
async fn schedules_query_by_type_over_rpc() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_in(ScriptedMockProvider::always_text("x"), &dir).await;
    let mut ws = ws_connect(addr, "/agent/mixed").await;
    for _ in 0..3 {
        ws_next_json(&mut ws).await;
    }

    for (id, when) in [
        ("c1", json!({ "type": "cron", "expr": "0 9 * * *" })),
        ("d1", json!({ "type": "delayed", "delay_ms": 3_600_000 })),
        ("i1", json!({ "type": "interval", "period_ms": 60_000 })),
    ] {
        ws_send_json(
            &mut ws,
            json!({
                "type": "rpc", "id": id, "method": "schedule",
                "args": { "callback": "prompt", "when": when, "payload": { "prompt": "later" } }
            }),
        )
        .await;
        let reply = loop {
            let frame = ws_next_json(&mut ws).await;
            if frame["type"] == "rpc" && frame["id"] == id {
                break frame;
            }
        };
        assert_eq!(reply["success"], true, "schedule {id} failed: {reply}");
    }

    ws_send_json(
        &mut ws,
        json!({ "type": "rpc", "id": "q", "method": "get_schedules_by_type", "args": { "type": "cron" } }),
    )
    .await;
    let reply = loop {
        let frame = ws_next_json(&mut ws).await;
        if frame["type"] == "rpc" && frame["id"] == "q" {
            break frame;
        }
    };
    let cron_only = reply["result"].as_array().unwrap();
    assert_eq!(cron_only.len(), 1);
    assert_eq!(cron_only[0]["kind"]["type"], "cron");

    ws_send_json(
        &mut ws,
        json!({ "type": "rpc", "id": "all", "method": "list_schedules", "args": {} }),
    )
    .await;
    let reply = loop {
        let frame = ws_next_json(&mut ws).await;
        if frame["type"] == "rpc" && frame["id"] == "all" {
            break frame;
        }
    };
    assert_eq!(reply["result"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn attachment_flags_survive_hibernation() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = test_config(dir.path());
    cfg.runtime.hibernate_after_secs = 1;
    let (addr, _node) = spawn_with_model(cfg, Arc::new(ScriptedMockProvider::always_text("x")))
        .await
        .unwrap();

    let mut ws = ws_connect(addr, "/agent/sleepy?readonly=true").await;
    for _ in 0..3 {
        ws_next_json(&mut ws).await;
    }

    // Let the instance hibernate out from under the open socket.
    tokio::time::sleep(Duration::from_millis(2500)).await;

    // The wake path must read the readonly flag from the durable attachment,
    // not from any in-memory table.
    ws_send_json(
        &mut ws,
        json!({ "type": "cf_agent_state", "state": { "count": 1 } }),
    )
    .await;
    let err = ws_next_json(&mut ws).await;
    assert_eq!(err["type"], "cf_agent_state_error");
    assert_eq!(err["error"], "Connection is readonly");
}

#[tokio::test]
async fn unknown_frames_are_dropped_and_connection_survives() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_in(ScriptedMockProvider::always_text("x"), &dir).await;
    let mut ws = ws_connect(addr, "/agent/tolerant").await;
    for _ in 0..3 {
        ws_next_json(&mut ws).await;
    }

    ws.send(WsMessage::Text("{not json at all".to_string()))
        .await
        .unwrap();
    ws_send_json(&mut ws, json!({ "type": "cf_agent_mystery", "x": 1 })).await;

    // Still alive: RPC round-trips.
    ws_send_json(
        &mut ws,
        json!({ "type": "rpc", "id": "ping", "method": "get_state", "args": {} }),
    )
    .await;
    let reply = ws_next_json(&mut ws).await;
    assert_eq!(reply["type"], "rpc");
    assert_eq!(reply["id"], "ping");
}
