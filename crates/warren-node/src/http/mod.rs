// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The HTTP edge: `(class, name)`-addressed routes over the instance host.
//!
//! | method | path | purpose |
//! |---|---|---|
//! | POST | `/threads` | allocate a fresh instance name |
//! | POST | `/:class/:name/invoke` | start/extend a run |
//! | POST | `/:class/:name/approve` | HITL resume |
//! | POST | `/:class/:name/cancel` | cancel the current run |
//! | GET  | `/:class/:name/state` | read the state document |
//! | GET  | `/:class/:name/events` | read the event ring |
//! | POST | `/:class/:name/chat` | begin an SSE chat turn |
//! | GET  | `/:class/:name/stream/:sid` | resume a stream from byte 0 |
//! | GET  | `/:class/:name/stream/:sid/status` | `{position, completed}` |
//! | POST | `/:class/:name/stream/:sid/cancel` | mark a stream terminal |
//! | GET/DELETE | `/:class/:name/messages` | read / clear history (+streams) |
//! | GET  | `/:class/:name` | WebSocket upgrade |

pub mod ws;

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use uuid::Uuid;

use warren_core::{
    ApproveBody, ChatPayload, ChildResultBody, Error, InstanceKey, InvokeRequest,
    Result as CoreResult, StreamLive, StreamReplay,
};

use crate::error::{ApiError, ApiResult};
use crate::host::{delta_frame, InstanceCmd, InstanceHandle, NodeState};

pub type AppState = Arc<NodeState>;

pub fn router(node: AppState) -> Router {
    let mut app = Router::new()
        .route("/threads", post(create_thread))
        .route("/:class/:name", get(ws::ws_handler))
        .route("/:class/:name/invoke", post(invoke))
        .route("/:class/:name/approve", post(approve))
        .route("/:class/:name/cancel", post(cancel))
        .route("/:class/:name/child_result", post(child_result))
        .route("/:class/:name/state", get(get_state))
        .route("/:class/:name/events", get(get_events))
        .route("/:class/:name/chat", post(chat))
        .route("/:class/:name/stream/:sid", get(stream_resume))
        .route("/:class/:name/stream/:sid/status", get(stream_status))
        .route("/:class/:name/stream/:sid/cancel", post(stream_cancel))
        .route(
            "/:class/:name/messages",
            get(get_messages).delete(delete_messages),
        )
        .layer(RequestBodyLimitLayer::new(node.config.http.body_limit))
        .with_state(node.clone());
    if node.config.http.cors {
        app = app.layer(CorsLayer::permissive());
    }
    app
}

/// Send a command whose reply is a `Result<T>` and await it.
async fn ask<T>(
    handle: &InstanceHandle,
    make: impl FnOnce(oneshot::Sender<CoreResult<T>>) -> InstanceCmd,
) -> CoreResult<T> {
    let (tx, rx) = oneshot::channel();
    handle.send(make(tx)).await?;
    rx.await
        .map_err(|_| Error::Internal("instance dropped the reply".into()))?
}

/// Send a command whose reply is a plain value and await it.
async fn ask_plain<T>(
    handle: &InstanceHandle,
    make: impl FnOnce(oneshot::Sender<T>) -> InstanceCmd,
) -> CoreResult<T> {
    let (tx, rx) = oneshot::channel();
    handle.send(make(tx)).await?;
    rx.await
        .map_err(|_| Error::Internal("instance dropped the reply".into()))
}

fn resolve(node: &AppState, class: &str, name: &str) -> CoreResult<InstanceHandle> {
    node.handle(&InstanceKey::new(class, name))
}

// ── Instance allocation ───────────────────────────────────────────────────────

async fn create_thread(body: Option<Json<Value>>) -> impl IntoResponse {
    let class = body
        .as_ref()
        .and_then(|b| b.0["class"].as_str())
        .unwrap_or("agent")
        .to_string();
    let id = Uuid::new_v4().to_string();
    (
        StatusCode::CREATED,
        Json(json!({ "id": id, "class": class })),
    )
}

// ── Runs ──────────────────────────────────────────────────────────────────────

async fn invoke(
    State(node): State<AppState>,
    Path((class, name)): Path<(String, String)>,
    Json(req): Json<InvokeRequest>,
) -> ApiResult<impl IntoResponse> {
    let handle = resolve(&node, &class, &name)?;
    let ack = ask(&handle, |reply| InstanceCmd::Invoke { req, reply }).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "run_id": ack.run_id, "status": ack.status }))))
}

async fn approve(
    State(node): State<AppState>,
    Path((class, name)): Path<(String, String)>,
    Json(body): Json<ApproveBody>,
) -> ApiResult<impl IntoResponse> {
    let handle = resolve(&node, &class, &name)?;
    let ack = ask(&handle, |reply| InstanceCmd::Approve { body, reply }).await?;
    Ok(Json(json!({ "run_id": ack.run_id, "status": ack.status })))
}

async fn cancel(
    State(node): State<AppState>,
    Path((class, name)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let handle = resolve(&node, &class, &name)?;
    // Flip the cancellation token first so an in-flight model call stops at
    // its next await point; the command then records the transition.
    handle.cancel_now();
    ask(&handle, |reply| InstanceCmd::CancelRun { reply }).await?;
    Ok(Json(json!({ "ok": true })))
}

/// Sub-agent completion report, delivered under the parent's write lock.
/// Normally reached through the in-process router; exposed over HTTP so a
/// child running on another node can join too.
async fn child_result(
    State(node): State<AppState>,
    Path((class, name)): Path<(String, String)>,
    Json(body): Json<ChildResultBody>,
) -> ApiResult<impl IntoResponse> {
    let handle = resolve(&node, &class, &name)?;
    ask(&handle, |reply| InstanceCmd::ChildResult { body, reply }).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn get_state(
    State(node): State<AppState>,
    Path((class, name)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let handle = resolve(&node, &class, &name)?;
    let state = ask_plain(&handle, |reply| InstanceCmd::GetState { reply }).await?;
    Ok(Json(state))
}

async fn get_events(
    State(node): State<AppState>,
    Path((class, name)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let handle = resolve(&node, &class, &name)?;
    let events = ask_plain(&handle, |reply| InstanceCmd::GetEvents { reply }).await?;
    Ok(Json(events))
}

// ── Messages ──────────────────────────────────────────────────────────────────

async fn get_messages(
    State(node): State<AppState>,
    Path((class, name)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let handle = resolve(&node, &class, &name)?;
    let messages = ask(&handle, |reply| InstanceCmd::GetMessages { reply }).await?;
    Ok(Json(messages))
}

async fn delete_messages(
    State(node): State<AppState>,
    Path((class, name)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let handle = resolve(&node, &class, &name)?;
    ask(&handle, |reply| InstanceCmd::ClearMessages { reply }).await?;
    Ok(Json(json!({ "ok": true })))
}

// ── Chat & streams ────────────────────────────────────────────────────────────

async fn chat(
    State(node): State<AppState>,
    Path((class, name)): Path<(String, String)>,
    Json(payload): Json<ChatPayload>,
) -> ApiResult<Response> {
    let handle = resolve(&node, &class, &name)?;
    let replay = ask(&handle, |reply| InstanceCmd::Chat { payload, reply }).await?;
    Ok(sse_response(replay, false))
}

async fn stream_resume(
    State(node): State<AppState>,
    Path((class, name, sid)): Path<(String, String, String)>,
) -> ApiResult<Response> {
    let handle = resolve(&node, &class, &name)?;
    let replay = ask(&handle, |reply| InstanceCmd::StreamRead {
        stream_id: sid,
        reply,
    })
    .await?;
    Ok(sse_response(replay, true))
}

async fn stream_status(
    State(node): State<AppState>,
    Path((class, name, sid)): Path<(String, String, String)>,
) -> ApiResult<impl IntoResponse> {
    let handle = resolve(&node, &class, &name)?;
    let (position, completed) = ask(&handle, |reply| InstanceCmd::StreamStatus {
        stream_id: sid,
        reply,
    })
    .await?;
    Ok(Json(json!({ "position": position, "completed": completed })))
}

async fn stream_cancel(
    State(node): State<AppState>,
    Path((class, name, sid)): Path<(String, String, String)>,
) -> ApiResult<impl IntoResponse> {
    let handle = resolve(&node, &class, &name)?;
    // Flag first so an in-flight producer stops appending immediately; the
    // queued command makes the cancel durable once the write lock frees up.
    handle.kill_stream(&sid);
    let (reply, _deferred) = oneshot::channel();
    handle
        .send(InstanceCmd::StreamCancel {
            stream_id: sid,
            reply,
        })
        .await?;
    Ok(Json(json!({ "ok": true })))
}

/// Build the SSE response for a chat turn or a stream resume.
///
/// Frames are written only after their delta is durably persisted (the
/// instance appends before fanning out), so any observed prefix is
/// replayable.  The `seq` carried by live chunks splices the replayed
/// prefix against the live tail without duplicates.
fn sse_response(replay: StreamReplay, mark_complete: bool) -> Response {
    let stream_id = replay.stream_id.clone();
    let terminal = replay.terminal;

    let body_stream = async_stream::stream! {
        if let Some(messages) = &replay.messages {
            let frame = json!({ "type": "messages", "messages": messages }).to_string();
            yield Ok::<Bytes, Infallible>(Bytes::from(format!("data: {frame}\n\n")));
        }
        let replayed = replay.chunks.len();
        for chunk in &replay.chunks {
            yield Ok(Bytes::from(format!("data: {}\n\n", delta_frame(chunk))));
        }
        let mut finished = replay.terminal;
        if let Some(mut live) = replay.live {
            loop {
                match live.recv().await {
                    Ok(StreamLive::Chunk { seq, text }) if seq >= replayed => {
                        yield Ok(Bytes::from(format!("data: {}\n\n", delta_frame(&text))));
                    }
                    Ok(StreamLive::Chunk { .. }) => {}
                    Ok(StreamLive::End) => {
                        finished = true;
                        break;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }
        if finished {
            yield Ok(Bytes::from("data: [DONE]\n\n"));
        }
    };

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header("X-Stream-Id", stream_id);
    if mark_complete && terminal {
        builder = builder.header("X-Stream-Complete", "true");
    }
    builder
        .body(Body::from_stream(body_stream))
        .unwrap_or_else(|_| {
            ApiError(Error::Internal("could not build stream response".into())).into_response()
        })
}
