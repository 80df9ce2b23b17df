// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! WebSocket bridge — translates client sockets to instance commands.
//!
//! # Wire format
//!
//! JSON over WebSocket text frames (see `warren_core::protocol`).
//! Capability flags ride on the upgrade query string: `readonly=true`,
//! `protocol=false`; anything else becomes a free-form attachment tag.
//!
//! # Hibernation
//!
//! The socket task outlives the instance actor.  Outbound frames flow
//! through a channel registered with the host, so a hibernated instance's
//! clients stay connected; the next inbound frame respawns the actor, which
//! reads the connection's attachment back from storage.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, RawQuery, State};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use warren_core::{Attachment, IncomingFrame, InstanceKey, OutgoingFrame};

use crate::host::{InstanceCmd, NodeState};
use crate::http::AppState;

/// HTTP handler for `GET /:class/:name` with an upgrade header.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(node): State<AppState>,
    Path((class, name)): Path<(String, String)>,
    RawQuery(query): RawQuery,
) -> Response {
    let attach = parse_attachment(query.as_deref().unwrap_or(""));
    let key = InstanceKey::new(class, name);
    ws.on_upgrade(move |socket| handle_socket(socket, node, key, attach))
}

fn parse_attachment(query: &str) -> Attachment {
    let pairs: Vec<(String, String)> = query
        .split('&')
        .filter(|s| !s.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect();
    Attachment::from_query_pairs(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
}

async fn handle_socket(
    socket: WebSocket,
    node: AppState,
    key: InstanceKey,
    attach: Attachment,
) {
    let conn_id = Uuid::new_v4().to_string();
    info!(instance = %key, conn = %conn_id, readonly = attach.readonly, "WebSocket connected");

    // Register the outbound channel before onConnect so the handshake frames
    // have somewhere to land.
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<OutgoingFrame>();
    node.register_conn(&conn_id, out_tx);

    // onConnect runs before any message is delivered; a failure rejects the
    // socket and stores no attachment.
    let connected = async {
        let handle = node.handle(&key)?;
        let (reply, rx) = oneshot::channel();
        handle
            .send(InstanceCmd::Connect {
                conn_id: conn_id.clone(),
                attach: attach.clone(),
                reply,
            })
            .await?;
        rx.await
            .map_err(|_| warren_core::Error::Internal("connect reply dropped".into()))?
    }
    .await;

    let (mut ws_tx, mut ws_rx) = socket.split();
    if let Err(e) = connected {
        warn!(instance = %key, conn = %conn_id, "rejecting connection: {e}");
        node.unregister_conn(&conn_id);
        let _ = ws_tx
            .send(Message::Close(Some(axum::extract::ws::CloseFrame {
                code: 1011,
                reason: "connect failed".into(),
            })))
            .await;
        return;
    }

    loop {
        tokio::select! {
            // Outgoing frame from the instance.
            out = out_rx.recv() => {
                let Some(frame) = out else { break };
                match serde_json::to_string(&frame) {
                    Ok(json) => {
                        if ws_tx.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(conn = %conn_id, "unserializable frame: {e}"),
                }
            }
            // Incoming message from the client.
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<IncomingFrame>(&text) {
                            Ok(frame) => {
                                if deliver(&node, &key, &conn_id, frame).await.is_err() {
                                    break;
                                }
                            }
                            // Parse errors and unknown frame types are
                            // dropped; the connection stays open.
                            Err(e) => debug!(conn = %conn_id, "dropping undecodable frame: {e}"),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if ws_tx.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // binary frames ignored
                    Some(Err(e)) => {
                        debug!(conn = %conn_id, "WebSocket recv error: {e}");
                        break;
                    }
                }
            }
        }
    }

    node.unregister_conn(&conn_id);
    if let Ok(handle) = node.handle(&key) {
        let _ = handle
            .send(InstanceCmd::Disconnect {
                conn_id: conn_id.clone(),
            })
            .await;
    }
    info!(instance = %key, conn = %conn_id, "WebSocket disconnected");
}

/// Hand a frame to the instance, re-resolving the handle once if the actor
/// hibernated between frames.
async fn deliver(
    node: &AppState,
    key: &InstanceKey,
    conn_id: &str,
    frame: IncomingFrame,
) -> warren_core::Result<()> {
    let handle = node.handle(key)?;
    match handle
        .send(InstanceCmd::Frame {
            conn_id: conn_id.to_string(),
            frame: frame.clone(),
        })
        .await
    {
        Ok(()) => Ok(()),
        Err(_) => {
            let handle = node.handle(key)?;
            handle
                .send(InstanceCmd::Frame {
                    conn_id: conn_id.to_string(),
                    frame,
                })
                .await
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
