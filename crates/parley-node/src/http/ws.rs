// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! WebSocket bridge — translates client connections to the internal frame
//! protocol.
//!
//! # Wire format
//!
//! JSON over WebSocket text frames, one frame per message.
//!
//! # Security
//!
//! Authentication happens **before** the upgrade: the bearer comes from the
//! `Authorization` header, or the `token` query parameter for browser
//! clients that cannot set headers on WebSocket connects. A rejected
//! credential closes the connection with 401; the socket itself adds no
//! further auth.
use std::collections::HashMap;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use tracing::{info, warn};

use crate::{protocol::ClientFrame, session::Session, state::AppState};

/// Consecutive malformed inbound frames tolerated before the connection is
/// closed.
const MAX_MALFORMED: u32 = 3;

/// HTTP handler for `GET /ws`.
pub async fn ws_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(bearer) = bearer_from(&headers, &params) else {
        return (StatusCode::UNAUTHORIZED, "missing credential").into_response();
    };
    match state.identity.verify(&bearer).await {
        Ok(user_id) => ws.on_upgrade(move |socket| run_socket(socket, state, user_id)),
        Err(e) => {
            warn!(error = %e, "WebSocket connect rejected");
            (StatusCode::UNAUTHORIZED, "invalid credential").into_response()
        }
    }
}

fn bearer_from(headers: &HeaderMap, params: &HashMap<String, String>) -> Option<String> {
    if let Some(value) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        if let Some(token) = value.strip_prefix("Bearer ") {
            return Some(token.to_string());
        }
    }
    params.get("token").cloned()
}

async fn run_socket(socket: WebSocket, state: AppState, user_id: String) {
    info!(user = %user_id, "session connected");
    let turn_limiter = state.turn_limiter_for(&user_id);
    let (session, mut out_rx) = Session::new(
        user_id.clone(),
        state.orchestrator.clone(),
        turn_limiter,
        state.limits,
    );

    let (mut sink, mut stream) = socket.split();

    // Writer task: drains the bounded outbound queue in order. Once the
    // sink errors the client is gone and the queue is simply dropped.
    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let json = match serde_json::to_string(&frame) {
                Ok(j) => j,
                Err(e) => {
                    warn!(error = %e, "unserializable frame dropped");
                    continue;
                }
            };
            if sink.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    // Reader loop: parse frames and hand them to the session.
    let mut malformed = 0u32;
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientFrame>(&text) {
                Ok(frame) => {
                    malformed = 0;
                    session.handle_frame(frame).await;
                }
                Err(e) => {
                    malformed += 1;
                    warn!(user = %user_id, error = %e, "malformed inbound frame");
                    session
                        .handle_malformed(format!("malformed frame: {e}"))
                        .await;
                    if malformed >= MAX_MALFORMED {
                        warn!(user = %user_id, "too many malformed frames, closing");
                        break;
                    }
                }
            },
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {} // ping/pong handled by the protocol layer; binary ignored
        }
    }

    session.shutdown().await;
    writer.abort();
    info!(user = %user_id, "session disconnected");
}
