// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Operator terminal WebSocket: authorises the operator, opens a broker
//! session toward the agent, then pumps both directions until either
//! side closes.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use picket_wire::{CloseReason, ErrorCode};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::broker::{OperatorEvent, OperatorSession};
use crate::state::HubState;
use crate::transport::operator_msg::{OperatorReply, OperatorRequest, TermOpen};

#[derive(Debug, Clone, Deserialize)]
pub struct TerminalQuery {
    pub token: Option<String>,
}

/// `GET /terminal/{agent_id}?token=…` — operator terminal upgrade.
pub async fn operator_ws_handler(
    State(state): State<Arc<HubState>>,
    Path(agent_id): Path<String>,
    Query(query): Query<TerminalQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    // Token and ownership checks happen before the upgrade so plain
    // unauthorised requests get an HTTP status, not a doomed socket.
    let token = query.token.unwrap_or_default();
    let operator_id = match state.authority.authorize_operator(&token).await {
        Ok(Some(operator_id)) => operator_id,
        Ok(None) => return plain_response(401, "invalid token"),
        Err(e) => {
            tracing::warn!(err = %e, "authority unavailable for operator");
            return plain_response(503, "authority unavailable");
        }
    };
    match state.authority.owner_of(&agent_id).await {
        Ok(Some(owner)) if owner == operator_id => {}
        Ok(_) => return plain_response(403, "not your agent"),
        Err(e) => {
            tracing::warn!(err = %e, "authority unavailable for ownership check");
            return plain_response(503, "authority unavailable");
        }
    }

    ws.on_upgrade(move |socket| handle_operator_socket(state, socket, agent_id, operator_id))
        .into_response()
}

fn plain_response(status: u16, body: &'static str) -> axum::response::Response {
    axum::http::Response::builder()
        .status(status)
        .body(axum::body::Body::from(body))
        .unwrap_or_default()
        .into_response()
}

async fn handle_operator_socket(
    state: Arc<HubState>,
    socket: WebSocket,
    agent_id: String,
    operator_id: String,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // First frame carries the initial dimensions.
    let open = tokio::time::timeout(state.config.handshake_timeout(), async {
        while let Some(msg) = ws_rx.next().await {
            match msg {
                Ok(Message::Text(text)) => return Some(text.to_string()),
                Ok(Message::Close(_)) | Err(_) => return None,
                _ => {}
            }
        }
        None
    })
    .await;
    let Ok(Some(text)) = open else {
        let _ = close_with(&mut ws_tx, CloseReason::Normal).await;
        return;
    };
    let open: TermOpen = match serde_json::from_str(&text) {
        Ok(open) => open,
        Err(_) => {
            send_reply(
                &mut ws_tx,
                &OperatorReply::TerminalError {
                    code: ErrorCode::InvalidMessage.as_str().to_owned(),
                    message: "expected {cols, rows, shell?}".into(),
                },
            )
            .await;
            let _ = close_with(&mut ws_tx, CloseReason::Normal).await;
            return;
        }
    };

    let opened = state
        .broker
        .open(&state, &agent_id, &operator_id, open.rows, open.cols, open.shell)
        .await;
    let (session, out_rx) = match opened {
        Ok(pair) => pair,
        Err(e) => {
            send_reply(
                &mut ws_tx,
                &OperatorReply::TerminalError {
                    code: e.code.as_str().to_owned(),
                    message: e.message,
                },
            )
            .await;
            let reason = match e.code {
                ErrorCode::AgentOffline => CloseReason::AgentOffline,
                ErrorCode::Unauthorised => CloseReason::Unauthorised,
                _ => CloseReason::Normal,
            };
            let _ = close_with(&mut ws_tx, reason).await;
            return;
        }
    };

    send_reply(
        &mut ws_tx,
        &OperatorReply::TerminalReady { session_id: session.session_id.clone() },
    )
    .await;

    pump(&state, &session, ws_tx, ws_rx, out_rx).await;
}

/// Duplex pump: operator frames toward the agent, session events toward
/// the operator. Ends on either side closing or session teardown.
async fn pump(
    state: &Arc<HubState>,
    session: &Arc<OperatorSession>,
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut ws_rx: futures_util::stream::SplitStream<WebSocket>,
    mut out_rx: mpsc::Receiver<OperatorEvent>,
) {
    let mut operator_gone = false;
    loop {
        tokio::select! {
            _ = session.cancel.cancelled() => break,

            event = out_rx.recv() => {
                let Some(event) = event else { break };
                let closed = matches!(event, OperatorEvent::Closed);
                send_reply(&mut ws_tx, &event.into()).await;
                if closed {
                    break;
                }
            }

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<OperatorRequest>(&text) {
                            Ok(OperatorRequest::Input { data }) => {
                                state.broker.operator_input(state, session, data).await;
                            }
                            Ok(OperatorRequest::Resize { cols, rows }) => {
                                state.broker.operator_resize(state, session, rows, cols).await;
                            }
                            Err(_) => {
                                send_reply(&mut ws_tx, &OperatorReply::TerminalError {
                                    code: ErrorCode::InvalidMessage.as_str().to_owned(),
                                    message: "unrecognised frame".into(),
                                }).await;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        operator_gone = true;
                        break;
                    }
                    Some(Err(_)) => {
                        operator_gone = true;
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    // Either direction ending tears the session down; the agent gets a
    // best-effort close command.
    state
        .broker
        .teardown_session(state, session, OperatorEvent::Closed, true)
        .await;
    if !operator_gone {
        // Flush events queued before the teardown raced our select.
        while let Ok(event) = out_rx.try_recv() {
            send_reply(&mut ws_tx, &event.into()).await;
        }
        let _ = close_with(&mut ws_tx, CloseReason::Normal).await;
    }
}

async fn send_reply(ws_tx: &mut SplitSink<WebSocket, Message>, reply: &OperatorReply) {
    if let Ok(text) = serde_json::to_string(reply) {
        let _ = ws_tx.send(Message::Text(text.into())).await;
    }
}

async fn close_with(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    reason: CloseReason,
) -> Result<(), axum::Error> {
    ws_tx
        .send(Message::Close(Some(CloseFrame {
            code: reason.ws_code(),
            reason: reason.as_str().into(),
        })))
        .await
}
