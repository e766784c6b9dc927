// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Agent transport lifecycle: handshake, writer/reader/supervisor tasks,
//! and close-time cleanup.
//!
//! One reader (this task) and one writer (the spawned drain task) per
//! socket; everything else reaches the socket through the handle's
//! bounded queue.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use picket_wire::{epoch_s, CloseReason, ErrorCode, Frame, Payload};
use tokio::sync::mpsc;

use crate::directory::{DirectoryError, Envelope, PresenceEntry, PresenceStatus};
use crate::hub::dispatch;
use crate::hub::AgentHandle;
use crate::state::{HubState, SERVER_VERSION};

/// Cadence of the heartbeat-miss supervisor check.
const SUPERVISOR_TICK: Duration = Duration::from_secs(5);

/// Poll cadence while waiting for a previous owner to hand an agent over.
const HANDOVER_POLL: Duration = Duration::from_millis(250);

pub(crate) fn error_frame(code: ErrorCode, message: impl Into<String>) -> Frame {
    Frame::new(Payload::Error { code: code.as_str().to_owned(), message: message.into() })
}

/// Entry point for an upgraded agent WebSocket.
pub async fn handle_agent_socket(state: Arc<HubState>, socket: WebSocket) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // 1. First frame must be a hello, within the handshake deadline.
    let hello = match read_hello(&state, &mut ws_rx).await {
        Ok(hello) => hello,
        Err((code, message, reason)) => {
            refuse(&mut ws_tx, code, &message, reason).await;
            return;
        }
    };

    // 2. Validate credentials against the auth authority.
    match state.authority.validate_agent(&hello.agent_id, &hello.secret).await {
        Ok(true) => {}
        Ok(false) => {
            tracing::info!(agent_id = %hello.agent_id, "handshake rejected: bad credentials");
            refuse(&mut ws_tx, ErrorCode::Auth, "invalid credentials", CloseReason::Auth).await;
            return;
        }
        Err(e) => {
            tracing::warn!(err = %e, "authority unavailable during handshake");
            refuse(&mut ws_tx, ErrorCode::Unavailable, "authority unavailable", CloseReason::Internal)
                .await;
            return;
        }
    }

    // 3. Serialise concurrent connects for this agent_id: latest wins.
    let lock = state.hub.connect_lock(&hello.agent_id).await;
    let guard = lock.lock().await;

    // 4. If another replica owns the agent, ask it to let go first.
    match state.directory.lookup(&hello.agent_id).await {
        Ok(Some(prev)) if prev.replica_id != state.replica_id => {
            request_eviction(&state, &hello.agent_id, &prev.replica_id).await;
        }
        Ok(Some(_)) => {
            // Previous transport on this replica; close it and take over.
            if state.hub.close(&hello.agent_id, CloseReason::DuplicateAgent).await {
                tracing::info!(agent_id = %hello.agent_id, "displacing local duplicate transport");
            }
        }
        Ok(None) => {}
        Err(e) => {
            // Degraded mode: keep serving existing agents, refuse new ones.
            tracing::warn!(err = %e, "directory unavailable; refusing new connection");
            drop(guard);
            refuse(&mut ws_tx, ErrorCode::Unavailable, "directory unavailable", CloseReason::Internal)
                .await;
            return;
        }
    }

    // 5. Claim presence.
    let now = epoch_s();
    let entry = PresenceEntry {
        agent_id: hello.agent_id.clone(),
        status: PresenceStatus::Online,
        replica_id: state.replica_id.clone(),
        connected_at: now,
        last_heartbeat: now,
        agent_version: hello.agent_version.clone(),
        uptime_s: 0,
    };
    if let Err(e) = state.directory.register(entry).await {
        tracing::warn!(err = %e, "directory unavailable; refusing new connection");
        drop(guard);
        refuse(&mut ws_tx, ErrorCode::Unavailable, "directory unavailable", CloseReason::Internal)
            .await;
        return;
    }
    if let Err(e) = state.authority.record_connect(&hello.agent_id, now).await {
        tracing::warn!(err = %e, agent_id = %hello.agent_id, "record_connect failed");
    }

    // 6. Install the write serialiser and welcome the agent.
    let (handle, write_rx) = AgentHandle::new(&hello.agent_id, &hello.agent_version);
    let writer = tokio::spawn(run_writer(
        ws_tx,
        write_rx,
        Arc::clone(&handle),
        state.config.write_timeout(),
    ));
    let welcome = Frame::new(Payload::Welcome {
        server_version: SERVER_VERSION.to_owned(),
        heartbeat_interval_s: state.config.heartbeat_interval_s,
        inventory_interval_s: state.config.inventory_interval_s,
    });
    let _ = handle.enqueue(welcome);

    if let Some(displaced) = state.hub.insert(Arc::clone(&handle)).await {
        displaced.begin_close(CloseReason::DuplicateAgent);
    }
    drop(guard);

    tracing::info!(
        agent_id = %hello.agent_id,
        agent_version = %hello.agent_version,
        "agent connected"
    );

    // 7. Reader + supervisor loop; runs until the transport dies.
    run_reader(&state, &handle, &mut ws_rx).await;

    // 8. Cleanup. Deregister only when no newer transport took the slot:
    // a duplicate_agent close means a successor owns the record now.
    state.hub.remove_if(&hello.agent_id, &handle).await;
    handle.begin_close(CloseReason::Normal);
    let displaced = handle.close_reason() == CloseReason::DuplicateAgent;
    if !displaced && !state.hub.contains(&hello.agent_id).await {
        if let Err(e) = state.directory.deregister(&hello.agent_id, &state.replica_id).await {
            tracing::warn!(err = %e, agent_id = %hello.agent_id, "deregister failed");
        }
        state.hub.prune_connect_lock(&hello.agent_id).await;
    }
    state.broker.agent_disconnected(&state, &hello.agent_id).await;
    let _ = writer.await;

    tracing::info!(
        agent_id = %hello.agent_id,
        reason = %handle.close_reason(),
        "agent disconnected"
    );
}

struct Hello {
    agent_id: String,
    secret: String,
    agent_version: String,
}

type RefusedHandshake = (ErrorCode, String, CloseReason);

async fn read_hello(
    state: &HubState,
    ws_rx: &mut SplitStream<WebSocket>,
) -> Result<Hello, RefusedHandshake> {
    let deadline = state.config.handshake_timeout();
    let first = tokio::time::timeout(deadline, async {
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

    let text = match first {
        Ok(Some(text)) => text,
        Ok(None) => {
            return Err((ErrorCode::InvalidMessage, "transport closed".into(), CloseReason::Normal))
        }
        Err(_) => {
            return Err((ErrorCode::InvalidMessage, "handshake timeout".into(), CloseReason::Normal))
        }
    };

    let frame = Frame::decode(&text).map_err(|_| {
        (ErrorCode::InvalidMessage, "malformed frame".to_owned(), CloseReason::Normal)
    })?;
    if !frame.skew_ok(epoch_s()) {
        return Err((
            ErrorCode::InvalidMessage,
            "timestamp outside tolerance".into(),
            CloseReason::Normal,
        ));
    }
    match frame.payload {
        Payload::Hello { agent_id, secret, agent_version } => {
            Ok(Hello { agent_id, secret, agent_version })
        }
        other => Err((
            ErrorCode::InvalidMessage,
            format!("expected hello, got {}", other.type_name()),
            CloseReason::Normal,
        )),
    }
}

/// Ask `prev_replica` to release `agent_id`, then wait until the
/// presence entry clears (or the handover window lapses; the subsequent
/// register wins either way).
async fn request_eviction(state: &HubState, agent_id: &str, prev_replica: &str) {
    let envelope = Envelope::Evict {
        agent_id: agent_id.to_owned(),
        new_replica_id: state.replica_id.clone(),
    };
    match state.directory.deliver(prev_replica, envelope).await {
        Ok(()) => {}
        Err(DirectoryError::NoSuchReplica(_)) => {
            // Previous owner is gone; its entry will expire on its own,
            // and our register overwrites it now.
            return;
        }
        Err(e) => {
            tracing::warn!(err = %e, agent_id, "evict delivery failed");
            return;
        }
    }

    let deadline = Instant::now() + state.config.handover_wait();
    loop {
        match state.directory.lookup(agent_id).await {
            Ok(None) => return,
            Ok(Some(entry)) if entry.replica_id == state.replica_id => return,
            Ok(Some(_)) => {}
            Err(_) => return,
        }
        if Instant::now() >= deadline {
            tracing::warn!(agent_id, prev_replica, "handover wait lapsed; proceeding");
            return;
        }
        tokio::time::sleep(HANDOVER_POLL).await;
    }
}

/// Reader + heartbeat supervisor. Returns when the transport should
/// close; the close reason is recorded on the handle.
async fn run_reader(
    state: &Arc<HubState>,
    handle: &Arc<AgentHandle>,
    ws_rx: &mut SplitStream<WebSocket>,
) {
    let miss = state.config.heartbeat_miss();
    let mut check = tokio::time::interval(SUPERVISOR_TICK.min(miss));
    check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = handle.cancel.cancelled() => return,

            _ = state.shutdown.cancelled() => {
                handle.begin_close(CloseReason::Shutdown);
                return;
            }

            _ = check.tick() => {
                let silent = epoch_s().saturating_sub(handle.last_heartbeat_s());
                if silent > miss.as_secs() as i64 {
                    tracing::info!(
                        agent_id = %handle.agent_id,
                        silent_s = silent,
                        "heartbeat missed; closing transport"
                    );
                    handle.begin_close(CloseReason::Stalled);
                    return;
                }
            }

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let raw_len = text.len();
                        let frame = match Frame::decode(&text) {
                            Ok(frame) => frame,
                            Err(e) => {
                                tracing::debug!(err = %e, agent_id = %handle.agent_id, "malformed frame");
                                let _ = handle.enqueue(error_frame(
                                    ErrorCode::InvalidMessage,
                                    "malformed frame",
                                ));
                                handle.begin_close(CloseReason::Normal);
                                return;
                            }
                        };
                        if let Err(reason) =
                            dispatch::handle_frame(state, handle, frame, raw_len).await
                        {
                            handle.begin_close(reason);
                            return;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        handle.begin_close(CloseReason::Normal);
                        return;
                    }
                    Some(Err(e)) => {
                        tracing::debug!(err = %e, agent_id = %handle.agent_id, "read error");
                        handle.begin_close(CloseReason::Normal);
                        return;
                    }
                    Some(Ok(_)) => {} // ping/pong/binary ignored
                }
            }
        }
    }
}

/// Single writer per socket: drains the bounded queue, enforcing the
/// per-write deadline. On cancellation it flushes what is already queued
/// and sends the close frame with the recorded reason.
async fn run_writer(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Frame>,
    handle: Arc<AgentHandle>,
    write_timeout: Duration,
) {
    loop {
        tokio::select! {
            maybe = rx.recv() => {
                match maybe {
                    Some(frame) => {
                        if !write_frame(&mut ws_tx, &frame, write_timeout, &handle).await {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = handle.cancel.cancelled() => {
                // Drain pending frames, then fall through to the close.
                while let Ok(frame) = rx.try_recv() {
                    if !write_frame(&mut ws_tx, &frame, write_timeout, &handle).await {
                        break;
                    }
                }
                break;
            }
        }
    }

    let reason = handle.close_reason();
    let close = Message::Close(Some(CloseFrame {
        code: reason.ws_code(),
        reason: reason.as_str().into(),
    }));
    let _ = ws_tx.send(close).await;
}

async fn write_frame(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    frame: &Frame,
    write_timeout: Duration,
    handle: &AgentHandle,
) -> bool {
    let Ok(text) = frame.encode() else {
        tracing::warn!(agent_id = %handle.agent_id, "failed to encode outbound frame");
        return true;
    };
    match tokio::time::timeout(write_timeout, ws_tx.send(Message::Text(text.into()))).await {
        Ok(Ok(())) => true,
        Ok(Err(_)) => {
            handle.cancel.cancel();
            false
        }
        Err(_) => {
            handle.begin_close(CloseReason::Stalled);
            false
        }
    }
}

/// Pre-handshake refusal: typed error frame, then close.
async fn refuse(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    code: ErrorCode,
    message: &str,
    reason: CloseReason,
) {
    let frame = error_frame(code, message);
    if let Ok(text) = frame.encode() {
        let _ = ws_tx.send(Message::Text(text.into())).await;
    }
    let close = Message::Close(Some(CloseFrame {
        code: reason.ws_code(),
        reason: reason.as_str().into(),
    }));
    let _ = ws_tx.send(close).await;
}
