// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! One connected session against the hub: handshake, the select loop of
//! timers and inbound frames, and the single socket writer.

use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use futures_util::{SinkExt, Stream, StreamExt};
use picket_wire::limits::WRITE_QUEUE_FRAMES;
use picket_wire::{ErrorCode, Frame, Payload};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::collector;
use crate::config::ProbeConfig;
use crate::terminal::TerminalManager;
use crate::AGENT_VERSION;

/// Deadline for the welcome frame after the transport opens.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// How a connected session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The process is exiting; do not reconnect.
    Shutdown,
    /// The welcome was seen before the connection died; backoff resets.
    Welcomed,
}

/// Dial the hub and serve one session to completion. Errors cover the
/// connect/handshake phase; once welcomed, connection loss is a normal
/// `Welcomed` end.
pub async fn session(
    config: &ProbeConfig,
    started_at: Instant,
    shutdown: &CancellationToken,
) -> anyhow::Result<SessionEnd> {
    let url = agent_ws_url(&config.server_url);
    tracing::info!(url = %url, agent_id = %config.agent_id, "connecting to hub");
    let (stream, _) = tokio_tungstenite::connect_async(&url).await.context("dial failed")?;
    let (ws_tx, mut ws_rx) = stream.split();

    let (write_tx, write_rx) = mpsc::channel::<Frame>(WRITE_QUEUE_FRAMES);
    let writer = tokio::spawn(run_writer(ws_tx, write_rx));

    let hello = Frame::new(Payload::Hello {
        agent_id: config.agent_id.clone(),
        secret: config.secret.clone(),
        agent_version: AGENT_VERSION.to_owned(),
    });
    write_tx.send(hello).await.map_err(|_| anyhow::anyhow!("writer gone during hello"))?;

    let welcome = tokio::time::timeout(HANDSHAKE_TIMEOUT, await_welcome(&mut ws_rx))
        .await
        .context("welcome timeout")??;
    tracing::info!(
        server_version = %welcome.server_version,
        heartbeat_interval_s = welcome.heartbeat_interval_s,
        inventory_interval_s = welcome.inventory_interval_s,
        "welcomed by hub"
    );

    let heartbeat_every = Duration::from_secs(welcome.heartbeat_interval_s.max(1));
    let inventory_every = Duration::from_secs(welcome.inventory_interval_s.max(1));

    let terminal = TerminalManager::new(write_tx.clone(), config.shell.clone());

    // First tick of each interval fires immediately: the first inventory
    // goes out right after the welcome, per the handshake contract.
    let mut heartbeat = tokio::time::interval(heartbeat_every);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut inventory = tokio::time::interval(inventory_every);
    inventory.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let end = loop {
        tokio::select! {
            _ = shutdown.cancelled() => break SessionEnd::Shutdown,

            _ = heartbeat.tick() => {
                let frame = Frame::new(Payload::Heartbeat {
                    status: "alive".into(),
                    uptime_s: started_at.elapsed().as_secs(),
                    agent_version: AGENT_VERSION.to_owned(),
                });
                if write_tx.send(frame).await.is_err() {
                    break SessionEnd::Welcomed;
                }
            }

            _ = inventory.tick() => {
                let agent_id = config.agent_id.clone();
                match tokio::task::spawn_blocking(move || collector::collect(&agent_id)).await {
                    Ok(snapshot) => {
                        let frame = Frame::new(Payload::Inventory(snapshot));
                        if write_tx.send(frame).await.is_err() {
                            break SessionEnd::Welcomed;
                        }
                    }
                    Err(e) => tracing::warn!(err = %e, "inventory collection panicked"),
                }
            }

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let frame = match Frame::decode(&text) {
                            Ok(frame) => frame,
                            Err(e) => {
                                tracing::debug!(err = %e, "malformed frame from hub");
                                continue;
                            }
                        };
                        if let Err(end) = handle_hub_frame(&terminal, &write_tx, frame).await {
                            break end;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        tracing::info!(close = ?frame, "hub closed the transport");
                        break SessionEnd::Welcomed;
                    }
                    None | Some(Err(_)) => break SessionEnd::Welcomed,
                    Some(Ok(_)) => {} // ping/pong/binary ignored
                }
            }
        }
    };

    terminal.close_all().await;
    drop(terminal);
    drop(write_tx);
    // Give the writer a moment to flush and send its close frame.
    let _ = tokio::time::timeout(Duration::from_secs(2), writer).await;
    Ok(end)
}

/// Dispatch one post-welcome frame from the hub. `Err` ends the session.
async fn handle_hub_frame(
    terminal: &TerminalManager,
    write_tx: &mpsc::Sender<Frame>,
    frame: Frame,
) -> Result<(), SessionEnd> {
    let Frame { payload, message_id, .. } = frame;
    match payload {
        Payload::HeartbeatAck { .. } => {}
        Payload::InventoryAck { changed, .. } => {
            tracing::debug!(changed, "inventory acknowledged");
        }
        Payload::TerminalCommand { session_id, op } => {
            terminal.handle(session_id, op).await;
        }
        Payload::Command { name, .. } => {
            // Only the liveness probe command is understood; anything
            // else answers unsupported so the hub sees a response either
            // way.
            let (ok, error) = match name.as_str() {
                "ping" => (true, None),
                _ => (false, Some(format!("unsupported command: {name}"))),
            };
            let response = Payload::CommandResponse {
                ok,
                result: serde_json::Value::Null,
                error,
            };
            let reply = match message_id {
                Some(id) => Frame::with_message_id(response, id),
                None => Frame::new(response),
            };
            let _ = write_tx.send(reply).await;
        }
        Payload::Error { code, message } => {
            tracing::warn!(code = %code, message = %message, "error frame from hub");
            if code == ErrorCode::Auth.as_str() {
                return Err(SessionEnd::Welcomed);
            }
        }
        Payload::Welcome { .. } => {
            tracing::debug!("duplicate welcome ignored");
        }
        other => {
            tracing::debug!(frame = other.type_name(), "unexpected frame from hub");
        }
    }
    Ok(())
}

struct WelcomeInfo {
    server_version: String,
    heartbeat_interval_s: u64,
    inventory_interval_s: u64,
}

async fn await_welcome<S>(ws_rx: &mut S) -> anyhow::Result<WelcomeInfo>
where
    S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                let frame = match Frame::decode(&text) {
                    Ok(frame) => frame,
                    Err(_) => continue,
                };
                match frame.payload {
                    Payload::Welcome {
                        server_version,
                        heartbeat_interval_s,
                        inventory_interval_s,
                    } => {
                        return Ok(WelcomeInfo {
                            server_version,
                            heartbeat_interval_s,
                            inventory_interval_s,
                        })
                    }
                    Payload::Error { code, message } => {
                        bail!("hub refused handshake: {code}: {message}")
                    }
                    _ => continue,
                }
            }
            Ok(Message::Close(_)) => bail!("hub closed during handshake"),
            Ok(_) => continue,
            Err(e) => bail!("transport error during handshake: {e}"),
        }
    }
    bail!("transport ended during handshake")
}

/// Single socket writer; everything reaches the wire through its queue.
async fn run_writer<S>(mut ws_tx: S, mut rx: mpsc::Receiver<Frame>)
where
    S: SinkExt<Message> + Unpin,
{
    while let Some(frame) = rx.recv().await {
        let Ok(text) = frame.encode() else { continue };
        if ws_tx.send(Message::Text(text.into())).await.is_err() {
            return;
        }
    }
    let _ = ws_tx.send(Message::Close(None)).await;
}

/// Derive the agent WebSocket endpoint from the configured base URL.
pub fn agent_ws_url(base_url: &str) -> String {
    let ws_base = if base_url.starts_with("https://") {
        base_url.replacen("https://", "wss://", 1)
    } else {
        base_url.replacen("http://", "ws://", 1)
    };
    format!("{}/ws/agent", ws_base.trim_end_matches('/'))
}

#[cfg(test)]
#[path = "conn_tests.rs"]
mod tests;
