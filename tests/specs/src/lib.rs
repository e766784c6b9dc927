// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test harness for end-to-end hub scenarios.
//!
//! Starts an in-process hub replica on an ephemeral port with in-memory
//! directory / snapshot-store / authority backends, and provides
//! WebSocket helpers for driving agents and operators against it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use picket_wire::{Frame, Payload};
use pickethub::authority::{AgentSeed, AuthoritySeed, StaticAuthority, TokenSeed};
use pickethub::config::HubConfig;
use pickethub::directory::memory::MemoryDirectory;
use pickethub::directory::Directory;
use pickethub::snapshot::{MemoryStore, SnapshotStore};
use pickethub::state::HubState;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub type WsSink = SplitSink<WsStream, Message>;
pub type WsSource = SplitStream<WsStream>;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(10);

/// Hub configuration for tests: ephemeral port, short windows.
pub fn spec_config() -> HubConfig {
    HubConfig {
        host: "127.0.0.1".into(),
        port: 0,
        replica_id: Some("replica-spec".into()),
        nats_url: None,
        nats_token: None,
        subject_prefix: "picket".into(),
        auth_url: None,
        auth_seed: None,
        snapshot_url: None,
        heartbeat_interval_s: 15,
        heartbeat_miss_s: 35,
        presence_ttl_s: 45,
        inventory_interval_s: 900,
        handover_wait_s: 2,
        session_idle_s: 600,
        write_timeout_s: 10,
        handshake_timeout_s: 5,
        ready_timeout_s: 5,
        drain_s: 2,
    }
}

/// One in-process hub replica with reachable backends.
pub struct SpecHub {
    pub addr: SocketAddr,
    pub state: Arc<HubState>,
    pub directory: Arc<MemoryDirectory>,
    pub snapshots: Arc<MemoryStore>,
    serve_task: tokio::task::JoinHandle<anyhow::Result<()>>,
}

impl SpecHub {
    pub async fn start() -> anyhow::Result<Self> {
        Self::start_with(spec_config()).await
    }

    pub async fn start_with(config: HubConfig) -> anyhow::Result<Self> {
        let directory = Arc::new(MemoryDirectory::new(config.presence_ttl()));
        Self::start_with_directory(config, directory).await
    }

    /// Start a replica against a shared directory (multi-replica tests).
    pub async fn start_with_directory(
        config: HubConfig,
        directory: Arc<MemoryDirectory>,
    ) -> anyhow::Result<Self> {
        let listener = tokio::net::TcpListener::bind((config.host.clone(), config.port)).await?;
        let addr = listener.local_addr()?;
        let snapshots = Arc::new(MemoryStore::new());
        let authority = Arc::new(StaticAuthority::from_seed(AuthoritySeed {
            agents: vec![
                AgentSeed {
                    agent_id: "probe-1".into(),
                    secret: "sesame".into(),
                    owner_id: "op-1".into(),
                },
                AgentSeed {
                    agent_id: "probe-2".into(),
                    secret: "tumeric".into(),
                    owner_id: "op-2".into(),
                },
            ],
            tokens: vec![
                TokenSeed { token: "tok-ops".into(), operator_id: "op-1".into() },
                TokenSeed { token: "tok-other".into(), operator_id: "op-2".into() },
            ],
        }));

        let dyn_directory: Arc<dyn Directory> = directory.clone();
        let dyn_snapshots: Arc<dyn SnapshotStore> = snapshots.clone();
        let state = Arc::new(HubState::new(
            config,
            dyn_directory,
            dyn_snapshots,
            authority,
            CancellationToken::new(),
        ));
        pickethub::spawn_background_tasks(Arc::clone(&state)).await?;

        let serve_state = Arc::clone(&state);
        let serve_task = tokio::spawn(pickethub::serve(serve_state, listener));

        Ok(Self { addr, state, directory, snapshots, serve_task })
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn agent_ws_url(&self) -> String {
        format!("ws://{}/ws/agent", self.addr)
    }

    pub fn terminal_url(&self, agent_id: &str, token: &str) -> String {
        format!("ws://{}/terminal/{agent_id}?token={token}", self.addr)
    }

    /// Cancel the replica and wait for the listener to stop.
    pub async fn stop(mut self) {
        self.state.shutdown.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(5), &mut self.serve_task).await;
    }
}

impl Drop for SpecHub {
    fn drop(&mut self) {
        self.state.shutdown.cancel();
    }
}

/// Open a raw WebSocket to `url`.
pub async fn connect_ws(url: &str) -> anyhow::Result<WsStream> {
    let (stream, _) = tokio_tungstenite::connect_async(url).await?;
    Ok(stream)
}

/// Send one protocol frame.
pub async fn send_frame(ws_tx: &mut WsSink, frame: &Frame) -> anyhow::Result<()> {
    let text = frame.encode()?;
    ws_tx.send(Message::Text(text.into())).await?;
    Ok(())
}

/// Send arbitrary JSON (operator frames, malformed payloads).
pub async fn send_json(ws_tx: &mut WsSink, value: &serde_json::Value) -> anyhow::Result<()> {
    ws_tx.send(Message::Text(value.to_string().into())).await?;
    Ok(())
}

/// Receive the next protocol frame, skipping pings.
pub async fn recv_frame(ws_rx: &mut WsSource) -> anyhow::Result<Frame> {
    let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
    loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .ok_or_else(|| anyhow::anyhow!("timed out waiting for frame"))?;
        match tokio::time::timeout(remaining, ws_rx.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => return Ok(Frame::decode(&text)?),
            Ok(Some(Ok(Message::Close(frame)))) => {
                anyhow::bail!("transport closed: {frame:?}")
            }
            Ok(Some(Ok(_))) => continue,
            Ok(Some(Err(e))) => anyhow::bail!("transport error: {e}"),
            Ok(None) => anyhow::bail!("transport ended"),
            Err(_) => anyhow::bail!("timed out waiting for frame"),
        }
    }
}

/// Receive the next operator-side JSON message.
pub async fn recv_json(ws_rx: &mut WsSource) -> anyhow::Result<serde_json::Value> {
    let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
    loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .ok_or_else(|| anyhow::anyhow!("timed out waiting for message"))?;
        match tokio::time::timeout(remaining, ws_rx.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => return Ok(serde_json::from_str(&text)?),
            Ok(Some(Ok(Message::Close(frame)))) => {
                anyhow::bail!("transport closed: {frame:?}")
            }
            Ok(Some(Ok(_))) => continue,
            Ok(Some(Err(e))) => anyhow::bail!("transport error: {e}"),
            Ok(None) => anyhow::bail!("transport ended"),
            Err(_) => anyhow::bail!("timed out waiting for message"),
        }
    }
}

/// Wait for the close frame, returning its code and reason.
pub async fn recv_close(ws_rx: &mut WsSource) -> anyhow::Result<(u16, String)> {
    let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
    loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .ok_or_else(|| anyhow::anyhow!("timed out waiting for close"))?;
        match tokio::time::timeout(remaining, ws_rx.next()).await {
            Ok(Some(Ok(Message::Close(Some(frame))))) => {
                return Ok((frame.code.into(), frame.reason.to_string()))
            }
            Ok(Some(Ok(Message::Close(None)))) => return Ok((1005, String::new())),
            Ok(Some(Ok(_))) => continue,
            Ok(Some(Err(_))) | Ok(None) => anyhow::bail!("transport ended without close frame"),
            Err(_) => anyhow::bail!("timed out waiting for close"),
        }
    }
}

/// A hello frame for the seeded test agent.
pub fn hello(agent_id: &str, secret: &str) -> Frame {
    Frame::new(Payload::Hello {
        agent_id: agent_id.to_owned(),
        secret: secret.to_owned(),
        agent_version: "0.4.2-spec".to_owned(),
    })
}

/// Complete the hello/welcome handshake for `agent_id`.
pub async fn connect_agent(
    hub: &SpecHub,
    agent_id: &str,
    secret: &str,
) -> anyhow::Result<(WsSink, WsSource)> {
    let (mut ws_tx, mut ws_rx) = connect_ws(&hub.agent_ws_url()).await?.split();
    send_frame(&mut ws_tx, &hello(agent_id, secret)).await?;
    let frame = recv_frame(&mut ws_rx).await?;
    match frame.payload {
        Payload::Welcome { .. } => Ok((ws_tx, ws_rx)),
        other => anyhow::bail!("expected welcome, got {}", other.type_name()),
    }
}
