// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end scenarios: a real hub replica on a TCP port, driven by raw
//! WebSocket clients and, where it matters, the real probe runtime.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use futures_util::StreamExt;
use picket_wire::{epoch_s, Frame, InventorySnapshot, Payload};
use pickethub::directory::Directory;
use pickethub::snapshot::SnapshotStore;
use tokio_util::sync::CancellationToken;

use picket_specs::*;

fn b64(data: &str) -> String {
    base64::engine::general_purpose::STANDARD.encode(data)
}

fn inventory(collected_at: i64) -> InventorySnapshot {
    InventorySnapshot {
        agent_id: "probe-1".into(),
        collected_at,
        hostname: "spec-host".into(),
        os: "SpecOS 1.0".into(),
        platform: "linux".into(),
        architecture: "x86_64".into(),
        cpu_count: 4,
        cpu_model: "Spec CPU".into(),
        memory_total: 8 << 30,
        memory_used: 2 << 30,
        memory_free: 6 << 30,
        disk_total: 100 << 30,
        disk_used: 40 << 30,
        disk_free: 60 << 30,
        ip_list: vec!["10.0.0.7".into()],
        mac_list: vec!["52:54:00:00:00:07".into()],
        extensions: serde_json::Map::new(),
    }
}

// -- Handshake and inventory --------------------------------------------------

#[tokio::test]
async fn hello_welcome_then_first_inventory_is_durable() -> anyhow::Result<()> {
    let hub = SpecHub::start().await?;
    let (mut tx, mut rx) = connect_agent(&hub, "probe-1", "sesame").await?;

    let collected_at = epoch_s();
    send_frame(&mut tx, &Frame::new(Payload::Inventory(inventory(collected_at)))).await?;

    match recv_frame(&mut rx).await?.payload {
        Payload::InventoryAck { received, changed } => {
            assert!(received);
            assert!(changed, "first inventory is a change");
        }
        other => anyhow::bail!("expected inventory_ack, got {}", other.type_name()),
    }

    // The ack implies durability: the store already has the snapshot.
    let stored = hub.snapshots.latest("probe-1").await?;
    let Some(stored) = stored else {
        anyhow::bail!("snapshot must be stored before the ack");
    };
    assert_eq!(stored.collected_at, collected_at);
    assert_eq!(stored.hostname, "spec-host");

    hub.stop().await;
    Ok(())
}

#[tokio::test]
async fn wrong_secret_is_refused_with_auth_error() -> anyhow::Result<()> {
    let hub = SpecHub::start().await?;
    let (mut tx, mut rx) = connect_ws(&hub.agent_ws_url()).await?.split();

    send_frame(&mut tx, &hello("probe-1", "wrong")).await?;

    match recv_frame(&mut rx).await?.payload {
        Payload::Error { code, .. } => assert_eq!(code, "auth"),
        other => anyhow::bail!("expected auth error, got {}", other.type_name()),
    }
    let (code, reason) = recv_close(&mut rx).await?;
    assert_eq!((code, reason.as_str()), (4001, "auth"));
    Ok(())
}

#[tokio::test]
async fn skewed_hello_is_rejected() -> anyhow::Result<()> {
    let hub = SpecHub::start().await?;
    let (mut tx, mut rx) = connect_ws(&hub.agent_ws_url()).await?.split();

    let mut frame = hello("probe-1", "sesame");
    frame.timestamp = epoch_s() - 400;
    send_frame(&mut tx, &frame).await?;

    match recv_frame(&mut rx).await?.payload {
        Payload::Error { code, .. } => assert_eq!(code, "invalid_message"),
        other => anyhow::bail!("expected invalid_message, got {}", other.type_name()),
    }
    recv_close(&mut rx).await?;
    Ok(())
}

#[tokio::test]
async fn oversize_inventory_is_rejected_but_transport_survives() -> anyhow::Result<()> {
    let hub = SpecHub::start().await?;
    let (mut tx, mut rx) = connect_agent(&hub, "probe-1", "sesame").await?;

    // ~2 MiB of extension payload, over the 1 MiB cap.
    let mut snap = inventory(epoch_s());
    snap.extensions
        .insert("padding".into(), serde_json::json!("x".repeat(2 * 1024 * 1024)));
    send_frame(&mut tx, &Frame::new(Payload::Inventory(snap))).await?;

    match recv_frame(&mut rx).await?.payload {
        Payload::Error { code, .. } => assert_eq!(code, "invalid_message"),
        other => anyhow::bail!("expected invalid_message, got {}", other.type_name()),
    }

    // Scenario 5: the transport stays open and heartbeats keep flowing.
    send_frame(
        &mut tx,
        &Frame::new(Payload::Heartbeat {
            status: "alive".into(),
            uptime_s: 9,
            agent_version: "0.4.2-spec".into(),
        }),
    )
    .await?;
    match recv_frame(&mut rx).await?.payload {
        Payload::HeartbeatAck { .. } => {}
        other => anyhow::bail!("expected heartbeat_ack, got {}", other.type_name()),
    }
    assert!(hub.snapshots.is_empty().await, "oversize snapshot must not be stored");
    Ok(())
}

// -- Presence -----------------------------------------------------------------

#[tokio::test]
async fn heartbeat_keeps_the_agent_listed_online() -> anyhow::Result<()> {
    let hub = SpecHub::start().await?;
    let (mut tx, mut rx) = connect_agent(&hub, "probe-1", "sesame").await?;

    send_frame(
        &mut tx,
        &Frame::new(Payload::Heartbeat {
            status: "alive".into(),
            uptime_s: 42,
            agent_version: "0.4.2-spec".into(),
        }),
    )
    .await?;
    match recv_frame(&mut rx).await?.payload {
        Payload::HeartbeatAck { .. } => {}
        other => anyhow::bail!("expected heartbeat_ack, got {}", other.type_name()),
    }

    let listing: serde_json::Value =
        reqwest::get(format!("{}/api/v1/agents", hub.base_url())).await?.json().await?;
    let agents = listing["agents"].as_array().cloned().unwrap_or_default();
    assert_eq!(agents.len(), 1);
    assert_eq!(agents[0]["agent_id"], "probe-1");
    assert_eq!(agents[0]["status"], "online");
    assert_eq!(agents[0]["replica_id"], "replica-spec");
    assert_eq!(agents[0]["uptime_s"], 42);
    Ok(())
}

#[tokio::test]
async fn missed_heartbeats_close_the_transport_and_presence() -> anyhow::Result<()> {
    let mut config = spec_config();
    config.heartbeat_interval_s = 1;
    config.heartbeat_miss_s = 2;
    config.presence_ttl_s = 3;
    let hub = SpecHub::start_with(config).await?;

    let (_tx, mut rx) = connect_agent(&hub, "probe-1", "sesame").await?;

    // Never heartbeat: the supervisor must close us (scenario 2).
    let (code, reason) = recv_close(&mut rx).await?;
    assert_eq!((code, reason.as_str()), (4009, "stalled"));

    // And presence must clear promptly after the close.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if hub.directory.lookup("probe-1").await?.is_none() {
            break;
        }
        anyhow::ensure!(
            tokio::time::Instant::now() < deadline,
            "presence entry should be gone after deregister/TTL"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    Ok(())
}

#[tokio::test]
async fn reconnect_leaves_one_transport_and_one_presence_entry() -> anyhow::Result<()> {
    let hub = SpecHub::start().await?;

    let (_tx1, mut rx1) = connect_agent(&hub, "probe-1", "sesame").await?;
    let (mut tx2, mut rx2) = connect_agent(&hub, "probe-1", "sesame").await?;

    // The older transport is displaced: latest wins.
    let (code, reason) = recv_close(&mut rx1).await?;
    assert_eq!((code, reason.as_str()), (4005, "duplicate_agent"));

    // The new transport is live.
    send_frame(
        &mut tx2,
        &Frame::new(Payload::Heartbeat {
            status: "alive".into(),
            uptime_s: 1,
            agent_version: "0.4.2-spec".into(),
        }),
    )
    .await?;
    match recv_frame(&mut rx2).await?.payload {
        Payload::HeartbeatAck { .. } => {}
        other => anyhow::bail!("expected heartbeat_ack, got {}", other.type_name()),
    }

    // Exactly one presence entry, no zombies.
    let listing: serde_json::Value =
        reqwest::get(format!("{}/api/v1/agents", hub.base_url())).await?.json().await?;
    assert_eq!(listing["agents"].as_array().map(Vec::len), Some(1));
    Ok(())
}

// -- Terminal sessions --------------------------------------------------------

#[tokio::test]
async fn operator_with_bad_token_cannot_upgrade() -> anyhow::Result<()> {
    let hub = SpecHub::start().await?;
    let result = connect_ws(&hub.terminal_url("probe-1", "bogus")).await;
    assert!(result.is_err(), "401 must abort the upgrade");
    Ok(())
}

#[tokio::test]
async fn operator_cannot_open_someone_elses_agent() -> anyhow::Result<()> {
    let hub = SpecHub::start().await?;
    // tok-other belongs to op-2, who does not own probe-1.
    let result = connect_ws(&hub.terminal_url("probe-1", "tok-other")).await;
    assert!(result.is_err(), "403 must abort the upgrade");
    Ok(())
}

#[tokio::test]
async fn terminal_open_fails_typed_when_agent_is_offline() -> anyhow::Result<()> {
    let hub = SpecHub::start().await?;
    let (mut tx, mut rx) = connect_ws(&hub.terminal_url("probe-1", "tok-ops")).await?.split();

    send_json(&mut tx, &serde_json::json!({"cols": 80, "rows": 24})).await?;
    let reply = recv_json(&mut rx).await?;
    assert_eq!(reply["type"], "terminal_error");
    assert_eq!(reply["code"], "agent_offline");
    Ok(())
}

/// Scenario: full duplex through the hub against the real probe runtime,
/// with `cat` standing in for a shell so output is deterministic.
#[tokio::test]
async fn terminal_session_round_trips_through_a_real_probe() -> anyhow::Result<()> {
    let hub = SpecHub::start().await?;

    let probe_config = picket::config::ProbeConfig {
        server_url: hub.base_url(),
        agent_id: "probe-1".into(),
        secret: "sesame".into(),
        heartbeat_interval_s: 15,
        inventory_interval_s: 900,
        shell: Some("/bin/cat".into()),
        reconnect_base_ms: 100,
        reconnect_max_ms: 1000,
    };
    let probe_shutdown = CancellationToken::new();
    let probe_task = {
        let shutdown = probe_shutdown.clone();
        tokio::spawn(async move {
            picket::conn::session(&probe_config, std::time::Instant::now(), &shutdown).await
        })
    };

    // Wait for the probe's first inventory: proof it connected and the
    // write-through works end to end.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if !hub.snapshots.is_empty().await {
            break;
        }
        anyhow::ensure!(tokio::time::Instant::now() < deadline, "probe never connected");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // Operator opens a terminal.
    let (mut op_tx, mut op_rx) =
        connect_ws(&hub.terminal_url("probe-1", "tok-ops")).await?.split();
    send_json(&mut op_tx, &serde_json::json!({"cols": 80, "rows": 24})).await?;

    let ready = recv_json(&mut op_rx).await?;
    assert_eq!(ready["type"], "terminal_ready", "got {ready}");
    assert!(ready["session_id"].is_string());

    // Type into the session; cat echoes it back through the PTY.
    send_json(
        &mut op_tx,
        &serde_json::json!({"type": "input", "data": b64("marker-attested\n")}),
    )
    .await?;

    let mut combined = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        anyhow::ensure!(tokio::time::Instant::now() < deadline, "echo never arrived");
        let reply = recv_json(&mut op_rx).await?;
        if reply["type"] == "terminal_output" {
            let chunk = reply["output"].as_str().unwrap_or_default();
            combined.extend(base64::engine::general_purpose::STANDARD.decode(chunk)?);
            if String::from_utf8_lossy(&combined).contains("marker-attested") {
                break;
            }
        }
    }

    // Resize is accepted without disturbing the stream.
    send_json(&mut op_tx, &serde_json::json!({"type": "resize", "cols": 132, "rows": 50})).await?;

    // Operator walks away; the probe should be told to close its PTY and
    // the hub should release the session.
    drop(op_tx);
    drop(op_rx);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if hub.state.broker.session_count().await == 0 {
            break;
        }
        anyhow::ensure!(tokio::time::Instant::now() < deadline, "session never released");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    probe_shutdown.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), probe_task).await;
    hub.stop().await;
    Ok(())
}

/// Scenario: operator on replica 1, agent on replica 2, bridged through
/// the shared directory.
#[tokio::test]
async fn cross_replica_terminal_routes_through_the_directory() -> anyhow::Result<()> {
    let shared = Arc::new(pickethub::directory::memory::MemoryDirectory::new(
        Duration::from_secs(45),
    ));

    let mut config_r1 = spec_config();
    config_r1.replica_id = Some("replica-r1".into());
    let r1 = SpecHub::start_with_directory(config_r1, Arc::clone(&shared)).await?;

    let mut config_r2 = spec_config();
    config_r2.replica_id = Some("replica-r2".into());
    let r2 = SpecHub::start_with_directory(config_r2, Arc::clone(&shared)).await?;

    // Fake agent homed on r2.
    let (mut agent_tx, mut agent_rx) = connect_agent(&r2, "probe-1", "sesame").await?;

    // Operator opens the terminal on r1.
    let (mut op_tx, mut op_rx) =
        connect_ws(&r1.terminal_url("probe-1", "tok-ops")).await?.split();
    send_json(&mut op_tx, &serde_json::json!({"cols": 80, "rows": 24})).await?;

    // The init arrives at the agent via r2.
    let session_id = match recv_frame(&mut agent_rx).await?.payload {
        Payload::TerminalCommand { session_id, op: picket_wire::TerminalOp::Init { rows, cols, .. } } => {
            assert_eq!((rows, cols), (24, 80));
            session_id
        }
        other => anyhow::bail!("expected init, got {}", other.type_name()),
    };
    send_frame(
        &mut agent_tx,
        &Frame::new(Payload::TerminalReady { session_id: session_id.clone() }),
    )
    .await?;

    let ready = recv_json(&mut op_rx).await?;
    assert_eq!(ready["type"], "terminal_ready");

    // Operator types; the agent receives it in order.
    send_json(&mut op_tx, &serde_json::json!({"type": "input", "data": b64("ls\n")})).await?;
    match recv_frame(&mut agent_rx).await?.payload {
        Payload::TerminalCommand { op: picket_wire::TerminalOp::Input { data }, .. } => {
            assert_eq!(data, b64("ls\n"));
        }
        other => anyhow::bail!("expected input, got {}", other.type_name()),
    }

    // Agent produces output; the operator sees it in order.
    for (seq, chunk) in [(0u64, "one-"), (1, "two")] {
        send_frame(
            &mut agent_tx,
            &Frame::new(Payload::TerminalOutput {
                session_id: session_id.clone(),
                data: b64(chunk),
                seq,
            }),
        )
        .await?;
    }
    let mut combined = String::new();
    while !combined.contains("one-two") {
        let reply = recv_json(&mut op_rx).await?;
        anyhow::ensure!(reply["type"] == "terminal_output", "got {reply}");
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(reply["output"].as_str().unwrap_or_default())?;
        combined.push_str(&String::from_utf8_lossy(&decoded));
    }

    // Agent closes the session; the operator hears about it across
    // replicas.
    send_frame(
        &mut agent_tx,
        &Frame::new(Payload::TerminalClosed { session_id: session_id.clone() }),
    )
    .await?;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        anyhow::ensure!(tokio::time::Instant::now() < deadline, "closed never arrived");
        let reply = recv_json(&mut op_rx).await?;
        if reply["type"] == "terminal_closed" {
            break;
        }
    }

    r1.stop().await;
    r2.stop().await;
    Ok(())
}
