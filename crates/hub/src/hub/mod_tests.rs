// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use picket_wire::{CloseReason, Frame, Payload};

use super::*;

fn heartbeat_ack() -> Frame {
    Frame::new(Payload::HeartbeatAck { server_time_s: 0 })
}

#[tokio::test]
async fn send_to_unknown_agent_is_not_here() {
    let hub = ConnectionHub::new();
    let result = hub.send("ghost", heartbeat_ack()).await;
    assert_eq!(result, Err(SendError::NotHere));
}

#[tokio::test]
async fn send_reaches_the_write_queue() -> anyhow::Result<()> {
    let hub = ConnectionHub::new();
    let (handle, mut rx) = AgentHandle::new("probe-1", "0.4.2");
    hub.insert(handle).await;

    hub.send("probe-1", heartbeat_ack()).await.map_err(|e| anyhow::anyhow!("{e}"))?;
    let frame = rx.recv().await;
    assert!(matches!(frame.map(|f| f.payload), Some(Payload::HeartbeatAck { .. })));
    Ok(())
}

#[tokio::test]
async fn queue_overflow_closes_with_backpressure() {
    let (handle, _rx) = AgentHandle::new("probe-1", "0.4.2");

    // Fill the bounded queue without draining it.
    let mut overflowed = false;
    for _ in 0..=picket_wire::limits::WRITE_QUEUE_FRAMES {
        if handle.enqueue(heartbeat_ack()) == Err(SendError::Backpressure) {
            overflowed = true;
            break;
        }
    }
    assert!(overflowed, "overflow must surface as backpressure");
    assert!(handle.cancel.is_cancelled());
    assert_eq!(handle.close_reason(), CloseReason::Backpressure);
}

#[tokio::test]
async fn first_close_reason_wins() {
    let (handle, _rx) = AgentHandle::new("probe-1", "0.4.2");
    handle.begin_close(CloseReason::Stalled);
    handle.begin_close(CloseReason::Shutdown);
    assert_eq!(handle.close_reason(), CloseReason::Stalled);
}

#[tokio::test]
async fn insert_returns_displaced_duplicate() {
    let hub = ConnectionHub::new();
    let (old, _old_rx) = AgentHandle::new("probe-1", "0.4.1");
    let (new, _new_rx) = AgentHandle::new("probe-1", "0.4.2");

    assert!(hub.insert(Arc::clone(&old)).await.is_none());
    let displaced = hub.insert(Arc::clone(&new)).await;
    assert!(displaced.is_some_and(|h| Arc::ptr_eq(&h, &old)));
}

#[tokio::test]
async fn remove_if_spares_a_newer_transport() {
    let hub = ConnectionHub::new();
    let (old, _old_rx) = AgentHandle::new("probe-1", "0.4.1");
    let (new, _new_rx) = AgentHandle::new("probe-1", "0.4.2");
    hub.insert(Arc::clone(&old)).await;
    hub.insert(Arc::clone(&new)).await;

    // The old transport's cleanup must not remove the new entry.
    assert!(!hub.remove_if("probe-1", &old).await);
    assert!(hub.contains("probe-1").await);

    assert!(hub.remove_if("probe-1", &new).await);
    assert!(!hub.contains("probe-1").await);
}

#[tokio::test]
async fn drain_all_closes_every_transport() {
    let hub = ConnectionHub::new();
    let (a, _a_rx) = AgentHandle::new("probe-1", "0.4.2");
    let (b, _b_rx) = AgentHandle::new("probe-2", "0.4.2");
    hub.insert(Arc::clone(&a)).await;
    hub.insert(Arc::clone(&b)).await;

    hub.drain_all(CloseReason::Shutdown).await;
    assert_eq!(a.close_reason(), CloseReason::Shutdown);
    assert_eq!(b.close_reason(), CloseReason::Shutdown);
}
