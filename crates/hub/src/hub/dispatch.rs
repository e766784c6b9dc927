// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Inbound frame dispatch for agent transports.
//!
//! Recoverable violations answer with a typed `error` frame and keep the
//! transport open; timestamp skew and malformed frames close it.

use std::sync::Arc;

use picket_wire::limits::MAX_INVENTORY_BYTES;
use picket_wire::{epoch_s, CloseReason, ErrorCode, Frame, InventorySnapshot, Payload};

use crate::directory::{PresenceEntry, PresenceStatus, Touch};
use crate::hub::accept::error_frame;
use crate::hub::AgentHandle;
use crate::state::HubState;

/// Dispatch one decoded frame. `raw_len` is the wire size of the frame
/// text, used for the inventory cap. An `Err` closes the transport with
/// the given reason.
pub async fn handle_frame(
    state: &Arc<HubState>,
    handle: &Arc<AgentHandle>,
    frame: Frame,
    raw_len: usize,
) -> Result<(), CloseReason> {
    let now = epoch_s();
    if !frame.skew_ok(now) {
        let _ = handle.enqueue(error_frame(ErrorCode::InvalidMessage, "timestamp outside tolerance"));
        return Err(CloseReason::Normal);
    }

    let Frame { payload, message_id, .. } = frame;
    match payload {
        Payload::Heartbeat { uptime_s, .. } => {
            handle_heartbeat(state, handle, now, uptime_s).await;
        }

        Payload::Inventory(snapshot) => {
            handle_inventory(state, handle, snapshot, raw_len).await;
        }

        payload @ (Payload::TerminalOutput { .. }
        | Payload::TerminalReady { .. }
        | Payload::TerminalError { .. }
        | Payload::TerminalClosed { .. }) => {
            state.broker.on_agent_frame(state, &handle.agent_id, payload).await;
        }

        response @ Payload::CommandResponse { .. } => match message_id {
            Some(id) => state.complete_command(&id, response).await,
            None => {
                tracing::debug!(agent_id = %handle.agent_id, "command_response without message_id");
            }
        },

        Payload::Error { code, message } => {
            tracing::warn!(agent_id = %handle.agent_id, code = %code, message = %message, "agent error frame");
        }

        Payload::Hello { .. } => {
            let _ = handle.enqueue(error_frame(ErrorCode::InvalidMessage, "unexpected hello"));
        }

        other => {
            let _ = handle.enqueue(error_frame(
                ErrorCode::InvalidMessage,
                format!("unexpected frame type {}", other.type_name()),
            ));
        }
    }
    Ok(())
}

async fn handle_heartbeat(
    state: &Arc<HubState>,
    handle: &Arc<AgentHandle>,
    now: i64,
    uptime_s: u64,
) {
    handle.note_heartbeat(now, uptime_s);

    match state.directory.touch(&handle.agent_id, now, uptime_s).await {
        Ok(Touch::Refreshed) => {}
        Ok(Touch::Evicted) => {
            // Entry expired (e.g. directory restart); re-register.
            tracing::debug!(agent_id = %handle.agent_id, "presence evicted; re-registering");
            let entry = PresenceEntry {
                agent_id: handle.agent_id.clone(),
                status: PresenceStatus::Online,
                replica_id: state.replica_id.clone(),
                connected_at: handle.connected_at,
                last_heartbeat: now,
                agent_version: handle.agent_version.clone(),
                uptime_s,
            };
            if let Err(e) = state.directory.register(entry).await {
                tracing::debug!(err = %e, agent_id = %handle.agent_id, "re-register failed");
            }
        }
        Err(e) => {
            // Degraded mode: the transport stays up while heartbeats flow.
            tracing::debug!(err = %e, agent_id = %handle.agent_id, "presence touch failed");
        }
    }

    let _ = handle.enqueue(Frame::new(Payload::HeartbeatAck { server_time_s: now }));
}

async fn handle_inventory(
    state: &Arc<HubState>,
    handle: &Arc<AgentHandle>,
    snapshot: InventorySnapshot,
    raw_len: usize,
) {
    if raw_len > MAX_INVENTORY_BYTES {
        tracing::info!(agent_id = %handle.agent_id, raw_len, "rejecting oversize inventory");
        let _ = handle.enqueue(error_frame(ErrorCode::InvalidMessage, "inventory exceeds size cap"));
        return;
    }
    if snapshot.agent_id != handle.agent_id {
        let _ = handle.enqueue(error_frame(ErrorCode::InvalidMessage, "inventory agent_id mismatch"));
        return;
    }

    let prev_digest = match state.snapshots.latest(&handle.agent_id).await {
        Ok(prev) => prev.map(|s| s.digest()),
        Err(_) => None,
    };

    // Write-through before the ack: an acknowledged snapshot is durable.
    match state.snapshots.put_inventory(&snapshot).await {
        Ok(advanced) => {
            let changed = advanced && prev_digest != Some(snapshot.digest());
            let _ = handle.enqueue(Frame::new(Payload::InventoryAck { received: true, changed }));
        }
        Err(e) => {
            tracing::warn!(err = %e, agent_id = %handle.agent_id, "snapshot write failed");
            let _ = handle.enqueue(error_frame(ErrorCode::Unavailable, "snapshot store unavailable"));
        }
    }
}

#[cfg(test)]
#[path = "dispatch_tests.rs"]
mod tests;
