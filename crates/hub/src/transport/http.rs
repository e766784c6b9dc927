// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! REST surface: health, fleet listing, and out-of-band agent commands.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::Json;
use picket_wire::{ErrorCode, Frame, Payload};
use serde::{Deserialize, Serialize};

use crate::directory::PresenceStatus;
use crate::error::to_http_response;
use crate::hub::SendError;
use crate::state::{HubState, SERVER_VERSION};

/// How long `agent_command` waits for the probe's response.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize)]
pub struct HealthReply {
    pub status: &'static str,
    pub replica_id: String,
    pub server_version: &'static str,
    pub uptime_s: u64,
    pub connected_agents: usize,
    pub open_sessions: usize,
}

/// `GET /api/v1/health`
pub async fn health(State(state): State<Arc<HubState>>) -> Json<HealthReply> {
    Json(HealthReply {
        status: "running",
        replica_id: state.replica_id.clone(),
        server_version: SERVER_VERSION,
        uptime_s: state.started_at.elapsed().as_secs(),
        connected_agents: state.hub.len().await,
        open_sessions: state.broker.session_count().await,
    })
}

#[derive(Debug, Serialize)]
pub struct AgentListEntry {
    pub agent_id: String,
    pub status: PresenceStatus,
    pub replica_id: String,
    pub connected_at: i64,
    pub last_heartbeat: i64,
    pub agent_version: String,
    pub uptime_s: u64,
}

/// `GET /api/v1/agents` — live presence entries across the fleet.
pub async fn list_agents(State(state): State<Arc<HubState>>) -> impl IntoResponse {
    match state.directory.list().await {
        Ok(entries) => {
            let agents: Vec<AgentListEntry> = entries
                .into_iter()
                .map(|e| AgentListEntry {
                    agent_id: e.agent_id,
                    status: e.status,
                    replica_id: e.replica_id,
                    connected_at: e.connected_at,
                    last_heartbeat: e.last_heartbeat,
                    agent_version: e.agent_version,
                    uptime_s: e.uptime_s,
                })
                .collect();
            Json(serde_json::json!({ "agents": agents })).into_response()
        }
        Err(e) => to_http_response(ErrorCode::Unavailable, e.to_string()).into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct CommandRequest {
    pub name: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// `POST /api/v1/agents/{agent_id}/command` — send a `command` frame to a
/// locally-homed agent and wait for its `command_response`.
///
/// Commands are not proxied across replicas; callers follow the
/// `replica_id` from the listing to the owning replica.
pub async fn agent_command(
    State(state): State<Arc<HubState>>,
    Path(agent_id): Path<String>,
    Json(request): Json<CommandRequest>,
) -> impl IntoResponse {
    let message_id = uuid::Uuid::new_v4().to_string();
    let response_rx = state.register_command(&message_id).await;

    let frame = Frame::with_message_id(
        Payload::Command { name: request.name, params: request.params },
        message_id.clone(),
    );
    if let Err(e) = state.hub.send(&agent_id, frame).await {
        state.abandon_command(&message_id).await;
        let code = match e {
            SendError::NotHere => ErrorCode::AgentOffline,
            SendError::Backpressure | SendError::Closed => ErrorCode::Unavailable,
        };
        return to_http_response(code, format!("cannot reach agent: {e}")).into_response();
    }

    match tokio::time::timeout(COMMAND_TIMEOUT, response_rx).await {
        Ok(Ok(Payload::CommandResponse { ok, result, error })) => Json(serde_json::json!({
            "ok": ok,
            "result": result,
            "error": error,
        }))
        .into_response(),
        Ok(Ok(_)) | Ok(Err(_)) => {
            to_http_response(ErrorCode::Internal, "command correlation lost").into_response()
        }
        Err(_) => {
            state.abandon_command(&message_id).await;
            to_http_response(ErrorCode::Unavailable, "agent did not respond").into_response()
        }
    }
}

#[cfg(test)]
#[path = "http_tests.rs"]
mod tests;
