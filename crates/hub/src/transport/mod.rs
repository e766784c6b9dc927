// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP + WebSocket transport for the hub.

pub mod agent_ws;
pub mod http;
pub mod operator_msg;
pub mod operator_ws;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::HubState;

/// Build the axum `Router` with all hub routes.
pub fn build_router(state: Arc<HubState>) -> Router {
    Router::new()
        // Health and fleet listing
        .route("/api/v1/health", get(http::health))
        .route("/api/v1/agents", get(http::list_agents))
        // Out-of-band command to a locally-homed agent
        .route("/api/v1/agents/{agent_id}/command", post(http::agent_command))
        // Agent transport
        .route("/ws/agent", get(agent_ws::agent_ws_handler))
        // Operator terminal
        .route("/terminal/{agent_id}", get(operator_ws::operator_ws_handler))
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
