// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Agent WebSocket upgrade. Authentication happens in-band via the hello
//! frame, so the upgrade itself is unconditional; shutdown is the only
//! gate here.

use std::sync::Arc;

use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;

use crate::hub::accept;
use crate::state::HubState;

/// `GET /ws/agent` — upgrade an agent transport.
pub async fn agent_ws_handler(
    State(state): State<Arc<HubState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    if state.shutdown.is_cancelled() {
        return axum::http::Response::builder()
            .status(503)
            .body(axum::body::Body::from("shutting down"))
            .unwrap_or_default()
            .into_response();
    }

    ws.on_upgrade(move |socket| accept::handle_agent_socket(state, socket)).into_response()
}
