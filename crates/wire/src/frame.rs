// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Frame envelope for the probe ⇄ hub protocol.
//!
//! Every frame is a JSON object `{"type": ..., "data": {...},
//! "timestamp": ..., "message_id"?: ...}`. The `type`/`data` pair is an
//! adjacently-tagged enum so dispatch is a `match`, not a string lookup.

use serde::{Deserialize, Serialize};

use crate::inventory::InventorySnapshot;

/// Maximum tolerated difference between a frame's `timestamp` and the
/// receiver's clock, in seconds. Frames outside the window are rejected
/// with `error{code=invalid_message}` and the transport is closed.
pub const MAX_CLOCK_SKEW_S: i64 = 300;

/// A single protocol frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    #[serde(flatten)]
    pub payload: Payload,
    /// Unix seconds at the sender when the frame was produced.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

impl Frame {
    /// Wrap a payload with the current time and no correlation id.
    pub fn new(payload: Payload) -> Self {
        Self { payload, timestamp: epoch_s(), message_id: None }
    }

    /// Wrap a payload with the current time and a correlation id.
    pub fn with_message_id(payload: Payload, message_id: impl Into<String>) -> Self {
        Self { payload, timestamp: epoch_s(), message_id: Some(message_id.into()) }
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn decode(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    /// True if the frame's timestamp is within [`MAX_CLOCK_SKEW_S`] of `now_s`.
    pub fn skew_ok(&self, now_s: i64) -> bool {
        (now_s - self.timestamp).abs() <= MAX_CLOCK_SKEW_S
    }
}

/// Frame payloads, tagged by the wire `type` with fields under `data`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Payload {
    /// First frame from a probe; authenticates the transport.
    Hello {
        agent_id: String,
        secret: String,
        agent_version: String,
    },
    /// Handshake reply; tells the probe its cadences.
    Welcome {
        server_version: String,
        heartbeat_interval_s: u64,
        inventory_interval_s: u64,
    },
    Heartbeat {
        status: String,
        uptime_s: u64,
        agent_version: String,
    },
    HeartbeatAck {
        server_time_s: i64,
    },
    Inventory(InventorySnapshot),
    InventoryAck {
        received: bool,
        changed: bool,
    },
    /// Hub → probe terminal control; `command` selects the operation.
    TerminalCommand {
        session_id: String,
        #[serde(flatten)]
        op: TerminalOp,
    },
    /// Probe → hub PTY output, base64 encoded, sequenced per session.
    TerminalOutput {
        session_id: String,
        data: String,
        seq: u64,
    },
    TerminalReady {
        session_id: String,
    },
    TerminalError {
        session_id: String,
        reason: String,
    },
    TerminalClosed {
        session_id: String,
    },
    /// Hub → probe out-of-band command, correlated by `message_id`.
    Command {
        name: String,
        #[serde(default)]
        params: serde_json::Value,
    },
    CommandResponse {
        ok: bool,
        #[serde(default)]
        result: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Error {
        code: String,
        message: String,
    },
}

impl Payload {
    /// Wire name of the frame type, matching the serialized `type` tag.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "hello",
            Self::Welcome { .. } => "welcome",
            Self::Heartbeat { .. } => "heartbeat",
            Self::HeartbeatAck { .. } => "heartbeat_ack",
            Self::Inventory(_) => "inventory",
            Self::InventoryAck { .. } => "inventory_ack",
            Self::TerminalCommand { .. } => "terminal_command",
            Self::TerminalOutput { .. } => "terminal_output",
            Self::TerminalReady { .. } => "terminal_ready",
            Self::TerminalError { .. } => "terminal_error",
            Self::TerminalClosed { .. } => "terminal_closed",
            Self::Command { .. } => "command",
            Self::CommandResponse { .. } => "command_response",
            Self::Error { .. } => "error",
        }
    }
}

/// Terminal operations carried inside `terminal_command` frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum TerminalOp {
    Init {
        rows: u16,
        cols: u16,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        shell: Option<String>,
    },
    Input {
        /// Base64-encoded raw bytes for the PTY.
        data: String,
    },
    Resize {
        rows: u16,
        cols: u16,
    },
    Close,
}

/// Current Unix time in whole seconds.
pub fn epoch_s() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
#[path = "frame_tests.rs"]
mod tests;
