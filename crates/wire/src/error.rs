// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error codes carried in `error` frames on both transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Auth,
    InvalidMessage,
    RateLimit,
    Unavailable,
    UnknownSession,
    Unauthorised,
    AgentOffline,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::InvalidMessage => "invalid_message",
            Self::RateLimit => "rate_limit",
            Self::Unavailable => "unavailable",
            Self::UnknownSession => "unknown_session",
            Self::Unauthorised => "unauthorised",
            Self::AgentOffline => "agent_offline",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reasons a transport is closed. Sent as the WebSocket close reason and
/// logged on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Auth,
    AgentOffline,
    Unauthorised,
    Backpressure,
    Stalled,
    DuplicateAgent,
    Shutdown,
    Normal,
    Internal,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::AgentOffline => "agent_offline",
            Self::Unauthorised => "unauthorised",
            Self::Backpressure => "backpressure",
            Self::Stalled => "stalled",
            Self::DuplicateAgent => "duplicate_agent",
            Self::Shutdown => "shutdown",
            Self::Normal => "normal",
            Self::Internal => "internal",
        }
    }

    /// WebSocket close code. `normal` maps to 1000; everything else uses
    /// the private 4000 range so clients can tell the reasons apart.
    pub fn ws_code(&self) -> u16 {
        match self {
            Self::Normal => 1000,
            Self::Shutdown => 1001,
            Self::Auth => 4001,
            Self::Unauthorised => 4003,
            Self::AgentOffline => 4004,
            Self::DuplicateAgent => 4005,
            Self::Backpressure => 4008,
            Self::Stalled => 4009,
            Self::Internal => 4011,
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
