// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Operator-facing message vocabulary for `/terminal/{agent_id}`.
//!
//! The operator's first frame is a bare `{cols, rows, shell?}` object;
//! every later inbound frame is internally tagged. Input and output byte
//! payloads are base64 so arbitrary terminal bytes survive the JSON
//! envelope.

use serde::{Deserialize, Serialize};

use crate::broker::OperatorEvent;

/// Opening frame: requested dimensions and optional shell override.
#[derive(Debug, Clone, Deserialize)]
pub struct TermOpen {
    pub cols: u16,
    pub rows: u16,
    #[serde(default)]
    pub shell: Option<String>,
}

/// Frames the operator sends after the session is open.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperatorRequest {
    Input { data: String },
    Resize { cols: u16, rows: u16 },
}

/// Frames the hub sends to the operator.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperatorReply {
    TerminalReady { session_id: String },
    TerminalOutput { output: String },
    TerminalError { code: String, message: String },
    TerminalClosed {},
}

impl From<OperatorEvent> for OperatorReply {
    fn from(event: OperatorEvent) -> Self {
        match event {
            OperatorEvent::Output { data } => Self::TerminalOutput { output: data },
            OperatorEvent::Error { code, message } => {
                Self::TerminalError { code: code.as_str().to_owned(), message }
            }
            OperatorEvent::Closed => Self::TerminalClosed {},
        }
    }
}
