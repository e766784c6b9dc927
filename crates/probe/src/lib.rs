// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Picket probe: the field agent. Keeps one connection to the hub,
//! heartbeats, submits inventory on a cadence, and serves terminal
//! sessions against a local PTY.

pub mod backoff;
pub mod collector;
pub mod config;
pub mod conn;
pub mod run;
pub mod terminal;

/// Version reported in hello and heartbeat frames.
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");
