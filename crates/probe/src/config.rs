// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

/// Configuration for the probe agent.
#[derive(Debug, Clone, clap::Parser)]
#[command(name = "picket", about = "Fleet probe: connects a host to the picket hub")]
pub struct ProbeConfig {
    /// Hub base URL (http or https; upgraded to ws/wss internally).
    #[arg(long, default_value = "http://127.0.0.1:9600", env = "PICKET_SERVER_URL")]
    pub server_url: String,

    /// Identity of this agent, as registered with the hub.
    #[arg(long, env = "PICKET_AGENT_ID")]
    pub agent_id: String,

    /// Shared secret for the hello handshake.
    #[arg(long, env = "PICKET_SECRET")]
    pub secret: String,

    /// Heartbeat cadence used until the welcome frame overrides it.
    #[arg(long, default_value_t = 15, env = "PICKET_HEARTBEAT_INTERVAL_S")]
    pub heartbeat_interval_s: u64,

    /// Inventory cadence used until the welcome frame overrides it.
    #[arg(long, default_value_t = 900, env = "PICKET_INVENTORY_INTERVAL_S")]
    pub inventory_interval_s: u64,

    /// Shell for terminal sessions; falls back to $SHELL, then /bin/sh.
    #[arg(long, env = "PICKET_SHELL")]
    pub shell: Option<String>,

    /// Initial reconnect backoff.
    #[arg(long, default_value_t = 1000, env = "PICKET_RECONNECT_BASE_MS")]
    pub reconnect_base_ms: u64,

    /// Reconnect backoff ceiling.
    #[arg(long, default_value_t = 60000, env = "PICKET_RECONNECT_MAX_MS")]
    pub reconnect_max_ms: u64,
}

impl ProbeConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_s)
    }

    pub fn inventory_interval(&self) -> Duration {
        Duration::from_secs(self.inventory_interval_s)
    }

    pub fn reconnect_base(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }
}
