// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

/// Configuration for a hub replica.
#[derive(Debug, Clone, clap::Parser)]
#[command(name = "pickethub", about = "Fleet hub: probe connections, presence, terminal relay")]
pub struct HubConfig {
    /// Host to bind on.
    #[arg(long, default_value = "127.0.0.1", env = "PICKET_HUB_HOST")]
    pub host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 9600, env = "PICKET_HUB_PORT")]
    pub port: u16,

    /// Stable identity of this replica in the presence directory.
    /// Generated per-process when unset.
    #[arg(long, env = "PICKET_HUB_REPLICA_ID")]
    pub replica_id: Option<String>,

    /// NATS server URL backing the presence directory. When unset the hub
    /// runs with an in-process directory and cannot join a replica fleet.
    #[arg(long, env = "PICKET_HUB_NATS_URL")]
    pub nats_url: Option<String>,

    /// Token for NATS authentication.
    #[arg(long, env = "PICKET_HUB_NATS_TOKEN")]
    pub nats_token: Option<String>,

    /// Subject prefix for directory traffic.
    #[arg(long, default_value = "picket", env = "PICKET_HUB_SUBJECT_PREFIX")]
    pub subject_prefix: String,

    /// Auth authority base URL. When unset, credentials come from
    /// `--auth-seed` instead.
    #[arg(long, env = "PICKET_HUB_AUTH_URL")]
    pub auth_url: Option<String>,

    /// JSON seed file for the static authority (development / tests).
    #[arg(long, env = "PICKET_HUB_AUTH_SEED")]
    pub auth_seed: Option<std::path::PathBuf>,

    /// Snapshot store base URL. When unset, snapshots are kept in memory
    /// and lost on restart.
    #[arg(long, env = "PICKET_HUB_SNAPSHOT_URL")]
    pub snapshot_url: Option<String>,

    /// Expected probe heartbeat cadence, advertised in the welcome frame.
    #[arg(long, default_value_t = 15, env = "PICKET_HUB_HEARTBEAT_INTERVAL_S")]
    pub heartbeat_interval_s: u64,

    /// Close a probe transport after this long without a heartbeat.
    #[arg(long, default_value_t = 35, env = "PICKET_HUB_HEARTBEAT_MISS_S")]
    pub heartbeat_miss_s: u64,

    /// Presence entry TTL. Must be strictly greater than twice the
    /// heartbeat interval.
    #[arg(long, default_value_t = 45, env = "PICKET_HUB_PRESENCE_TTL_S")]
    pub presence_ttl_s: u64,

    /// Inventory cadence advertised in the welcome frame.
    #[arg(long, default_value_t = 900, env = "PICKET_HUB_INVENTORY_INTERVAL_S")]
    pub inventory_interval_s: u64,

    /// How long to wait for a previous owner to release an agent during a
    /// cross-replica handover.
    #[arg(long, default_value_t = 5, env = "PICKET_HUB_HANDOVER_WAIT_S")]
    pub handover_wait_s: u64,

    /// Tear down a terminal session after this long with no bytes in
    /// either direction.
    #[arg(long, default_value_t = 600, env = "PICKET_HUB_SESSION_IDLE_S")]
    pub session_idle_s: u64,

    /// Deadline for a single outbound socket write.
    #[arg(long, default_value_t = 10, env = "PICKET_HUB_WRITE_TIMEOUT_S")]
    pub write_timeout_s: u64,

    /// Deadline for the first (hello) frame of a probe handshake, and for
    /// the operator's opening frame.
    #[arg(long, default_value_t = 10, env = "PICKET_HUB_HANDSHAKE_TIMEOUT_S")]
    pub handshake_timeout_s: u64,

    /// How long an operator waits for `terminal_ready` before the open
    /// attempt fails.
    #[arg(long, default_value_t = 10, env = "PICKET_HUB_READY_TIMEOUT_S")]
    pub ready_timeout_s: u64,

    /// Grace period for draining transports at shutdown.
    #[arg(long, default_value_t = 5, env = "PICKET_HUB_DRAIN_S")]
    pub drain_s: u64,
}

impl HubConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_s)
    }

    pub fn heartbeat_miss(&self) -> Duration {
        Duration::from_secs(self.heartbeat_miss_s)
    }

    pub fn presence_ttl(&self) -> Duration {
        Duration::from_secs(self.presence_ttl_s)
    }

    pub fn handover_wait(&self) -> Duration {
        Duration::from_secs(self.handover_wait_s)
    }

    pub fn session_idle(&self) -> Duration {
        Duration::from_secs(self.session_idle_s)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_s)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_s)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_s)
    }

    pub fn drain(&self) -> Duration {
        Duration::from_secs(self.drain_s)
    }

    /// Reject interval combinations that break the liveness invariants.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.presence_ttl_s <= 2 * self.heartbeat_interval_s {
            anyhow::bail!(
                "presence TTL ({}s) must exceed twice the heartbeat interval ({}s)",
                self.presence_ttl_s,
                self.heartbeat_interval_s
            );
        }
        if self.heartbeat_miss_s <= self.heartbeat_interval_s {
            anyhow::bail!(
                "heartbeat miss window ({}s) must exceed the heartbeat interval ({}s)",
                self.heartbeat_miss_s,
                self.heartbeat_interval_s
            );
        }
        if self.heartbeat_miss_s >= self.presence_ttl_s {
            anyhow::bail!(
                "heartbeat miss window ({}s) must be below the presence TTL ({}s); \
                 a transport must close before its presence entry can expire",
                self.heartbeat_miss_s,
                self.presence_ttl_s
            );
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
