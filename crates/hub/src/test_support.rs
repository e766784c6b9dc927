// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared fixtures for unit tests: a config with the recommended timing
//! constants and a hub state wired to in-memory backends.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::authority::{AgentSeed, AuthoritySeed, StaticAuthority, TokenSeed};
use crate::config::HubConfig;
use crate::directory::memory::MemoryDirectory;
use crate::snapshot::MemoryStore;
use crate::state::HubState;

pub fn test_config() -> HubConfig {
    HubConfig {
        host: "127.0.0.1".into(),
        port: 0,
        replica_id: Some("replica-test".into()),
        nats_url: None,
        nats_token: None,
        subject_prefix: "picket".into(),
        auth_url: None,
        auth_seed: None,
        snapshot_url: None,
        heartbeat_interval_s: 15,
        heartbeat_miss_s: 35,
        presence_ttl_s: 45,
        inventory_interval_s: 900,
        handover_wait_s: 5,
        session_idle_s: 600,
        write_timeout_s: 10,
        handshake_timeout_s: 10,
        ready_timeout_s: 10,
        drain_s: 5,
    }
}

pub fn seeded_authority() -> StaticAuthority {
    StaticAuthority::from_seed(AuthoritySeed {
        agents: vec![AgentSeed {
            agent_id: "probe-1".into(),
            secret: "sesame".into(),
            owner_id: "op-1".into(),
        }],
        tokens: vec![TokenSeed { token: "tok-ops".into(), operator_id: "op-1".into() }],
    })
}

pub struct TestBackends {
    pub directory: Arc<MemoryDirectory>,
    pub snapshots: Arc<MemoryStore>,
    pub authority: Arc<StaticAuthority>,
}

pub fn test_state() -> (Arc<HubState>, TestBackends) {
    test_state_with(test_config())
}

pub fn test_state_with(config: HubConfig) -> (Arc<HubState>, TestBackends) {
    let directory = Arc::new(MemoryDirectory::new(config.presence_ttl()));
    let snapshots = Arc::new(MemoryStore::new());
    let authority = Arc::new(seeded_authority());
    let dyn_directory: Arc<dyn crate::directory::Directory> = directory.clone();
    let dyn_snapshots: Arc<dyn crate::snapshot::SnapshotStore> = snapshots.clone();
    let dyn_authority: Arc<dyn crate::authority::Authority> = authority.clone();
    let state = Arc::new(HubState::new(
        config,
        dyn_directory,
        dyn_snapshots,
        dyn_authority,
        CancellationToken::new(),
    ));
    (state, TestBackends { directory, snapshots, authority })
}
