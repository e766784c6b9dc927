// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Pickethub: fleet hub replica — probe connections, presence, inventory
//! ingest, and operator terminal relay.

pub mod authority;
pub mod broker;
pub mod config;
pub mod directory;
pub mod error;
pub mod hub;
pub mod snapshot;
pub mod state;
pub mod transport;

#[cfg(test)]
pub mod test_support;

use std::sync::Arc;
use std::time::Duration;

use picket_wire::CloseReason;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::authority::{Authority, HttpAuthority, StaticAuthority};
use crate::config::HubConfig;
use crate::directory::memory::MemoryDirectory;
use crate::directory::nats::NatsDirectory;
use crate::directory::{Directory, Envelope, PresenceStatus};
use crate::snapshot::{HttpSnapshotStore, MemoryStore, SnapshotStore};
use crate::state::HubState;
use crate::transport::build_router;

/// Cadence of the idle-session sweep.
const SWEEP_TICK: Duration = Duration::from_secs(30);

/// Run the hub until shutdown.
pub async fn run(config: HubConfig) -> anyhow::Result<()> {
    config.validate()?;
    let shutdown = CancellationToken::new();

    let directory: Arc<dyn Directory> = match &config.nats_url {
        Some(url) => Arc::new(
            NatsDirectory::connect(
                url,
                config.nats_token.as_deref(),
                &config.subject_prefix,
                config.presence_ttl(),
            )
            .await?,
        ),
        None => {
            tracing::warn!("no NATS URL configured; running single-replica with in-process directory");
            Arc::new(MemoryDirectory::new(config.presence_ttl()))
        }
    };

    let snapshots: Arc<dyn SnapshotStore> = match &config.snapshot_url {
        Some(url) => Arc::new(HttpSnapshotStore::new(url)),
        None => {
            tracing::warn!("no snapshot store configured; inventories are kept in memory");
            Arc::new(MemoryStore::new())
        }
    };

    let authority: Arc<dyn Authority> = match (&config.auth_url, &config.auth_seed) {
        (Some(url), _) => Arc::new(HttpAuthority::new(url)),
        (None, Some(path)) => Arc::new(StaticAuthority::load(path)?),
        (None, None) => {
            tracing::warn!("no authority configured; every credential will be rejected");
            Arc::new(StaticAuthority::default())
        }
    };

    let addr = format!("{}:{}", config.host, config.port);
    let state = Arc::new(HubState::new(config, directory, snapshots, authority, shutdown.clone()));

    spawn_background_tasks(Arc::clone(&state)).await?;
    spawn_signal_handler(shutdown);

    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(replica_id = %state.replica_id, "pickethub listening on {addr}");
    serve(state, listener).await
}

/// Serve an already-bound listener with the replica's state. Split from
/// [`run`] so tests can drive a hub on an ephemeral port.
pub async fn serve(state: Arc<HubState>, listener: TcpListener) -> anyhow::Result<()> {
    let shutdown = state.shutdown.clone();
    let drain = state.config.drain();
    let router = build_router(Arc::clone(&state));

    let graceful = shutdown.clone();
    let mut serve_task = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(graceful.cancelled_owned())
            .await
    });

    tokio::select! {
        result = &mut serve_task => result??,
        () = async {
            shutdown.cancelled().await;
            state.hub.drain_all(CloseReason::Shutdown).await;
            tokio::time::sleep(drain).await;
        } => {
            tracing::warn!("drain window lapsed; aborting remaining transports");
            serve_task.abort();
        }
    }

    shutdown_cleanup(&state).await;
    Ok(())
}

/// Replica heartbeat, inbox routing, status watching, idle sweeping.
pub async fn spawn_background_tasks(state: Arc<HubState>) -> anyhow::Result<()> {
    state.directory.announce_replica(&state.replica_id).await?;
    let mut inbox = state.directory.subscribe_inbox(&state.replica_id).await?;
    let mut status = state.directory.subscribe_status().await?;

    // Replica liveness heartbeat: re-announce well inside the TTL.
    let heartbeat_state = Arc::clone(&state);
    tokio::spawn(async move {
        let period = (heartbeat_state.config.presence_ttl() / 3).max(Duration::from_secs(1));
        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = heartbeat_state.shutdown.cancelled() => break,
                _ = tick.tick() => {
                    let replica_id = heartbeat_state.replica_id.clone();
                    if let Err(e) = heartbeat_state.directory.announce_replica(&replica_id).await {
                        tracing::warn!(err = %e, "replica announce failed");
                    }
                }
            }
        }
    });

    // Inbox: evictions go to the hub, terminal envelopes to the broker.
    let inbox_state = Arc::clone(&state);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = inbox_state.shutdown.cancelled() => break,
                envelope = inbox.recv() => {
                    let Some(envelope) = envelope else { break };
                    match envelope {
                        Envelope::Evict { agent_id, new_replica_id } => {
                            tracing::info!(
                                agent_id = %agent_id,
                                new_replica_id = %new_replica_id,
                                "evicting agent for cross-replica handover"
                            );
                            inbox_state.hub.close(&agent_id, CloseReason::DuplicateAgent).await;
                        }
                        other => inbox_state.broker.on_envelope(&inbox_state, other).await,
                    }
                }
            }
        }
    });

    // Status transitions: close sessions toward agents that went offline
    // elsewhere, and drop stale local transports after a handover we
    // somehow missed.
    let status_state = Arc::clone(&state);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = status_state.shutdown.cancelled() => break,
                event = status.recv() => {
                    let Some(event) = event else { break };
                    if event.replica_id == status_state.replica_id {
                        continue;
                    }
                    match event.status {
                        PresenceStatus::Offline => {
                            status_state.broker.agent_offline(&status_state, &event.agent_id).await;
                        }
                        PresenceStatus::Online => {
                            if status_state.hub.contains(&event.agent_id).await {
                                tracing::info!(
                                    agent_id = %event.agent_id,
                                    new_replica_id = %event.replica_id,
                                    "agent re-homed elsewhere; dropping local transport"
                                );
                                status_state
                                    .hub
                                    .close(&event.agent_id, CloseReason::DuplicateAgent)
                                    .await;
                            }
                        }
                    }
                }
            }
        }
    });

    // Idle sweep for terminal sessions.
    let sweep_state = Arc::clone(&state);
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(SWEEP_TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = sweep_state.shutdown.cancelled() => break,
                _ = tick.tick() => {
                    let idle_s = sweep_state.config.session_idle_s as i64;
                    sweep_state.broker.sweep_idle(&sweep_state, idle_s).await;
                }
            }
        }
    });

    Ok(())
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut term = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate(),
            ) {
                Ok(term) => term,
                Err(e) => {
                    tracing::warn!(err = %e, "cannot install SIGTERM handler");
                    let _ = tokio::signal::ctrl_c().await;
                    shutdown.cancel();
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        tracing::info!("shutdown signal received");
        shutdown.cancel();
    });
}

async fn shutdown_cleanup(state: &Arc<HubState>) {
    state.broker.close_all(state).await;
    state.hub.drain_all(CloseReason::Shutdown).await;
    for agent_id in state.hub.agent_ids().await {
        if let Err(e) = state.directory.deregister(&agent_id, &state.replica_id).await {
            tracing::debug!(err = %e, agent_id = %agent_id, "shutdown deregister failed");
        }
    }
    if let Err(e) = state.directory.retire_replica(&state.replica_id).await {
        tracing::debug!(err = %e, "replica retire failed");
    }
}
