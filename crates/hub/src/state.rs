// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use picket_wire::Payload;
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use crate::authority::Authority;
use crate::broker::SessionBroker;
use crate::config::HubConfig;
use crate::directory::Directory;
use crate::hub::ConnectionHub;
use crate::snapshot::SnapshotStore;

pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Shared state of one hub replica. Constructed once at startup and
/// passed into every task; there are no process-wide singletons.
pub struct HubState {
    pub config: HubConfig,
    pub replica_id: String,
    pub started_at: Instant,
    pub shutdown: CancellationToken,
    pub hub: ConnectionHub,
    pub broker: SessionBroker,
    pub directory: Arc<dyn Directory>,
    pub snapshots: Arc<dyn SnapshotStore>,
    pub authority: Arc<dyn Authority>,
    /// In-flight `command` frames awaiting a `command_response`, keyed by
    /// `message_id`.
    pending_commands: Mutex<HashMap<String, oneshot::Sender<Payload>>>,
}

impl HubState {
    pub fn new(
        config: HubConfig,
        directory: Arc<dyn Directory>,
        snapshots: Arc<dyn SnapshotStore>,
        authority: Arc<dyn Authority>,
        shutdown: CancellationToken,
    ) -> Self {
        let replica_id = config
            .replica_id
            .clone()
            .unwrap_or_else(|| format!("replica-{}", uuid::Uuid::new_v4()));
        Self {
            config,
            replica_id,
            started_at: Instant::now(),
            shutdown,
            hub: ConnectionHub::new(),
            broker: SessionBroker::new(),
            directory,
            snapshots,
            authority,
            pending_commands: Mutex::new(HashMap::new()),
        }
    }

    /// Register interest in the response to `message_id`.
    pub async fn register_command(&self, message_id: &str) -> oneshot::Receiver<Payload> {
        let (tx, rx) = oneshot::channel();
        self.pending_commands.lock().await.insert(message_id.to_owned(), tx);
        rx
    }

    /// Correlate an inbound `command_response` with its waiter.
    pub async fn complete_command(&self, message_id: &str, payload: Payload) {
        if let Some(tx) = self.pending_commands.lock().await.remove(message_id) {
            let _ = tx.send(payload);
        } else {
            tracing::debug!(message_id, "command_response with no pending command");
        }
    }

    /// Drop a pending command that timed out.
    pub async fn abandon_command(&self, message_id: &str) {
        self.pending_commands.lock().await.remove(message_id);
    }
}
