// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Snapshot store seam: write-through persistence for accepted
//! inventories. The ack to the probe is sent only after `put_inventory`
//! returns, so every acknowledged snapshot is durable.

use std::collections::HashMap;
use std::fmt;

use picket_wire::InventorySnapshot;
use tokio::sync::RwLock;

#[derive(Debug)]
pub enum SnapshotError {
    Unavailable(String),
}

impl fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable(msg) => write!(f, "snapshot store unavailable: {msg}"),
        }
    }
}

impl std::error::Error for SnapshotError {}

pub type SnapResult<T> = Result<T, SnapshotError>;

#[async_trait::async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Append a snapshot. Returns true when the latest-snapshot pointer
    /// advanced; an out-of-order older snapshot is stored but does not
    /// move the pointer.
    async fn put_inventory(&self, snapshot: &InventorySnapshot) -> SnapResult<bool>;

    /// Snapshot the latest pointer refers to.
    async fn latest(&self, agent_id: &str) -> SnapResult<Option<InventorySnapshot>>;
}

// -- HTTP client --------------------------------------------------------------

pub struct HttpSnapshotStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSnapshotStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { client: reqwest::Client::new(), base_url: base_url.into() }
    }
}

fn unavailable(e: impl fmt::Display) -> SnapshotError {
    SnapshotError::Unavailable(e.to_string())
}

#[async_trait::async_trait]
impl SnapshotStore for HttpSnapshotStore {
    async fn put_inventory(&self, snapshot: &InventorySnapshot) -> SnapResult<bool> {
        #[derive(serde::Deserialize)]
        struct Reply {
            advanced: bool,
        }
        let url = format!("{}/v1/inventory/{}", self.base_url, snapshot.agent_id);
        let reply: Reply = self
            .client
            .post(&url)
            .json(snapshot)
            .send()
            .await
            .map_err(unavailable)?
            .error_for_status()
            .map_err(unavailable)?
            .json()
            .await
            .map_err(unavailable)?;
        Ok(reply.advanced)
    }

    async fn latest(&self, agent_id: &str) -> SnapResult<Option<InventorySnapshot>> {
        let url = format!("{}/v1/inventory/{agent_id}/latest", self.base_url);
        let response = self.client.get(&url).send().await.map_err(unavailable)?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let snapshot = response
            .error_for_status()
            .map_err(unavailable)?
            .json()
            .await
            .map_err(unavailable)?;
        Ok(Some(snapshot))
    }
}

// -- In-memory store ----------------------------------------------------------

/// Append-only in-process store for tests and storeless development runs.
#[derive(Default)]
pub struct MemoryStore {
    log: RwLock<Vec<InventorySnapshot>>,
    latest: RwLock<HashMap<String, InventorySnapshot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of appended snapshots across all agents.
    pub async fn len(&self) -> usize {
        self.log.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.log.read().await.is_empty()
    }
}

#[async_trait::async_trait]
impl SnapshotStore for MemoryStore {
    async fn put_inventory(&self, snapshot: &InventorySnapshot) -> SnapResult<bool> {
        self.log.write().await.push(snapshot.clone());
        let mut latest = self.latest.write().await;
        let advanced = latest
            .get(&snapshot.agent_id)
            .is_none_or(|prev| snapshot.collected_at > prev.collected_at);
        if advanced {
            latest.insert(snapshot.agent_id.clone(), snapshot.clone());
        }
        Ok(advanced)
    }

    async fn latest(&self, agent_id: &str) -> SnapResult<Option<InventorySnapshot>> {
        Ok(self.latest.read().await.get(agent_id).cloned())
    }
}

#[cfg(test)]
#[path = "snapshot_tests.rs"]
mod tests;
