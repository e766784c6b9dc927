// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Inventory snapshot schema: the canonical host description a probe
//! submits on its inventory cadence, plus an open `extensions` map for
//! platform-specific detail the hub stores but does not interpret.

use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// Point-in-time description of a probe host.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InventorySnapshot {
    pub agent_id: String,
    /// Unix seconds at collection time. The hub's latest-snapshot pointer
    /// only advances when this is newer than the stored pointer.
    pub collected_at: i64,
    pub hostname: String,
    pub os: String,
    pub platform: String,
    pub architecture: String,
    pub cpu_count: u32,
    pub cpu_model: String,
    pub memory_total: u64,
    pub memory_used: u64,
    pub memory_free: u64,
    pub disk_total: u64,
    pub disk_used: u64,
    pub disk_free: u64,
    pub ip_list: Vec<String>,
    pub mac_list: Vec<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extensions: serde_json::Map<String, serde_json::Value>,
}

impl InventorySnapshot {
    /// Stable digest over the descriptive fields, used for the
    /// `inventory_ack.changed` flag. Excludes `collected_at` and the
    /// usage gauges so a quiet host does not report as changed every
    /// cadence.
    pub fn digest(&self) -> u64 {
        let mut h = std::collections::hash_map::DefaultHasher::new();
        self.agent_id.hash(&mut h);
        self.hostname.hash(&mut h);
        self.os.hash(&mut h);
        self.platform.hash(&mut h);
        self.architecture.hash(&mut h);
        self.cpu_count.hash(&mut h);
        self.cpu_model.hash(&mut h);
        self.memory_total.hash(&mut h);
        self.disk_total.hash(&mut h);
        self.ip_list.hash(&mut h);
        self.mac_list.hash(&mut h);
        // Extensions participate via their serialized form; the map is
        // ordered by serde_json, so the digest is stable.
        if let Ok(ext) = serde_json::to_string(&self.extensions) {
            ext.hash(&mut h);
        }
        h.finish()
    }
}

#[cfg(test)]
#[path = "inventory_tests.rs"]
mod tests;
