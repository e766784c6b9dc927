// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Presence directory: the cross-replica answer to "is agent A online,
//! and which replica holds its transport?"
//!
//! Backed by a shared key-value + pub/sub store ([`nats::NatsDirectory`])
//! in production, or by an in-process implementation
//! ([`memory::MemoryDirectory`]) for tests and single-replica runs.

pub mod memory;
pub mod nats;

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Presence status of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Offline,
}

/// Ephemeral presence record for a connected agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub agent_id: String,
    pub status: PresenceStatus,
    pub replica_id: String,
    /// Unix seconds when the transport was accepted.
    pub connected_at: i64,
    /// Unix seconds of the last observed heartbeat.
    pub last_heartbeat: i64,
    #[serde(default)]
    pub agent_version: String,
    #[serde(default)]
    pub uptime_s: u64,
}

/// Result of a `touch`: either the entry TTL was refreshed, or the entry
/// had already expired and the caller must re-register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Touch {
    Refreshed,
    Evicted,
}

/// Agent status transition broadcast to every replica.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusEvent {
    pub agent_id: String,
    pub status: PresenceStatus,
    pub replica_id: String,
}

/// Point-to-point envelope addressed to a named replica's inbox.
///
/// Terminal envelopes in the operator → agent direction share one
/// monotonic `seq` per session; output travels with the agent-assigned
/// sequence. Receivers reorder and dedupe, so delivery may be
/// at-least-once and unordered.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Envelope {
    /// Ask the previous owner to release an agent that reconnected
    /// elsewhere.
    Evict { agent_id: String, new_replica_id: String },
    TerminalOpen {
        session_id: String,
        agent_id: String,
        rows: u16,
        cols: u16,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        shell: Option<String>,
        /// Replica anchoring the operator side; replies go here.
        return_to: String,
    },
    TerminalInput { session_id: String, data: String, seq: u64 },
    TerminalResize { session_id: String, rows: u16, cols: u16, seq: u64 },
    TerminalClose { session_id: String, seq: u64 },
    TerminalReady { session_id: String },
    TerminalOutput { session_id: String, data: String, seq: u64 },
    TerminalError { session_id: String, reason: String },
    TerminalClosed { session_id: String },
}

/// Directory operation failures.
#[derive(Debug)]
pub enum DirectoryError {
    /// The backing store is unreachable; callers fail fast and the hub
    /// degrades per the connection policy.
    Unavailable(String),
    /// `deliver` target is not a live replica.
    NoSuchReplica(String),
}

impl fmt::Display for DirectoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable(msg) => write!(f, "directory unavailable: {msg}"),
            Self::NoSuchReplica(id) => write!(f, "no such replica: {id}"),
        }
    }
}

impl std::error::Error for DirectoryError {}

pub type DirResult<T> = Result<T, DirectoryError>;

/// Cross-replica presence and point-to-point delivery.
#[async_trait::async_trait]
pub trait Directory: Send + Sync {
    /// Record `entry` as online with a fresh TTL, replacing any previous
    /// owner. Emits an `online` status event.
    async fn register(&self, entry: PresenceEntry) -> DirResult<()>;

    /// Refresh the TTL and heartbeat timestamp of an existing entry.
    async fn touch(&self, agent_id: &str, now: i64, uptime_s: u64) -> DirResult<Touch>;

    /// Conditionally delete the entry: a no-op when `replica_id` is not
    /// the recorded owner, so a stale replica cannot clear a fresh
    /// re-registration. Emits an `offline` status event when it deletes.
    async fn deregister(&self, agent_id: &str, replica_id: &str) -> DirResult<()>;

    async fn lookup(&self, agent_id: &str) -> DirResult<Option<PresenceEntry>>;

    /// All live presence entries (the fleet listing).
    async fn list(&self) -> DirResult<Vec<PresenceEntry>>;

    /// Deliver an envelope to the named replica's inbox.
    async fn deliver(&self, replica_id: &str, envelope: Envelope) -> DirResult<()>;

    /// Subscribe to envelopes addressed to `replica_id`.
    async fn subscribe_inbox(&self, replica_id: &str) -> DirResult<mpsc::Receiver<Envelope>>;

    /// Subscribe to agent status transitions fleet-wide.
    async fn subscribe_status(&self) -> DirResult<mpsc::Receiver<StatusEvent>>;

    /// Record this replica as live so peers can `deliver` to it. Called
    /// at startup and re-called periodically as the replica heartbeat.
    async fn announce_replica(&self, replica_id: &str) -> DirResult<()>;

    /// Remove this replica's liveness record at shutdown.
    async fn retire_replica(&self, replica_id: &str) -> DirResult<()>;
}
