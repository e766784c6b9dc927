// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Connection hub: the per-replica registry of locally-homed agent
//! transports. Owns one write-serialised channel per agent, exposes the
//! send interface the session broker borrows, and drives liveness
//! detection.

pub mod accept;
pub mod dispatch;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use picket_wire::{epoch_s, CloseReason, Frame};
use picket_wire::limits::WRITE_QUEUE_FRAMES;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

/// Send failures, distinguished so the broker can fall back to
/// cross-replica delivery on `NotHere`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    NotHere,
    Backpressure,
    Closed,
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotHere => "agent not homed on this replica",
            Self::Backpressure => "write queue overflow",
            Self::Closed => "transport closed",
        };
        f.write_str(s)
    }
}

/// Handle to one agent transport. The writer task drains the queue; all
/// other tasks reach the socket only through [`AgentHandle::enqueue`].
pub struct AgentHandle {
    pub agent_id: String,
    pub agent_version: String,
    pub connected_at: i64,
    pub cancel: CancellationToken,
    write_tx: mpsc::Sender<Frame>,
    last_heartbeat_s: AtomicI64,
    pub uptime_s: AtomicU64,
    close_reason: std::sync::Mutex<Option<CloseReason>>,
}

impl AgentHandle {
    /// Create a handle and the receiving half of its write queue.
    pub fn new(
        agent_id: impl Into<String>,
        agent_version: impl Into<String>,
    ) -> (Arc<Self>, mpsc::Receiver<Frame>) {
        let (write_tx, write_rx) = mpsc::channel(WRITE_QUEUE_FRAMES);
        let handle = Arc::new(Self {
            agent_id: agent_id.into(),
            agent_version: agent_version.into(),
            connected_at: epoch_s(),
            cancel: CancellationToken::new(),
            write_tx,
            last_heartbeat_s: AtomicI64::new(epoch_s()),
            uptime_s: AtomicU64::new(0),
            close_reason: std::sync::Mutex::new(None),
        });
        (handle, write_rx)
    }

    /// Queue a frame for the writer. Overflow closes the transport with
    /// reason `backpressure` rather than ballooning memory.
    pub fn enqueue(&self, frame: Frame) -> Result<(), SendError> {
        match self.write_tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.begin_close(CloseReason::Backpressure);
                Err(SendError::Backpressure)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SendError::Closed),
        }
    }

    /// Start closing the transport. The first reason wins; the writer
    /// drains the queue and sends the close frame.
    pub fn begin_close(&self, reason: CloseReason) {
        if let Ok(mut guard) = self.close_reason.lock() {
            guard.get_or_insert(reason);
        }
        self.cancel.cancel();
    }

    pub fn close_reason(&self) -> CloseReason {
        self.close_reason
            .lock()
            .ok()
            .and_then(|guard| *guard)
            .unwrap_or(CloseReason::Normal)
    }

    pub fn note_heartbeat(&self, now_s: i64, uptime_s: u64) {
        self.last_heartbeat_s.store(now_s, Ordering::Release);
        self.uptime_s.store(uptime_s, Ordering::Relaxed);
    }

    pub fn last_heartbeat_s(&self) -> i64 {
        self.last_heartbeat_s.load(Ordering::Acquire)
    }
}

/// Registry of agents currently homed on this replica.
///
/// The map is read-mostly: reads take the shared lock, membership changes
/// happen only on accept and close.
pub struct ConnectionHub {
    agents: RwLock<HashMap<String, Arc<AgentHandle>>>,
    /// Per-agent handshake serialisation so concurrent connects for one
    /// agent_id resolve latest-wins.
    connect_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ConnectionHub {
    pub fn new() -> Self {
        Self { agents: RwLock::new(HashMap::new()), connect_locks: Mutex::new(HashMap::new()) }
    }

    pub async fn connect_lock(&self, agent_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.connect_locks.lock().await;
        Arc::clone(locks.entry(agent_id.to_owned()).or_default())
    }

    /// Install a handle, returning a displaced handle for the same agent
    /// if one was present (the caller closes it as `duplicate_agent`).
    pub async fn insert(&self, handle: Arc<AgentHandle>) -> Option<Arc<AgentHandle>> {
        self.agents.write().await.insert(handle.agent_id.clone(), handle)
    }

    pub async fn get(&self, agent_id: &str) -> Option<Arc<AgentHandle>> {
        self.agents.read().await.get(agent_id).cloned()
    }

    pub async fn contains(&self, agent_id: &str) -> bool {
        self.agents.read().await.contains_key(agent_id)
    }

    /// Remove the entry only if it still refers to `handle`; a newer
    /// transport that displaced it is left untouched.
    pub async fn remove_if(&self, agent_id: &str, handle: &Arc<AgentHandle>) -> bool {
        let mut agents = self.agents.write().await;
        if agents.get(agent_id).is_some_and(|current| Arc::ptr_eq(current, handle)) {
            agents.remove(agent_id);
            return true;
        }
        false
    }

    /// Queue a frame to a locally-homed agent.
    pub async fn send(&self, agent_id: &str, frame: Frame) -> Result<(), SendError> {
        let handle = self.get(agent_id).await.ok_or(SendError::NotHere)?;
        handle.enqueue(frame)
    }

    /// Begin a graceful close of an agent's transport. Returns false when
    /// the agent is not homed here.
    pub async fn close(&self, agent_id: &str, reason: CloseReason) -> bool {
        match self.get(agent_id).await {
            Some(handle) => {
                handle.begin_close(reason);
                true
            }
            None => false,
        }
    }

    pub async fn agent_ids(&self) -> Vec<String> {
        self.agents.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.agents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.agents.read().await.is_empty()
    }

    /// Close every transport (replica shutdown).
    pub async fn drain_all(&self, reason: CloseReason) {
        for handle in self.agents.read().await.values() {
            handle.begin_close(reason);
        }
    }

    /// Drop the connect lock for an agent with no live transport.
    pub async fn prune_connect_lock(&self, agent_id: &str) {
        if self.contains(agent_id).await {
            return;
        }
        let mut locks = self.connect_locks.lock().await;
        if let Some(lock) = locks.get(agent_id) {
            // Strong count 1 means nobody is mid-handshake.
            if Arc::strong_count(lock) == 1 {
                locks.remove(agent_id);
            }
        }
    }
}

impl Default for ConnectionHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
