// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-process directory backend.
//!
//! Same semantics as the NATS backend — TTL expiry, owner-checked
//! deregistration, replica inboxes — without an external store. Used by
//! tests and by single-replica deployments. TTL expiry is lazy: expired
//! entries are dropped whenever they are read.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, RwLock};

use super::{
    DirResult, Directory, DirectoryError, Envelope, PresenceEntry, PresenceStatus, StatusEvent,
    Touch,
};

const INBOX_DEPTH: usize = 256;

struct Slot {
    entry: PresenceEntry,
    expires: Instant,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Slot>,
    inboxes: HashMap<String, mpsc::Sender<Envelope>>,
    status_subs: Vec<mpsc::Sender<StatusEvent>>,
    replicas: HashMap<String, Instant>,
}

/// Shared in-memory directory; clones share state, so several replicas
/// in one process can point at the same directory.
#[derive(Clone)]
pub struct MemoryDirectory {
    ttl: Duration,
    inner: Arc<RwLock<Inner>>,
}

impl MemoryDirectory {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, inner: Arc::new(RwLock::new(Inner::default())) }
    }

    async fn broadcast_status(inner: &mut Inner, event: StatusEvent) {
        inner.status_subs.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            // A full subscriber misses this event but stays subscribed.
            Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

#[async_trait::async_trait]
impl Directory for MemoryDirectory {
    async fn register(&self, entry: PresenceEntry) -> DirResult<()> {
        let mut inner = self.inner.write().await;
        let event = StatusEvent {
            agent_id: entry.agent_id.clone(),
            status: PresenceStatus::Online,
            replica_id: entry.replica_id.clone(),
        };
        inner.entries.insert(
            entry.agent_id.clone(),
            Slot { entry, expires: Instant::now() + self.ttl },
        );
        Self::broadcast_status(&mut inner, event).await;
        Ok(())
    }

    async fn touch(&self, agent_id: &str, now: i64, uptime_s: u64) -> DirResult<Touch> {
        let mut inner = self.inner.write().await;
        let ttl = self.ttl;
        match inner.entries.get_mut(agent_id) {
            Some(slot) if slot.expires > Instant::now() => {
                slot.entry.last_heartbeat = now;
                slot.entry.uptime_s = uptime_s;
                slot.expires = Instant::now() + ttl;
                Ok(Touch::Refreshed)
            }
            Some(_) => {
                inner.entries.remove(agent_id);
                Ok(Touch::Evicted)
            }
            None => Ok(Touch::Evicted),
        }
    }

    async fn deregister(&self, agent_id: &str, replica_id: &str) -> DirResult<()> {
        let mut inner = self.inner.write().await;
        let owned = inner
            .entries
            .get(agent_id)
            .is_some_and(|slot| slot.entry.replica_id == replica_id);
        if owned {
            inner.entries.remove(agent_id);
            let event = StatusEvent {
                agent_id: agent_id.to_owned(),
                status: PresenceStatus::Offline,
                replica_id: replica_id.to_owned(),
            };
            Self::broadcast_status(&mut inner, event).await;
        }
        Ok(())
    }

    async fn lookup(&self, agent_id: &str) -> DirResult<Option<PresenceEntry>> {
        let mut inner = self.inner.write().await;
        match inner.entries.get(agent_id) {
            Some(slot) if slot.expires > Instant::now() => Ok(Some(slot.entry.clone())),
            Some(_) => {
                inner.entries.remove(agent_id);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn list(&self) -> DirResult<Vec<PresenceEntry>> {
        let mut inner = self.inner.write().await;
        let now = Instant::now();
        inner.entries.retain(|_, slot| slot.expires > now);
        Ok(inner.entries.values().map(|slot| slot.entry.clone()).collect())
    }

    async fn deliver(&self, replica_id: &str, envelope: Envelope) -> DirResult<()> {
        let tx = {
            let inner = self.inner.read().await;
            if !inner.replicas.contains_key(replica_id) {
                return Err(DirectoryError::NoSuchReplica(replica_id.to_owned()));
            }
            inner.inboxes.get(replica_id).cloned()
        };
        match tx {
            Some(tx) => tx
                .send(envelope)
                .await
                .map_err(|_| DirectoryError::NoSuchReplica(replica_id.to_owned())),
            None => Err(DirectoryError::NoSuchReplica(replica_id.to_owned())),
        }
    }

    async fn subscribe_inbox(&self, replica_id: &str) -> DirResult<mpsc::Receiver<Envelope>> {
        let (tx, rx) = mpsc::channel(INBOX_DEPTH);
        self.inner.write().await.inboxes.insert(replica_id.to_owned(), tx);
        Ok(rx)
    }

    async fn subscribe_status(&self) -> DirResult<mpsc::Receiver<StatusEvent>> {
        let (tx, rx) = mpsc::channel(INBOX_DEPTH);
        self.inner.write().await.status_subs.push(tx);
        Ok(rx)
    }

    async fn announce_replica(&self, replica_id: &str) -> DirResult<()> {
        self.inner.write().await.replicas.insert(replica_id.to_owned(), Instant::now());
        Ok(())
    }

    async fn retire_replica(&self, replica_id: &str) -> DirResult<()> {
        let mut inner = self.inner.write().await;
        inner.replicas.remove(replica_id);
        inner.inboxes.remove(replica_id);
        Ok(())
    }
}

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;
