// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! NATS-backed directory.
//!
//! Presence entries live in a JetStream key-value bucket whose `max_age`
//! is the presence TTL, so expiry needs no sweeper. Replica liveness
//! lives in a second bucket and backs `deliver`'s no-such-replica
//! answer. Point-to-point envelopes ride core pub/sub on
//! `{prefix}.replica.{id}.inbox`; status transitions on
//! `{prefix}.presence.{agent_id}`.

use std::time::Duration;

use async_nats::jetstream::{self, kv};
use futures_util::StreamExt;
use tokio::sync::mpsc;

use super::{
    DirResult, Directory, DirectoryError, Envelope, PresenceEntry, PresenceStatus, StatusEvent,
    Touch,
};

const INBOX_DEPTH: usize = 256;

pub struct NatsDirectory {
    client: async_nats::Client,
    presence: kv::Store,
    replicas: kv::Store,
    prefix: String,
}

impl NatsDirectory {
    /// Connect and ensure both key-value buckets exist.
    pub async fn connect(
        url: &str,
        token: Option<&str>,
        prefix: &str,
        presence_ttl: Duration,
    ) -> anyhow::Result<Self> {
        let opts = match token {
            Some(token) => async_nats::ConnectOptions::with_token(token.to_owned()),
            None => async_nats::ConnectOptions::new(),
        }
        .retry_on_initial_connect();

        tracing::info!(url = %url, prefix = %prefix, "connecting directory to NATS");
        let client = opts.connect(url).await?;

        let js = jetstream::new(client.clone());
        let bucket_prefix = prefix.replace('.', "-");
        let presence =
            ensure_bucket(&js, format!("{bucket_prefix}-presence"), presence_ttl).await?;
        let replicas =
            ensure_bucket(&js, format!("{bucket_prefix}-replicas"), presence_ttl).await?;

        Ok(Self { client, presence, replicas, prefix: prefix.to_owned() })
    }

    fn status_subject(&self, agent_id: &str) -> String {
        format!("{}.presence.{agent_id}", self.prefix)
    }

    fn inbox_subject(&self, replica_id: &str) -> String {
        format!("{}.replica.{replica_id}.inbox", self.prefix)
    }

    async fn publish_status(&self, event: &StatusEvent) {
        let Ok(payload) = serde_json::to_vec(event) else { return };
        let subject = self.status_subject(&event.agent_id);
        if let Err(e) = self.client.publish(subject, payload.into()).await {
            tracing::warn!(err = %e, agent_id = %event.agent_id, "status publish failed");
        }
    }
}

async fn ensure_bucket(
    js: &jetstream::Context,
    bucket: String,
    max_age: Duration,
) -> anyhow::Result<kv::Store> {
    if let Ok(store) = js.get_key_value(bucket.as_str()).await {
        return Ok(store);
    }
    let store = js
        .create_key_value(kv::Config { bucket, max_age, ..Default::default() })
        .await?;
    Ok(store)
}

fn unavailable(e: impl std::fmt::Display) -> DirectoryError {
    DirectoryError::Unavailable(e.to_string())
}

fn decode_entry(value: &[u8]) -> Option<PresenceEntry> {
    match serde_json::from_slice(value) {
        Ok(entry) => Some(entry),
        Err(e) => {
            tracing::debug!(err = %e, "discarding malformed presence entry");
            None
        }
    }
}

#[async_trait::async_trait]
impl Directory for NatsDirectory {
    async fn register(&self, entry: PresenceEntry) -> DirResult<()> {
        let payload = serde_json::to_vec(&entry).map_err(unavailable)?;
        self.presence
            .put(entry.agent_id.as_str(), payload.into())
            .await
            .map_err(unavailable)?;
        self.publish_status(&StatusEvent {
            agent_id: entry.agent_id.clone(),
            status: PresenceStatus::Online,
            replica_id: entry.replica_id.clone(),
        })
        .await;
        Ok(())
    }

    async fn touch(&self, agent_id: &str, now: i64, uptime_s: u64) -> DirResult<Touch> {
        let current = self.presence.get(agent_id).await.map_err(unavailable)?;
        let Some(raw) = current else {
            return Ok(Touch::Evicted);
        };
        let Some(mut entry) = decode_entry(&raw) else {
            return Ok(Touch::Evicted);
        };
        entry.last_heartbeat = now;
        entry.uptime_s = uptime_s;
        let payload = serde_json::to_vec(&entry).map_err(unavailable)?;
        self.presence.put(agent_id, payload.into()).await.map_err(unavailable)?;
        Ok(Touch::Refreshed)
    }

    async fn deregister(&self, agent_id: &str, replica_id: &str) -> DirResult<()> {
        let entry = self.presence.entry(agent_id).await.map_err(unavailable)?;
        let Some(entry) = entry else { return Ok(()) };
        if entry.operation != kv::Operation::Put {
            return Ok(());
        }
        let Some(present) = decode_entry(&entry.value) else { return Ok(()) };
        if present.replica_id != replica_id {
            // Another replica re-registered the agent; leave it alone.
            return Ok(());
        }
        // Revision guard: if the entry changed between read and delete,
        // the delete fails and the newer owner wins.
        if let Err(e) = self
            .presence
            .delete_expect_revision(agent_id, Some(entry.revision))
            .await
        {
            tracing::debug!(err = %e, agent_id, "deregister lost a revision race");
            return Ok(());
        }
        self.publish_status(&StatusEvent {
            agent_id: agent_id.to_owned(),
            status: PresenceStatus::Offline,
            replica_id: replica_id.to_owned(),
        })
        .await;
        Ok(())
    }

    async fn lookup(&self, agent_id: &str) -> DirResult<Option<PresenceEntry>> {
        let raw = self.presence.get(agent_id).await.map_err(unavailable)?;
        Ok(raw.as_deref().and_then(decode_entry))
    }

    async fn list(&self) -> DirResult<Vec<PresenceEntry>> {
        let mut keys = self.presence.keys().await.map_err(unavailable)?;
        let mut entries = Vec::new();
        while let Some(key) = keys.next().await {
            let key = key.map_err(unavailable)?;
            if let Some(raw) = self.presence.get(&key).await.map_err(unavailable)? {
                if let Some(entry) = decode_entry(&raw) {
                    entries.push(entry);
                }
            }
        }
        Ok(entries)
    }

    async fn deliver(&self, replica_id: &str, envelope: Envelope) -> DirResult<()> {
        let live = self.replicas.get(replica_id).await.map_err(unavailable)?;
        if live.is_none() {
            return Err(DirectoryError::NoSuchReplica(replica_id.to_owned()));
        }
        let payload = serde_json::to_vec(&envelope).map_err(unavailable)?;
        self.client
            .publish(self.inbox_subject(replica_id), payload.into())
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn subscribe_inbox(&self, replica_id: &str) -> DirResult<mpsc::Receiver<Envelope>> {
        let mut sub = self
            .client
            .subscribe(self.inbox_subject(replica_id))
            .await
            .map_err(unavailable)?;
        let (tx, rx) = mpsc::channel(INBOX_DEPTH);
        tokio::spawn(async move {
            while let Some(msg) = sub.next().await {
                match serde_json::from_slice::<Envelope>(&msg.payload) {
                    Ok(envelope) => {
                        if tx.send(envelope).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::debug!(err = %e, "discarding malformed envelope"),
                }
            }
        });
        Ok(rx)
    }

    async fn subscribe_status(&self) -> DirResult<mpsc::Receiver<StatusEvent>> {
        let subject = format!("{}.presence.>", self.prefix);
        let mut sub = self.client.subscribe(subject).await.map_err(unavailable)?;
        let (tx, rx) = mpsc::channel(INBOX_DEPTH);
        tokio::spawn(async move {
            while let Some(msg) = sub.next().await {
                match serde_json::from_slice::<StatusEvent>(&msg.payload) {
                    Ok(event) => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::debug!(err = %e, "discarding malformed status event"),
                }
            }
        });
        Ok(rx)
    }

    async fn announce_replica(&self, replica_id: &str) -> DirResult<()> {
        self.replicas
            .put(replica_id, b"{}".to_vec().into())
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn retire_replica(&self, replica_id: &str) -> DirResult<()> {
        self.replicas.delete(replica_id).await.map_err(unavailable)?;
        Ok(())
    }
}
