// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-session state: the operator-side session record, the agent-side
//! remote binding, and the sequence buffer that restores producer order
//! for cross-replica envelopes.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use picket_wire::{epoch_s, ErrorCode, TerminalOp};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

/// Bound on buffered out-of-order envelopes per direction.
const SEQ_BUFFER_CAP: usize = 1024;

/// Depth of the operator-bound event queue. A slow operator overflows it
/// and loses the session rather than stalling the shared inbox task.
const OPERATOR_QUEUE_DEPTH: usize = 256;

/// Outcome of offering a sequenced item to a [`SeqBuffer`].
#[derive(Debug, PartialEq, Eq)]
pub enum Push<T> {
    /// The item (and any directly following buffered items) are in order.
    Ready(Vec<T>),
    /// Out of order; held until the gap fills.
    Buffered,
    /// Already delivered or already buffered; dropped.
    Duplicate,
    /// The gap never filled and the buffer is at capacity.
    Overflow,
}

/// Reorders at-least-once, possibly out-of-order envelopes back into
/// producer order, deduping by sequence number.
pub struct SeqBuffer<T> {
    next: u64,
    pending: BTreeMap<u64, T>,
}

impl<T> SeqBuffer<T> {
    pub fn new() -> Self {
        Self { next: 0, pending: BTreeMap::new() }
    }

    pub fn next_expected(&self) -> u64 {
        self.next
    }

    pub fn push(&mut self, seq: u64, item: T) -> Push<T> {
        if seq < self.next || self.pending.contains_key(&seq) {
            return Push::Duplicate;
        }
        if seq == self.next {
            let mut ready = vec![item];
            self.next += 1;
            while let Some(next_item) = self.pending.remove(&self.next) {
                ready.push(next_item);
                self.next += 1;
            }
            return Push::Ready(ready);
        }
        if self.pending.len() >= SEQ_BUFFER_CAP {
            return Push::Overflow;
        }
        self.pending.insert(seq, item);
        Push::Buffered
    }
}

impl<T> Default for SeqBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Where the agent's transport lives relative to this session's replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Local,
    Remote { replica_id: String },
}

/// Event queued toward the operator's WebSocket task.
#[derive(Debug, Clone)]
pub enum OperatorEvent {
    /// Base64 PTY output, already reordered.
    Output { data: String },
    Error { code: ErrorCode, message: String },
    Closed,
}

/// A terminal session anchored on this replica by its operator transport.
pub struct OperatorSession {
    pub session_id: String,
    pub agent_id: String,
    pub operator_id: String,
    pub route: Route,
    pub opened_at: i64,
    pub cancel: CancellationToken,
    out_tx: mpsc::Sender<OperatorEvent>,
    output_buf: Mutex<SeqBuffer<String>>,
    input_seq: AtomicU64,
    last_activity_s: AtomicI64,
    ready_tx: Mutex<Option<oneshot::Sender<Result<(), String>>>>,
}

impl OperatorSession {
    pub fn new(
        session_id: String,
        agent_id: String,
        operator_id: String,
        route: Route,
    ) -> (Arc<Self>, mpsc::Receiver<OperatorEvent>, oneshot::Receiver<Result<(), String>>) {
        let (out_tx, out_rx) = mpsc::channel(OPERATOR_QUEUE_DEPTH);
        let (ready_tx, ready_rx) = oneshot::channel();
        let session = Arc::new(Self {
            session_id,
            agent_id,
            operator_id,
            route,
            opened_at: epoch_s(),
            cancel: CancellationToken::new(),
            out_tx,
            output_buf: Mutex::new(SeqBuffer::new()),
            input_seq: AtomicU64::new(0),
            last_activity_s: AtomicI64::new(epoch_s()),
            ready_tx: Mutex::new(Some(ready_tx)),
        });
        (session, out_rx, ready_rx)
    }

    /// Next sequence number for the operator → agent direction.
    pub fn next_input_seq(&self) -> u64 {
        self.input_seq.fetch_add(1, Ordering::Relaxed)
    }

    pub fn touch_activity(&self) {
        self.last_activity_s.store(epoch_s(), Ordering::Relaxed);
    }

    pub fn idle_secs(&self, now: i64) -> i64 {
        now.saturating_sub(self.last_activity_s.load(Ordering::Relaxed))
    }

    /// Resolve the pending `terminal_ready` wait, if one is still open.
    /// Returns false when the session was already past the opening phase.
    pub async fn resolve_ready(&self, result: Result<(), String>) -> bool {
        match self.ready_tx.lock().await.take() {
            Some(tx) => {
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    /// Queue reordered output toward the operator. Returns false when the
    /// operator queue overflowed and the session must be torn down.
    pub async fn deliver_output(&self, seq: u64, data: String) -> bool {
        self.touch_activity();
        let ready = {
            let mut buf = self.output_buf.lock().await;
            match buf.push(seq, data) {
                Push::Ready(items) => items,
                Push::Buffered | Push::Duplicate => return true,
                Push::Overflow => return false,
            }
        };
        for data in ready {
            if self.out_tx.try_send(OperatorEvent::Output { data }).is_err() {
                return false;
            }
        }
        true
    }

    /// Queue a non-output event toward the operator (best effort).
    pub fn emit(&self, event: OperatorEvent) {
        let _ = self.out_tx.try_send(event);
    }
}

/// Agent-side record of a session whose operator lives on a peer replica.
pub struct RemoteBinding {
    pub session_id: String,
    pub agent_id: String,
    /// Replica anchoring the operator; output and lifecycle events return
    /// there.
    pub return_to: String,
    input_buf: Mutex<SeqBuffer<TerminalOp>>,
    last_activity_s: AtomicI64,
}

impl RemoteBinding {
    pub fn new(session_id: String, agent_id: String, return_to: String) -> Arc<Self> {
        Arc::new(Self {
            session_id,
            agent_id,
            return_to,
            input_buf: Mutex::new(SeqBuffer::new()),
            last_activity_s: AtomicI64::new(epoch_s()),
        })
    }

    pub fn touch_activity(&self) {
        self.last_activity_s.store(epoch_s(), Ordering::Relaxed);
    }

    pub fn idle_secs(&self, now: i64) -> i64 {
        now.saturating_sub(self.last_activity_s.load(Ordering::Relaxed))
    }

    /// Reorder an operator-direction command; returns the ops now ready
    /// to forward to the agent, in producer order.
    pub async fn accept(&self, seq: u64, op: TerminalOp) -> Vec<TerminalOp> {
        self.touch_activity();
        match self.input_buf.lock().await.push(seq, op) {
            Push::Ready(ops) => ops,
            Push::Buffered | Push::Duplicate => Vec::new(),
            Push::Overflow => {
                tracing::warn!(session_id = %self.session_id, "input sequence buffer overflow");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
