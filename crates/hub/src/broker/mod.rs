// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session broker: lifecycle of interactive terminal sessions.
//!
//! A session is anchored on the replica holding the operator transport
//! ([`OperatorSession`]); when the agent is homed elsewhere, the agent's
//! replica keeps a [`RemoteBinding`] and the two sides exchange directory
//! envelopes. Sessions never share mutable state with each other.

pub mod session;

use std::collections::HashMap;
use std::sync::Arc;

use picket_wire::{epoch_s, ErrorCode, Frame, Payload, TerminalOp};
use tokio::sync::{mpsc, RwLock};

use crate::directory::{DirectoryError, Envelope};
use crate::hub::SendError;
use crate::state::HubState;

pub use session::{OperatorEvent, OperatorSession, RemoteBinding, Route};

/// Failure opening a session, surfaced to the operator as a typed banner.
#[derive(Debug)]
pub struct OpenError {
    pub code: ErrorCode,
    pub message: String,
}

impl OpenError {
    fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }
}

pub struct SessionBroker {
    /// Sessions whose operator transport is on this replica.
    sessions: RwLock<HashMap<String, Arc<OperatorSession>>>,
    /// Sessions whose agent is here but whose operator is elsewhere.
    bindings: RwLock<HashMap<String, Arc<RemoteBinding>>>,
}

impl SessionBroker {
    pub fn new() -> Self {
        Self { sessions: RwLock::new(HashMap::new()), bindings: RwLock::new(HashMap::new()) }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    // -- Opening --------------------------------------------------------------

    /// Open a terminal session toward `agent_id`. The caller has already
    /// authorised `operator_id` against the agent record. Blocks until
    /// the agent reports `terminal_ready` or the ready window lapses.
    pub async fn open(
        &self,
        state: &Arc<HubState>,
        agent_id: &str,
        operator_id: &str,
        rows: u16,
        cols: u16,
        shell: Option<String>,
    ) -> Result<(Arc<OperatorSession>, mpsc::Receiver<OperatorEvent>), OpenError> {
        let entry = match state.directory.lookup(agent_id).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return Err(OpenError::new(ErrorCode::AgentOffline, "agent is offline")),
            Err(e) => return Err(OpenError::new(ErrorCode::Unavailable, e.to_string())),
        };

        let route = if entry.replica_id == state.replica_id {
            Route::Local
        } else {
            Route::Remote { replica_id: entry.replica_id.clone() }
        };
        let session_id = uuid::Uuid::new_v4().to_string();
        let (session, out_rx, ready_rx) = OperatorSession::new(
            session_id.clone(),
            agent_id.to_owned(),
            operator_id.to_owned(),
            route.clone(),
        );
        self.sessions.write().await.insert(session_id.clone(), Arc::clone(&session));

        let routed = match &route {
            Route::Local => self
                .send_local(state, agent_id, &session_id, TerminalOp::Init {
                    rows,
                    cols,
                    shell: shell.clone(),
                })
                .await
                .map_err(|_| OpenError::new(ErrorCode::AgentOffline, "agent transport lost")),
            Route::Remote { replica_id } => {
                let envelope = Envelope::TerminalOpen {
                    session_id: session_id.clone(),
                    agent_id: agent_id.to_owned(),
                    rows,
                    cols,
                    shell: shell.clone(),
                    return_to: state.replica_id.clone(),
                };
                state.directory.deliver(replica_id, envelope).await.map_err(|e| match e {
                    DirectoryError::NoSuchReplica(_) => {
                        OpenError::new(ErrorCode::AgentOffline, "owning replica is gone")
                    }
                    DirectoryError::Unavailable(msg) => {
                        OpenError::new(ErrorCode::Unavailable, msg)
                    }
                })
            }
        };
        if let Err(e) = routed {
            self.remove_session(&session_id).await;
            return Err(e);
        }

        // Await terminal_ready from the agent.
        match tokio::time::timeout(state.config.ready_timeout(), ready_rx).await {
            Ok(Ok(Ok(()))) => {
                tracing::info!(
                    session_id = %session_id,
                    agent_id,
                    operator_id,
                    "terminal session open"
                );
                Ok((session, out_rx))
            }
            Ok(Ok(Err(reason))) => {
                self.remove_session(&session_id).await;
                Err(OpenError::new(ErrorCode::Internal, format!("agent refused session: {reason}")))
            }
            Ok(Err(_)) | Err(_) => {
                self.remove_session(&session_id).await;
                self.route_close(state, &session, true).await;
                Err(OpenError::new(ErrorCode::AgentOffline, "agent did not become ready"))
            }
        }
    }

    // -- Operator → agent ------------------------------------------------------

    pub async fn operator_input(
        &self,
        state: &Arc<HubState>,
        session: &Arc<OperatorSession>,
        data: String,
    ) {
        session.touch_activity();
        self.route_op(state, session, TerminalOp::Input { data }).await;
    }

    pub async fn operator_resize(
        &self,
        state: &Arc<HubState>,
        session: &Arc<OperatorSession>,
        rows: u16,
        cols: u16,
    ) {
        session.touch_activity();
        self.route_op(state, session, TerminalOp::Resize { rows, cols }).await;
    }

    async fn route_op(&self, state: &Arc<HubState>, session: &Arc<OperatorSession>, op: TerminalOp) {
        match &session.route {
            Route::Local => {
                if self
                    .send_local(state, &session.agent_id, &session.session_id, op)
                    .await
                    .is_err()
                {
                    self.teardown_session(state, session, OperatorEvent::Closed, false).await;
                }
            }
            Route::Remote { replica_id } => {
                if matches!(op, TerminalOp::Init { .. }) {
                    return;
                }
                // Sequence numbers must stay gapless or the peer's
                // reorder buffer stalls, so allocate only for ops that
                // will actually travel.
                let seq = session.next_input_seq();
                let envelope = match op {
                    TerminalOp::Input { data } => Envelope::TerminalInput {
                        session_id: session.session_id.clone(),
                        data,
                        seq,
                    },
                    TerminalOp::Resize { rows, cols } => Envelope::TerminalResize {
                        session_id: session.session_id.clone(),
                        rows,
                        cols,
                        seq,
                    },
                    TerminalOp::Close => Envelope::TerminalClose {
                        session_id: session.session_id.clone(),
                        seq,
                    },
                    TerminalOp::Init { .. } => unreachable!("init handled above"),
                };
                if state.directory.deliver(replica_id, envelope).await.is_err() {
                    self.teardown_session(state, session, OperatorEvent::Closed, false).await;
                }
            }
        }
    }

    async fn send_local(
        &self,
        state: &Arc<HubState>,
        agent_id: &str,
        session_id: &str,
        op: TerminalOp,
    ) -> Result<(), SendError> {
        let frame = Frame::new(Payload::TerminalCommand { session_id: session_id.to_owned(), op });
        state.hub.send(agent_id, frame).await
    }

    // -- Agent frames (this replica owns the agent transport) ------------------

    /// Route a terminal frame read from a local agent transport, either
    /// to a local session or back to the operator's replica.
    pub async fn on_agent_frame(&self, state: &Arc<HubState>, agent_id: &str, payload: Payload) {
        match payload {
            Payload::TerminalOutput { session_id, data, seq } => {
                if let Some(session) = self.get_session(&session_id).await {
                    if !session.deliver_output(seq, data).await {
                        tracing::warn!(session_id = %session_id, "operator queue overflow");
                        self.teardown_session(state, &session, OperatorEvent::Closed, true).await;
                    }
                } else if let Some(binding) = self.get_binding(&session_id).await {
                    binding.touch_activity();
                    let envelope = Envelope::TerminalOutput { session_id, data, seq };
                    self.return_or_drop(state, &binding, envelope).await;
                } else {
                    // Stray PTY with no session anywhere we know of.
                    let _ = self
                        .send_local(state, agent_id, &session_id, TerminalOp::Close)
                        .await;
                }
            }
            Payload::TerminalReady { session_id } => {
                if let Some(session) = self.get_session(&session_id).await {
                    session.resolve_ready(Ok(())).await;
                } else if let Some(binding) = self.get_binding(&session_id).await {
                    let envelope = Envelope::TerminalReady { session_id };
                    self.return_or_drop(state, &binding, envelope).await;
                }
            }
            Payload::TerminalError { session_id, reason } => {
                if let Some(session) = self.get_session(&session_id).await {
                    self.fail_session(state, &session, reason).await;
                } else if let Some(binding) = self.remove_binding(&session_id).await {
                    let envelope = Envelope::TerminalError { session_id, reason };
                    self.return_or_drop(state, &binding, envelope).await;
                }
            }
            Payload::TerminalClosed { session_id } => {
                if let Some(session) = self.get_session(&session_id).await {
                    self.teardown_session(state, &session, OperatorEvent::Closed, false).await;
                } else if let Some(binding) = self.remove_binding(&session_id).await {
                    let envelope = Envelope::TerminalClosed { session_id };
                    self.return_or_drop(state, &binding, envelope).await;
                }
            }
            other => {
                tracing::debug!(frame = other.type_name(), "non-terminal frame routed to broker");
            }
        }
    }

    // -- Directory envelopes ---------------------------------------------------

    /// Handle an envelope addressed to this replica.
    pub async fn on_envelope(&self, state: &Arc<HubState>, envelope: Envelope) {
        match envelope {
            Envelope::TerminalOpen { session_id, agent_id, rows, cols, shell, return_to } => {
                let binding =
                    RemoteBinding::new(session_id.clone(), agent_id.clone(), return_to.clone());
                self.bindings.write().await.insert(session_id.clone(), Arc::clone(&binding));
                let init = TerminalOp::Init { rows, cols, shell };
                if self.send_local(state, &agent_id, &session_id, init).await.is_err() {
                    self.remove_binding(&session_id).await;
                    let reply = Envelope::TerminalError {
                        session_id,
                        reason: ErrorCode::AgentOffline.as_str().to_owned(),
                    };
                    if let Err(e) = state.directory.deliver(&return_to, reply).await {
                        tracing::debug!(err = %e, "could not report open failure");
                    }
                }
            }

            Envelope::TerminalInput { session_id, data, seq } => {
                self.forward_bound(state, &session_id, seq, TerminalOp::Input { data }).await;
            }
            Envelope::TerminalResize { session_id, rows, cols, seq } => {
                self.forward_bound(state, &session_id, seq, TerminalOp::Resize { rows, cols })
                    .await;
            }
            Envelope::TerminalClose { session_id, seq } => {
                self.forward_bound(state, &session_id, seq, TerminalOp::Close).await;
            }

            Envelope::TerminalReady { session_id } => {
                if let Some(session) = self.get_session(&session_id).await {
                    session.resolve_ready(Ok(())).await;
                }
            }
            Envelope::TerminalOutput { session_id, data, seq } => {
                if let Some(session) = self.get_session(&session_id).await {
                    if !session.deliver_output(seq, data).await {
                        tracing::warn!(session_id = %session_id, "operator queue overflow");
                        self.teardown_session(state, &session, OperatorEvent::Closed, true).await;
                    }
                }
            }
            Envelope::TerminalError { session_id, reason } => {
                if let Some(session) = self.get_session(&session_id).await {
                    self.fail_session(state, &session, reason).await;
                }
            }
            Envelope::TerminalClosed { session_id } => {
                if let Some(session) = self.get_session(&session_id).await {
                    self.teardown_session(state, &session, OperatorEvent::Closed, false).await;
                }
            }

            Envelope::Evict { .. } => {
                // Handled by the hub layer before envelopes reach the broker.
                tracing::debug!("evict envelope reached the broker");
            }
        }
    }

    /// Reorder and forward an operator-direction command to the local
    /// agent transport.
    async fn forward_bound(
        &self,
        state: &Arc<HubState>,
        session_id: &str,
        seq: u64,
        op: TerminalOp,
    ) {
        let Some(binding) = self.get_binding(session_id).await else {
            tracing::debug!(session_id, "command for unknown binding");
            return;
        };
        for op in binding.accept(seq, op).await {
            let closing = matches!(op, TerminalOp::Close);
            if self.send_local(state, &binding.agent_id, session_id, op).await.is_err() {
                self.remove_binding(session_id).await;
                return;
            }
            if closing {
                self.remove_binding(session_id).await;
                return;
            }
        }
    }

    // -- Disconnection and sweeps ----------------------------------------------

    /// The local transport for `agent_id` is gone: tear down every local
    /// session and binding that referenced it.
    pub async fn agent_disconnected(&self, state: &Arc<HubState>, agent_id: &str) {
        let sessions: Vec<_> = {
            let map = self.sessions.read().await;
            map.values()
                .filter(|s| s.agent_id == agent_id && s.route == Route::Local)
                .cloned()
                .collect()
        };
        for session in sessions {
            self.teardown_session(state, &session, OperatorEvent::Closed, false).await;
        }

        let bindings: Vec<_> = {
            let map = self.bindings.read().await;
            map.values().filter(|b| b.agent_id == agent_id).cloned().collect()
        };
        for binding in bindings {
            self.remove_binding(&binding.session_id).await;
            let envelope = Envelope::TerminalClosed { session_id: binding.session_id.clone() };
            self.return_or_drop(state, &binding, envelope).await;
        }
    }

    /// A peer replica reported `agent_id` offline: close any local
    /// sessions routed toward it.
    pub async fn agent_offline(&self, state: &Arc<HubState>, agent_id: &str) {
        let sessions: Vec<_> = {
            let map = self.sessions.read().await;
            map.values()
                .filter(|s| s.agent_id == agent_id && s.route != Route::Local)
                .cloned()
                .collect()
        };
        for session in sessions {
            session.emit(OperatorEvent::Error {
                code: ErrorCode::AgentOffline,
                message: "agent went offline".into(),
            });
            self.teardown_session(state, &session, OperatorEvent::Closed, false).await;
        }
    }

    /// Tear down sessions and bindings idle beyond `idle_s`.
    pub async fn sweep_idle(&self, state: &Arc<HubState>, idle_s: i64) {
        let now = epoch_s();
        let idle_sessions: Vec<_> = {
            let map = self.sessions.read().await;
            map.values().filter(|s| s.idle_secs(now) > idle_s).cloned().collect()
        };
        for session in idle_sessions {
            tracing::info!(session_id = %session.session_id, "closing idle session");
            self.teardown_session(state, &session, OperatorEvent::Closed, true).await;
        }

        let idle_bindings: Vec<_> = {
            let map = self.bindings.read().await;
            map.values().filter(|b| b.idle_secs(now) > idle_s).cloned().collect()
        };
        for binding in idle_bindings {
            self.remove_binding(&binding.session_id).await;
            let _ = self
                .send_local(state, &binding.agent_id, &binding.session_id, TerminalOp::Close)
                .await;
            let envelope = Envelope::TerminalClosed { session_id: binding.session_id.clone() };
            self.return_or_drop(state, &binding, envelope).await;
        }
    }

    /// Replica shutdown: close everything, notifying both sides.
    pub async fn close_all(&self, state: &Arc<HubState>) {
        let sessions: Vec<_> = self.sessions.read().await.values().cloned().collect();
        for session in sessions {
            self.teardown_session(state, &session, OperatorEvent::Closed, true).await;
        }
        let bindings: Vec<_> = self.bindings.read().await.values().cloned().collect();
        for binding in bindings {
            self.remove_binding(&binding.session_id).await;
            let _ = self
                .send_local(state, &binding.agent_id, &binding.session_id, TerminalOp::Close)
                .await;
            let envelope = Envelope::TerminalClosed { session_id: binding.session_id.clone() };
            self.return_or_drop(state, &binding, envelope).await;
        }
    }

    // -- Teardown helpers ------------------------------------------------------

    /// Tear down an operator-anchored session: best-effort close toward
    /// the agent, a final event to the operator, then release state.
    pub async fn teardown_session(
        &self,
        state: &Arc<HubState>,
        session: &Arc<OperatorSession>,
        last_event: OperatorEvent,
        notify_agent: bool,
    ) {
        if self.remove_session(&session.session_id).await.is_none() {
            return; // already torn down
        }
        if notify_agent {
            self.route_close(state, session, false).await;
        }
        session.emit(last_event);
        session.cancel.cancel();
        tracing::info!(session_id = %session.session_id, agent_id = %session.agent_id, "session closed");
    }

    async fn fail_session(&self, state: &Arc<HubState>, session: &Arc<OperatorSession>, reason: String) {
        if session.resolve_ready(Err(reason.clone())).await {
            // open() owns cleanup of sessions that never became ready.
            return;
        }
        session.emit(OperatorEvent::Error { code: ErrorCode::Internal, message: reason });
        self.teardown_session(state, session, OperatorEvent::Closed, false).await;
    }

    /// Send the close command toward the agent without touching session
    /// maps (used during open-failure cleanup and teardown).
    async fn route_close(&self, state: &Arc<HubState>, session: &Arc<OperatorSession>, quiet: bool) {
        match &session.route {
            Route::Local => {
                let result = self
                    .send_local(state, &session.agent_id, &session.session_id, TerminalOp::Close)
                    .await;
                if let (Err(e), false) = (result, quiet) {
                    tracing::debug!(err = %e, session_id = %session.session_id, "close not delivered");
                }
            }
            Route::Remote { replica_id } => {
                let envelope = Envelope::TerminalClose {
                    session_id: session.session_id.clone(),
                    seq: session.next_input_seq(),
                };
                if let (Err(e), false) =
                    (state.directory.deliver(replica_id, envelope).await, quiet)
                {
                    tracing::debug!(err = %e, session_id = %session.session_id, "close not delivered");
                }
            }
        }
    }

    async fn return_or_drop(
        &self,
        state: &Arc<HubState>,
        binding: &Arc<RemoteBinding>,
        envelope: Envelope,
    ) {
        if let Err(e) = state.directory.deliver(&binding.return_to, envelope).await {
            tracing::debug!(
                err = %e,
                session_id = %binding.session_id,
                "operator replica unreachable; dropping binding"
            );
            self.remove_binding(&binding.session_id).await;
            let _ = self
                .send_local(state, &binding.agent_id, &binding.session_id, TerminalOp::Close)
                .await;
        }
    }

    // -- Map access ------------------------------------------------------------

    pub async fn get_session(&self, session_id: &str) -> Option<Arc<OperatorSession>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    async fn remove_session(&self, session_id: &str) -> Option<Arc<OperatorSession>> {
        self.sessions.write().await.remove(session_id)
    }

    pub async fn get_binding(&self, session_id: &str) -> Option<Arc<RemoteBinding>> {
        self.bindings.read().await.get(session_id).cloned()
    }

    async fn remove_binding(&self, session_id: &str) -> Option<Arc<RemoteBinding>> {
        self.bindings.write().await.remove(session_id)
    }

    pub async fn binding_count(&self) -> usize {
        self.bindings.read().await.len()
    }
}

impl Default for SessionBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
