// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Terminal session executor: one PTY child per session, serving
//! `terminal_command` frames from the hub and streaming output back as
//! sequenced, base64-encoded `terminal_output` frames.

#[cfg(unix)]
pub mod pty;

use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine;
use bytes::Bytes;
use picket_wire::limits::terminal_chunks;
use picket_wire::{Frame, Payload, TerminalOp};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// How a PTY child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

struct SessionHandle {
    input_tx: mpsc::Sender<Bytes>,
    resize_tx: mpsc::Sender<(u16, u16)>,
    cancel: CancellationToken,
}

type SessionMap = Arc<Mutex<HashMap<String, SessionHandle>>>;

/// Owns the active PTY sessions of one hub connection.
pub struct TerminalManager {
    sessions: SessionMap,
    write_tx: mpsc::Sender<Frame>,
    shell_override: Option<String>,
}

impl TerminalManager {
    pub fn new(write_tx: mpsc::Sender<Frame>, shell_override: Option<String>) -> Self {
        Self { sessions: Arc::new(Mutex::new(HashMap::new())), write_tx, shell_override }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Serve one `terminal_command` frame.
    pub async fn handle(&self, session_id: String, op: TerminalOp) {
        match op {
            TerminalOp::Init { rows, cols, shell } => self.init(session_id, rows, cols, shell).await,
            TerminalOp::Input { data } => self.input(&session_id, &data).await,
            TerminalOp::Resize { rows, cols } => self.resize(&session_id, rows, cols).await,
            TerminalOp::Close => self.close(&session_id).await,
        }
    }

    /// Close every session (connection loss or shutdown).
    pub async fn close_all(&self) {
        let mut sessions = self.sessions.lock().await;
        for (session_id, handle) in sessions.drain() {
            tracing::debug!(session_id = %session_id, "closing terminal session");
            handle.cancel.cancel();
        }
    }

    #[cfg(unix)]
    async fn init(&self, session_id: String, rows: u16, cols: u16, shell: Option<String>) {
        {
            let sessions = self.sessions.lock().await;
            if sessions.contains_key(&session_id) {
                self.send_error(&session_id, "duplicate_session").await;
                return;
            }
        }

        let shell = shell
            .or_else(|| self.shell_override.clone())
            .or_else(|| std::env::var("SHELL").ok())
            .unwrap_or_else(|| "/bin/sh".to_owned());

        let pty = match pty::NativePty::spawn(&[shell.clone()], cols, rows) {
            Ok(pty) => pty,
            Err(e) => {
                tracing::warn!(err = %e, shell = %shell, "pty spawn failed");
                self.send_error(&session_id, "spawn_failed").await;
                return;
            }
        };
        tracing::info!(
            session_id = %session_id,
            shell = %shell,
            pid = pty.child_pid(),
            rows,
            cols,
            "terminal session started"
        );

        let (input_tx, input_rx) = mpsc::channel(64);
        let (resize_tx, resize_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        self.sessions.lock().await.insert(
            session_id.clone(),
            SessionHandle { input_tx, resize_tx, cancel: cancel.clone() },
        );

        tokio::spawn(run_session(
            session_id.clone(),
            pty,
            Arc::clone(&self.sessions),
            self.write_tx.clone(),
            input_rx,
            resize_rx,
            cancel,
        ));

        self.send(Payload::TerminalReady { session_id }).await;
    }

    #[cfg(not(unix))]
    async fn init(&self, session_id: String, _rows: u16, _cols: u16, _shell: Option<String>) {
        self.send_error(&session_id, "unsupported").await;
    }

    async fn input(&self, session_id: &str, data: &str) {
        let input_tx = {
            let sessions = self.sessions.lock().await;
            sessions.get(session_id).map(|h| h.input_tx.clone())
        };
        let Some(input_tx) = input_tx else {
            self.send_error(session_id, "unknown_session").await;
            return;
        };
        let bytes = match base64::engine::general_purpose::STANDARD.decode(data) {
            Ok(bytes) => Bytes::from(bytes),
            Err(_) => {
                self.send_error(session_id, "bad_encoding").await;
                return;
            }
        };
        // Channel pressure here throttles the hub, not the PTY.
        let _ = input_tx.send(bytes).await;
    }

    async fn resize(&self, session_id: &str, rows: u16, cols: u16) {
        let resize_tx = {
            let sessions = self.sessions.lock().await;
            sessions.get(session_id).map(|h| h.resize_tx.clone())
        };
        match resize_tx {
            Some(resize_tx) => {
                let _ = resize_tx.send((cols, rows)).await;
            }
            None => self.send_error(session_id, "unknown_session").await,
        }
    }

    async fn close(&self, session_id: &str) {
        match self.sessions.lock().await.remove(session_id) {
            Some(handle) => handle.cancel.cancel(),
            None => {
                tracing::debug!(session_id, "close for unknown session");
            }
        }
    }

    async fn send(&self, payload: Payload) {
        let _ = self.write_tx.send(Frame::new(payload)).await;
    }

    async fn send_error(&self, session_id: &str, reason: &str) {
        self.send(Payload::TerminalError {
            session_id: session_id.to_owned(),
            reason: reason.to_owned(),
        })
        .await;
    }
}

/// Drive one PTY to completion: raw chunks from the child are split,
/// base64 encoded, sequenced, and framed; the final frame reports how the
/// session ended.
#[cfg(unix)]
async fn run_session(
    session_id: String,
    pty: pty::NativePty,
    sessions: SessionMap,
    write_tx: mpsc::Sender<Frame>,
    input_rx: mpsc::Receiver<Bytes>,
    resize_rx: mpsc::Receiver<(u16, u16)>,
    cancel: CancellationToken,
) {
    let (out_tx, mut out_rx) = mpsc::channel::<Bytes>(64);

    let forward_id = session_id.clone();
    let forward_tx = write_tx.clone();
    let forward = async move {
        let mut seq = 0u64;
        while let Some(chunk) = out_rx.recv().await {
            for part in terminal_chunks(&chunk) {
                let data = base64::engine::general_purpose::STANDARD.encode(part);
                let frame = Frame::new(Payload::TerminalOutput {
                    session_id: forward_id.clone(),
                    data,
                    seq,
                });
                seq += 1;
                if forward_tx.send(frame).await.is_err() {
                    return;
                }
            }
        }
    };

    let (outcome, ()) = tokio::join!(pty.run(out_tx, input_rx, resize_rx, cancel), forward);

    sessions.lock().await.remove(&session_id);
    match outcome {
        Ok(status) => {
            tracing::info!(
                session_id = %session_id,
                code = ?status.code,
                signal = ?status.signal,
                "terminal session ended"
            );
            let _ = write_tx.send(Frame::new(Payload::TerminalClosed { session_id })).await;
        }
        Err(e) => {
            tracing::warn!(err = %e, session_id = %session_id, "terminal session failed");
            let _ = write_tx
                .send(Frame::new(Payload::TerminalError { session_id, reason: "io".into() }))
                .await;
        }
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
