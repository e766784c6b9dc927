// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The reconnect loop: dial, serve, back off, repeat — until a shutdown
//! signal lands.

use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::backoff::Backoff;
use crate::config::ProbeConfig;
use crate::conn::{self, SessionEnd};

/// Run the probe until shutdown.
pub async fn run(config: ProbeConfig) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let started_at = Instant::now();
    let mut backoff = Backoff::new(config.reconnect_base(), config.reconnect_max());

    while !shutdown.is_cancelled() {
        match conn::session(&config, started_at, &shutdown).await {
            Ok(SessionEnd::Shutdown) => break,
            Ok(SessionEnd::Welcomed) => {
                // A session that got as far as welcome resets the backoff.
                backoff.reset();
                tracing::info!("connection lost; reconnecting");
            }
            Err(e) => {
                tracing::warn!(err = %e, "connection attempt failed");
            }
        }

        let delay = backoff.next_delay();
        tracing::debug!(delay_ms = delay.as_millis() as u64, "backing off");
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    tracing::info!("probe exiting");
    Ok(())
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut term = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate(),
            ) {
                Ok(term) => term,
                Err(e) => {
                    tracing::warn!(err = %e, "cannot install SIGTERM handler");
                    let _ = tokio::signal::ctrl_c().await;
                    shutdown.cancel();
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        tracing::info!("shutdown signal received");
        shutdown.cancel();
    });
}
