// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Reconnect backoff: doubles from base to a ceiling, with ±20% uniform
//! jitter so a replica restart does not stampede the hub.

use std::time::Duration;

use rand::Rng;

/// Jitter band applied to every delay.
const JITTER_FACTOR: f64 = 0.2;

pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max, current: base }
    }

    /// Back to the base interval; called after a successful welcome.
    pub fn reset(&mut self) {
        self.current = self.base;
    }

    /// The delay to sleep before the next attempt. Doubles the stored
    /// interval afterwards, up to the ceiling.
    pub fn next_delay(&mut self) -> Duration {
        let delay = jitter(self.current);
        self.current = (self.current * 2).min(self.max);
        delay
    }

    /// Current un-jittered interval (what the next delay derives from).
    pub fn current(&self) -> Duration {
        self.current
    }
}

fn jitter(d: Duration) -> Duration {
    let factor = rand::rng().random_range(1.0 - JITTER_FACTOR..=1.0 + JITTER_FACTOR);
    d.mul_f64(factor)
}

#[cfg(test)]
#[path = "backoff_tests.rs"]
mod tests;
