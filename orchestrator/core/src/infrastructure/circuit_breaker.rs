// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Circuit Breaker - Failure Isolation for the Generator
//
// closed --(threshold consecutive failures)--> open
// open --(cooldown elapsed, first caller)--> half-open (one probe in flight)
// half-open --(probe succeeds)--> closed
// half-open --(probe fails)--> open, cooldown restarts
//
// One instance per process, shared by every request: it protects the
// downstream service, not a single composition.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::domain::config::CircuitBreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_started_at: Option<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            cooldown,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_started_at: None,
            }),
        }
    }

    pub fn from_config(config: &CircuitBreakerConfig) -> Self {
        Self::new(config.failure_threshold, config.cooldown)
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Admission check before a downstream call. While open this returns
    /// false until the cooldown elapses; the first caller after that gets
    /// the single probe and everyone else keeps being rejected.
    pub fn allow_request(&self) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = inner.opened_at.is_none_or(|t| now.duration_since(t) >= self.cooldown);
                if elapsed {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    inner.probe_started_at = Some(now);
                }
                elapsed
            }
            CircuitState::HalfOpen => {
                // A probe whose caller vanished without reporting back frees
                // the slot after one more cooldown.
                let stale = inner
                    .probe_started_at
                    .is_none_or(|t| now.duration_since(t) >= self.cooldown);
                if stale {
                    inner.probe_started_at = Some(now);
                }
                stale
            }
        }
    }

    /// Whether a call made now would be short-circuited. Does not consume the probe.
    pub fn is_open(&self) -> bool {
        let now = Instant::now();
        let inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => inner
                .opened_at
                .is_some_and(|t| now.duration_since(t) < self.cooldown),
            CircuitState::HalfOpen => inner
                .probe_started_at
                .is_some_and(|t| now.duration_since(t) < self.cooldown),
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => inner.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                info!("Generator probe succeeded, closing circuit breaker");
                inner.consecutive_failures = 0;
                inner.opened_at = None;
                inner.probe_started_at = None;
                self.transition(&mut inner, CircuitState::Closed);
            }
            // Late success from a call admitted before the trip; only a
            // half-open trial call may close the circuit.
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.failure_threshold {
                    warn!(
                        failures = inner.consecutive_failures,
                        cooldown = ?self.cooldown,
                        "Generator failure threshold reached, opening circuit breaker"
                    );
                    inner.opened_at = Some(Instant::now());
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                warn!("Generator probe failed, reopening circuit breaker");
                inner.opened_at = Some(Instant::now());
                inner.probe_started_at = None;
                self.transition(&mut inner, CircuitState::Open);
            }
            // Late failure from a call admitted before the trip.
            CircuitState::Open => {}
        }
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState) {
        if inner.state == to {
            return;
        }
        inner.state = to;
        metrics::counter!("ensemble_circuit_breaker_transitions_total", "to" => to.as_str()).increment(1);
    }
}
