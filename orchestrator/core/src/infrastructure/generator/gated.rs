// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Gated Generator
//
// Wraps a MusicGenerator with, in order:
//   1. circuit breaker admission (no downstream call while open)
//   2. counting semaphore (bounded concurrent calls to the accelerator)
//   3. per-call timeout
//   4. breaker bookkeeping
//
// Transient errors count as breaker failures. An InvalidResponse means the
// service answered, so it counts as a success for the breaker even though
// the section fails.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::domain::config::OrchestratorConfig;
use crate::domain::generator::{GenerationOutput, GenerationRequest, GeneratorError, MusicGenerator};
use crate::infrastructure::circuit_breaker::{CircuitBreaker, CircuitState};

pub struct GatedGenerator {
    inner: Arc<dyn MusicGenerator>,
    breaker: Arc<CircuitBreaker>,
    permits: Arc<Semaphore>,
    call_timeout: Duration,
    health_timeout: Duration,
}

impl GatedGenerator {
    pub fn new(
        inner: Arc<dyn MusicGenerator>,
        breaker: Arc<CircuitBreaker>,
        max_concurrency: usize,
        call_timeout: Duration,
        health_timeout: Duration,
    ) -> Self {
        Self {
            inner,
            breaker,
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
            call_timeout,
            health_timeout,
        }
    }

    pub fn from_config(
        inner: Arc<dyn MusicGenerator>,
        breaker: Arc<CircuitBreaker>,
        config: &OrchestratorConfig,
    ) -> Self {
        Self::new(
            inner,
            breaker,
            config.generator.max_concurrency,
            config.timeouts.generator_call,
            config.timeouts.health_check,
        )
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Permits not currently held by in-flight calls.
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    pub async fn generate(&self, request: &GenerationRequest) -> Result<GenerationOutput, GeneratorError> {
        if !self.breaker.allow_request() {
            record_call("circuit_open");
            return Err(GeneratorError::CircuitOpen);
        }

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| GeneratorError::Unavailable("generator gate closed".to_string()))?;

        // The breaker may have tripped while this call was queued.
        if self.breaker.state() == CircuitState::Open {
            record_call("circuit_open");
            return Err(GeneratorError::CircuitOpen);
        }

        let mut pending = PendingCall::new(&self.breaker);
        let result = match tokio::time::timeout(self.call_timeout, self.inner.generate(request)).await {
            Ok(result) => result,
            Err(_) => Err(GeneratorError::Timeout),
        };
        pending.settle();

        match &result {
            Ok(output) => {
                debug!(
                    instrument = %request.structural.instrument,
                    kind = request.kind.as_str(),
                    notes = output.notes.len(),
                    "Generator call succeeded"
                );
                self.breaker.record_success();
                record_call("success");
            }
            Err(e) if e.is_transient() => {
                warn!(instrument = %request.structural.instrument, error = %e, "Transient generator error");
                self.breaker.record_failure();
                record_call(if matches!(e, GeneratorError::Timeout) { "timeout" } else { "transient" });
            }
            Err(e) => {
                warn!(instrument = %request.structural.instrument, error = %e, "Generator call failed");
                self.breaker.record_success();
                record_call("error");
            }
        }

        result
    }

    /// Bounded health probe; a hang counts as unhealthy.
    pub async fn health_check(&self) -> bool {
        tokio::time::timeout(self.health_timeout, self.inner.health_check())
            .await
            .unwrap_or(false)
    }
}

/// Counts an in-flight call as a breaker failure if its future is dropped
/// before an outcome is recorded, e.g. by a section watchdog.
struct PendingCall<'a> {
    breaker: &'a CircuitBreaker,
    settled: bool,
}

impl<'a> PendingCall<'a> {
    fn new(breaker: &'a CircuitBreaker) -> Self {
        Self {
            breaker,
            settled: false,
        }
    }

    fn settle(&mut self) {
        self.settled = true;
    }
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        if !self.settled {
            warn!("Generator call abandoned in flight, counting as failure");
            self.breaker.record_failure();
            record_call("abandoned");
        }
    }
}

fn record_call(outcome: &'static str) {
    metrics::counter!("ensemble_generator_calls_total", "outcome" => outcome).increment(1);
}
