// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Section Agent (Level 3)
//!
//! Executes one section of one instrument from a sealed [`SectionContract`].
//!
//! ## Pipeline
//! | Step | Action | On failure |
//! |------|--------|------------|
//! | 1 | verify the contract seal | `ProtocolViolation`, no external call |
//! | 2 | wait for the producer's signal | degrade: run without its notes |
//! | 3 | materialize the region from contract values | `SectionFailure` |
//! | 4 | optional prompt refinement | fall back to the advisory prompt |
//! | 5 | gated generator call | mapped generator error |
//! | 6 | telemetry to `SectionState` | - |
//! | 7 | signal dependents (producers only) | - |
//! | 8 | attach `execution_hash` | - |
//! | 9 | optional expression pass | warning only |
//!
//! The agent never returns an error: every outcome is a [`SectionResult`]
//! and the instrument decides whether to retry.

use serde_json::json;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::application::services::AgentContext;
use crate::domain::contract::SectionContract;
use crate::domain::error::OrchestrationError;
use crate::domain::events::CompositionEvent;
use crate::domain::generator::{
    CreativeParams, GenerationKind, GenerationOutput, GenerationRequest, StructuralParams,
};
use crate::domain::lineage::{ensure_verified, execution_hash};
use crate::domain::llm::{ModelPurpose, ModelRequest};
use crate::domain::music::{ControlPoint, Note};
use crate::domain::outcome::SectionResult;
use crate::domain::telemetry::SectionTelemetry;
use crate::infrastructure::event_bus::EventEmitter;
use ensemble_swarm::SignalWaitError;

const REFINE_SYSTEM: &str = "You write one short generation prompt for a single section of one \
instrument. Reply with the prompt text only.";

/// Per-attempt inputs that are not part of the contract.
#[derive(Debug, Clone, Default)]
pub struct SectionRun {
    /// 1-based.
    pub attempt: u32,
    /// No retry follows a failure of this attempt.
    pub final_attempt: bool,
    /// Tail of the previous section (sequential mode).
    pub continuation: Vec<Note>,
    /// Placement proposed by the planning step; the contract always wins.
    pub planned_start_beat: Option<f64>,
    pub planned_duration_beats: Option<f64>,
}

impl SectionRun {
    pub fn first(final_attempt: bool) -> Self {
        Self {
            attempt: 1,
            final_attempt,
            ..Default::default()
        }
    }
}

struct Dependency {
    notes: Vec<Note>,
    degraded: bool,
}

pub struct SectionAgent {
    ctx: AgentContext,
    events: EventEmitter,
}

impl SectionAgent {
    /// `events` should already carry the instrument and section correlation.
    pub fn new(ctx: AgentContext, events: EventEmitter) -> Self {
        Self { ctx, events }
    }

    pub async fn run(&self, contract: &SectionContract, run: SectionRun) -> SectionResult {
        let mut result = match self.execute(contract, &run).await {
            Ok(result) => result,
            Err(e) => {
                if matches!(e, OrchestrationError::ProtocolViolation(_)) {
                    error!(
                        instrument = %contract.instrument,
                        section_id = %contract.section_id(),
                        error = %e,
                        "Refusing to run section with unverified contract"
                    );
                } else {
                    warn!(
                        instrument = %contract.instrument,
                        section_id = %contract.section_id(),
                        attempt = run.attempt,
                        error = %e,
                        "Section attempt failed"
                    );
                }

                // Dependents must never hang on a producer that will not retry.
                if contract.is_producer && (run.final_attempt || !e.is_retryable()) {
                    self.signal(contract, false, None);
                }

                self.events.emit(CompositionEvent::ToolError {
                    tool: "generate_section".to_string(),
                    error: e.to_string(),
                });

                SectionResult::failed(
                    &contract.instrument,
                    contract.section_id(),
                    &contract.contract_hash,
                    contract.parent_contract_hash.as_deref(),
                    &e,
                )
            }
        };

        result.attempts = run.attempt;
        metrics::counter!(
            "ensemble_section_attempts_total",
            "outcome" => if result.success { "success" } else { "failure" }
        )
        .increment(1);
        result
    }

    async fn execute(
        &self,
        contract: &SectionContract,
        run: &SectionRun,
    ) -> Result<SectionResult, OrchestrationError> {
        // 1. Nothing external happens before the seal checks out.
        ensure_verified(contract)?;

        let section = contract.section.as_ref();
        let section_id = section.section_id.as_str();

        // 2. Dependency
        let dependency = self.await_dependency(contract).await?;

        // 3. Region placement comes from the contract, whatever the plan said.
        if run.planned_start_beat.is_some_and(|b| b != section.start_beat)
            || run.planned_duration_beats.is_some_and(|d| d != section.duration_beats)
        {
            debug!(
                section_id,
                planned_start = ?run.planned_start_beat,
                planned_duration = ?run.planned_duration_beats,
                start = section.start_beat,
                duration = section.duration_beats,
                "Correcting planned placement to contract values"
            );
        }

        let (region_id, created) = self
            .ctx
            .timeline
            .ensure_region(&contract.track_id, section.start_beat, section.duration_beats)
            .map_err(|e| OrchestrationError::SectionFailure {
                section_id: section_id.to_string(),
                reason: e.to_string(),
            })?;

        if created {
            self.events.emit(CompositionEvent::ToolResult {
                tool: "create_region".to_string(),
                result: json!({
                    "region_id": region_id,
                    "track_id": contract.track_id,
                    "start_beat": section.start_beat,
                    "duration_beats": section.duration_beats,
                }),
            });
        }

        // 4. Prompt
        let prompt = self.creative_prompt(contract, &dependency).await;

        // 5. Generate
        let request = GenerationRequest {
            kind: GenerationKind::Part,
            structural: self.structural_params(contract),
            creative: CreativeParams {
                prompt: prompt.clone(),
                style: contract.style.clone(),
                character: (!section.character.is_empty()).then(|| section.character.clone()),
                continuation: run.continuation.clone(),
                dependency: dependency.notes.clone(),
            },
        };

        self.events.emit(CompositionEvent::GenerationStarted {
            kind: GenerationKind::Part.as_str().to_string(),
            prompt,
        });
        let started = Instant::now();

        let output = self
            .ctx
            .generator
            .generate(&request)
            .await
            .map_err(|e| OrchestrationError::from_generator(section_id, e))?;

        self.events.emit(CompositionEvent::GenerationCompleted {
            kind: GenerationKind::Part.as_str().to_string(),
            note_count: output.notes.len(),
            duration_ms: started.elapsed().as_millis() as u64,
        });

        self.ctx
            .timeline
            .write_notes(&region_id, output.notes.clone())
            .map_err(|e| OrchestrationError::SectionFailure {
                section_id: section_id.to_string(),
                reason: e.to_string(),
            })?;

        // 6. Telemetry
        let telemetry = SectionTelemetry::compute(
            &contract.instrument,
            section_id,
            contract.tempo,
            &output.notes,
            section.duration_beats,
            section.beats_per_bar(),
        );
        self.ctx
            .services
            .state
            .record(&contract.instrument, section_id, telemetry);

        // 7. Release dependents before the optional expression pass.
        if contract.is_producer {
            self.signal(contract, true, Some(output.notes.clone()));
        }

        // 8. Attest
        let execution_hash = execution_hash(&contract.contract_hash, &self.ctx.runtime.trace_id);

        // 9. Expression
        let expression = if self.ctx.runtime.expressive {
            self.expression_pass(contract, &request, &output, &region_id).await
        } else {
            Vec::new()
        };

        info!(
            instrument = %contract.instrument,
            section_id,
            notes = output.notes.len(),
            degraded = dependency.degraded,
            "Section completed"
        );

        Ok(SectionResult {
            instrument: contract.instrument.clone(),
            section_id: section_id.to_string(),
            success: true,
            region_id: Some(region_id),
            notes: output.notes,
            expression,
            degraded: dependency.degraded,
            region_skipped: !created,
            attempts: run.attempt,
            error: None,
            contract_hash: contract.contract_hash.clone(),
            parent_contract_hash: contract.parent_contract_hash.clone(),
            execution_hash,
        })
    }

    async fn await_dependency(&self, contract: &SectionContract) -> Result<Dependency, OrchestrationError> {
        let Some(dependency) = &contract.dependency else {
            return Ok(Dependency {
                notes: Vec::new(),
                degraded: false,
            });
        };

        self.events.status(format!(
            "Waiting for {} {}",
            dependency.producer, dependency.section_id
        ));

        let waited = self
            .ctx
            .services
            .signals
            .wait_for(
                &dependency.section_id,
                &dependency.spec_hash,
                self.ctx.config.timeouts.dependency_wait,
            )
            .await;

        let degraded = |reason: String| -> Result<Dependency, OrchestrationError> {
            warn!(
                instrument = %contract.instrument,
                section_id = %dependency.section_id,
                producer = %dependency.producer,
                reason = %reason,
                "Proceeding without dependency"
            );
            self.events.status(format!(
                "Proceeding without {}: {}",
                dependency.producer, reason
            ));
            Ok(Dependency {
                notes: Vec::new(),
                degraded: true,
            })
        };

        match waited {
            Ok(result) if result.success => Ok(Dependency {
                notes: result.payload.clone().unwrap_or_default(),
                degraded: false,
            }),
            Ok(_) => degraded("producer failed".to_string()),
            Err(e @ SignalWaitError::LineageMismatch { .. }) => {
                Err(OrchestrationError::ProtocolViolation(e.to_string()))
            }
            Err(e) => degraded(e.to_string()),
        }
    }

    async fn creative_prompt(&self, contract: &SectionContract, dependency: &Dependency) -> String {
        let section = contract.section.as_ref();
        let fallback = if contract.suggested_prompt.is_empty() {
            format!("{} {} for the {}", contract.style, contract.role, section.name)
        } else {
            contract.suggested_prompt.clone()
        };

        if !self.ctx.runtime.refine_prompts {
            return fallback;
        }

        let siblings: Vec<String> = self
            .ctx
            .services
            .state
            .for_section(&section.section_id)
            .into_iter()
            .filter(|(_, t)| t.instrument != contract.instrument)
            .map(|(_, t)| {
                format!(
                    "- {}: energy {:.2}, density {:.2}, complexity {:.2}",
                    t.instrument, t.energy, t.density, t.complexity
                )
            })
            .collect();

        let mut prompt = format!(
            "Instrument: {} ({})\nSection: {} ({} bars)\nCharacter: {}\nBrief: {}\nDraft prompt: {}",
            contract.instrument,
            contract.role,
            section.name,
            section.bar_count,
            section.character,
            section.role_brief,
            fallback,
        );
        if !dependency.notes.is_empty() {
            prompt.push_str(&format!("\nFollowing a part with {} notes", dependency.notes.len()));
        }
        if !siblings.is_empty() {
            prompt.push_str("\nOther parts so far:\n");
            prompt.push_str(&siblings.join("\n"));
        }

        let request = ModelRequest {
            purpose: ModelPurpose::SectionRefinement,
            subject: contract.instrument.clone(),
            system: REFINE_SYSTEM.to_string(),
            prompt,
            tools: Vec::new(),
        };

        match self.ctx.llm.complete(&request).await {
            Ok(response) if !response.text.trim().is_empty() => response.text.trim().to_string(),
            Ok(_) => fallback,
            Err(e) => {
                warn!(
                    instrument = %contract.instrument,
                    section_id = %section.section_id,
                    error = %e,
                    "Prompt refinement failed, using planned prompt"
                );
                fallback
            }
        }
    }

    async fn expression_pass(
        &self,
        contract: &SectionContract,
        part: &GenerationRequest,
        output: &GenerationOutput,
        region_id: &str,
    ) -> Vec<ControlPoint> {
        let request = GenerationRequest {
            kind: GenerationKind::Expression,
            structural: part.structural.clone(),
            creative: CreativeParams {
                prompt: format!("expressive dynamics for {}", part.creative.prompt),
                continuation: Vec::new(),
                dependency: output.notes.clone(),
                ..part.creative.clone()
            },
        };

        self.events.emit(CompositionEvent::GenerationStarted {
            kind: GenerationKind::Expression.as_str().to_string(),
            prompt: request.creative.prompt.clone(),
        });
        let started = Instant::now();

        let written = match self.ctx.generator.generate(&request).await {
            Ok(expression) => self
                .ctx
                .timeline
                .write_expression(region_id, expression.expression.clone())
                .map(|_| expression.expression)
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        match written {
            Ok(points) => {
                self.events.emit(CompositionEvent::GenerationCompleted {
                    kind: GenerationKind::Expression.as_str().to_string(),
                    note_count: points.len(),
                    duration_ms: started.elapsed().as_millis() as u64,
                });
                points
            }
            Err(e) => {
                warn!(
                    instrument = %contract.instrument,
                    section_id = %contract.section_id(),
                    error = %e,
                    "Expression pass failed, keeping the plain part"
                );
                self.events.status(format!("Expression pass skipped: {}", e));
                Vec::new()
            }
        }
    }

    fn structural_params(&self, contract: &SectionContract) -> StructuralParams {
        let section = contract.section.as_ref();
        StructuralParams {
            instrument: contract.instrument.clone(),
            role: contract.role.clone(),
            tempo: contract.tempo,
            key: contract.key.clone(),
            start_beat: section.start_beat,
            duration_beats: section.duration_beats,
            bars: section.bar_count,
            beats_per_bar: section.beats_per_bar(),
        }
    }

    fn signal(&self, contract: &SectionContract, success: bool, notes: Option<Vec<Note>>) {
        self.ctx.services.signals.signal_complete(
            contract.section_id(),
            &contract.section.contract_hash,
            success,
            notes,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::services::ExecutionServices;
    use crate::domain::config::OrchestratorConfig;
    use crate::domain::contract::{RuntimeContext, SectionDependency, SectionSpec};
    use crate::domain::error::ErrorKind;
    use crate::domain::generator::{GeneratorError, MusicGenerator};
    use crate::domain::lineage::seal;
    use crate::domain::llm::{LLMError, LLMProvider, ModelResponse};
    use crate::domain::timeline::ProjectTimeline;
    use crate::infrastructure::circuit_breaker::CircuitBreaker;
    use crate::infrastructure::event_bus::EventQueue;
    use crate::infrastructure::generator::GatedGenerator;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use uuid::Uuid;

    struct SilentModel;

    #[async_trait]
    impl LLMProvider for SilentModel {
        async fn complete(&self, _request: &ModelRequest) -> Result<ModelResponse, LLMError> {
            Err(LLMError::Provider("offline".to_string()))
        }
    }

    #[derive(Default)]
    struct RecordingGenerator {
        calls: AtomicUsize,
        fail_expression: bool,
        requests: Mutex<Vec<GenerationRequest>>,
    }

    #[async_trait]
    impl MusicGenerator for RecordingGenerator {
        async fn generate(&self, request: &GenerationRequest) -> Result<GenerationOutput, GeneratorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().push(request.clone());
            match request.kind {
                GenerationKind::Expression if self.fail_expression => Err(GeneratorError::QueueFull),
                GenerationKind::Expression => Ok(GenerationOutput {
                    notes: vec![],
                    expression: vec![ControlPoint { beat: 0.0, value: 64 }],
                }),
                GenerationKind::Part => Ok(GenerationOutput {
                    notes: vec![Note::new(36, 0.0, 1.0, 100), Note::new(38, 1.0, 1.0, 90)],
                    expression: vec![],
                }),
            }
        }

        async fn health_check(&self) -> bool {
            true
        }
    }

    struct Harness {
        ctx: AgentContext,
        generator: Arc<RecordingGenerator>,
        queue: EventQueue,
    }

    fn harness(generator: RecordingGenerator, runtime: RuntimeContext) -> Harness {
        let generator = Arc::new(generator);
        let mut config = OrchestratorConfig::default();
        config.timeouts.dependency_wait = Duration::from_millis(200);
        let ctx = AgentContext {
            llm: Arc::new(SilentModel),
            generator: Arc::new(GatedGenerator::new(
                generator.clone(),
                Arc::new(CircuitBreaker::new(3, Duration::from_secs(60))),
                2,
                Duration::from_secs(5),
                Duration::from_secs(1),
            )),
            timeline: Arc::new(ProjectTimeline::new()),
            services: ExecutionServices::new(),
            config: Arc::new(config),
            runtime: Arc::new(runtime),
        };
        Harness {
            ctx,
            generator,
            queue: EventQueue::new(),
        }
    }

    fn contract(h: &Harness, instrument: &str, is_producer: bool, depends_on: Option<&str>) -> SectionContract {
        let spec = Arc::new(seal(
            SectionSpec::new(0, "Intro", 0.0, 2, 4).with_character("sparse"),
            None,
        ));
        let (track_id, _) = h.ctx.timeline.create_track(instrument, instrument);
        seal(
            SectionContract {
                instrument: instrument.to_string(),
                role: "rhythm".to_string(),
                section: spec.clone(),
                dependency: depends_on.map(|producer| SectionDependency {
                    producer: producer.to_string(),
                    section_id: spec.section_id.clone(),
                    spec_hash: spec.contract_hash.clone(),
                }),
                is_producer,
                style: "house".to_string(),
                tempo: 124,
                key: "F minor".to_string(),
                track_id: String::new(),
                suggested_prompt: String::new(),
                contract_hash: String::new(),
                parent_contract_hash: None,
            },
            Some("0123456789abcdef"),
        )
        .with_track_id(track_id)
        .with_suggested_prompt("four on the floor")
    }

    fn agent(h: &Harness, instrument: &str) -> SectionAgent {
        SectionAgent::new(
            h.ctx.clone(),
            h.queue.emitter().for_instrument(instrument).for_section("00-intro"),
        )
    }

    #[tokio::test]
    async fn test_success_attests_and_signals() {
        let h = harness(RecordingGenerator::default(), RuntimeContext::new(Uuid::nil()).with_trace_id("t-1"));
        let c = contract(&h, "drums", true, None);

        let result = agent(&h, "drums").run(&c, SectionRun::first(true)).await;

        assert!(result.success);
        assert_eq!(result.notes.len(), 2);
        assert_eq!(result.execution_hash, execution_hash(&c.contract_hash, "t-1"));
        assert_eq!(result.parent_contract_hash.as_deref(), Some("0123456789abcdef"));
        assert!(h.ctx.services.state.get("drums", "00-intro").is_some());

        let signal = h.ctx.services.signals.peek("00-intro", &c.section.contract_hash).unwrap();
        assert!(signal.success);
        assert_eq!(signal.payload.as_ref().unwrap().len(), 2);

        let requests = h.generator.requests.lock();
        assert_eq!(requests[0].creative.prompt, "four on the floor");
        assert_eq!(requests[0].creative.character.as_deref(), Some("sparse"));
    }

    #[tokio::test]
    async fn test_tampered_contract_makes_no_calls() {
        let h = harness(RecordingGenerator::default(), RuntimeContext::new(Uuid::nil()));
        let mut c = contract(&h, "drums", true, None);
        c.tempo = 180;

        let result = agent(&h, "drums").run(&c, SectionRun::first(false)).await;

        assert!(!result.success);
        assert_eq!(result.error_kind(), Some(ErrorKind::ProtocolViolation));
        assert_eq!(h.generator.calls.load(Ordering::SeqCst), 0);
        assert!(h.ctx.timeline.snapshot().regions.is_empty());
        // Not retryable, so the failure is signalled even on a non-final attempt.
        assert!(!h.ctx.services.signals.peek("00-intro", &c.section.contract_hash).unwrap().success);
    }

    #[tokio::test]
    async fn test_failed_producer_degrades_dependent() {
        let h = harness(RecordingGenerator::default(), RuntimeContext::new(Uuid::nil()));
        let c = contract(&h, "bass", false, Some("drums"));
        h.ctx
            .services
            .signals
            .signal_complete("00-intro", &c.section.contract_hash, false, None);

        let result = agent(&h, "bass").run(&c, SectionRun::first(true)).await;

        assert!(result.success);
        assert!(result.degraded);
        assert!(h.generator.requests.lock()[0].creative.dependency.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_producer_times_out_into_degraded_mode() {
        let h = harness(RecordingGenerator::default(), RuntimeContext::new(Uuid::nil()));
        let c = contract(&h, "bass", false, Some("drums"));

        let result = agent(&h, "bass").run(&c, SectionRun::first(true)).await;
        assert!(result.success);
        assert!(result.degraded);
    }

    #[tokio::test]
    async fn test_dependency_notes_are_forwarded() {
        let h = harness(RecordingGenerator::default(), RuntimeContext::new(Uuid::nil()));
        let c = contract(&h, "bass", false, Some("drums"));
        h.ctx.services.signals.signal_complete(
            "00-intro",
            &c.section.contract_hash,
            true,
            Some(vec![Note::new(36, 0.0, 0.5, 110)]),
        );

        let result = agent(&h, "bass").run(&c, SectionRun::first(true)).await;
        assert!(!result.degraded);
        assert_eq!(h.generator.requests.lock()[0].creative.dependency.len(), 1);
    }

    #[tokio::test]
    async fn test_retry_reuses_existing_region() {
        let h = harness(RecordingGenerator::default(), RuntimeContext::new(Uuid::nil()));
        let c = contract(&h, "keys", false, None);
        let a = agent(&h, "keys");

        let first = a.run(&c, SectionRun::first(false)).await;
        let second = a
            .run(
                &c,
                SectionRun {
                    attempt: 2,
                    final_attempt: true,
                    planned_start_beat: Some(64.0),
                    ..Default::default()
                },
            )
            .await;

        assert!(!first.region_skipped);
        assert!(second.region_skipped);
        assert_eq!(first.region_id, second.region_id);
        assert_eq!(second.attempts, 2);

        let regions = h.ctx.timeline.snapshot().regions;
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].start_beat, 0.0);
    }

    #[tokio::test]
    async fn test_expression_failure_does_not_fail_section() {
        let generator = RecordingGenerator {
            fail_expression: true,
            ..Default::default()
        };
        let h = harness(generator, RuntimeContext::new(Uuid::nil()).with_expressive(true));
        let c = contract(&h, "keys", false, None);

        let result = agent(&h, "keys").run(&c, SectionRun::first(true)).await;
        assert!(result.success);
        assert!(result.expression.is_empty());
        assert_eq!(h.generator.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_refinement_failure_falls_back_to_planned_prompt() {
        let h = harness(
            RecordingGenerator::default(),
            RuntimeContext::new(Uuid::nil()).with_refine_prompts(true),
        );
        let c = contract(&h, "keys", false, None);

        let result = agent(&h, "keys").run(&c, SectionRun::first(true)).await;
        assert!(result.success);
        assert_eq!(h.generator.requests.lock()[0].creative.prompt, "four on the floor");
    }
}
