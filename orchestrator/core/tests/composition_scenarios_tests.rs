// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! End-to-end composition scenarios run through the coordinator with a
//! scripted model and an in-memory generator.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use ensemble_core::application::{AgentContext, Coordinator, ExecutionServices, SectionAgent, SectionRun};
use ensemble_core::domain::config::OrchestratorConfig;
use ensemble_core::domain::contract::{RuntimeContext, SectionContract, SectionSpec};
use ensemble_core::domain::error::ErrorKind;
use ensemble_core::domain::events::{CompositionEvent, EventEnvelope, StepStatus};
use ensemble_core::domain::generator::{
    GenerationKind, GenerationOutput, GenerationRequest, GeneratorError, MusicGenerator,
};
use ensemble_core::domain::lineage::seal;
use ensemble_core::domain::llm::{LLMError, LLMProvider, ModelPurpose, ModelRequest, ModelResponse, ToolCall};
use ensemble_core::domain::music::Note;
use ensemble_core::domain::outcome::CompositionOutcome;
use ensemble_core::domain::plan::{
    ADD_EFFECT, ADD_SEND, CREATE_BUS, CREATE_TRACK, GENERATE_SECTION, SET_LEVEL,
};
use ensemble_core::domain::request::CompositionRequest;
use ensemble_core::domain::timeline::ProjectTimeline;
use ensemble_core::infrastructure::{ChannelEventSink, CircuitBreaker, EventQueue, GatedGenerator};

// ============================================================================
// Test doubles
// ============================================================================

/// Plans every section listed in the prompt and mixes every listed track.
#[derive(Default)]
struct ScriptedModel {
    calls: Mutex<Vec<(ModelPurpose, String)>>,
    /// Never answer the mixing call.
    hang_mixing: bool,
}

impl ScriptedModel {
    fn calls_for(&self, purpose: ModelPurpose) -> usize {
        self.calls.lock().iter().filter(|(p, _)| *p == purpose).count()
    }
}

/// First column of every `- a | b | ...` line.
fn listed_ids(prompt: &str) -> Vec<String> {
    prompt
        .lines()
        .filter_map(|l| l.strip_prefix("- "))
        .filter_map(|l| l.split(" | ").next())
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl LLMProvider for ScriptedModel {
    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse, LLMError> {
        self.calls.lock().push((request.purpose, request.subject.clone()));
        if self.hang_mixing && request.purpose == ModelPurpose::Mixing {
            std::future::pending::<()>().await;
        }

        let tool_calls = match request.purpose {
            ModelPurpose::InstrumentPlan | ModelPurpose::GapFill => {
                let mut calls = vec![ToolCall::new(CREATE_TRACK, json!({"name": request.subject}))];
                calls.extend(listed_ids(&request.prompt).into_iter().map(|id| {
                    ToolCall::new(
                        GENERATE_SECTION,
                        json!({"section_id": id, "prompt": format!("{} idea", request.subject)}),
                    )
                }));
                calls.push(ToolCall::new(ADD_EFFECT, json!({"effect": "eq"})));
                calls
            }
            ModelPurpose::Mixing => {
                let mut calls = vec![ToolCall::new(CREATE_BUS, json!({"name": "Reverb"}))];
                for track_id in listed_ids(&request.prompt) {
                    calls.push(ToolCall::new(
                        ADD_SEND,
                        json!({"track": track_id, "bus": "Reverb", "level_db": -18.0}),
                    ));
                    calls.push(ToolCall::new(SET_LEVEL, json!({"track": track_id, "level_db": -6.0})));
                }
                calls
            }
            ModelPurpose::SectionRefinement => Vec::new(),
        };

        Ok(ModelResponse {
            text: format!("{:?} for {}", request.purpose, request.subject),
            tool_calls,
        })
    }
}

/// In-memory generator with per-(instrument, start beat) failures and hangs.
struct MockGenerator {
    healthy: bool,
    delay: Duration,
    failures: HashMap<(String, u64), GeneratorError>,
    hanging: Vec<(String, u64)>,
    calls: AtomicUsize,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl MockGenerator {
    fn healthy() -> Self {
        Self {
            healthy: true,
            delay: Duration::ZERO,
            failures: HashMap::new(),
            hanging: Vec::new(),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    fn failing(mut self, instrument: &str, start_beat: f64, error: GeneratorError) -> Self {
        self.failures.insert((instrument.to_string(), start_beat as u64), error);
        self
    }

    fn hanging(mut self, instrument: &str, start_beat: f64) -> Self {
        self.hanging.push((instrument.to_string(), start_beat as u64));
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MusicGenerator for MockGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationOutput, GeneratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let key = (
            request.structural.instrument.clone(),
            request.structural.start_beat as u64,
        );
        if self.hanging.contains(&key) {
            std::future::pending::<()>().await;
        }
        if let Some(error) = self.failures.get(&key) {
            return Err(error.clone());
        }

        let notes = (0..request.structural.duration_beats as u32)
            .map(|beat| Note::new(48 + (beat % 12) as u8, f64::from(beat), 0.5, 96))
            .collect();
        Ok(GenerationOutput {
            notes,
            expression: Vec::new(),
        })
    }

    async fn health_check(&self) -> bool {
        self.healthy
    }
}

// ============================================================================
// Harness
// ============================================================================

const TWO_BY_TWO: &str = r#"
style: nu jazz
tempo: 100
key: A minor
sections:
  - name: Intro
    bars: 4
    character: sparse
  - name: Verse
    bars: 4
instruments:
  - name: drums
    role: rhythm
  - name: keys
    role: harmony
"#;

const DEPENDENT: &str = r#"
style: funk
tempo: 104
key: E minor
sections:
  - name: Intro
    bars: 4
  - name: Verse
    bars: 4
instruments:
  - name: drums
    role: rhythm
  - name: bass
    role: low end
    depends_on: drums
"#;

fn config() -> OrchestratorConfig {
    let config = OrchestratorConfig::default();
    config.validate().unwrap();
    config
}

fn gated(generator: Arc<MockGenerator>, config: &OrchestratorConfig) -> Arc<GatedGenerator> {
    Arc::new(GatedGenerator::new(
        generator,
        Arc::new(CircuitBreaker::new(50, Duration::from_secs(60))),
        config.generator.max_concurrency,
        config.timeouts.generator_call,
        config.timeouts.health_check,
    ))
}

struct Run {
    outcome: CompositionOutcome,
    events: Vec<EventEnvelope>,
}

async fn compose(
    request: &str,
    model: Arc<ScriptedModel>,
    generator: Arc<MockGenerator>,
    config: OrchestratorConfig,
    cancel: CancellationToken,
) -> Run {
    let request = CompositionRequest::from_yaml_str(request).unwrap();
    let (sink, mut receiver) = ChannelEventSink::new(100_000);
    let coordinator = Coordinator::new(model, gated(generator, &config), Arc::new(config));

    let outcome = coordinator.compose(&request, Arc::new(sink), cancel).await;

    let mut events = Vec::new();
    while let Ok(envelope) = receiver.try_recv() {
        events.push(envelope);
    }
    Run { outcome, events }
}

fn completes(events: &[EventEnvelope]) -> Vec<&CompositionEvent> {
    events.iter().map(|e| &e.event).filter(|e| e.is_terminal()).collect()
}

fn step_statuses(events: &[EventEnvelope], step: &str) -> Vec<StepStatus> {
    events
        .iter()
        .filter_map(|e| match &e.event {
            CompositionEvent::PlanStep { step_id, status, .. } if step_id == step => Some(*status),
            _ => None,
        })
        .collect()
}

/// Every active step is closed, exactly one terminal event, and it is last.
fn assert_well_formed(events: &[EventEnvelope]) {
    let mut open: HashMap<String, StepStatus> = HashMap::new();
    for envelope in events {
        if let CompositionEvent::PlanStep { step_id, status, .. } = &envelope.event {
            open.insert(step_id.clone(), *status);
        }
    }
    let dangling: Vec<&String> = open
        .iter()
        .filter(|(_, s)| !s.is_terminal())
        .map(|(id, _)| id)
        .collect();
    assert!(dangling.is_empty(), "dangling steps: {:?}", dangling);

    assert_eq!(completes(events).len(), 1);
    assert!(events.last().unwrap().event.is_terminal());

    let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
    let expected: Vec<u64> = (1..=events.len() as u64).collect();
    assert_eq!(seqs, expected);
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_happy_path_two_instruments_two_sections() {
    let model = Arc::new(ScriptedModel::default());
    let generator = Arc::new(MockGenerator::healthy());

    let run = compose(TWO_BY_TWO, model.clone(), generator.clone(), config(), CancellationToken::new()).await;
    let outcome = &run.outcome;

    assert!(outcome.success);
    assert!(outcome.failed_steps.is_empty(), "{:?}", outcome.failed_steps);
    assert_eq!(outcome.section_results.len(), 4);
    assert!(outcome.section_results.iter().all(|r| r.success && !r.execution_hash.is_empty()));
    assert_eq!(outcome.instruments.len(), 2);
    assert!(outcome.instruments.iter().all(|s| s.succeeded()));
    assert_eq!(outcome.telemetry.len(), 4);
    assert!(outcome.telemetry.contains_key("keys: 01-verse"));

    assert!(outcome.mix_applied);
    assert_eq!(model.calls_for(ModelPurpose::InstrumentPlan), 2);
    assert_eq!(model.calls_for(ModelPurpose::Mixing), 1);
    assert_eq!(model.calls_for(ModelPurpose::GapFill), 0);
    assert_eq!(generator.calls(), 4);

    assert_eq!(step_statuses(&run.events, "mixing"), vec![StepStatus::Active, StepStatus::Completed]);
    assert_well_formed(&run.events);
    match completes(&run.events)[0] {
        CompositionEvent::Complete { success, failed_steps, .. } => {
            assert!(*success);
            assert!(failed_steps.is_empty());
        }
        other => panic!("unexpected terminal event {:?}", other),
    }

    let timeline = &outcome.timeline;
    assert_eq!(timeline.tempo, Some(100));
    assert_eq!(timeline.tracks.len(), 2);
    assert_eq!(timeline.regions.len(), 4);
    assert_eq!(timeline.sends.len(), 2);
    assert!(timeline.tracks.iter().all(|t| t.level_db == -6.0 && t.effects == vec!["eq"]));

    // Regions land exactly on the section grid.
    let mut starts: Vec<f64> = timeline.regions.iter().map(|r| r.start_beat).collect();
    starts.sort_by(|a, b| a.partial_cmp(b).unwrap());
    assert_eq!(starts, vec![0.0, 0.0, 16.0, 16.0]);
}

#[tokio::test(start_paused = true)]
async fn test_events_carry_correlation_fields() {
    let run = compose(
        TWO_BY_TWO,
        Arc::new(ScriptedModel::default()),
        Arc::new(MockGenerator::healthy()),
        config(),
        CancellationToken::new(),
    )
    .await;

    let generation_events: Vec<&EventEnvelope> = run
        .events
        .iter()
        .filter(|e| matches!(e.event, CompositionEvent::GenerationCompleted { .. }))
        .collect();
    assert_eq!(generation_events.len(), 4);
    for envelope in generation_events {
        assert!(envelope.instrument.is_some());
        assert!(envelope.section_id.is_some());
    }

    assert!(run
        .events
        .iter()
        .any(|e| matches!(&e.event, CompositionEvent::Reasoning { .. }) && e.instrument.as_deref() == Some("drums")));
}

#[tokio::test(start_paused = true)]
async fn test_dependency_wait_degrades_when_producer_fails() {
    let generator = Arc::new(MockGenerator::healthy().failing(
        "drums",
        0.0,
        GeneratorError::InvalidResponse("empty pattern".to_string()),
    ));

    let run = compose(
        DEPENDENT,
        Arc::new(ScriptedModel::default()),
        generator.clone(),
        config(),
        CancellationToken::new(),
    )
    .await;
    let outcome = &run.outcome;

    let drums_intro = outcome.section("drums", "00-intro").unwrap();
    assert!(!drums_intro.success);
    assert_eq!(drums_intro.attempts, 3);

    let bass_intro = outcome.section("bass", "00-intro").unwrap();
    assert!(bass_intro.success);
    assert!(bass_intro.degraded);

    let bass_verse = outcome.section("bass", "01-verse").unwrap();
    assert!(bass_verse.success);
    assert!(!bass_verse.degraded);

    // The verse bass part was generated against the drum part.
    let requests = generator.requests.lock();
    let verse_bass = requests
        .iter()
        .find(|r| r.structural.instrument == "bass" && r.structural.start_beat == 16.0)
        .unwrap();
    assert!(!verse_bass.creative.dependency.is_empty());

    assert!(outcome.success);
    assert_eq!(outcome.failed_steps, vec!["drums:00-intro".to_string()]);
    assert_well_formed(&run.events);
}

#[tokio::test]
async fn test_tampered_section_contract_never_reaches_generator() {
    let generator = Arc::new(MockGenerator::healthy());
    let config = config();
    let ctx = AgentContext {
        llm: Arc::new(ScriptedModel::default()),
        generator: gated(generator.clone(), &config),
        timeline: Arc::new(ProjectTimeline::new()),
        services: ExecutionServices::new(),
        config: Arc::new(config),
        runtime: Arc::new(RuntimeContext::new(Uuid::new_v4())),
    };
    let (track_id, _) = ctx.timeline.create_track("Drums", "drums");

    let spec = Arc::new(seal(SectionSpec::new(0, "Intro", 0.0, 4, 4), None));
    let mut contract = seal(
        SectionContract {
            instrument: "drums".to_string(),
            role: "rhythm".to_string(),
            section: spec,
            dependency: None,
            is_producer: false,
            style: "techno".to_string(),
            tempo: 128,
            key: "A minor".to_string(),
            track_id: String::new(),
            suggested_prompt: String::new(),
            contract_hash: String::new(),
            parent_contract_hash: None,
        },
        Some("00112233aabbccdd"),
    )
    .with_track_id(track_id);

    // Structural field changed after sealing.
    contract.instrument = "keys".to_string();

    let queue = EventQueue::new();
    let agent = SectionAgent::new(ctx.clone(), queue.emitter().for_instrument("drums").for_section("00-intro"));
    let result = agent.run(&contract, SectionRun::first(false)).await;

    assert!(!result.success);
    assert_eq!(result.error_kind(), Some(ErrorKind::ProtocolViolation));
    assert_eq!(generator.calls(), 0);
    assert!(ctx.timeline.snapshot().regions.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_generator_outage_aborts_before_any_agent() {
    let model = Arc::new(ScriptedModel::default());
    let generator = Arc::new(MockGenerator {
        healthy: false,
        ..MockGenerator::healthy()
    });

    let run = compose(TWO_BY_TWO, model.clone(), generator.clone(), config(), CancellationToken::new()).await;

    assert!(!run.outcome.success);
    assert_eq!(run.outcome.failed_steps, vec!["health_check".to_string()]);
    assert!(run.outcome.instruments.is_empty());
    assert!(model.calls.lock().is_empty());
    assert_eq!(generator.calls(), 0);

    assert_well_formed(&run.events);
    assert!(run.events.iter().all(|e| e.instrument.is_none()));
    match completes(&run.events)[0] {
        CompositionEvent::Complete { success, failed_steps, .. } => {
            assert!(!success);
            assert_eq!(failed_steps, &vec!["health_check".to_string()]);
        }
        other => panic!("unexpected terminal event {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_unhealthy_generator_is_tolerated_when_not_required() {
    let mut config = config();
    config.generator.require_healthy = false;
    let generator = Arc::new(MockGenerator {
        healthy: false,
        ..MockGenerator::healthy()
    });

    let run = compose(TWO_BY_TWO, Arc::new(ScriptedModel::default()), generator, config, CancellationToken::new()).await;

    assert!(run.outcome.success);
    assert_eq!(run.outcome.section_results.len(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_retry_exhaustion_keeps_siblings() {
    let generator = Arc::new(MockGenerator::healthy().failing("keys", 16.0, GeneratorError::QueueFull));

    let run = compose(
        TWO_BY_TWO,
        Arc::new(ScriptedModel::default()),
        generator.clone(),
        config(),
        CancellationToken::new(),
    )
    .await;
    let outcome = &run.outcome;

    let keys = outcome.instrument("keys").unwrap();
    assert_eq!(keys.completed, vec!["00-intro".to_string()]);
    assert_eq!(keys.failed.len(), 1);
    assert_eq!(keys.failed[0].0, "01-verse");

    let verse = outcome.section("keys", "01-verse").unwrap();
    assert_eq!(verse.attempts, 3);
    assert_eq!(verse.error_kind(), Some(ErrorKind::TransientGenerator));

    assert!(outcome.instrument("drums").unwrap().succeeded());
    assert!(outcome.success);
    assert_eq!(outcome.failed_steps, vec!["keys:01-verse".to_string()]);
    // 3 healthy sections + 3 attempts at the failing one.
    assert_eq!(generator.calls(), 6);

    assert_eq!(
        step_statuses(&run.events, "keys:01-verse"),
        vec![StepStatus::Active, StepStatus::Failed]
    );
    assert_well_formed(&run.events);
}

#[tokio::test(start_paused = true)]
async fn test_circuit_open_stops_retries() {
    let config = config();
    let generator = Arc::new(MockGenerator::healthy().failing("drums", 0.0, GeneratorError::ColdStart));
    let breaker = Arc::new(CircuitBreaker::new(1, Duration::from_secs(600)));
    let gated = Arc::new(GatedGenerator::new(
        generator.clone(),
        breaker.clone(),
        1,
        config.timeouts.generator_call,
        config.timeouts.health_check,
    ));

    let request = CompositionRequest::from_yaml_str(
        r#"
style: drum and bass
tempo: 174
key: F minor
sections:
  - name: Intro
    bars: 8
instruments:
  - name: drums
    role: breaks
"#,
    )
    .unwrap();

    let (sink, _receiver) = ChannelEventSink::new(10_000);
    let coordinator = Coordinator::new(Arc::new(ScriptedModel::default()), gated, Arc::new(config));
    let outcome = coordinator
        .compose(&request, Arc::new(sink), CancellationToken::new())
        .await;

    assert!(!outcome.success);
    assert!(breaker.is_open());
    assert_eq!(generator.calls(), 1);
    assert_eq!(outcome.section("drums", "00-intro").unwrap().attempts, 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_closes_stream_cleanly() {
    let generator = Arc::new(MockGenerator {
        delay: Duration::from_secs(100),
        ..MockGenerator::healthy()
    });
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        trigger.cancel();
    });

    let run = compose(TWO_BY_TWO, Arc::new(ScriptedModel::default()), generator, config(), cancel).await;

    assert!(!run.outcome.success);
    assert_eq!(run.outcome.error.as_deref(), Some("cancelled"));
    assert!(run.outcome.section_results.is_empty());
    assert!(!run.outcome.mix_applied);

    assert_well_formed(&run.events);
    assert!(step_statuses(&run.events, "mixing").is_empty());
    assert!(run.events.iter().any(|e| matches!(
        &e.event,
        CompositionEvent::PlanStep { status: StepStatus::Failed, detail: Some(d), .. } if d == "interrupted"
    )));
}

#[tokio::test(start_paused = true)]
async fn test_client_disconnect_cancels_agents() {
    let request = CompositionRequest::from_yaml_str(TWO_BY_TWO).unwrap();
    let config = config();
    let generator = Arc::new(MockGenerator {
        delay: Duration::from_secs(100),
        ..MockGenerator::healthy()
    });
    let coordinator = Coordinator::new(
        Arc::new(ScriptedModel::default()),
        gated(generator, &config),
        Arc::new(config),
    );

    let (sink, receiver) = ChannelEventSink::new(16);
    drop(receiver);
    let cancel = CancellationToken::new();

    let outcome = coordinator.compose(&request, Arc::new(sink), cancel.clone()).await;

    assert!(cancel.is_cancelled());
    assert!(!outcome.success);
}

#[tokio::test(start_paused = true)]
async fn test_long_silence_emits_keepalive_and_warning() {
    let mut config = config();
    config.stream.keepalive_interval = Duration::from_secs(1);
    config.stream.stall_warning = Duration::from_secs(10);
    let generator = Arc::new(MockGenerator {
        delay: Duration::from_secs(30),
        ..MockGenerator::healthy()
    });

    let run = compose(
        TWO_BY_TWO,
        Arc::new(ScriptedModel::default()),
        generator,
        config,
        CancellationToken::new(),
    )
    .await;

    assert!(run.outcome.success);
    assert!(run.events.iter().any(|e| e.event.is_keepalive()));
    let warning = run
        .events
        .iter()
        .find_map(|e| match &e.event {
            CompositionEvent::Warning { running, .. } => Some(running.clone()),
            _ => None,
        })
        .unwrap();
    assert!(!warning.is_empty());
    assert_well_formed(&run.events);
}

#[tokio::test(start_paused = true)]
async fn test_expressive_request_runs_expression_pass() {
    let generator = Arc::new(MockGenerator::healthy());
    let request = TWO_BY_TWO.replace("style: nu jazz", "style: nu jazz\nexpressive: true");

    let run = compose(
        &request,
        Arc::new(ScriptedModel::default()),
        generator.clone(),
        config(),
        CancellationToken::new(),
    )
    .await;

    assert!(run.outcome.success);
    let expression_calls = generator
        .requests
        .lock()
        .iter()
        .filter(|r| r.kind == GenerationKind::Expression)
        .count();
    assert_eq!(expression_calls, 4);
}

#[tokio::test(start_paused = true)]
async fn test_section_watchdog_retries_hung_section() {
    let mut config = config();
    // Watchdog fires long before the per-call timeout would.
    config.timeouts.section = Duration::from_secs(5);
    config.timeouts.generator_call = Duration::from_secs(30);
    let generator = Arc::new(MockGenerator::healthy().hanging("keys", 16.0));

    let run = compose(
        TWO_BY_TWO,
        Arc::new(ScriptedModel::default()),
        generator.clone(),
        config,
        CancellationToken::new(),
    )
    .await;
    let outcome = &run.outcome;

    let verse = outcome.section("keys", "01-verse").unwrap();
    assert!(!verse.success);
    assert_eq!(verse.attempts, 3);
    assert_eq!(verse.error_kind(), Some(ErrorKind::Timeout));

    assert_eq!(outcome.instrument("keys").unwrap().completed, vec!["00-intro".to_string()]);
    assert!(outcome.instrument("drums").unwrap().succeeded());
    assert!(outcome.success);
    assert_eq!(outcome.failed_steps, vec!["keys:01-verse".to_string()]);
    assert_eq!(generator.calls(), 6);

    assert_eq!(
        step_statuses(&run.events, "keys:01-verse"),
        vec![StepStatus::Active, StepStatus::Failed]
    );
    assert_well_formed(&run.events);
}

#[tokio::test(start_paused = true)]
async fn test_instrument_watchdog_interrupts_only_the_hung_instrument() {
    let mut config = config();
    config.timeouts.instrument = Duration::from_secs(3);
    let generator = Arc::new(MockGenerator::healthy().hanging("keys", 16.0));

    let run = compose(
        TWO_BY_TWO,
        Arc::new(ScriptedModel::default()),
        generator,
        config,
        CancellationToken::new(),
    )
    .await;
    let outcome = &run.outcome;

    let keys = outcome.instrument("keys").unwrap();
    assert!(keys.error.as_deref().unwrap().contains("timed out"));
    assert!(outcome.section("keys", "00-intro").is_none());
    assert!(outcome.failed_steps.contains(&"keys".to_string()));

    let drums = outcome.instrument("drums").unwrap();
    assert!(drums.succeeded());
    assert_eq!(drums.completed.len(), 2);
    assert!(outcome.success);
    assert_eq!(
        step_statuses(&run.events, "mixing"),
        vec![StepStatus::Active, StepStatus::Completed]
    );

    assert_eq!(
        step_statuses(&run.events, "keys:01-verse").last(),
        Some(&StepStatus::Failed)
    );
    assert!(run.events.iter().any(|e| matches!(
        &e.event,
        CompositionEvent::PlanStep { step_id, status: StepStatus::Failed, detail: Some(d), .. }
            if step_id == "keys:01-verse" && d == "interrupted"
    )));
    assert_well_formed(&run.events);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_mixing_ends_stream() {
    let model = Arc::new(ScriptedModel {
        hang_mixing: true,
        ..ScriptedModel::default()
    });
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        trigger.cancel();
    });

    let run = compose(TWO_BY_TWO, model.clone(), Arc::new(MockGenerator::healthy()), config(), cancel).await;

    assert!(!run.outcome.success);
    assert_eq!(run.outcome.error.as_deref(), Some("cancelled"));
    assert!(!run.outcome.mix_applied);
    assert_eq!(run.outcome.instruments.len(), 2);
    assert_eq!(model.calls_for(ModelPurpose::Mixing), 1);

    assert_eq!(
        step_statuses(&run.events, "mixing"),
        vec![StepStatus::Active, StepStatus::Failed]
    );
    assert_well_formed(&run.events);
}

#[tokio::test(start_paused = true)]
async fn test_mixing_timeout_keeps_composed_sections() {
    let mut config = config();
    config.timeouts.mixing = Duration::from_secs(10);
    config.stream.keepalive_interval = Duration::from_secs(1);
    let model = Arc::new(ScriptedModel {
        hang_mixing: true,
        ..ScriptedModel::default()
    });

    let run = compose(
        TWO_BY_TWO,
        model,
        Arc::new(MockGenerator::healthy()),
        config,
        CancellationToken::new(),
    )
    .await;

    assert!(run.outcome.success);
    assert!(!run.outcome.mix_applied);
    assert_eq!(run.outcome.failed_steps, vec!["mixing".to_string()]);
    assert_eq!(run.outcome.section_results.len(), 4);

    let mixing_failure = run.events.iter().find_map(|e| match &e.event {
        CompositionEvent::PlanStep { step_id, status: StepStatus::Failed, detail, .. } if step_id == "mixing" => {
            detail.clone()
        }
        _ => None,
    });
    assert!(mixing_failure.unwrap().contains("timed out"));
    assert!(run.events.iter().any(|e| e.event.is_keepalive()));
    assert_well_formed(&run.events);
}
