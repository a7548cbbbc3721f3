// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Coordinator (Level 1)
//!
//! Runs one composition request end to end and owns the outgoing event
//! stream.
//!
//! ```text
//! contracts -> setup -> health check -> instrument agents (concurrent)
//!                                         │  events ──> EventQueue
//!                                         ▼
//!                           drain loop (poll, keepalive, stall warning,
//!                                       disconnect -> cancel)
//!                                         ▼
//!                            mixing -> close dangling steps -> Complete
//! ```
//!
//! Whatever happens, the stream ends with exactly one
//! [`CompositionEvent::Complete`], and every step that went active has a
//! terminal marker before it.

use chrono::Utc;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::application::instrument_agent::{InstrumentAgent, InstrumentReport};
use crate::application::services::{AgentContext, ExecutionServices};
use crate::domain::config::OrchestratorConfig;
use crate::domain::contract::{CompositionContract, InstrumentContract, RuntimeContext, SectionSpec};
use crate::domain::events::{CompositionEvent, EventEnvelope, StepStatus};
use crate::domain::lineage::seal;
use crate::domain::llm::{LLMProvider, ModelPurpose, ModelRequest};
use crate::domain::outcome::{CompositionOutcome, InstrumentSummary};
use crate::domain::plan::{mixing_tools, MixPlan, ADD_SEND, CREATE_BUS, MIXING_SYSTEM, SET_LEVEL};
use crate::domain::request::{CompositionRequest, InstrumentRequest};
use crate::domain::timeline::{ProjectTimeline, TimelineSnapshot};
use crate::infrastructure::event_bus::{EventQueue, EventSink, QueuedEvent};
use crate::infrastructure::generator::GatedGenerator;

const SETUP_STEP: &str = "setup";
const HEALTH_STEP: &str = "health_check";
const MIXING_STEP: &str = "mixing";

pub struct Coordinator {
    llm: Arc<dyn LLMProvider>,
    generator: Arc<GatedGenerator>,
    config: Arc<OrchestratorConfig>,
}

impl Coordinator {
    /// `generator` is expected to be the process-wide instance so its
    /// circuit breaker is shared across requests.
    pub fn new(
        llm: Arc<dyn LLMProvider>,
        generator: Arc<GatedGenerator>,
        config: Arc<OrchestratorConfig>,
    ) -> Self {
        Self {
            llm,
            generator,
            config,
        }
    }

    pub async fn compose(
        &self,
        request: &CompositionRequest,
        sink: Arc<dyn EventSink>,
        cancel: CancellationToken,
    ) -> CompositionOutcome {
        let composition_id = Uuid::new_v4();
        let mut stream = EventStream::new(sink, composition_id);

        info!(
            %composition_id,
            instruments = request.instruments.len(),
            sections = request.sections.len(),
            "Starting composition"
        );

        let outcome = self.run(request, composition_id, &mut stream, &cancel).await;

        stream.close_dangling().await;
        stream.complete(&outcome).await;

        let label = if outcome.success {
            "success"
        } else if cancel.is_cancelled() {
            "cancelled"
        } else {
            "failure"
        };
        metrics::counter!("ensemble_compositions_total", "outcome" => label).increment(1);

        info!(
            %composition_id,
            success = outcome.success,
            failed_steps = ?outcome.failed_steps,
            "Composition finished"
        );
        outcome
    }

    async fn run(
        &self,
        request: &CompositionRequest,
        composition_id: Uuid,
        stream: &mut EventStream,
        cancel: &CancellationToken,
    ) -> CompositionOutcome {
        if let Err(e) = request.validate() {
            warn!(%composition_id, error = %e, "Rejecting invalid composition request");
            let mut outcome = CompositionOutcome::aborted(composition_id, e.to_string());
            outcome.failed_steps.push("request".to_string());
            return outcome;
        }

        // 1. Contracts
        let composition = Arc::new(seal_composition(composition_id, request));
        let timeline = Arc::new(ProjectTimeline::new());

        // 2. Setup
        stream.step(SETUP_STEP, "Set tempo and key", StepStatus::Active, None).await;
        timeline.set_tempo_key(request.tempo, &request.key);
        stream
            .step(
                SETUP_STEP,
                "Set tempo and key",
                StepStatus::Completed,
                Some(format!("{} BPM, {}", request.tempo, request.key)),
            )
            .await;

        // 3. Pre-flight
        stream.step(HEALTH_STEP, "Check generator", StepStatus::Active, None).await;
        let healthy = tokio::select! {
            _ = cancel.cancelled() => {
                info!(%composition_id, "Cancelled during health check");
                return cancelled(composition_id, &timeline);
            }
            healthy = self.generator.health_check() => healthy,
        };

        if !healthy && self.config.generator.require_healthy {
            warn!(%composition_id, "Generator unavailable, aborting before launching agents");
            stream
                .step(HEALTH_STEP, "Check generator", StepStatus::Failed, Some("generator unavailable".to_string()))
                .await;
            let mut outcome = CompositionOutcome::aborted(composition_id, "generator unavailable");
            outcome.failed_steps.push(HEALTH_STEP.to_string());
            outcome.timeline = timeline.snapshot();
            return outcome;
        }
        let detail = if healthy {
            "healthy"
        } else {
            warn!(%composition_id, "Generator unhealthy, continuing because it is not required");
            "unhealthy, continuing"
        };
        stream
            .step(HEALTH_STEP, "Check generator", StepStatus::Completed, Some(detail.to_string()))
            .await;

        // 4. Instruments
        let services = ExecutionServices::new();
        let runtime = RuntimeContext::new(composition_id)
            .with_expressive(request.expressive)
            .with_section_mode(request.section_mode)
            .with_refine_prompts(self.config.refine_section_prompts);
        let ctx = AgentContext {
            llm: self.llm.clone(),
            generator: self.generator.clone(),
            timeline: timeline.clone(),
            services: services.clone(),
            config: self.config.clone(),
            runtime: Arc::new(runtime),
        };

        let mut queue = EventQueue::new();
        let mut tasks: JoinSet<(String, Option<InstrumentReport>)> = JoinSet::new();
        let mut contracts: BTreeMap<String, Arc<InstrumentContract>> = BTreeMap::new();
        let mut running: BTreeSet<String> = BTreeSet::new();
        let instrument_timeout = self.config.timeouts.instrument;

        for instrument in &request.instruments {
            let contract = Arc::new(seal_instrument(&composition, request, instrument));
            let agent = InstrumentAgent::new(ctx.clone(), queue.emitter().for_instrument(&instrument.name));
            let name = instrument.name.clone();
            let task_contract = contract.clone();
            let task_composition = composition.clone();

            tasks.spawn(async move {
                let report = tokio::time::timeout(instrument_timeout, agent.run(&task_contract, &task_composition))
                    .await
                    .ok();
                (name, report)
            });

            running.insert(instrument.name.clone());
            contracts.insert(instrument.name.clone(), contract);
        }

        // 5-7. Drain until every agent resolves or the client goes away.
        let mut reports: BTreeMap<String, InstrumentReport> = BTreeMap::new();
        let mut ticker = tokio::time::interval(self.config.stream.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let keepalive = self.config.stream.keepalive_interval;
        let stall_warning = self.config.stream.stall_warning;
        let mut last_warning: Option<Instant> = None;
        let mut was_cancelled = false;

        loop {
            let finished = tokio::select! {
                _ = cancel.cancelled() => {
                    was_cancelled = true;
                    true
                }
                joined = tasks.join_next() => match joined {
                    None => true,
                    Some(Ok((name, report))) => {
                        running.remove(&name);
                        let report = report.unwrap_or_else(|| {
                            warn!(%composition_id, instrument = %name, timeout = ?instrument_timeout, "Instrument watchdog fired");
                            timed_out_report(&name, instrument_timeout)
                        });
                        if report.summary.error.is_some() {
                            release_sections(&services, contracts.get(&name));
                        }
                        reports.insert(name, report);
                        false
                    }
                    Some(Err(e)) => {
                        error!(%composition_id, error = %e, "Instrument task panicked");
                        false
                    }
                },
                _ = ticker.tick() => false,
            };

            stream.forward_all(queue.drain()).await;

            if stream.is_disconnected() {
                info!(%composition_id, "Client disconnected, cancelling outstanding agents");
                cancel.cancel();
                was_cancelled = true;
            }
            if finished || was_cancelled {
                break;
            }

            let now = Instant::now();
            if now.duration_since(stream.last_sent) >= keepalive {
                stream.send(None, None, CompositionEvent::Keepalive).await;
            }
            let quiet_since = last_warning.map_or(stream.last_real, |w| w.max(stream.last_real));
            if now.duration_since(quiet_since) >= stall_warning {
                let names: Vec<String> = running.iter().cloned().collect();
                warn!(%composition_id, running = ?names, "No progress from agents");
                stream
                    .send(
                        None,
                        None,
                        CompositionEvent::Warning {
                            message: format!("No progress for {:?}", now.duration_since(stream.last_real)),
                            running: names,
                        },
                    )
                    .await;
                last_warning = Some(now);
            }
        }

        if was_cancelled {
            tasks.shutdown().await;
            stream.forward_all(queue.drain()).await;
            info!(%composition_id, running = ?running, "Composition cancelled");
            let mut outcome = cancelled(composition_id, &timeline);
            outcome.instruments = collect_summaries(request, &reports);
            return outcome;
        }

        // Agents that never reported back panicked.
        for name in &running {
            release_sections(&services, contracts.get(name));
            reports.insert(
                name.clone(),
                InstrumentReport {
                    summary: InstrumentSummary {
                        error: Some("agent task panicked".to_string()),
                        ..InstrumentSummary::new(name.clone())
                    },
                    section_results: Vec::new(),
                },
            );
        }

        // 8. Mixing
        let any_completed = reports.values().any(|r| !r.summary.completed.is_empty());
        let mut failed_steps = Vec::new();
        let mix_applied = if any_completed {
            match self.mix(request, &timeline, stream, cancel).await {
                Ok(applied) => applied,
                Err(reason) => {
                    warn!(%composition_id, error = %reason, "Mixing failed");
                    failed_steps.push(MIXING_STEP.to_string());
                    false
                }
            }
        } else {
            stream
                .step(MIXING_STEP, "Mix", StepStatus::Skipped, Some("no completed sections".to_string()))
                .await;
            false
        };

        if cancel.is_cancelled() {
            info!(%composition_id, "Composition cancelled during mixing");
            let mut outcome = cancelled(composition_id, &timeline);
            outcome.instruments = collect_summaries(request, &reports);
            return outcome;
        }

        // 9. Outcome
        let summaries = collect_summaries(request, &reports);
        let mut section_results = Vec::new();
        let mut instrument_failures = Vec::new();
        for summary in &summaries {
            for (section_id, _) in &summary.failed {
                instrument_failures.push(InstrumentAgent::section_step_id(&summary.instrument, section_id));
            }
            for section_id in &summary.missing {
                instrument_failures.push(InstrumentAgent::section_step_id(&summary.instrument, section_id));
            }
            if summary.error.is_some() {
                instrument_failures.push(InstrumentAgent::step_id(&summary.instrument));
            }
        }
        for instrument in &request.instruments {
            if let Some(report) = reports.remove(&instrument.name) {
                section_results.extend(report.section_results);
            }
        }
        instrument_failures.extend(failed_steps);

        let success = any_completed;
        let telemetry = services
            .state
            .snapshot()
            .into_iter()
            .map(|(key, snapshot)| (key, snapshot.as_ref().clone()))
            .collect();

        CompositionOutcome {
            composition_id,
            success,
            instruments: summaries,
            section_results,
            telemetry,
            mix_applied,
            failed_steps: instrument_failures,
            timeline: timeline.snapshot(),
            error: (!success).then(|| "no instrument completed any section".to_string()),
        }
    }

    /// Returns whether any mix change was applied; `Err` when the planning
    /// call failed, timed out or was cancelled. The stream keeps its
    /// keepalive and disconnect checks while the call is outstanding.
    async fn mix(
        &self,
        request: &CompositionRequest,
        timeline: &ProjectTimeline,
        stream: &mut EventStream,
        cancel: &CancellationToken,
    ) -> Result<bool, String> {
        stream.step(MIXING_STEP, "Mix", StepStatus::Active, None).await;

        let model_request = ModelRequest {
            purpose: ModelPurpose::Mixing,
            subject: MIXING_STEP.to_string(),
            system: MIXING_SYSTEM.to_string(),
            prompt: mixing_prompt(request, &timeline.snapshot()),
            tools: mixing_tools(),
        };

        let limit = self.config.timeouts.mixing;
        let completion = self.llm.complete(&model_request);
        tokio::pin!(completion);
        let deadline = tokio::time::sleep(limit);
        tokio::pin!(deadline);
        let mut ticker = tokio::time::interval(self.config.stream.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let result = loop {
            tokio::select! {
                result = &mut completion => break result.map_err(|e| e.to_string()),
                _ = cancel.cancelled() => break Err("cancelled".to_string()),
                _ = &mut deadline => break Err(format!("mixing timed out after {:?}", limit)),
                _ = ticker.tick() => {
                    if stream.is_disconnected() {
                        info!("Client disconnected during mixing");
                        cancel.cancel();
                    } else if Instant::now().duration_since(stream.last_sent) >= self.config.stream.keepalive_interval {
                        stream.send(None, None, CompositionEvent::Keepalive).await;
                    }
                }
            }
        };

        let response = match result {
            Ok(response) => response,
            Err(reason) => {
                stream
                    .step(MIXING_STEP, "Mix", StepStatus::Failed, Some(reason.clone()))
                    .await;
                return Err(reason);
            }
        };

        if !response.text.is_empty() {
            stream
                .send(None, None, CompositionEvent::Reasoning { content: response.text })
                .await;
        }

        let plan = MixPlan::from_tool_calls(&response.tool_calls);

        for bus in &plan.buses {
            stream.tool_started(CREATE_BUS, json!({"name": bus})).await;
            let (bus_id, created) = timeline.create_bus(bus);
            stream
                .tool_result(CREATE_BUS, json!({"bus_id": bus_id, "name": bus, "created": created}))
                .await;
        }
        for send in &plan.sends {
            stream
                .tool_started(ADD_SEND, json!({"track": send.track, "bus": send.bus, "level_db": send.level_db}))
                .await;
            match timeline.add_send(&send.track, &send.bus, send.level_db) {
                Ok(()) => stream.tool_result(ADD_SEND, json!({"track": send.track, "bus": send.bus})).await,
                Err(e) => stream.tool_error(ADD_SEND, e.to_string()).await,
            }
        }
        for level in &plan.levels {
            stream
                .tool_started(SET_LEVEL, json!({"track": level.track, "level_db": level.level_db}))
                .await;
            match timeline.set_level(&level.track, level.level_db) {
                Ok(()) => stream.tool_result(SET_LEVEL, json!({"track": level.track})).await,
                Err(e) => stream.tool_error(SET_LEVEL, e.to_string()).await,
            }
        }

        stream
            .step(
                MIXING_STEP,
                "Mix",
                StepStatus::Completed,
                Some(format!(
                    "{} buses, {} sends, {} levels",
                    plan.buses.len(),
                    plan.sends.len(),
                    plan.levels.len()
                )),
            )
            .await;
        Ok(!plan.is_empty())
    }
}

fn seal_composition(composition_id: Uuid, request: &CompositionRequest) -> CompositionContract {
    let mut start_beat = 0.0;
    let sections = request
        .sections
        .iter()
        .enumerate()
        .map(|(index, section)| {
            let mut spec = SectionSpec::new(index, section.name.as_str(), start_beat, section.bars, request.beats_per_bar);
            if let Some(character) = &section.character {
                spec = spec.with_character(character.clone());
            }
            if let Some(brief) = &section.role_brief {
                spec = spec.with_role_brief(brief.clone());
            }
            start_beat += spec.duration_beats;
            Arc::new(seal(spec, None))
        })
        .collect();

    seal(
        CompositionContract {
            composition_id,
            sections,
            style: request.style.clone(),
            tempo: request.tempo,
            key: request.key.clone(),
            beats_per_bar: request.beats_per_bar,
            contract_hash: String::new(),
        },
        None,
    )
}

fn seal_instrument(
    composition: &CompositionContract,
    request: &CompositionRequest,
    instrument: &InstrumentRequest,
) -> InstrumentContract {
    let sealed = seal(
        InstrumentContract {
            instrument: instrument.name.clone(),
            role: instrument.role.clone(),
            sections: composition.sections.clone(),
            depends_on: instrument.depends_on.clone(),
            is_producer: request.is_producer(&instrument.name),
            style: composition.style.clone(),
            tempo: composition.tempo,
            key: composition.key.clone(),
            beats_per_bar: composition.beats_per_bar,
            guidance: None,
            contract_hash: String::new(),
            parent_contract_hash: None,
        },
        Some(&composition.contract_hash),
    );
    match &instrument.guidance {
        Some(guidance) => sealed.with_guidance(guidance.clone()),
        None => sealed,
    }
}

fn mixing_prompt(request: &CompositionRequest, snapshot: &TimelineSnapshot) -> String {
    let tracks: Vec<String> = snapshot
        .tracks
        .iter()
        .map(|t| {
            let regions = snapshot.regions.iter().filter(|r| r.track_id == t.id).count();
            let effects = if t.effects.is_empty() {
                "-".to_string()
            } else {
                t.effects.join(", ")
            };
            format!("- {} | {} | {} | regions: {} | effects: {}", t.id, t.name, t.instrument, regions, effects)
        })
        .collect();
    format!(
        "Style: {}\nTempo: {} BPM\nKey: {}\nTracks:\n{}",
        request.style,
        request.tempo,
        request.key,
        tracks.join("\n")
    )
}

fn timed_out_report(instrument: &str, after: std::time::Duration) -> InstrumentReport {
    InstrumentReport {
        summary: InstrumentSummary {
            error: Some(format!("instrument timed out after {:?}", after)),
            ..InstrumentSummary::new(instrument)
        },
        section_results: Vec::new(),
    }
}

/// Summaries in request order. Instruments without a report are skipped.
fn collect_summaries(
    request: &CompositionRequest,
    reports: &BTreeMap<String, InstrumentReport>,
) -> Vec<InstrumentSummary> {
    request
        .instruments
        .iter()
        .filter_map(|i| reports.get(&i.name).map(|r| r.summary.clone()))
        .collect()
}

/// Fail every unsignalled section of a producer that will not run again.
/// Sections it already signalled keep their first result.
fn release_sections(services: &ExecutionServices, contract: Option<&Arc<InstrumentContract>>) {
    let Some(contract) = contract.filter(|c| c.is_producer) else {
        return;
    };
    for spec in &contract.sections {
        services
            .signals
            .signal_complete(&spec.section_id, &spec.contract_hash, false, None);
    }
}

fn cancelled(composition_id: Uuid, timeline: &ProjectTimeline) -> CompositionOutcome {
    let mut outcome = CompositionOutcome::aborted(composition_id, "cancelled");
    outcome.timeline = timeline.snapshot();
    outcome
}

#[derive(Debug, Clone)]
struct StepRecord {
    label: String,
    status: StepStatus,
    instrument: Option<String>,
    section_id: Option<String>,
}

/// Sequences events onto the client sink and tracks step lifecycles.
struct EventStream {
    sink: Arc<dyn EventSink>,
    composition_id: Uuid,
    seq: u64,
    steps: BTreeMap<String, StepRecord>,
    last_sent: Instant,
    /// Last non-liveness event.
    last_real: Instant,
    disconnected: bool,
}

impl EventStream {
    fn new(sink: Arc<dyn EventSink>, composition_id: Uuid) -> Self {
        let now = Instant::now();
        Self {
            sink,
            composition_id,
            seq: 0,
            steps: BTreeMap::new(),
            last_sent: now,
            last_real: now,
            disconnected: false,
        }
    }

    fn is_disconnected(&self) -> bool {
        self.disconnected || self.sink.is_closed()
    }

    async fn forward_all(&mut self, events: Vec<QueuedEvent>) {
        for queued in events {
            self.send(queued.instrument, queued.section_id, queued.event).await;
        }
    }

    async fn send(&mut self, instrument: Option<String>, section_id: Option<String>, event: CompositionEvent) {
        if let CompositionEvent::PlanStep { step_id, label, status, .. } = &event {
            self.steps.insert(
                step_id.clone(),
                StepRecord {
                    label: label.clone(),
                    status: *status,
                    instrument: instrument.clone(),
                    section_id: section_id.clone(),
                },
            );
        }

        let now = Instant::now();
        self.last_sent = now;
        if !matches!(event, CompositionEvent::Keepalive | CompositionEvent::Warning { .. }) {
            self.last_real = now;
        }

        if self.disconnected {
            return;
        }

        self.seq += 1;
        let envelope = EventEnvelope {
            seq: self.seq,
            timestamp: Utc::now(),
            composition_id: self.composition_id,
            instrument,
            section_id,
            event,
        };
        if let Err(e) = self.sink.emit(envelope).await {
            debug!(composition_id = %self.composition_id, error = %e, "Event sink closed");
            self.disconnected = true;
        }
    }

    async fn step(&mut self, step_id: &str, label: &str, status: StepStatus, detail: Option<String>) {
        let event = match detail {
            Some(detail) => CompositionEvent::step_with_detail(step_id, label, status, detail),
            None => CompositionEvent::step(step_id, label, status),
        };
        self.send(None, None, event).await;
    }

    async fn tool_started(&mut self, tool: &str, arguments: serde_json::Value) {
        self.send(
            None,
            None,
            CompositionEvent::ToolStarted {
                tool: tool.to_string(),
                arguments,
            },
        )
        .await;
    }

    async fn tool_result(&mut self, tool: &str, result: serde_json::Value) {
        self.send(
            None,
            None,
            CompositionEvent::ToolResult {
                tool: tool.to_string(),
                result,
            },
        )
        .await;
    }

    async fn tool_error(&mut self, tool: &str, error: String) {
        self.send(
            None,
            None,
            CompositionEvent::ToolError {
                tool: tool.to_string(),
                error,
            },
        )
        .await;
    }

    /// Fail every step still active so none is left open at stream end.
    async fn close_dangling(&mut self) {
        let dangling: Vec<(String, StepRecord)> = self
            .steps
            .iter()
            .filter(|(_, record)| !record.status.is_terminal())
            .map(|(id, record)| (id.clone(), record.clone()))
            .collect();

        for (step_id, record) in dangling {
            debug!(step_id = %step_id, "Closing interrupted step");
            self.send(
                record.instrument,
                record.section_id,
                CompositionEvent::step_with_detail(step_id, record.label, StepStatus::Failed, "interrupted"),
            )
            .await;
        }
    }

    async fn complete(&mut self, outcome: &CompositionOutcome) {
        let mut lines: Vec<String> = outcome.instruments.iter().map(|s| s.summary_line()).collect();
        if outcome.mix_applied {
            lines.push("mixing: applied".to_string());
        }
        self.send(
            None,
            None,
            CompositionEvent::Complete {
                success: outcome.success,
                failed_steps: outcome.failed_steps.clone(),
                summary: lines.join("\n"),
                error: outcome.error.clone(),
            },
        )
        .await;
    }
}
