// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Instrument Agent (Level 2)
//
// Owns one instrument for the whole request:
//   verify -> plan (streamed) -> track -> seal section contracts -> dispatch
//   with server-owned retry -> effects -> gap fill -> one compact summary.
//
// The planning call is made once (plus bounded retries of the call itself).
// A failed section is re-run from the same frozen contract; the plan is
// never re-requested for it. Missing intent is a separate concern handled
// by the bounded gap-fill calls.

use futures::future::join_all;
use serde_json::json;
use std::collections::HashSet;
use tracing::{error, info, warn};

use crate::application::section_agent::{SectionAgent, SectionRun};
use crate::application::services::AgentContext;
use crate::domain::contract::{CompositionContract, InstrumentContract, SectionContract, SectionDependency};
use crate::domain::error::OrchestrationError;
use crate::domain::events::{CompositionEvent, StepStatus};
use crate::domain::lineage::{ensure_child_of, ensure_verified, seal};
use crate::domain::llm::{collect_stream, ModelPurpose, ModelRequest};
use crate::domain::music::{tail, Note};
use crate::domain::outcome::{InstrumentSummary, SectionResult};
use crate::domain::plan::{
    gap_fill_prompt, planning_prompt, planning_tools, InstrumentPlan, PlannedSection, ADD_EFFECT,
    CREATE_TRACK, PLANNING_SYSTEM,
};
use crate::domain::request::SectionMode;
use crate::infrastructure::event_bus::EventEmitter;

/// What an instrument hands back to the coordinator.
#[derive(Debug, Clone)]
pub struct InstrumentReport {
    pub summary: InstrumentSummary,
    pub section_results: Vec<SectionResult>,
}

pub struct InstrumentAgent {
    ctx: AgentContext,
    events: EventEmitter,
}

impl InstrumentAgent {
    /// `events` should already carry the instrument correlation.
    pub fn new(ctx: AgentContext, events: EventEmitter) -> Self {
        Self { ctx, events }
    }

    /// Step id used for this instrument's lifecycle markers.
    pub fn step_id(instrument: &str) -> String {
        instrument.to_string()
    }

    /// Step id used for one section's lifecycle markers.
    pub fn section_step_id(instrument: &str, section_id: &str) -> String {
        format!("{}:{}", instrument, section_id)
    }

    pub async fn run(&self, contract: &InstrumentContract, composition: &CompositionContract) -> InstrumentReport {
        let instrument = contract.instrument.as_str();
        let step_id = Self::step_id(instrument);
        let label = format!("Compose {}", instrument);
        self.events.step(&step_id, &label, StepStatus::Active);

        let mut summary = InstrumentSummary::new(instrument);
        let mut section_results = Vec::new();

        match self.execute(contract, composition, &mut summary, &mut section_results).await {
            Ok(()) => {
                if summary.completed.is_empty() && summary.error.is_none() {
                    summary.error = Some("no section completed".to_string());
                }
            }
            Err(e) => {
                if matches!(e, OrchestrationError::ProtocolViolation(_)) {
                    error!(instrument, error = %e, "Refusing to run instrument with unverified contract");
                } else {
                    warn!(instrument, error = %e, "Instrument failed");
                }
                // Nothing more will run for this instrument.
                if contract.is_producer {
                    let all: Vec<String> = contract.sections.iter().map(|s| s.section_id.clone()).collect();
                    self.release_dependents(contract, &all);
                }
                summary.error = Some(e.to_string());
            }
        }

        section_results.sort_by(|a, b| a.section_id.cmp(&b.section_id));

        let line = summary.summary_line();
        self.events.status(line.clone());
        let status = if summary.succeeded() {
            StepStatus::Completed
        } else {
            StepStatus::Failed
        };
        self.events.step_with_detail(&step_id, &label, status, line);

        info!(
            instrument,
            completed = summary.completed.len(),
            failed = summary.failed.len(),
            missing = summary.missing.len(),
            "Instrument finished"
        );

        InstrumentReport {
            summary,
            section_results,
        }
    }

    async fn execute(
        &self,
        contract: &InstrumentContract,
        composition: &CompositionContract,
        summary: &mut InstrumentSummary,
        results: &mut Vec<SectionResult>,
    ) -> Result<(), OrchestrationError> {
        ensure_verified(contract)?;
        ensure_child_of(contract, composition)?;

        let known: Vec<&str> = contract.sections.iter().map(|s| s.section_id.as_str()).collect();

        // 1. Plan
        let mut plan = self.plan(contract, &known, summary).await?;

        // 2. Track
        let track_name = plan.track_name.clone().unwrap_or_else(|| contract.instrument.clone());
        self.events.emit(CompositionEvent::ToolStarted {
            tool: CREATE_TRACK.to_string(),
            arguments: json!({"name": track_name}),
        });
        let (track_id, _) = self.ctx.timeline.create_track(&track_name, &contract.instrument);
        self.events.emit(CompositionEvent::ToolResult {
            tool: CREATE_TRACK.to_string(),
            result: json!({"track_id": track_id, "name": track_name}),
        });
        summary.track_id = Some(track_id.clone());

        // 3-4. Sections
        let contracts = self.section_contracts(contract, &track_id);
        let planned: Vec<&SectionContract> = contracts
            .iter()
            .filter(|c| plan.sections.contains_key(c.section_id()))
            .collect();
        results.extend(self.dispatch(&planned, &plan).await);

        // 5. Effects
        self.apply_effects(&track_id, &plan, summary);

        // 6. Gap fill
        let mut missing = plan.missing(known.iter().copied());
        let mut gap_calls = 0;
        while !missing.is_empty() && gap_calls < self.ctx.config.retry.max_gap_fill_calls {
            gap_calls += 1;
            summary.planning_calls += 1;
            info!(instrument = %contract.instrument, missing = ?missing, "Requesting plan for missing sections");

            let request = ModelRequest {
                purpose: ModelPurpose::GapFill,
                subject: contract.instrument.clone(),
                system: PLANNING_SYSTEM.to_string(),
                prompt: gap_fill_prompt(contract, &missing),
                tools: planning_tools(),
            };
            match self.ctx.llm.complete(&request).await {
                Ok(response) => plan.merge(&response.tool_calls, known.iter().copied()),
                Err(e) => warn!(instrument = %contract.instrument, error = %e, "Gap-fill call failed"),
            }

            let filled: Vec<&SectionContract> = contracts
                .iter()
                .filter(|c| missing.iter().any(|id| id == c.section_id()))
                .filter(|c| plan.sections.contains_key(c.section_id()))
                .collect();
            results.extend(self.dispatch(&filled, &plan).await);

            missing = plan.missing(known.iter().copied());
        }

        if !missing.is_empty() {
            warn!(instrument = %contract.instrument, missing = ?missing, "Sections left unplanned");
            if contract.is_producer {
                self.release_dependents(contract, &missing);
            }
        }

        // 7. Summary
        let mut completed = HashSet::new();
        for result in results.iter() {
            if result.success {
                completed.insert(result.section_id.clone());
            } else {
                let reason = result
                    .error
                    .as_ref()
                    .map(|e| e.message.clone())
                    .unwrap_or_else(|| "unknown".to_string());
                summary.failed.push((result.section_id.clone(), reason));
            }
        }
        summary.completed = known
            .iter()
            .filter(|id| completed.contains(**id))
            .map(|id| id.to_string())
            .collect();
        summary.missing = missing;

        Ok(())
    }

    async fn plan(
        &self,
        contract: &InstrumentContract,
        known: &[&str],
        summary: &mut InstrumentSummary,
    ) -> Result<InstrumentPlan, OrchestrationError> {
        let request = ModelRequest {
            purpose: ModelPurpose::InstrumentPlan,
            subject: contract.instrument.clone(),
            system: PLANNING_SYSTEM.to_string(),
            prompt: planning_prompt(contract),
            tools: planning_tools(),
        };

        let max_attempts = self.ctx.config.retry.max_planning_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            summary.planning_calls += 1;
            let events = self.events.clone();
            let streamed = collect_stream(self.ctx.llm.complete_stream(&request), |text| {
                events.emit(CompositionEvent::Reasoning {
                    content: text.to_string(),
                })
            })
            .await;

            match streamed {
                Ok(response) => {
                    let plan = InstrumentPlan::from_tool_calls(&response.tool_calls, known.iter().copied());
                    info!(
                        instrument = %contract.instrument,
                        planned = plan.sections.len(),
                        effects = plan.effects.len(),
                        "Instrument plan ready"
                    );
                    return Ok(plan);
                }
                Err(e) => {
                    warn!(instrument = %contract.instrument, attempt, error = %e, "Planning call failed");
                    last_error = e.to_string();
                    if attempt < max_attempts {
                        tokio::time::sleep(self.ctx.config.retry.backoff_for(attempt)).await;
                    }
                }
            }
        }

        Err(OrchestrationError::InstrumentFailure {
            instrument: contract.instrument.clone(),
            reason: format!("planning failed after {} attempts: {}", max_attempts, last_error),
        })
    }

    fn section_contracts(&self, contract: &InstrumentContract, track_id: &str) -> Vec<SectionContract> {
        contract
            .sections
            .iter()
            .map(|spec| {
                let dependency = contract.depends_on.as_ref().map(|producer| SectionDependency {
                    producer: producer.clone(),
                    section_id: spec.section_id.clone(),
                    spec_hash: spec.contract_hash.clone(),
                });
                seal(
                    SectionContract {
                        instrument: contract.instrument.clone(),
                        role: contract.role.clone(),
                        section: spec.clone(),
                        dependency,
                        is_producer: contract.is_producer,
                        style: contract.style.clone(),
                        tempo: contract.tempo,
                        key: contract.key.clone(),
                        track_id: String::new(),
                        suggested_prompt: String::new(),
                        contract_hash: String::new(),
                        parent_contract_hash: None,
                    },
                    Some(&contract.contract_hash),
                )
                .with_track_id(track_id)
            })
            .collect()
    }

    async fn dispatch(&self, contracts: &[&SectionContract], plan: &InstrumentPlan) -> Vec<SectionResult> {
        let prepared: Vec<(SectionContract, Option<&PlannedSection>)> = contracts
            .iter()
            .map(|c| {
                let planned = plan.sections.get(c.section_id());
                let prompted = match planned {
                    Some(p) if !p.prompt.is_empty() => c.with_suggested_prompt(p.prompt.clone()),
                    _ => (*c).clone(),
                };
                (prompted, planned)
            })
            .collect();

        match self.ctx.runtime.section_mode {
            SectionMode::Parallel => {
                join_all(
                    prepared
                        .iter()
                        .map(|(c, planned)| self.run_with_retry(c, *planned, Vec::new())),
                )
                .await
            }
            SectionMode::Sequential => {
                let mut results = Vec::with_capacity(prepared.len());
                let mut continuation: Vec<Note> = Vec::new();
                for (c, planned) in &prepared {
                    let result = self.run_with_retry(c, *planned, continuation).await;
                    continuation = if result.success {
                        let spec = c.section.as_ref();
                        tail(&result.notes, spec.duration_beats, spec.beats_per_bar())
                    } else {
                        Vec::new()
                    };
                    results.push(result);
                }
                results
            }
        }
    }

    async fn run_with_retry(
        &self,
        contract: &SectionContract,
        planned: Option<&PlannedSection>,
        continuation: Vec<Note>,
    ) -> SectionResult {
        let section_id = contract.section_id();
        let step_id = Self::section_step_id(&contract.instrument, section_id);
        let label = format!("{} {}", contract.instrument, contract.section.name);
        let events = self.events.for_section(section_id);
        events.step(&step_id, &label, StepStatus::Active);

        let agent = SectionAgent::new(self.ctx.clone(), events.clone());
        let retry = &self.ctx.config.retry;
        let section_timeout = self.ctx.config.timeouts.section;
        let max_attempts = retry.max_section_attempts.max(1);
        let mut attempt = 1;

        let result = loop {
            let run = SectionRun {
                attempt,
                final_attempt: attempt >= max_attempts,
                continuation: continuation.clone(),
                planned_start_beat: planned.and_then(|p| p.start_beat),
                planned_duration_beats: planned.and_then(|p| p.duration_beats),
            };

            let result = match tokio::time::timeout(section_timeout, agent.run(contract, run)).await {
                Ok(result) => result,
                Err(_) => {
                    let e = OrchestrationError::Timeout {
                        scope: format!("section {}", section_id),
                        after: section_timeout,
                    };
                    warn!(instrument = %contract.instrument, section_id, attempt, "Section watchdog fired");
                    let mut failed = SectionResult::failed(
                        &contract.instrument,
                        section_id,
                        &contract.contract_hash,
                        contract.parent_contract_hash.as_deref(),
                        &e,
                    );
                    failed.attempts = attempt;
                    failed
                }
            };

            if result.success || attempt >= max_attempts {
                break result;
            }
            if !result.error_kind().is_some_and(|k| k.is_retryable()) {
                break result;
            }
            if self.ctx.generator.breaker().is_open() {
                info!(instrument = %contract.instrument, section_id, "Circuit breaker open, skipping retries");
                break result;
            }

            let backoff = retry.backoff_for(attempt);
            attempt += 1;
            events.status(format!(
                "Retrying {} in {:?} (attempt {}/{})",
                section_id, backoff, attempt, max_attempts
            ));
            tokio::time::sleep(backoff).await;
        };

        // Covers a watchdog that dropped the agent before it could signal.
        if contract.is_producer && !result.success {
            self.release_dependents_of(contract);
        }

        if result.success {
            let detail = if result.degraded {
                format!("{} notes, without dependency", result.notes.len())
            } else {
                format!("{} notes", result.notes.len())
            };
            events.step_with_detail(&step_id, &label, StepStatus::Completed, detail);
        } else {
            let detail = result
                .error
                .as_ref()
                .map(|e| e.message.clone())
                .unwrap_or_else(|| "failed".to_string());
            events.step_with_detail(&step_id, &label, StepStatus::Failed, detail);
        }

        result
    }

    fn apply_effects(&self, track_id: &str, plan: &InstrumentPlan, summary: &mut InstrumentSummary) {
        for effect in &plan.effects {
            self.events.emit(CompositionEvent::ToolStarted {
                tool: ADD_EFFECT.to_string(),
                arguments: json!({"track_id": track_id, "effect": effect}),
            });
            match self.ctx.timeline.add_effect(track_id, effect) {
                Ok(added) => {
                    self.events.emit(CompositionEvent::ToolResult {
                        tool: ADD_EFFECT.to_string(),
                        result: json!({"track_id": track_id, "effect": effect, "added": added}),
                    });
                    summary.effects_applied.push(effect.clone());
                }
                Err(e) => {
                    warn!(track_id, effect = %effect, error = %e, "Failed to apply effect");
                    self.events.emit(CompositionEvent::ToolError {
                        tool: ADD_EFFECT.to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }
    }

    fn release_dependents(&self, contract: &InstrumentContract, section_ids: &[String]) {
        for spec in contract.sections.iter().filter(|s| section_ids.contains(&s.section_id)) {
            self.ctx
                .services
                .signals
                .signal_complete(&spec.section_id, &spec.contract_hash, false, None);
        }
    }

    fn release_dependents_of(&self, contract: &SectionContract) {
        self.ctx.services.signals.signal_complete(
            contract.section_id(),
            &contract.section.contract_hash,
            false,
            None,
        );
    }
}
