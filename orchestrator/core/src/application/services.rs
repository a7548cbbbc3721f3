// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Execution Services
//!
//! Mutable coordination state that travels alongside (never inside) the
//! sealed contracts, plus the collaborator bundle every agent receives.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Request-scoped wiring for the agent hierarchy

use std::sync::Arc;

use ensemble_swarm::{SectionSignals, SectionState};

use crate::domain::config::OrchestratorConfig;
use crate::domain::contract::RuntimeContext;
use crate::domain::llm::LLMProvider;
use crate::domain::music::Note;
use crate::domain::telemetry::SectionTelemetry;
use crate::domain::timeline::ProjectTimeline;
use crate::infrastructure::generator::GatedGenerator;

/// Per-request coordination primitives. Discarded when the request ends.
#[derive(Clone, Default)]
pub struct ExecutionServices {
    /// Producer notes, keyed by `(section_id, section spec hash)`.
    pub signals: Arc<SectionSignals<Vec<Note>>>,
    /// Write-once telemetry, keyed by `"{instrument}: {section_id}"`.
    pub state: Arc<SectionState<SectionTelemetry>>,
}

impl ExecutionServices {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Everything an agent needs besides its contract.
#[derive(Clone)]
pub struct AgentContext {
    pub llm: Arc<dyn LLMProvider>,
    /// Process-wide; shares its circuit breaker across requests.
    pub generator: Arc<GatedGenerator>,
    pub timeline: Arc<ProjectTimeline>,
    pub services: ExecutionServices,
    pub config: Arc<OrchestratorConfig>,
    pub runtime: Arc<RuntimeContext>,
}
