// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Results reported upward through the hierarchy.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::domain::error::{ErrorKind, OrchestrationError};
use crate::domain::music::{ControlPoint, Note};
use crate::domain::telemetry::SectionTelemetry;
use crate::domain::timeline::TimelineSnapshot;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&OrchestrationError> for SectionErrorInfo {
    fn from(error: &OrchestrationError) -> Self {
        Self {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

/// Output of one section agent run. Carries its lineage so any consumer can
/// check it against the contract and the session that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectionResult {
    pub instrument: String,
    pub section_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region_id: Option<String>,
    pub notes: Vec<Note>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expression: Vec<ControlPoint>,
    /// Ran without the dependency's data.
    pub degraded: bool,
    /// The region already existed (a retry re-entering a placed section).
    pub region_skipped: bool,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<SectionErrorInfo>,
    pub contract_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_contract_hash: Option<String>,
    /// Empty when the section failed before attestation.
    pub execution_hash: String,
}

impl SectionResult {
    pub fn failed(
        instrument: &str,
        section_id: &str,
        contract_hash: &str,
        parent_contract_hash: Option<&str>,
        error: &OrchestrationError,
    ) -> Self {
        Self {
            instrument: instrument.to_string(),
            section_id: section_id.to_string(),
            success: false,
            region_id: None,
            notes: Vec::new(),
            expression: Vec::new(),
            degraded: false,
            region_skipped: false,
            attempts: 1,
            error: Some(error.into()),
            contract_hash: contract_hash.to_string(),
            parent_contract_hash: parent_contract_hash.map(str::to_string),
            execution_hash: String::new(),
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

/// The single compact report an instrument agent hands back.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstrumentSummary {
    pub instrument: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub track_id: Option<String>,
    pub completed: Vec<String>,
    /// `(section_id, reason)`
    pub failed: Vec<(String, String)>,
    /// Sections the plan never covered, even after gap filling.
    pub missing: Vec<String>,
    pub effects_applied: Vec<String>,
    pub planning_calls: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl InstrumentSummary {
    pub fn new(instrument: impl Into<String>) -> Self {
        Self {
            instrument: instrument.into(),
            ..Default::default()
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none() && !self.completed.is_empty()
    }

    pub fn summary_line(&self) -> String {
        let mut line = format!(
            "{}: {} completed, {} failed, {} missing",
            self.instrument,
            self.completed.len(),
            self.failed.len(),
            self.missing.len()
        );
        if !self.effects_applied.is_empty() {
            line.push_str(&format!("; effects: {}", self.effects_applied.join(", ")));
        }
        if !self.failed.is_empty() {
            let failed: Vec<&str> = self.failed.iter().map(|(id, _)| id.as_str()).collect();
            line.push_str(&format!("; failed: {}", failed.join(", ")));
        }
        if let Some(error) = &self.error {
            line.push_str(&format!("; error: {}", error));
        }
        line
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositionOutcome {
    pub composition_id: Uuid,
    pub success: bool,
    pub instruments: Vec<InstrumentSummary>,
    pub section_results: Vec<SectionResult>,
    /// `"{instrument}: {section_id}"` -> snapshot.
    pub telemetry: BTreeMap<String, SectionTelemetry>,
    pub mix_applied: bool,
    pub failed_steps: Vec<String>,
    /// Final state of the project timeline.
    pub timeline: TimelineSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CompositionOutcome {
    pub fn aborted(composition_id: Uuid, error: impl Into<String>) -> Self {
        Self {
            composition_id,
            success: false,
            instruments: Vec::new(),
            section_results: Vec::new(),
            telemetry: BTreeMap::new(),
            mix_applied: false,
            failed_steps: Vec::new(),
            timeline: TimelineSnapshot::default(),
            error: Some(error.into()),
        }
    }

    pub fn section(&self, instrument: &str, section_id: &str) -> Option<&SectionResult> {
        self.section_results
            .iter()
            .find(|r| r.instrument == instrument && r.section_id == section_id)
    }

    pub fn instrument(&self, instrument: &str) -> Option<&InstrumentSummary> {
        self.instruments.iter().find(|s| s.instrument == instrument)
    }
}
