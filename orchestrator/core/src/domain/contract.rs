// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Contracts
//!
//! Immutable, hash-sealed value objects handed from one level of the agent
//! hierarchy to the next.
//!
//! ```text
//! SectionSpec ×N ──┐
//!                  ▼
//! CompositionContract (root)            sealed by the coordinator
//!   └─ InstrumentContract ×I            parent = composition hash
//!        └─ SectionContract ×N          parent = instrument hash, sealed by the instrument agent
//! ```
//!
//! Contracts carry data only. Mutable coordination state (signals, telemetry)
//! travels alongside them in the execution services. The `with_*` methods
//! return modified copies; they only touch advisory fields, so the copy keeps
//! its seal.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::lineage::{
    combine_hashes, ensure_verified, LineageError, Sealable, StructuralFields,
};
use crate::domain::request::SectionMode;

/// Canonical description of one musical section, owned by the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionSpec {
    pub section_id: String,
    pub name: String,
    pub index: usize,
    pub start_beat: f64,
    pub duration_beats: f64,
    pub bar_count: u32,
    /// Free text, excluded from the hash.
    pub character: String,
    /// Free text, excluded from the hash.
    pub role_brief: String,
    pub contract_hash: String,
}

impl SectionSpec {
    pub fn new(
        index: usize,
        name: impl Into<String>,
        start_beat: f64,
        bar_count: u32,
        beats_per_bar: u32,
    ) -> Self {
        let name = name.into();
        Self {
            section_id: crate::domain::request::section_id(index, &name),
            name,
            index,
            start_beat,
            duration_beats: f64::from(bar_count) * f64::from(beats_per_bar),
            bar_count,
            character: String::new(),
            role_brief: String::new(),
            contract_hash: String::new(),
        }
    }

    pub fn with_character(self, character: impl Into<String>) -> Self {
        Self {
            character: character.into(),
            ..self
        }
    }

    pub fn with_role_brief(self, role_brief: impl Into<String>) -> Self {
        Self {
            role_brief: role_brief.into(),
            ..self
        }
    }

    pub fn end_beat(&self) -> f64 {
        self.start_beat + self.duration_beats
    }

    pub fn beats_per_bar(&self) -> f64 {
        self.duration_beats / f64::from(self.bar_count.max(1))
    }
}

impl Sealable for SectionSpec {
    const KIND: &'static str = "SectionSpec";

    fn structural_fields(&self) -> StructuralFields {
        StructuralFields::from([
            ("section_id", json!(self.section_id)),
            ("name", json!(self.name)),
            ("index", json!(self.index)),
            ("start_beat", json!(self.start_beat)),
            ("duration_beats", json!(self.duration_beats)),
            ("bar_count", json!(self.bar_count)),
        ])
    }

    fn contract_hash(&self) -> &str {
        &self.contract_hash
    }

    fn parent_contract_hash(&self) -> Option<&str> {
        None
    }

    fn set_lineage(&mut self, contract_hash: String, _parent: Option<String>) {
        self.contract_hash = contract_hash;
    }
}

fn section_hashes(sections: &[Arc<SectionSpec>]) -> Value {
    let hashes: Vec<&str> = sections.iter().map(|s| s.contract_hash.as_str()).collect();
    Value::String(combine_hashes(&hashes))
}

fn verify_sections(sections: &[Arc<SectionSpec>]) -> Result<(), LineageError> {
    sections.iter().try_for_each(|s| ensure_verified(s.as_ref()))
}

/// Root lineage anchor for one composition request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositionContract {
    pub composition_id: Uuid,
    pub sections: Vec<Arc<SectionSpec>>,
    pub style: String,
    pub tempo: u32,
    pub key: String,
    pub beats_per_bar: u32,
    pub contract_hash: String,
}

impl CompositionContract {
    pub fn total_beats(&self) -> f64 {
        self.sections.iter().map(|s| s.duration_beats).sum()
    }
}

impl Sealable for CompositionContract {
    const KIND: &'static str = "CompositionContract";

    fn structural_fields(&self) -> StructuralFields {
        StructuralFields::from([
            ("composition_id", json!(self.composition_id.to_string())),
            ("sections", section_hashes(&self.sections)),
            ("style", json!(self.style)),
            ("tempo", json!(self.tempo)),
            ("key", json!(self.key)),
            ("beats_per_bar", json!(self.beats_per_bar)),
        ])
    }

    fn contract_hash(&self) -> &str {
        &self.contract_hash
    }

    fn parent_contract_hash(&self) -> Option<&str> {
        None
    }

    fn set_lineage(&mut self, contract_hash: String, _parent: Option<String>) {
        self.contract_hash = contract_hash;
    }

    fn verify_nested(&self) -> Result<(), LineageError> {
        verify_sections(&self.sections)
    }
}

/// One instrument's slice of the composition, handed to exactly one
/// instrument agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentContract {
    pub instrument: String,
    pub role: String,
    pub sections: Vec<Arc<SectionSpec>>,
    /// Producer instrument this instrument waits on, per section.
    pub depends_on: Option<String>,
    /// Whether other instruments wait on this one.
    pub is_producer: bool,
    pub style: String,
    pub tempo: u32,
    pub key: String,
    pub beats_per_bar: u32,
    /// Advisory generation guidance, excluded from the hash.
    pub guidance: Option<String>,
    pub contract_hash: String,
    pub parent_contract_hash: Option<String>,
}

impl InstrumentContract {
    pub fn with_guidance(&self, guidance: impl Into<String>) -> Self {
        Self {
            guidance: Some(guidance.into()),
            ..self.clone()
        }
    }
}

impl Sealable for InstrumentContract {
    const KIND: &'static str = "InstrumentContract";

    fn structural_fields(&self) -> StructuralFields {
        StructuralFields::from([
            ("instrument", json!(self.instrument)),
            ("role", json!(self.role)),
            ("sections", section_hashes(&self.sections)),
            ("depends_on", json!(self.depends_on)),
            ("is_producer", json!(self.is_producer)),
            ("style", json!(self.style)),
            ("tempo", json!(self.tempo)),
            ("key", json!(self.key)),
            ("beats_per_bar", json!(self.beats_per_bar)),
        ])
    }

    fn contract_hash(&self) -> &str {
        &self.contract_hash
    }

    fn parent_contract_hash(&self) -> Option<&str> {
        self.parent_contract_hash.as_deref()
    }

    fn set_lineage(&mut self, contract_hash: String, parent: Option<String>) {
        self.contract_hash = contract_hash;
        self.parent_contract_hash = parent;
    }

    fn verify_nested(&self) -> Result<(), LineageError> {
        verify_sections(&self.sections)
    }
}

/// Where a dependent section waits: the producer's part of the same section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionDependency {
    pub producer: String,
    pub section_id: String,
    /// Hash of the shared `SectionSpec`; together with `section_id` this is
    /// the signal key.
    pub spec_hash: String,
}

/// One (instrument, section) unit of work, handed to exactly one section agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectionContract {
    pub instrument: String,
    pub role: String,
    pub section: Arc<SectionSpec>,
    pub dependency: Option<SectionDependency>,
    pub is_producer: bool,
    pub style: String,
    pub tempo: u32,
    pub key: String,
    /// Materialized track, advisory: excluded from the hash.
    pub track_id: String,
    /// Advisory prompt from the planning step, excluded from the hash.
    pub suggested_prompt: String,
    pub contract_hash: String,
    pub parent_contract_hash: Option<String>,
}

impl SectionContract {
    pub fn section_id(&self) -> &str {
        &self.section.section_id
    }

    pub fn with_track_id(&self, track_id: impl Into<String>) -> Self {
        Self {
            track_id: track_id.into(),
            ..self.clone()
        }
    }

    pub fn with_suggested_prompt(&self, prompt: impl Into<String>) -> Self {
        Self {
            suggested_prompt: prompt.into(),
            ..self.clone()
        }
    }
}

impl Sealable for SectionContract {
    const KIND: &'static str = "SectionContract";

    fn structural_fields(&self) -> StructuralFields {
        let dependency = self
            .dependency
            .as_ref()
            .map(|d| json!([d.producer, d.section_id, d.spec_hash]))
            .unwrap_or(Value::Null);

        StructuralFields::from([
            ("instrument", json!(self.instrument)),
            ("role", json!(self.role)),
            ("section_hash", json!(self.section.contract_hash)),
            ("section_id", json!(self.section.section_id)),
            ("section_index", json!(self.section.index)),
            ("start_beat", json!(self.section.start_beat)),
            ("duration_beats", json!(self.section.duration_beats)),
            ("bar_count", json!(self.section.bar_count)),
            ("dependency", dependency),
            ("is_producer", json!(self.is_producer)),
            ("style", json!(self.style)),
            ("tempo", json!(self.tempo)),
            ("key", json!(self.key)),
        ])
    }

    fn contract_hash(&self) -> &str {
        &self.contract_hash
    }

    fn parent_contract_hash(&self) -> Option<&str> {
        self.parent_contract_hash.as_deref()
    }

    fn set_lineage(&mut self, contract_hash: String, parent: Option<String>) {
        self.contract_hash = contract_hash;
        self.parent_contract_hash = parent;
    }

    fn verify_nested(&self) -> Result<(), LineageError> {
        ensure_verified(self.section.as_ref())
    }
}

/// Request-scoped run data passed alongside contracts. Not hash-sealed: the
/// session identity it carries is bound into results via `execution_hash`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeContext {
    pub composition_id: Uuid,
    pub trace_id: String,
    pub expressive: bool,
    pub section_mode: SectionMode,
    pub refine_prompts: bool,
}

impl RuntimeContext {
    pub fn new(composition_id: Uuid) -> Self {
        Self {
            composition_id,
            trace_id: Uuid::new_v4().to_string(),
            expressive: false,
            section_mode: SectionMode::Parallel,
            refine_prompts: false,
        }
    }

    pub fn with_trace_id(&self, trace_id: impl Into<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
            ..self.clone()
        }
    }

    pub fn with_expressive(&self, expressive: bool) -> Self {
        Self {
            expressive,
            ..self.clone()
        }
    }

    pub fn with_section_mode(&self, section_mode: SectionMode) -> Self {
        Self {
            section_mode,
            ..self.clone()
        }
    }

    pub fn with_refine_prompts(&self, refine_prompts: bool) -> Self {
        Self {
            refine_prompts,
            ..self.clone()
        }
    }
}
