// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Plans
//!
//! Tool vocabulary offered to the model and the typed plans recovered from
//! its tool calls. A plan is intent only: structural values it proposes
//! (start, duration) are checked against the contract and overridden by it.

use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use tracing::warn;

use crate::domain::contract::{InstrumentContract, SectionSpec};
use crate::domain::llm::{ToolCall, ToolSpec};

pub const CREATE_TRACK: &str = "create_track";
pub const GENERATE_SECTION: &str = "generate_section";
pub const ADD_EFFECT: &str = "add_effect";
pub const CREATE_BUS: &str = "create_bus";
pub const ADD_SEND: &str = "add_send";
pub const SET_LEVEL: &str = "set_level";

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PlannedSection {
    pub section_id: String,
    pub prompt: String,
    #[serde(default)]
    pub start_beat: Option<f64>,
    #[serde(default)]
    pub duration_beats: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstrumentPlan {
    pub track_name: Option<String>,
    /// Keyed by section id; a later call for the same section replaces an earlier one.
    pub sections: BTreeMap<String, PlannedSection>,
    pub effects: Vec<String>,
}

#[derive(Deserialize)]
struct NameArgs {
    name: String,
}

#[derive(Deserialize)]
struct EffectArgs {
    effect: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SendStep {
    pub track: String,
    pub bus: String,
    pub level_db: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LevelStep {
    pub track: String,
    pub level_db: f64,
}

fn parse_args<T: for<'de> Deserialize<'de>>(call: &ToolCall) -> Option<T> {
    match serde_json::from_value(call.arguments.clone()) {
        Ok(args) => Some(args),
        Err(e) => {
            warn!(tool = %call.name, error = %e, "Ignoring tool call with malformed arguments");
            None
        }
    }
}

impl InstrumentPlan {
    /// Build a plan from tool calls. Sections not in `known_sections` are
    /// dropped; unknown tools are ignored.
    pub fn from_tool_calls<'a>(
        calls: &[ToolCall],
        known_sections: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        let known: Vec<&str> = known_sections.into_iter().collect();
        let mut plan = Self::default();
        plan.absorb(calls, &known);
        plan
    }

    /// Merge further tool calls (e.g. from a gap-fill call) into this plan.
    pub fn merge<'a>(&mut self, calls: &[ToolCall], known_sections: impl IntoIterator<Item = &'a str>) {
        let known: Vec<&str> = known_sections.into_iter().collect();
        self.absorb(calls, &known);
    }

    fn absorb(&mut self, calls: &[ToolCall], known: &[&str]) {
        for call in calls {
            match call.name.as_str() {
                CREATE_TRACK => {
                    if let Some(args) = parse_args::<NameArgs>(call) {
                        self.track_name = Some(args.name);
                    }
                }
                GENERATE_SECTION => {
                    let Some(section) = parse_args::<PlannedSection>(call) else {
                        continue;
                    };
                    if !known.contains(&section.section_id.as_str()) {
                        warn!(section_id = %section.section_id, "Ignoring plan for unknown section");
                        continue;
                    }
                    self.sections.insert(section.section_id.clone(), section);
                }
                ADD_EFFECT => {
                    if let Some(args) = parse_args::<EffectArgs>(call) {
                        if !self.effects.contains(&args.effect) {
                            self.effects.push(args.effect);
                        }
                    }
                }
                other => warn!(tool = %other, "Ignoring unknown planning tool"),
            }
        }
    }

    /// Section ids from `expected` with no planned generation request.
    pub fn missing<'a>(&self, expected: impl IntoIterator<Item = &'a str>) -> Vec<String> {
        expected
            .into_iter()
            .filter(|id| !self.sections.contains_key(*id))
            .map(str::to_string)
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MixPlan {
    pub buses: Vec<String>,
    pub sends: Vec<SendStep>,
    pub levels: Vec<LevelStep>,
}

impl MixPlan {
    pub fn from_tool_calls(calls: &[ToolCall]) -> Self {
        let mut plan = Self::default();
        for call in calls {
            match call.name.as_str() {
                CREATE_BUS => {
                    if let Some(args) = parse_args::<NameArgs>(call) {
                        plan.buses.push(args.name);
                    }
                }
                ADD_SEND => {
                    if let Some(step) = parse_args::<SendStep>(call) {
                        plan.sends.push(step);
                    }
                }
                SET_LEVEL => {
                    if let Some(step) = parse_args::<LevelStep>(call) {
                        plan.levels.push(step);
                    }
                }
                other => warn!(tool = %other, "Ignoring unknown mixing tool"),
            }
        }
        plan
    }

    pub fn is_empty(&self) -> bool {
        self.buses.is_empty() && self.sends.is_empty() && self.levels.is_empty()
    }
}

pub fn planning_tools() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: CREATE_TRACK.to_string(),
            description: "Create the instrument's track".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {"name": {"type": "string"}},
                "required": ["name"]
            }),
        },
        ToolSpec {
            name: GENERATE_SECTION.to_string(),
            description: "Request generation of one section of this instrument's part".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "section_id": {"type": "string"},
                    "prompt": {"type": "string"},
                    "start_beat": {"type": "number"},
                    "duration_beats": {"type": "number"}
                },
                "required": ["section_id", "prompt"]
            }),
        },
        ToolSpec {
            name: ADD_EFFECT.to_string(),
            description: "Add an effect to the instrument's track".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {"effect": {"type": "string"}},
                "required": ["effect"]
            }),
        },
    ]
}

pub fn mixing_tools() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: CREATE_BUS.to_string(),
            description: "Create a shared effects bus".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {"name": {"type": "string"}},
                "required": ["name"]
            }),
        },
        ToolSpec {
            name: ADD_SEND.to_string(),
            description: "Send a track to a bus at a level in dB".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "track": {"type": "string"},
                    "bus": {"type": "string"},
                    "level_db": {"type": "number"}
                },
                "required": ["track", "bus", "level_db"]
            }),
        },
        ToolSpec {
            name: SET_LEVEL.to_string(),
            description: "Set a track's fader level in dB".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "track": {"type": "string"},
                    "level_db": {"type": "number"}
                },
                "required": ["track", "level_db"]
            }),
        },
    ]
}

/// One line per section: `- {section_id} | {name} | beats {start}..{end} | {character}`.
pub fn section_lines<'a>(sections: impl IntoIterator<Item = &'a SectionSpec>) -> String {
    sections
        .into_iter()
        .map(|s| {
            format!(
                "- {} | {} | beats {}..{} | {}",
                s.section_id,
                s.name,
                s.start_beat,
                s.end_beat(),
                if s.character.is_empty() { "-" } else { s.character.as_str() }
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub const PLANNING_SYSTEM: &str = "You arrange one instrument of a multi-instrument piece. \
Call create_track once, generate_section once per listed section, then add_effect for the \
track's effects. Keep prompts short; detailed musical choices happen per section.";

pub fn planning_prompt(contract: &InstrumentContract) -> String {
    let mut prompt = format!(
        "Instrument: {} ({})\nStyle: {}\nTempo: {} BPM\nKey: {}\nSections:\n{}",
        contract.instrument,
        contract.role,
        contract.style,
        contract.tempo,
        contract.key,
        section_lines(contract.sections.iter().map(|s| s.as_ref())),
    );
    if let Some(depends_on) = &contract.depends_on {
        prompt.push_str(&format!("\nFollows: {}", depends_on));
    }
    if let Some(guidance) = &contract.guidance {
        prompt.push_str(&format!("\nGuidance: {}", guidance));
    }
    prompt
}

pub fn gap_fill_prompt(contract: &InstrumentContract, missing: &[String]) -> String {
    let sections = contract
        .sections
        .iter()
        .filter(|s| missing.contains(&s.section_id))
        .map(|s| s.as_ref());
    format!(
        "Instrument: {} ({})\nThe plan is missing these sections. Call generate_section for each:\n{}",
        contract.instrument,
        contract.role,
        section_lines(sections),
    )
}

pub const MIXING_SYSTEM: &str = "You mix a finished arrangement. Use create_bus, add_send and \
set_level. Tracks can be referenced by id or instrument name.";
