// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Music Generator
//!
//! Domain interface to the external creative-generation service. Agents never
//! hold a raw `MusicGenerator`; they go through the gated client in
//! `infrastructure::generator`, which applies the circuit breaker, the
//! concurrency gate and the call timeout.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::music::{ControlPoint, Note};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationKind {
    /// The section's notes.
    Part,
    /// Optional expressive pass over an existing part.
    Expression,
}

impl GenerationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            GenerationKind::Part => "part",
            GenerationKind::Expression => "expression",
        }
    }
}

/// Parameters fixed by the contract. Never taken from a planning step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuralParams {
    pub instrument: String,
    pub role: String,
    pub tempo: u32,
    pub key: String,
    pub start_beat: f64,
    pub duration_beats: f64,
    pub bars: u32,
    pub beats_per_bar: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreativeParams {
    pub prompt: String,
    pub style: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub character: Option<String>,
    /// Tail of the previous section, in sequential mode.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub continuation: Vec<Note>,
    /// Producer's notes for the same section, or the part itself on an
    /// expression pass.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependency: Vec<Note>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub kind: GenerationKind,
    pub structural: StructuralParams,
    pub creative: CreativeParams,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationOutput {
    #[serde(default)]
    pub notes: Vec<Note>,
    #[serde(default)]
    pub expression: Vec<ControlPoint>,
}

#[async_trait]
pub trait MusicGenerator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationOutput, GeneratorError>;

    /// Cheap liveness probe.
    async fn health_check(&self) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GeneratorError {
    #[error("Generator call timed out")]
    Timeout,

    #[error("Generator queue is full")]
    QueueFull,

    #[error("Generator is cold-starting")]
    ColdStart,

    #[error("Generator unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid generator response: {0}")]
    InvalidResponse(String),

    #[error("Generator circuit breaker is open")]
    CircuitOpen,
}

impl GeneratorError {
    /// Worth retrying after a backoff; also counts against the breaker.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GeneratorError::Timeout
                | GeneratorError::QueueFull
                | GeneratorError::ColdStart
                | GeneratorError::Unavailable(_)
        )
    }
}
