// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Orchestration error taxonomy.
//!
//! | Variant | Retried | Scope |
//! |---------|---------|-------|
//! | `ProtocolViolation` | never | halts the level that detected it |
//! | `TransientGenerator` | with backoff | one section |
//! | `GeneratorCircuitOpen` | never by the observer | one section |
//! | `SectionFailure` | by the instrument | one section |
//! | `InstrumentFailure` | no | one instrument |
//! | `Timeout` | as the interrupted failure | level where it fired |
//! | `Cancelled` | no | whole request, not logged as an error |

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::domain::generator::GeneratorError;
use crate::domain::lineage::LineageError;

#[derive(Debug, Clone, Error)]
pub enum OrchestrationError {
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Transient generator error: {0}")]
    TransientGenerator(GeneratorError),

    #[error("Generator circuit breaker is open")]
    GeneratorCircuitOpen,

    #[error("Section {section_id} failed: {reason}")]
    SectionFailure { section_id: String, reason: String },

    #[error("Instrument {instrument} failed: {reason}")]
    InstrumentFailure { instrument: String, reason: String },

    #[error("{scope} timed out after {after:?}")]
    Timeout { scope: String, after: Duration },

    #[error("Cancelled")]
    Cancelled,
}

impl OrchestrationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ProtocolViolation(_) => ErrorKind::ProtocolViolation,
            Self::TransientGenerator(_) => ErrorKind::TransientGenerator,
            Self::GeneratorCircuitOpen => ErrorKind::GeneratorCircuitOpen,
            Self::SectionFailure { .. } => ErrorKind::SectionFailure,
            Self::InstrumentFailure { .. } => ErrorKind::InstrumentFailure,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Whether the instrument's server-owned retry may run this section again.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    pub fn from_generator(section_id: &str, error: GeneratorError) -> Self {
        match error {
            GeneratorError::CircuitOpen => Self::GeneratorCircuitOpen,
            e if e.is_transient() => Self::TransientGenerator(e),
            e => Self::SectionFailure {
                section_id: section_id.to_string(),
                reason: e.to_string(),
            },
        }
    }
}

impl From<LineageError> for OrchestrationError {
    fn from(error: LineageError) -> Self {
        Self::ProtocolViolation(error.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ProtocolViolation,
    TransientGenerator,
    GeneratorCircuitOpen,
    SectionFailure,
    InstrumentFailure,
    Timeout,
    Cancelled,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::TransientGenerator | ErrorKind::SectionFailure | ErrorKind::Timeout
        )
    }
}
