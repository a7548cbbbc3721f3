// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Correlation envelope shared by every event. Consumers group interleaved
/// output by `instrument` / `section_id`, never by arrival order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Strictly increasing in forwarding order; assigned by the coordinator.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub composition_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instrument: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section_id: Option<String>,
    pub event: CompositionEvent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Active,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, StepStatus::Active)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CompositionEvent {
    Status {
        message: String,
    },
    Reasoning {
        content: String,
    },
    GenerationStarted {
        kind: String,
        prompt: String,
    },
    GenerationCompleted {
        kind: String,
        note_count: usize,
        duration_ms: u64,
    },
    ToolStarted {
        tool: String,
        arguments: serde_json::Value,
    },
    ToolResult {
        tool: String,
        result: serde_json::Value,
    },
    ToolError {
        tool: String,
        error: String,
    },
    PlanStep {
        step_id: String,
        label: String,
        status: StepStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    /// Transport-level idle marker, carries no information.
    Keepalive,
    Warning {
        message: String,
        running: Vec<String>,
    },
    /// Exactly one per request, always last.
    Complete {
        success: bool,
        failed_steps: Vec<String>,
        summary: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl CompositionEvent {
    pub fn status(message: impl Into<String>) -> Self {
        Self::Status {
            message: message.into(),
        }
    }

    pub fn step(step_id: impl Into<String>, label: impl Into<String>, status: StepStatus) -> Self {
        Self::PlanStep {
            step_id: step_id.into(),
            label: label.into(),
            status,
            detail: None,
        }
    }

    pub fn step_with_detail(
        step_id: impl Into<String>,
        label: impl Into<String>,
        status: StepStatus,
        detail: impl Into<String>,
    ) -> Self {
        Self::PlanStep {
            step_id: step_id.into(),
            label: label.into(),
            status,
            detail: Some(detail.into()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. })
    }

    pub fn is_keepalive(&self) -> bool {
        matches!(self, Self::Keepalive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_serialize_with_type_tag() {
        let envelope = EventEnvelope {
            seq: 3,
            timestamp: Utc::now(),
            composition_id: Uuid::nil(),
            instrument: Some("bass".to_string()),
            section_id: None,
            event: CompositionEvent::step("bass:01-verse", "Bass / Verse", StepStatus::Active),
        };

        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["event"]["type"], "plan_step");
        assert_eq!(value["event"]["status"], "active");
        assert_eq!(value["instrument"], "bass");
        assert!(value.get("section_id").is_none());

        let keepalive = serde_json::to_value(CompositionEvent::Keepalive).unwrap();
        assert_eq!(keepalive["type"], "keepalive");
    }
}
