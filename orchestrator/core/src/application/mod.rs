// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod coordinator;
pub mod instrument_agent;
pub mod section_agent;
pub mod services;

// Re-export the agent hierarchy for convenience
pub use coordinator::Coordinator;
pub use instrument_agent::{InstrumentAgent, InstrumentReport};
pub use section_agent::{SectionAgent, SectionRun};
pub use services::{AgentContext, ExecutionServices};
