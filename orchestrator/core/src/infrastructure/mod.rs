// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod circuit_breaker;
pub mod event_bus;
pub mod generator;
pub mod llm;

pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use event_bus::{ChannelEventSink, EventEmitter, EventQueue, EventSink, EventSinkError};
pub use generator::{GatedGenerator, HttpGenerator};
