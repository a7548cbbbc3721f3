// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Swarm Domain Layer
//!
//! | Module | Key Types |
//! |--------|-----------|
//! | [`signals`] | `SectionSignals`, `SignalResult`, `SignalWaitError` |
//! | [`section_state`] | `SectionState` |

pub mod section_state;
pub mod signals;

pub use section_state::*;
pub use signals::*;
