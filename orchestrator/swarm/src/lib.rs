// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # `ensemble-swarm`: Cross-Task Coordination Primitives
//!
//! Mutable coordination state that concurrently running agents share within one
//! composition request. These primitives are passed *alongside* contracts, never
//! inside them: contracts stay immutable value objects while everything that
//! changes at run time lives here.
//!
//! ## Crate Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`domain::signals`] | `SectionSignals`: lineage-keyed, write-once completion signals |
//! | [`domain::section_state`] | `SectionState`: write-once telemetry store |
//!
//! ## Locking Discipline
//!
//! Both primitives hold a `parking_lot` mutex only for map lookups and inserts,
//! never across an `.await`. Waiting happens on a per-entry `tokio::sync::watch`
//! channel, so the primitives stay correct on a multi-threaded runtime.

pub mod domain;

pub use domain::*;
