// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Lib
//!
//! Agent-team composition orchestrator: a coordinator fans a request out to
//! instrument agents, which fan out to section agents, all bound together by
//! hash-sealed contracts.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Purpose:** Crate root for the domain, application and infrastructure layers

pub mod domain;
pub mod application;
pub mod infrastructure;

pub use domain::*;
