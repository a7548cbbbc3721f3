// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain
//!
//! Contracts, lineage and the value types the agent hierarchy exchanges.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Pure types and interfaces; no I/O besides config loading

pub mod config;
pub mod contract;
pub mod error;
pub mod events;
pub mod generator;
pub mod lineage;
pub mod llm;
pub mod music;
pub mod outcome;
pub mod plan;
pub mod request;
pub mod telemetry;
pub mod timeline;
