// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Command implementations for the Ensemble CLI

pub mod compose;
pub mod config;

pub use self::compose::ComposeCommand;
pub use self::config::ConfigCommand;
