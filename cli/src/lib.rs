// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Ensemble CLI library
//!
//! Exposes command implementations so they can be exercised from tests.

pub mod commands;
