// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// LLM Provider Infrastructure - Anti-Corruption Layer Implementations
//
// Each provider adapter translates between the domain ModelRequest /
// ModelResponse and an external API.

pub mod openai;

pub use openai::OpenAIAdapter;
