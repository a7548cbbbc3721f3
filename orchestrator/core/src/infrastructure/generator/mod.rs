// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Generator Infrastructure
//
// http: the external generation service client.
// gated: the only path agents use to reach any MusicGenerator.

pub mod gated;
pub mod http;

pub use gated::GatedGenerator;
pub use http::HttpGenerator;
