// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use serde::{Deserialize, Serialize};

/// One generated note. `start_beat` is relative to the start of its region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub pitch: u8,
    pub start_beat: f64,
    pub duration_beats: f64,
    pub velocity: u8,
}

impl Note {
    pub fn new(pitch: u8, start_beat: f64, duration_beats: f64, velocity: u8) -> Self {
        Self {
            pitch,
            start_beat,
            duration_beats,
            velocity,
        }
    }
}

/// Expression curve point (modulation / dynamics), region-relative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlPoint {
    pub beat: f64,
    pub value: u8,
}

/// Notes that start in the last `beats` of a part, shifted so the window starts at 0.
pub fn tail(notes: &[Note], total_beats: f64, beats: f64) -> Vec<Note> {
    let window_start = (total_beats - beats).max(0.0);
    notes
        .iter()
        .filter(|n| n.start_beat >= window_start)
        .map(|n| Note {
            start_beat: n.start_beat - window_start,
            ..n.clone()
        })
        .collect()
}
