// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Section Telemetry
//!
//! Deterministic numeric summary of one generated part, computed without any
//! external call and written once to `SectionState` so sibling agents can
//! react to each other's output.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::domain::lineage::short_hash;
use crate::domain::music::Note;

/// Bins per bar in the rhythmic histogram (sixteenth-note grid in 4/4).
pub const RHYTHM_BINS: usize = 16;

const FINGERPRINT_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionTelemetry {
    pub instrument: String,
    pub section_id: String,
    pub tempo: u32,
    pub note_count: usize,
    /// 0..=1, loudness blended with density.
    pub energy: f64,
    /// Notes per beat.
    pub density: f64,
    /// Onset distribution over one bar, normalized to sum 1 (all zero when silent).
    pub rhythm_histogram: [f64; RHYTHM_BINS],
    pub rhythm_fingerprint: String,
    /// 0..=1, rhythmic entropy blended with pitch-class variety.
    pub complexity: f64,
    pub velocity_mean: f64,
    pub velocity_variance: f64,
}

impl SectionTelemetry {
    pub fn compute(
        instrument: &str,
        section_id: &str,
        tempo: u32,
        notes: &[Note],
        duration_beats: f64,
        beats_per_bar: f64,
    ) -> Self {
        let count = notes.len();
        let density = if duration_beats > 0.0 {
            count as f64 / duration_beats
        } else {
            0.0
        };

        let (velocity_mean, velocity_variance) = velocity_stats(notes);
        let rhythm_histogram = histogram(notes, beats_per_bar);
        let rhythm_fingerprint = fingerprint(&rhythm_histogram);

        let energy = (0.6 * velocity_mean / 127.0 + 0.4 * (density / 4.0).min(1.0)).clamp(0.0, 1.0);

        let pitch_classes: HashSet<u8> = notes.iter().map(|n| n.pitch % 12).collect();
        let variety = pitch_classes.len() as f64 / 12.0;
        let complexity = (0.5 * normalized_entropy(&rhythm_histogram) + 0.5 * variety).clamp(0.0, 1.0);

        Self {
            instrument: instrument.to_string(),
            section_id: section_id.to_string(),
            tempo,
            note_count: count,
            energy,
            density,
            rhythm_histogram,
            rhythm_fingerprint,
            complexity,
            velocity_mean,
            velocity_variance,
        }
    }
}

fn velocity_stats(notes: &[Note]) -> (f64, f64) {
    if notes.is_empty() {
        return (0.0, 0.0);
    }
    let n = notes.len() as f64;
    let mean = notes.iter().map(|note| f64::from(note.velocity)).sum::<f64>() / n;
    let variance = notes
        .iter()
        .map(|note| (f64::from(note.velocity) - mean).powi(2))
        .sum::<f64>()
        / n;
    (mean, variance)
}

fn histogram(notes: &[Note], beats_per_bar: f64) -> [f64; RHYTHM_BINS] {
    let mut bins = [0.0; RHYTHM_BINS];
    if notes.is_empty() || beats_per_bar <= 0.0 {
        return bins;
    }
    for note in notes {
        let position = note.start_beat.max(0.0).rem_euclid(beats_per_bar) / beats_per_bar;
        let bin = ((position * RHYTHM_BINS as f64) as usize).min(RHYTHM_BINS - 1);
        bins[bin] += 1.0;
    }
    let total = notes.len() as f64;
    for bin in bins.iter_mut() {
        *bin /= total;
    }
    bins
}

/// Short hash of the onset pattern (which grid positions are ever hit).
fn fingerprint(bins: &[f64; RHYTHM_BINS]) -> String {
    let pattern: String = bins.iter().map(|b| if *b > 0.0 { '1' } else { '0' }).collect();
    let mut hash = short_hash(pattern.as_bytes());
    hash.truncate(FINGERPRINT_LEN);
    hash
}

fn normalized_entropy(bins: &[f64; RHYTHM_BINS]) -> f64 {
    let entropy: f64 = bins
        .iter()
        .filter(|p| **p > 0.0)
        .map(|p| -p * p.log2())
        .sum();
    entropy / (RHYTHM_BINS as f64).log2()
}
