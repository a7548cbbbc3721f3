// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Project Timeline
//!
//! The per-request workspace agents materialize into: tracks, regions,
//! buses and sends. Every write is idempotent so a retried section never
//! duplicates a placement.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::domain::music::{ControlPoint, Note};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub id: String,
    pub name: String,
    pub instrument: String,
    pub effects: Vec<String>,
    pub level_db: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub id: String,
    pub track_id: String,
    pub start_beat: f64,
    pub duration_beats: f64,
    pub notes: Vec<Note>,
    pub expression: Vec<ControlPoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusSend {
    pub track_id: String,
    pub bus_id: String,
    pub level_db: f64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimelineError {
    #[error("Unknown track '{0}'")]
    UnknownTrack(String),
    #[error("Unknown region '{0}'")]
    UnknownRegion(String),
    #[error("Unknown bus '{0}'")]
    UnknownBus(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimelineSnapshot {
    pub tempo: Option<u32>,
    pub key: Option<String>,
    pub tracks: Vec<Track>,
    pub regions: Vec<Region>,
    pub buses: BTreeMap<String, String>,
    pub sends: Vec<BusSend>,
}

#[derive(Debug, Default)]
struct Inner {
    tempo: Option<u32>,
    key: Option<String>,
    tracks: Vec<Track>,
    regions: Vec<Region>,
    /// bus id -> name
    buses: BTreeMap<String, String>,
    sends: Vec<BusSend>,
}

impl Inner {
    fn track_mut(&mut self, track: &str) -> Result<&mut Track, TimelineError> {
        self.tracks
            .iter_mut()
            .find(|t| t.id == track || t.name == track || t.instrument == track)
            .ok_or_else(|| TimelineError::UnknownTrack(track.to_string()))
    }

    fn region_mut(&mut self, region_id: &str) -> Result<&mut Region, TimelineError> {
        self.regions
            .iter_mut()
            .find(|r| r.id == region_id)
            .ok_or_else(|| TimelineError::UnknownRegion(region_id.to_string()))
    }
}

#[derive(Debug, Default)]
pub struct ProjectTimeline {
    inner: Mutex<Inner>,
}

/// `(id, created)`. `created == false` means the call was a no-op.
pub type Placement = (String, bool);

impl ProjectTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_tempo_key(&self, tempo: u32, key: &str) {
        let mut inner = self.inner.lock();
        inner.tempo = Some(tempo);
        inner.key = Some(key.to_string());
    }

    /// Idempotent by instrument.
    pub fn create_track(&self, name: &str, instrument: &str) -> Placement {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.tracks.iter().find(|t| t.instrument == instrument) {
            return (existing.id.clone(), false);
        }
        let id = format!("track-{}", inner.tracks.len() + 1);
        inner.tracks.push(Track {
            id: id.clone(),
            name: name.to_string(),
            instrument: instrument.to_string(),
            effects: Vec::new(),
            level_db: 0.0,
        });
        (id, true)
    }

    /// Idempotent by `(track, start, duration)`.
    pub fn ensure_region(
        &self,
        track_id: &str,
        start_beat: f64,
        duration_beats: f64,
    ) -> Result<Placement, TimelineError> {
        let mut inner = self.inner.lock();
        if !inner.tracks.iter().any(|t| t.id == track_id) {
            return Err(TimelineError::UnknownTrack(track_id.to_string()));
        }
        if let Some(existing) = inner.regions.iter().find(|r| {
            r.track_id == track_id && r.start_beat == start_beat && r.duration_beats == duration_beats
        }) {
            return Ok((existing.id.clone(), false));
        }
        let id = format!("{}-region-{}", track_id, inner.regions.len() + 1);
        inner.regions.push(Region {
            id: id.clone(),
            track_id: track_id.to_string(),
            start_beat,
            duration_beats,
            notes: Vec::new(),
            expression: Vec::new(),
        });
        Ok((id, true))
    }

    /// Replaces the region's notes.
    pub fn write_notes(&self, region_id: &str, notes: Vec<Note>) -> Result<(), TimelineError> {
        self.inner.lock().region_mut(region_id)?.notes = notes;
        Ok(())
    }

    pub fn write_expression(
        &self,
        region_id: &str,
        expression: Vec<ControlPoint>,
    ) -> Result<(), TimelineError> {
        self.inner.lock().region_mut(region_id)?.expression = expression;
        Ok(())
    }

    /// Returns false when the effect was already on the track.
    pub fn add_effect(&self, track: &str, effect: &str) -> Result<bool, TimelineError> {
        let mut inner = self.inner.lock();
        let track = inner.track_mut(track)?;
        if track.effects.iter().any(|e| e == effect) {
            return Ok(false);
        }
        track.effects.push(effect.to_string());
        Ok(true)
    }

    /// Idempotent by name.
    pub fn create_bus(&self, name: &str) -> Placement {
        let mut inner = self.inner.lock();
        if let Some((id, _)) = inner.buses.iter().find(|(_, n)| n.as_str() == name) {
            return (id.clone(), false);
        }
        let id = format!("bus-{}", inner.buses.len() + 1);
        inner.buses.insert(id.clone(), name.to_string());
        (id, true)
    }

    /// Upserts the send level for `(track, bus)`.
    pub fn add_send(&self, track: &str, bus: &str, level_db: f64) -> Result<(), TimelineError> {
        let mut inner = self.inner.lock();
        let track_id = inner.track_mut(track)?.id.clone();
        let bus_id = inner
            .buses
            .iter()
            .find(|(id, name)| id.as_str() == bus || name.as_str() == bus)
            .map(|(id, _)| id.clone())
            .ok_or_else(|| TimelineError::UnknownBus(bus.to_string()))?;

        match inner
            .sends
            .iter_mut()
            .find(|s| s.track_id == track_id && s.bus_id == bus_id)
        {
            Some(send) => send.level_db = level_db,
            None => inner.sends.push(BusSend {
                track_id,
                bus_id,
                level_db,
            }),
        }
        Ok(())
    }

    pub fn set_level(&self, track: &str, level_db: f64) -> Result<(), TimelineError> {
        self.inner.lock().track_mut(track)?.level_db = level_db;
        Ok(())
    }

    pub fn snapshot(&self) -> TimelineSnapshot {
        let inner = self.inner.lock();
        TimelineSnapshot {
            tempo: inner.tempo,
            key: inner.key.clone(),
            tracks: inner.tracks.clone(),
            regions: inner.regions.clone(),
            buses: inner.buses.clone(),
            sends: inner.sends.clone(),
        }
    }
}
