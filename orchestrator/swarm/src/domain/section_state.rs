// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Section State
//!
//! Write-once store of per-section telemetry snapshots, keyed by
//! `"{instrument}: {section_id}"`. Agents read each other's snapshots for
//! cross-task awareness without re-invoking any model. An entry is never
//! overwritten once written; the store stays readable after the request
//! completes for diagnostics.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

pub struct SectionState<T> {
    entries: RwLock<HashMap<String, Arc<T>>>,
}

impl<T> Default for SectionState<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SectionState<T> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn key(instrument: &str, section_id: &str) -> String {
        format!("{}: {}", instrument, section_id)
    }

    /// Store a snapshot. Returns `false` (and keeps the existing entry) when
    /// the key was already written.
    pub fn record(&self, instrument: &str, section_id: &str, snapshot: T) -> bool {
        let key = Self::key(instrument, section_id);
        let mut entries = self.entries.write();
        if entries.contains_key(&key) {
            debug!(key = %key, "Section state already recorded, keeping first snapshot");
            return false;
        }
        entries.insert(key, Arc::new(snapshot));
        true
    }

    pub fn get(&self, instrument: &str, section_id: &str) -> Option<Arc<T>> {
        self.entries
            .read()
            .get(&Self::key(instrument, section_id))
            .cloned()
    }

    /// All snapshots recorded for one section, across instruments.
    pub fn for_section(&self, section_id: &str) -> Vec<(String, Arc<T>)> {
        let suffix = format!(": {}", section_id);
        let mut found: Vec<_> = self
            .entries
            .read()
            .iter()
            .filter(|(key, _)| key.ends_with(&suffix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        found.sort_by(|a, b| a.0.cmp(&b.0));
        found
    }

    /// Ordered copy of every entry.
    pub fn snapshot(&self) -> BTreeMap<String, Arc<T>> {
        self.entries
            .read()
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
