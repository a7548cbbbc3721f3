// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Composition Request
//!
//! The parsed client request the coordinator decomposes into sections and
//! instruments. Parsing and validation happen here so every contract built
//! from a request starts from checked input.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositionRequest {
    pub style: String,
    pub tempo: u32,
    pub key: String,
    #[serde(default = "default_beats_per_bar")]
    pub beats_per_bar: u32,
    pub sections: Vec<SectionRequest>,
    pub instruments: Vec<InstrumentRequest>,
    /// Issue one extra expression pass per section.
    #[serde(default)]
    pub expressive: bool,
    #[serde(default)]
    pub section_mode: SectionMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectionRequest {
    pub name: String,
    pub bars: u32,
    #[serde(default)]
    pub character: Option<String>,
    #[serde(default)]
    pub role_brief: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentRequest {
    pub name: String,
    pub role: String,
    /// Instrument whose part for the same section must finish first.
    #[serde(default)]
    pub depends_on: Option<String>,
    /// Free-text generation guidance, advisory only.
    #[serde(default)]
    pub guidance: Option<String>,
}

/// How one instrument runs its sections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionMode {
    /// All sections concurrently.
    #[default]
    Parallel,
    /// Index order, previous section's tail threaded forward.
    Sequential,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("Request must contain at least one section")]
    NoSections,
    #[error("Request must contain at least one instrument")]
    NoInstruments,
    #[error("Section '{0}' must have at least one bar")]
    EmptySection(String),
    #[error("Tempo {0} is outside 20..=400 BPM")]
    TempoOutOfRange(u32),
    #[error("beats_per_bar {0} is outside 1..={MAX_BEATS_PER_BAR}")]
    InvalidMeter(u32),
    #[error("Section '{name}' has {bars} bars, at most {MAX_SECTION_BARS} are allowed")]
    SectionTooLong { name: String, bars: u32 },
    #[error("Duplicate instrument '{0}'")]
    DuplicateInstrument(String),
    #[error("Instrument '{instrument}' depends on unknown instrument '{target}'")]
    UnknownDependency { instrument: String, target: String },
    #[error("Instrument '{0}' cannot depend on itself")]
    SelfDependency(String),
    #[error("Instrument '{0}' is a dependency producer and cannot depend on another instrument")]
    ChainedDependency(String),
    #[error("At most one producer instrument is supported, found: {0:?}")]
    MultipleProducers(Vec<String>),
    #[error("Failed to parse request: {0}")]
    Parse(String),
}

pub const MAX_SECTION_BARS: u32 = 1024;
pub const MAX_BEATS_PER_BAR: u32 = 32;

fn default_beats_per_bar() -> u32 {
    4
}

impl CompositionRequest {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, RequestError> {
        let request: Self =
            serde_yaml::from_str(yaml).map_err(|e| RequestError::Parse(e.to_string()))?;
        request.validate()?;
        Ok(request)
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(Self::from_yaml_str(&content)?)
    }

    pub fn validate(&self) -> Result<(), RequestError> {
        if self.sections.is_empty() {
            return Err(RequestError::NoSections);
        }
        if self.instruments.is_empty() {
            return Err(RequestError::NoInstruments);
        }
        if !(20..=400).contains(&self.tempo) {
            return Err(RequestError::TempoOutOfRange(self.tempo));
        }
        if !(1..=MAX_BEATS_PER_BAR).contains(&self.beats_per_bar) {
            return Err(RequestError::InvalidMeter(self.beats_per_bar));
        }
        if let Some(section) = self.sections.iter().find(|s| s.bars == 0) {
            return Err(RequestError::EmptySection(section.name.clone()));
        }
        if let Some(section) = self.sections.iter().find(|s| s.bars > MAX_SECTION_BARS) {
            return Err(RequestError::SectionTooLong {
                name: section.name.clone(),
                bars: section.bars,
            });
        }

        let mut names = HashSet::new();
        for instrument in &self.instruments {
            if !names.insert(instrument.name.as_str()) {
                return Err(RequestError::DuplicateInstrument(instrument.name.clone()));
            }
        }

        for instrument in &self.instruments {
            let Some(target) = &instrument.depends_on else {
                continue;
            };
            if target == &instrument.name {
                return Err(RequestError::SelfDependency(instrument.name.clone()));
            }
            if !names.contains(target.as_str()) {
                return Err(RequestError::UnknownDependency {
                    instrument: instrument.name.clone(),
                    target: target.clone(),
                });
            }
        }

        let producers = self.producers();
        if producers.len() > 1 {
            return Err(RequestError::MultipleProducers(producers));
        }
        if let Some(producer) = producers.first() {
            let chained = self
                .instruments
                .iter()
                .any(|i| &i.name == producer && i.depends_on.is_some());
            if chained {
                return Err(RequestError::ChainedDependency(producer.clone()));
            }
        }

        Ok(())
    }

    /// Instruments that some other instrument waits on, sorted.
    pub fn producers(&self) -> Vec<String> {
        let mut producers: Vec<String> = self
            .instruments
            .iter()
            .filter_map(|i| i.depends_on.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        producers.sort();
        producers
    }

    pub fn is_producer(&self, instrument: &str) -> bool {
        self.instruments
            .iter()
            .any(|i| i.depends_on.as_deref() == Some(instrument))
    }
}

/// `"{index:02}-{slug}"`, e.g. `"01-pre-chorus"`.
pub fn section_id(index: usize, name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut last_dash = true;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    let slug = slug.trim_end_matches('-');
    let slug = if slug.is_empty() { "section" } else { slug };
    format!("{:02}-{}", index, slug)
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQUEST: &str = r#"
style: lofi hip hop
tempo: 84
key: A minor
sections:
  - name: Intro
    bars: 4
  - name: Verse
    bars: 8
    character: laid back
instruments:
  - name: drums
    role: rhythm
  - name: bass
    role: low end
    depends_on: drums
"#;

    #[test]
    fn test_parse_and_defaults() {
        let request = CompositionRequest::from_yaml_str(REQUEST).unwrap();
        assert_eq!(request.beats_per_bar, 4);
        assert_eq!(request.section_mode, SectionMode::Parallel);
        assert!(!request.expressive);
        assert_eq!(request.producers(), vec!["drums".to_string()]);
        assert!(request.is_producer("drums"));
        assert!(!request.is_producer("bass"));
    }

    #[test]
    fn test_validation_rejects_bad_dependencies() {
        let mut request = CompositionRequest::from_yaml_str(REQUEST).unwrap();

        request.instruments[1].depends_on = Some("keys".to_string());
        assert!(matches!(
            request.validate(),
            Err(RequestError::UnknownDependency { .. })
        ));

        request.instruments[1].depends_on = Some("bass".to_string());
        assert_eq!(
            request.validate(),
            Err(RequestError::SelfDependency("bass".to_string()))
        );

        request.instruments[1].depends_on = Some("drums".to_string());
        request.instruments[0].depends_on = Some("bass".to_string());
        assert!(matches!(
            request.validate(),
            Err(RequestError::MultipleProducers(_))
        ));
    }

    #[test]
    fn test_validation_rejects_empty_input() {
        let mut request = CompositionRequest::from_yaml_str(REQUEST).unwrap();
        request.tempo = 500;
        assert_eq!(request.validate(), Err(RequestError::TempoOutOfRange(500)));

        request.tempo = 90;
        request.sections[0].bars = 0;
        assert_eq!(
            request.validate(),
            Err(RequestError::EmptySection("Intro".to_string()))
        );

        request.sections.clear();
        assert_eq!(request.validate(), Err(RequestError::NoSections));
    }

    #[test]
    fn test_validation_bounds_section_length_and_meter() {
        let mut request = CompositionRequest::from_yaml_str(REQUEST).unwrap();
        request.sections[1].bars = 2_000_000_000;
        assert_eq!(
            request.validate(),
            Err(RequestError::SectionTooLong {
                name: "Verse".to_string(),
                bars: 2_000_000_000
            })
        );

        request.sections[1].bars = MAX_SECTION_BARS;
        assert!(request.validate().is_ok());

        request.beats_per_bar = 0;
        assert_eq!(request.validate(), Err(RequestError::InvalidMeter(0)));
        request.beats_per_bar = MAX_BEATS_PER_BAR + 1;
        assert_eq!(
            request.validate(),
            Err(RequestError::InvalidMeter(MAX_BEATS_PER_BAR + 1))
        );
    }

    #[test]
    fn test_section_id_slug() {
        assert_eq!(section_id(0, "Intro"), "00-intro");
        assert_eq!(section_id(3, "Pre Chorus!"), "03-pre-chorus");
        assert_eq!(section_id(12, "  "), "12-section");
    }
}
