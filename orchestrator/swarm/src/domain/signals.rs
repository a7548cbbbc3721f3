// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Section Signals
//!
//! Cross-task completion signals between a dependency *producer* (e.g. the drum
//! part of a section) and its *dependents* (e.g. the bass part of the same
//! section).
//!
//! Every entry is keyed by `(section_id, contract_hash)`, so a signal raised
//! under one lineage can never release a waiter that expects another. Entries
//! are created lazily by whichever side arrives first and are write-once: the
//! first `signal_complete` wins and later calls are no-ops.
//!
//! The stored result is published through a `watch` channel, which means the
//! payload is written before any waiter is woken and a waiter that wakes always
//! reads the complete result.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Registry key for one signal slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SignalKey {
    pub section_id: String,
    pub contract_hash: String,
}

impl SignalKey {
    pub fn new(section_id: impl Into<String>, contract_hash: impl Into<String>) -> Self {
        Self {
            section_id: section_id.into(),
            contract_hash: contract_hash.into(),
        }
    }
}

/// Result stored by a producer.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalResult<P> {
    pub section_id: String,
    pub contract_hash: String,
    pub success: bool,
    /// Producer output on success; `None` on failure.
    pub payload: Option<P>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignalWaitError {
    #[error("Timed out after {timeout:?} waiting for section {section_id}")]
    Timeout { section_id: String, timeout: Duration },

    #[error("Lineage mismatch for section {section_id}: expected {expected}, found {found}")]
    LineageMismatch {
        section_id: String,
        expected: String,
        found: String,
    },

    #[error("Signal registry dropped while waiting for section {0}")]
    Closed(String),
}

type Slot<P> = watch::Sender<Option<Arc<SignalResult<P>>>>;

/// Per-request registry of completion signals.
pub struct SectionSignals<P> {
    slots: Mutex<HashMap<SignalKey, Arc<Slot<P>>>>,
}

impl<P> Default for SectionSignals<P>
where
    P: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<P> SectionSignals<P>
where
    P: Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, key: &SignalKey) -> Arc<Slot<P>> {
        let mut slots = self.slots.lock();
        slots
            .entry(key.clone())
            .or_insert_with(|| Arc::new(watch::Sender::new(None)))
            .clone()
    }

    /// Store the producer's result and release every waiter on this key.
    ///
    /// Returns `false` when a result was already stored (first write wins).
    pub fn signal_complete(
        &self,
        section_id: &str,
        contract_hash: &str,
        success: bool,
        payload: Option<P>,
    ) -> bool {
        let key = SignalKey::new(section_id, contract_hash);
        let slot = self.slot(&key);
        let result = Arc::new(SignalResult {
            section_id: key.section_id.clone(),
            contract_hash: key.contract_hash.clone(),
            success,
            payload: if success { payload } else { None },
        });

        let stored = slot.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(result);
            true
        });

        if stored {
            debug!(section_id, contract_hash, success, "Section signal stored");
        } else {
            debug!(section_id, contract_hash, "Duplicate section signal ignored");
        }
        stored
    }

    /// Wait for the producer of `(section_id, contract_hash)`.
    ///
    /// Returns immediately when the result is already stored. A reported
    /// failure is returned as `Ok` with `success == false`; the caller decides
    /// how to degrade.
    pub async fn wait_for(
        &self,
        section_id: &str,
        contract_hash: &str,
        timeout: Duration,
    ) -> Result<Arc<SignalResult<P>>, SignalWaitError> {
        let key = SignalKey::new(section_id, contract_hash);
        let mut receiver = self.slot(&key).subscribe();

        let waited = tokio::time::timeout(timeout, async {
            receiver
                .wait_for(|current| current.is_some())
                .await
                .map(|current| current.clone())
        })
        .await;

        let result = match waited {
            Ok(Ok(Some(result))) => result,
            Ok(Ok(None)) | Ok(Err(_)) => return Err(SignalWaitError::Closed(key.section_id)),
            Err(_) => {
                return Err(SignalWaitError::Timeout {
                    section_id: key.section_id,
                    timeout,
                })
            }
        };

        if result.contract_hash != contract_hash {
            warn!(
                section_id,
                expected = contract_hash,
                found = %result.contract_hash,
                "Signal lineage mismatch"
            );
            return Err(SignalWaitError::LineageMismatch {
                section_id: key.section_id,
                expected: contract_hash.to_string(),
                found: result.contract_hash.clone(),
            });
        }

        Ok(result)
    }

    /// Stored result, if the producer has already signalled.
    pub fn peek(&self, section_id: &str, contract_hash: &str) -> Option<Arc<SignalResult<P>>> {
        let key = SignalKey::new(section_id, contract_hash);
        let slots = self.slots.lock();
        slots.get(&key).and_then(|slot| slot.borrow().clone())
    }

    /// Number of keys touched so far (waited on or signalled).
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
