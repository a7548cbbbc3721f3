// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Contract Lineage
//!
//! Structural content hashes and parent links for every contract object.
//! Pure functions, no state.
//!
//! ## Hashing Recipe
//!
//! ```text
//! structural_fields()      explicitly enumerated per contract type
//!   │  BTreeMap<&str, Value> (key-sorted), parent hash included
//!   ▼
//! serde_json::to_vec       deterministic bytes
//!   ▼
//! SHA-256 → hex → first 16 chars
//! ```
//!
//! Child hash sets (e.g. the `SectionSpec`s a `CompositionContract` covers)
//! are sorted and encoded as a JSON array before hashing, never concatenated.
//! A failed or missing seal is a `ProtocolViolation`: the caller must halt
//! before any external side effect.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use thiserror::Error;

/// Width of every contract, execution and fingerprint hash.
pub const SHORT_HASH_LEN: usize = 16;

pub type StructuralFields = BTreeMap<&'static str, Value>;

/// Implemented by every hash-sealed contract.
pub trait Sealable {
    /// Contract type name used in error messages.
    const KIND: &'static str;

    /// Only the fields that define the contract's meaning. Advisory and
    /// free-text fields must not appear here.
    fn structural_fields(&self) -> StructuralFields;

    fn contract_hash(&self) -> &str;

    fn parent_contract_hash(&self) -> Option<&str>;

    fn set_lineage(&mut self, contract_hash: String, parent_contract_hash: Option<String>);

    /// Nested sealed objects that must verify alongside this one.
    fn verify_nested(&self) -> Result<(), LineageError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LineageError {
    #[error("{kind} is not sealed")]
    MissingHash { kind: &'static str },

    #[error("{kind} hash mismatch: stored {stored}, computed {computed}")]
    HashMismatch {
        kind: &'static str,
        stored: String,
        computed: String,
    },

    #[error("{kind} parent hash mismatch: expected {expected}, found {found:?}")]
    ParentMismatch {
        kind: &'static str,
        expected: String,
        found: Option<String>,
    },
}

/// SHA-256 of `bytes`, hex, truncated to [`SHORT_HASH_LEN`].
pub fn short_hash(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut encoded = hex::encode(digest);
    encoded.truncate(SHORT_HASH_LEN);
    encoded
}

/// Canonical hash over a key-sorted field map.
pub fn hash_fields(fields: &StructuralFields) -> String {
    // BTreeMap of scalars/arrays serializes infallibly and in key order.
    let bytes = serde_json::to_vec(fields).unwrap_or_default();
    short_hash(&bytes)
}

/// Order-independent combination of child hashes.
pub fn combine_hashes<S: AsRef<str>>(hashes: &[S]) -> String {
    let mut sorted: Vec<&str> = hashes.iter().map(|h| h.as_ref()).collect();
    sorted.sort_unstable();
    let encoded = Value::Array(sorted.into_iter().map(|h| Value::String(h.to_string())).collect());
    short_hash(encoded.to_string().as_bytes())
}

fn compute<C: Sealable>(contract: &C, parent_hash: Option<&str>) -> String {
    let mut fields = contract.structural_fields();
    fields.insert(
        "parent_contract_hash",
        parent_hash.map_or(Value::Null, |h| Value::String(h.to_string())),
    );
    hash_fields(&fields)
}

/// Compute and set `contract_hash` (and `parent_contract_hash` when given).
pub fn seal<C: Sealable>(mut contract: C, parent_hash: Option<&str>) -> C {
    let hash = compute(&contract, parent_hash);
    contract.set_lineage(hash, parent_hash.map(str::to_string));
    contract
}

/// Recompute the hash from the current structural fields.
pub fn verify<C: Sealable>(contract: &C) -> bool {
    ensure_verified(contract).is_ok()
}

/// [`verify`] with the reason for failure.
pub fn ensure_verified<C: Sealable>(contract: &C) -> Result<(), LineageError> {
    let stored = contract.contract_hash();
    if stored.is_empty() {
        return Err(LineageError::MissingHash { kind: C::KIND });
    }
    let computed = compute(contract, contract.parent_contract_hash());
    if computed != stored {
        return Err(LineageError::HashMismatch {
            kind: C::KIND,
            stored: stored.to_string(),
            computed,
        });
    }
    contract.verify_nested()
}

/// Check that `child` was sealed under `parent`.
pub fn ensure_child_of<C: Sealable, P: Sealable>(child: &C, parent: &P) -> Result<(), LineageError> {
    if child.parent_contract_hash() != Some(parent.contract_hash()) {
        return Err(LineageError::ParentMismatch {
            kind: C::KIND,
            expected: parent.contract_hash().to_string(),
            found: child.parent_contract_hash().map(str::to_string),
        });
    }
    Ok(())
}

/// Binds a contract hash to one run: replaying the same contract under a
/// different trace yields a different value.
pub fn execution_hash(contract_hash: &str, trace_id: &str) -> String {
    let mut fields = StructuralFields::new();
    fields.insert("contract_hash", Value::String(contract_hash.to_string()));
    fields.insert("trace_id", Value::String(trace_id.to_string()));
    hash_fields(&fields)
}
