//! Canonical encoding.
//!
//! The byte sequence fed to both signing and the continuity hash is a
//! deterministic serialization: struct fields in declaration order, map keys
//! sorted (every map in the data model is a `BTreeMap`), no insignificant
//! whitespace. Compact JSON over those types satisfies all three.

use serde::Serialize;

/// Serialize a value to its canonical byte encoding.
pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(value)
}
