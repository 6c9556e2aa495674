//! ACCORD Chain - keyed continuity hashing for per-relationship event logs.
//!
//! Every relationship owns its own chain. The continuity hash of an event is
//! a keyed BLAKE3 over `previous_hash || sequence || kind || canonical(payload)`
//! with a per-broker secret key, so external verifiers holding the key can
//! audit a chain by replaying events; any insertion, deletion, or reordering
//! breaks verification at the point of tampering.

#![deny(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use accord_types::{canonical_bytes, Event, EventHash, EventKind, EventPayload, GENESIS_HASH};

/// Domain-separation prefix mixed into every continuity hash.
const DOMAIN_PREFIX: &[u8] = b"accord-event-v1:";

/// Per-broker chain-hashing secret. Process-wide, read-only after startup.
#[derive(Clone)]
pub struct ChainKey([u8; 32]);

impl ChainKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Derive a key from an arbitrary-length secret.
    pub fn derive(secret: &[u8]) -> Self {
        Self(*blake3::hash(secret).as_bytes())
    }
}

impl std::fmt::Debug for ChainKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        write!(f, "ChainKey(..)")
    }
}

/// Chain-related errors.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("payload serialization failed: {0}")]
    Serialization(String),
}

/// Compute the continuity hash for an event position.
pub fn continuity_hash(
    key: &ChainKey,
    previous: &EventHash,
    sequence: u64,
    kind: EventKind,
    payload: &EventPayload,
) -> Result<EventHash, ChainError> {
    let payload_bytes =
        canonical_bytes(payload).map_err(|e| ChainError::Serialization(e.to_string()))?;

    let mut hasher = blake3::Hasher::new_keyed(&key.0);
    hasher.update(DOMAIN_PREFIX);
    hasher.update(&previous.0);
    hasher.update(&sequence.to_le_bytes());
    hasher.update(&[kind.ordinal()]);
    hasher.update(&payload_bytes);

    Ok(EventHash::from_bytes(*hasher.finalize().as_bytes()))
}

/// Seal a payload into a chain position, producing the finished event.
pub fn seal_event(
    key: &ChainKey,
    sequence: u64,
    timestamp: DateTime<Utc>,
    previous: EventHash,
    payload: EventPayload,
) -> Result<Event, ChainError> {
    let kind = payload.kind();
    let hash = continuity_hash(key, &previous, sequence, kind, &payload)?;
    Ok(Event {
        sequence,
        kind,
        timestamp,
        payload,
        previous_hash: previous,
        hash,
    })
}

/// Hex digest of a message's canonical encoding (unkeyed). Used to bind an
/// admitted-intent event to the exact intent bytes without storing them.
pub fn content_digest<T: Serialize>(value: &T) -> Result<String, ChainError> {
    let bytes = canonical_bytes(value).map_err(|e| ChainError::Serialization(e.to_string()))?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

/// Result of replaying a full chain.
#[derive(Clone, Debug)]
pub struct ChainReport {
    pub valid: bool,
    pub total_events: u64,
    pub verified_events: u64,
    /// Sequence of the first event that failed verification.
    pub first_invalid_sequence: Option<u64>,
    pub detail: Option<String>,
}

impl ChainReport {
    fn clean(total: u64) -> Self {
        Self {
            valid: true,
            total_events: total,
            verified_events: total,
            first_invalid_sequence: None,
            detail: None,
        }
    }

    fn broken(total: u64, verified: u64, sequence: u64, detail: String) -> Self {
        Self {
            valid: false,
            total_events: total,
            verified_events: verified,
            first_invalid_sequence: Some(sequence),
            detail: Some(detail),
        }
    }
}

/// Replay a chain and recompute every hash.
///
/// Checks, in order per event: dense sequence numbering, linkage to the
/// previous event's hash (genesis for the first), and the keyed continuity
/// hash itself.
pub fn verify_chain(key: &ChainKey, events: &[Event]) -> Result<ChainReport, ChainError> {
    let total = events.len() as u64;
    if events.is_empty() {
        return Ok(ChainReport::clean(0));
    }

    let mut expected_previous = GENESIS_HASH;
    for (index, event) in events.iter().enumerate() {
        let expected_sequence = index as u64;
        if event.sequence != expected_sequence {
            return Ok(ChainReport::broken(
                total,
                expected_sequence,
                expected_sequence,
                format!(
                    "sequence gap: expected {expected_sequence}, found {}",
                    event.sequence
                ),
            ));
        }
        if event.previous_hash != expected_previous {
            return Ok(ChainReport::broken(
                total,
                expected_sequence,
                expected_sequence,
                format!("broken link at sequence {}", event.sequence),
            ));
        }
        let recomputed =
            continuity_hash(key, &event.previous_hash, event.sequence, event.kind, &event.payload)?;
        if recomputed != event.hash {
            return Ok(ChainReport::broken(
                total,
                expected_sequence,
                event.sequence,
                format!("hash mismatch at sequence {}", event.sequence),
            ));
        }
        expected_previous = event.hash;
    }

    Ok(ChainReport::clean(total))
}
