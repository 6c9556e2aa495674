//! Events - the append-only record of everything that happens on a
//! relationship.
//!
//! Events are immutable once sealed. Each carries the continuity hash of its
//! predecessor and its own keyed hash, so any insertion, deletion, or
//! reordering breaks the chain at the point of tampering.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{IntentId, IntentKind, ParticipantId, RelationshipId};
use crate::intent::ResponseOutcome;
use crate::rejection::RejectionKind;
use crate::relationship::{CloseReason, RelationshipStats, TimeboxPolicy, TrustLevel};

/// Continuity hash of an event (keyed BLAKE3, 32 bytes).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventHash(pub [u8; 32]);

/// Previous-hash value of the first event on every chain.
pub const GENESIS_HASH: EventHash = EventHash([0u8; 32]);

impl EventHash {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(64);
        for b in &self.0 {
            out.push_str(&format!("{b:02x}"));
        }
        out
    }
}

impl std::fmt::Debug for EventHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EventHash({self})")
    }
}

impl std::fmt::Display for EventHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in &self.0[..8] {
            write!(f, "{b:02x}")?;
        }
        write!(f, "...")
    }
}

/// Classification of an event, mirrored from its payload variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RelationshipEstablished,
    RelationshipContinued,
    IntentAdmitted,
    IntentRejected,
    BreachAttempt,
    ResponseRecorded,
    RelationshipClosed,
}

impl EventKind {
    /// Stable ordinal fed into the continuity hash.
    pub fn ordinal(&self) -> u8 {
        match self {
            EventKind::RelationshipEstablished => 0,
            EventKind::RelationshipContinued => 1,
            EventKind::IntentAdmitted => 2,
            EventKind::IntentRejected => 3,
            EventKind::BreachAttempt => 4,
            EventKind::ResponseRecorded => 5,
            EventKind::RelationshipClosed => 6,
        }
    }
}

/// Event payloads, one variant per event kind.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum EventPayload {
    /// Seals the creation parameters. Always the first event on a chain.
    RelationshipEstablished {
        initiator: ParticipantId,
        responder: ParticipantId,
        trust_level: TrustLevel,
        max_depth: u32,
        timebox: TimeboxPolicy,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        continuation_of: Option<RelationshipId>,
        context_snapshot: std::collections::BTreeMap<String, serde_json::Value>,
    },
    /// Seals the inheritance from a closed predecessor. When present, always
    /// the second event of a successor chain.
    RelationshipContinued {
        predecessor: RelationshipId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        open_items: Option<serde_json::Value>,
    },
    IntentAdmitted {
        intent_id: IntentId,
        kind: IntentKind,
        sender: ParticipantId,
        /// Hex digest of the canonical intent encoding.
        digest: String,
        risk_score: f64,
        policy_version: u32,
        /// Admitted inside an appointment grace window at lowered trust.
        within_grace: bool,
        /// Marked for retention under the policy's legal-hold flag.
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        legal_hold: bool,
    },
    IntentRejected {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kind: Option<IntentKind>,
        reason: RejectionKind,
        detail: String,
        /// Risk signals that fired, for `risk_too_low` rejections.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        signals: Vec<String>,
    },
    /// A rejection that is a misuse signal rather than a benign error
    /// (strict-window violation, forbidden content, parameter cap breach).
    BreachAttempt {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kind: Option<IntentKind>,
        reason: RejectionKind,
        detail: String,
    },
    ResponseRecorded {
        intent_sequence: u64,
        outcome: ResponseOutcome,
        #[serde(default)]
        data: serde_json::Value,
    },
    /// Always the last event on a chain; nothing may be appended after it.
    RelationshipClosed {
        reason: CloseReason,
        total_events: u64,
        depth: u32,
        stats: RelationshipStats,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        open_items: Option<serde_json::Value>,
    },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::RelationshipEstablished { .. } => EventKind::RelationshipEstablished,
            EventPayload::RelationshipContinued { .. } => EventKind::RelationshipContinued,
            EventPayload::IntentAdmitted { .. } => EventKind::IntentAdmitted,
            EventPayload::IntentRejected { .. } => EventKind::IntentRejected,
            EventPayload::BreachAttempt { .. } => EventKind::BreachAttempt,
            EventPayload::ResponseRecorded { .. } => EventKind::ResponseRecorded,
            EventPayload::RelationshipClosed { .. } => EventKind::RelationshipClosed,
        }
    }
}

/// A sealed entry on a relationship's event chain.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    /// Dense sequence number starting at 0.
    pub sequence: u64,
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
    pub previous_hash: EventHash,
    pub hash: EventHash,
}
