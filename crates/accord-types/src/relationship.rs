//! The relationship record - the central long-lived object of the broker.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::event::EventHash;
use crate::id::{IntentKind, ParticipantId, RelationshipId};

/// Trust level assigned at relationship creation, 0 (none) to 5 (full).
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct TrustLevel(pub u8);

impl TrustLevel {
    pub const MIN: TrustLevel = TrustLevel(0);
    pub const MAX: TrustLevel = TrustLevel(5);

    /// Build a trust level, clamping to the 0-5 range.
    pub fn new(level: u8) -> Self {
        Self(level.min(Self::MAX.0))
    }
}

impl std::fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a relationship.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipState {
    Active,
    Closed,
}

/// Why a relationship was closed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Activity-based timebox ran out.
    Expired,
    /// Depth counter reached its maximum.
    MaxDepthReached,
    /// Accumulated safety violations.
    Breach,
    /// Explicit close requested by a participant.
    UserRequested,
    /// Conversation reached its natural end.
    Completed,
    /// Closed with open items remaining (candidate for continuation).
    Incomplete,
    /// Closed because of an unrecoverable error.
    Error,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CloseReason::Expired => "expired",
            CloseReason::MaxDepthReached => "max_depth_reached",
            CloseReason::Breach => "breach",
            CloseReason::UserRequested => "user_requested",
            CloseReason::Completed => "completed",
            CloseReason::Incomplete => "incomplete",
            CloseReason::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// How a relationship is time-bounded. Exactly one mode is chosen at
/// creation and never changes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TimeboxPolicy {
    /// Expires after `idle_hours` without admitted activity.
    ActivityBased { idle_hours: u32 },
    /// Fixed appointment window; intents are only admissible inside it.
    AppointmentBased {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

impl TimeboxPolicy {
    pub fn is_appointment(&self) -> bool {
        matches!(self, TimeboxPolicy::AppointmentBased { .. })
    }

    /// Expiry deadline implied by this policy at `reference` time.
    pub fn expiry_from(&self, reference: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            TimeboxPolicy::ActivityBased { idle_hours } => {
                reference + Duration::hours(i64::from(*idle_hours))
            }
            TimeboxPolicy::AppointmentBased { end, .. } => *end,
        }
    }
}

/// Running counters kept on the relationship record. `depth` (on the record
/// itself) stays the authoritative admitted-intent count; these feed the
/// risk score and the close summary.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipStats {
    pub intents_admitted: u64,
    pub intents_rejected: u64,
    pub responses_recorded: u64,
    pub breach_attempts: u64,
}

/// Persistent, directional trust record between two participants.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Relationship {
    pub id: RelationshipId,
    pub initiator: ParticipantId,
    pub responder: ParticipantId,
    pub trust_level: TrustLevel,
    pub state: RelationshipState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub close_reason: Option<CloseReason>,
    /// Admitted initiator-sent intents since creation.
    pub depth: u32,
    pub max_depth: u32,
    pub timebox: TimeboxPolicy,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continuation_of: Option<RelationshipId>,
    /// Immutable key-value context supplied at creation.
    pub context_snapshot: BTreeMap<String, serde_json::Value>,
    /// Continuity hash of the most recent event.
    pub chain_head: EventHash,
    pub stats: RelationshipStats,
}

impl Relationship {
    pub fn is_active(&self) -> bool {
        self.state == RelationshipState::Active
    }

    /// Whether the snapshot carries a positive consent entry for the given
    /// intent kind (`consent:<kind>` = `"granted"`).
    pub fn consent_granted(&self, kind: &IntentKind) -> bool {
        self.context_snapshot
            .get(&format!("consent:{kind}"))
            .and_then(|v| v.as_str())
            .map(|v| v == "granted")
            .unwrap_or(false)
    }

    /// The `open_items` list from the context snapshot, if any. Carried
    /// forward to a successor relationship on continuation.
    pub fn open_items(&self) -> Option<&serde_json::Value> {
        self.context_snapshot.get("open_items")
    }
}
