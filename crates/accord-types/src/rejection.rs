//! The public rejection taxonomy.
//!
//! Every failure the broker surfaces to a caller is one of these kinds; each
//! corresponds to an admission-pipeline step or a lifecycle rule. Internal
//! failures are collapsed into `internal_error` with a correlation
//! identifier.

use serde::{Deserialize, Serialize};

/// Caller-visible failure kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionKind {
    // Authentication
    BadSignature,
    UnknownSender,
    BindingMismatch,
    ExpiredKey,

    // Relationship lifecycle
    UnknownRelationship,
    ClosedRelationship,
    DepthExceeded,
    Expired,
    OutsideWindow,
    AlreadyClosed,
    ParticipantMismatch,
    PredecessorActive,

    // Policy
    PolicyDenies,
    TrustLevelInsufficient,
    ConsentMissing,
    FilterRejected,
    RiskTooLow,

    // Protocol misuse
    WrongDirection,
    NotAdmitted,
    AlreadyFinalized,
    Duplicate,

    // Capacity / time
    Timeout,
    DeliveryTimeout,
    ResponderOverloaded,

    // Read access
    NotFound,
    Unauthorized,

    // Catch-all
    InternalError,
}

impl RejectionKind {
    /// Stable snake_case name, as recorded in event payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionKind::BadSignature => "bad_signature",
            RejectionKind::UnknownSender => "unknown_sender",
            RejectionKind::BindingMismatch => "binding_mismatch",
            RejectionKind::ExpiredKey => "expired_key",
            RejectionKind::UnknownRelationship => "unknown_relationship",
            RejectionKind::ClosedRelationship => "closed_relationship",
            RejectionKind::DepthExceeded => "depth_exceeded",
            RejectionKind::Expired => "expired",
            RejectionKind::OutsideWindow => "outside_window",
            RejectionKind::AlreadyClosed => "already_closed",
            RejectionKind::ParticipantMismatch => "participant_mismatch",
            RejectionKind::PredecessorActive => "predecessor_active",
            RejectionKind::PolicyDenies => "policy_denies",
            RejectionKind::TrustLevelInsufficient => "trust_level_insufficient",
            RejectionKind::ConsentMissing => "consent_missing",
            RejectionKind::FilterRejected => "filter_rejected",
            RejectionKind::RiskTooLow => "risk_too_low",
            RejectionKind::WrongDirection => "wrong_direction",
            RejectionKind::NotAdmitted => "not_admitted",
            RejectionKind::AlreadyFinalized => "already_finalized",
            RejectionKind::Duplicate => "duplicate",
            RejectionKind::Timeout => "timeout",
            RejectionKind::DeliveryTimeout => "delivery_timeout",
            RejectionKind::ResponderOverloaded => "responder_overloaded",
            RejectionKind::NotFound => "not_found",
            RejectionKind::Unauthorized => "unauthorized",
            RejectionKind::InternalError => "internal_error",
        }
    }
}

impl std::fmt::Display for RejectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
