//! ACCORD Types - shared data model for the intent-coordination broker.
//!
//! Everything the broker components exchange lives here: participant and
//! relationship identifiers, the relationship record itself, intents and
//! responses, the per-relationship event log entries, and the public
//! rejection taxonomy.

#![deny(unsafe_code)]

pub mod canonical;
pub mod event;
pub mod id;
pub mod intent;
pub mod rejection;
pub mod relationship;

pub use canonical::canonical_bytes;
pub use event::{Event, EventHash, EventKind, EventPayload, GENESIS_HASH};
pub use id::{IntentId, IntentKind, ParticipantId, RelationshipId, Signature, SubscriptionId};
pub use intent::{Constraints, Intent, Response, ResponseOutcome, TimeWindow};
pub use rejection::RejectionKind;
pub use relationship::{
    CloseReason, Relationship, RelationshipState, RelationshipStats, TimeboxPolicy, TrustLevel,
};
