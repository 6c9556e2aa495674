use async_trait::async_trait;
use chrono::{DateTime, Utc};

use accord_chain::{seal_event, ChainKey};
use accord_types::{
    CloseReason, Event, EventHash, EventPayload, Relationship, RelationshipId, RelationshipState,
};

use crate::{StoreError, StoreResult};

/// Which record fields an event append mutates, applied atomically with the
/// append itself. Rejection events leave everything untouched.
#[derive(Clone, Copy, Debug, Default)]
pub struct AppendEffects {
    /// Refresh `last_activity_at` to the event timestamp.
    pub touch_activity: bool,
    /// Increment the depth counter (admitted initiator intents only).
    pub increment_depth: bool,
    /// Recompute `expires_at` (activity-based relationships on admission).
    pub new_expires_at: Option<DateTime<Utc>>,
    pub stat: StatBump,
}

/// Which stats counter the append increments.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StatBump {
    #[default]
    None,
    Admitted,
    Rejected,
    Breach,
    Response,
}

/// Aggregate counts over the whole store.
#[derive(Clone, Copy, Debug, Default)]
pub struct StoreStatistics {
    pub relationships_total: u64,
    pub relationships_active: u64,
    pub relationships_closed: u64,
    pub intents_admitted: u64,
    pub intents_rejected: u64,
    pub breach_attempts: u64,
    pub responses_recorded: u64,
}

/// Persistence contract for relationships and their event chains.
///
/// Concurrency: every mutation of a single relationship is atomic, but
/// multi-step flows (read, check, append, close) must hold that
/// relationship's lock from [`crate::RelationshipLocks`].
#[async_trait]
pub trait RelationshipStore: Send + Sync {
    /// Persist a fully populated record together with its sequence-0
    /// `relationship_established` event.
    ///
    /// Fails with [`StoreError::Duplicate`] when an *active* relationship
    /// for the same `(initiator, responder, continuation_of)` triple exists.
    async fn create(&self, record: Relationship, established: Event) -> StoreResult<()>;

    async fn get(&self, id: &RelationshipId) -> StoreResult<Option<Relationship>>;

    /// Append one event: verifies `expected_head` against the current chain
    /// head (fails with [`StoreError::ChainConflict`] on mismatch), checks
    /// sequence contiguity, writes the event, advances the head, and applies
    /// `effects` - all atomically for this relationship.
    async fn append_event(
        &self,
        id: &RelationshipId,
        expected_head: &EventHash,
        event: Event,
        effects: AppendEffects,
    ) -> StoreResult<()>;

    /// Transition the lifecycle state. Used only by the lifecycle engine.
    async fn update_state(
        &self,
        id: &RelationshipId,
        expected: RelationshipState,
        to: RelationshipState,
        close_reason: Option<CloseReason>,
        closed_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()>;

    /// Events in sequence order, starting at `from_sequence`.
    async fn list_events(&self, id: &RelationshipId, from_sequence: u64)
        -> StoreResult<Vec<Event>>;

    /// Identifiers of all currently active relationships (sweep input).
    async fn list_active(&self) -> StoreResult<Vec<Relationship>>;

    /// Record a breach attempt against a relationship without touching its
    /// chain. Used for messages aimed at closed relationships, whose chains
    /// are sealed by their closing event.
    async fn note_breach(&self, id: &RelationshipId) -> StoreResult<u64>;

    async fn statistics(&self) -> StoreResult<StoreStatistics>;
}

/// Read the chain head, seal `payload` at the next sequence, and append it.
///
/// Retries exactly once on [`StoreError::ChainConflict`] with a refreshed
/// head; further conflicts propagate to the caller.
pub async fn append_sealed(
    store: &dyn RelationshipStore,
    key: &ChainKey,
    id: &RelationshipId,
    timestamp: DateTime<Utc>,
    payload: EventPayload,
    effects: AppendEffects,
) -> StoreResult<Event> {
    for attempt in 0..2 {
        let record = store
            .get(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.0.clone()))?;
        let events = store.list_events(id, 0).await?;
        let sequence = events.len() as u64;

        let event = seal_event(key, sequence, timestamp, record.chain_head, payload.clone())
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        match store
            .append_event(id, &record.chain_head, event.clone(), effects)
            .await
        {
            Ok(()) => return Ok(event),
            Err(StoreError::ChainConflict(_)) if attempt == 0 => continue,
            Err(e) => return Err(e),
        }
    }
    Err(StoreError::ChainConflict(id.0.clone()))
}
