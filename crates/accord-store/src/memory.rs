//! In-memory reference implementation of the relationship store.
//!
//! Deterministic and test-friendly. Deployments that need durability put a
//! transactional backend behind [`RelationshipStore`] instead; the contract
//! is identical.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use accord_types::{
    CloseReason, Event, EventHash, Relationship, RelationshipId, RelationshipState,
};

use crate::traits::{AppendEffects, RelationshipStore, StatBump, StoreStatistics};
use crate::{StoreError, StoreResult};

struct StoredRelationship {
    record: Relationship,
    events: Vec<Event>,
}

/// In-memory store adapter.
#[derive(Default)]
pub struct MemoryStore {
    relationships: RwLock<HashMap<RelationshipId, StoredRelationship>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RelationshipStore for MemoryStore {
    async fn create(&self, record: Relationship, established: Event) -> StoreResult<()> {
        let mut guard = self
            .relationships
            .write()
            .map_err(|_| StoreError::Backend("relationships lock poisoned".to_string()))?;

        if guard.contains_key(&record.id) {
            return Err(StoreError::Duplicate(record.id.0.clone()));
        }

        let duplicate = guard.values().any(|stored| {
            stored.record.state == RelationshipState::Active
                && stored.record.initiator == record.initiator
                && stored.record.responder == record.responder
                && stored.record.continuation_of == record.continuation_of
        });
        if duplicate {
            return Err(StoreError::Duplicate(format!(
                "{} -> {}",
                record.initiator, record.responder
            )));
        }

        if established.sequence != 0 {
            return Err(StoreError::InvariantViolation(
                "establishment event must have sequence 0".to_string(),
            ));
        }
        if record.chain_head != established.hash {
            return Err(StoreError::InvariantViolation(
                "record chain head must seal the establishment event".to_string(),
            ));
        }

        guard.insert(
            record.id.clone(),
            StoredRelationship {
                record,
                events: vec![established],
            },
        );
        Ok(())
    }

    async fn get(&self, id: &RelationshipId) -> StoreResult<Option<Relationship>> {
        let guard = self
            .relationships
            .read()
            .map_err(|_| StoreError::Backend("relationships lock poisoned".to_string()))?;
        Ok(guard.get(id).map(|stored| stored.record.clone()))
    }

    async fn append_event(
        &self,
        id: &RelationshipId,
        expected_head: &EventHash,
        event: Event,
        effects: AppendEffects,
    ) -> StoreResult<()> {
        let mut guard = self
            .relationships
            .write()
            .map_err(|_| StoreError::Backend("relationships lock poisoned".to_string()))?;
        let stored = guard
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.0.clone()))?;

        if stored.record.state == RelationshipState::Closed {
            return Err(StoreError::Closed(id.0.clone()));
        }
        if stored.record.chain_head != *expected_head {
            return Err(StoreError::ChainConflict(id.0.clone()));
        }
        if event.previous_hash != stored.record.chain_head {
            return Err(StoreError::ChainConflict(id.0.clone()));
        }
        if event.sequence != stored.events.len() as u64 {
            return Err(StoreError::InvariantViolation(format!(
                "non-contiguous sequence: expected {}, got {}",
                stored.events.len(),
                event.sequence
            )));
        }

        stored.record.chain_head = event.hash;
        if effects.touch_activity {
            stored.record.last_activity_at = event.timestamp;
        }
        if effects.increment_depth {
            stored.record.depth += 1;
        }
        if let Some(expires_at) = effects.new_expires_at {
            stored.record.expires_at = expires_at;
        }
        match effects.stat {
            StatBump::None => {}
            StatBump::Admitted => stored.record.stats.intents_admitted += 1,
            StatBump::Rejected => stored.record.stats.intents_rejected += 1,
            StatBump::Breach => stored.record.stats.breach_attempts += 1,
            StatBump::Response => stored.record.stats.responses_recorded += 1,
        }

        stored.events.push(event);
        Ok(())
    }

    async fn update_state(
        &self,
        id: &RelationshipId,
        expected: RelationshipState,
        to: RelationshipState,
        close_reason: Option<CloseReason>,
        closed_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        let mut guard = self
            .relationships
            .write()
            .map_err(|_| StoreError::Backend("relationships lock poisoned".to_string()))?;
        let stored = guard
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.0.clone()))?;

        if stored.record.state != expected {
            return Err(StoreError::InvariantViolation(format!(
                "state transition expected {:?}, found {:?}",
                expected, stored.record.state
            )));
        }
        if to == RelationshipState::Closed && closed_at.is_none() {
            return Err(StoreError::InvariantViolation(
                "closing requires a closed_at timestamp".to_string(),
            ));
        }

        stored.record.state = to;
        stored.record.close_reason = close_reason;
        stored.record.closed_at = closed_at;
        Ok(())
    }

    async fn list_events(
        &self,
        id: &RelationshipId,
        from_sequence: u64,
    ) -> StoreResult<Vec<Event>> {
        let guard = self
            .relationships
            .read()
            .map_err(|_| StoreError::Backend("relationships lock poisoned".to_string()))?;
        let stored = guard
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.0.clone()))?;
        Ok(stored
            .events
            .iter()
            .filter(|e| e.sequence >= from_sequence)
            .cloned()
            .collect())
    }

    async fn list_active(&self) -> StoreResult<Vec<Relationship>> {
        let guard = self
            .relationships
            .read()
            .map_err(|_| StoreError::Backend("relationships lock poisoned".to_string()))?;
        Ok(guard
            .values()
            .filter(|stored| stored.record.state == RelationshipState::Active)
            .map(|stored| stored.record.clone())
            .collect())
    }

    async fn note_breach(&self, id: &RelationshipId) -> StoreResult<u64> {
        let mut guard = self
            .relationships
            .write()
            .map_err(|_| StoreError::Backend("relationships lock poisoned".to_string()))?;
        let stored = guard
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.0.clone()))?;
        stored.record.stats.breach_attempts += 1;
        Ok(stored.record.stats.breach_attempts)
    }

    async fn statistics(&self) -> StoreResult<StoreStatistics> {
        let guard = self
            .relationships
            .read()
            .map_err(|_| StoreError::Backend("relationships lock poisoned".to_string()))?;

        let mut stats = StoreStatistics {
            relationships_total: guard.len() as u64,
            ..Default::default()
        };
        for stored in guard.values() {
            match stored.record.state {
                RelationshipState::Active => stats.relationships_active += 1,
                RelationshipState::Closed => stats.relationships_closed += 1,
            }
            stats.intents_admitted += stored.record.stats.intents_admitted;
            stats.intents_rejected += stored.record.stats.intents_rejected;
            stats.breach_attempts += stored.record.stats.breach_attempts;
            stats.responses_recorded += stored.record.stats.responses_recorded;
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::append_sealed;
    use accord_chain::{seal_event, ChainKey};
    use accord_types::{
        EventPayload, IntentKind, ParticipantId, RejectionKind, RelationshipStats, TimeboxPolicy,
        TrustLevel, GENESIS_HASH,
    };
    use chrono::Duration;
    use std::collections::BTreeMap;

    fn test_key() -> ChainKey {
        ChainKey::derive(b"store-test-key")
    }

    fn new_relationship(key: &ChainKey, id: &str) -> (Relationship, Event) {
        let now = Utc::now();
        let initiator = ParticipantId::new(format!("{id}-initiator"));
        let responder = ParticipantId::new(format!("{id}-responder"));
        let timebox = TimeboxPolicy::ActivityBased { idle_hours: 24 };
        let snapshot = BTreeMap::new();

        let established = seal_event(
            key,
            0,
            now,
            GENESIS_HASH,
            EventPayload::RelationshipEstablished {
                initiator: initiator.clone(),
                responder: responder.clone(),
                trust_level: TrustLevel::new(1),
                max_depth: 5,
                timebox: timebox.clone(),
                continuation_of: None,
                context_snapshot: snapshot.clone(),
            },
        )
        .unwrap();

        let record = Relationship {
            id: RelationshipId::new(id),
            initiator,
            responder,
            trust_level: TrustLevel::new(1),
            state: RelationshipState::Active,
            close_reason: None,
            depth: 0,
            max_depth: 5,
            timebox: timebox.clone(),
            created_at: now,
            last_activity_at: now,
            expires_at: timebox.expiry_from(now),
            closed_at: None,
            continuation_of: None,
            context_snapshot: snapshot,
            chain_head: established.hash,
            stats: RelationshipStats::default(),
        };
        (record, established)
    }

    fn rejection_payload() -> EventPayload {
        EventPayload::IntentRejected {
            kind: Some(IntentKind::new("greet")),
            reason: RejectionKind::WrongDirection,
            detail: "responder on the intent channel".to_string(),
            signals: vec![],
        }
    }

    #[tokio::test]
    async fn create_then_get_roundtrip() {
        let key = test_key();
        let store = MemoryStore::new();
        let (record, established) = new_relationship(&key, "r1");
        let id = record.id.clone();

        store.create(record, established).await.unwrap();

        let fetched = store.get(&id).await.unwrap().unwrap();
        assert_eq!(fetched.id, id);
        assert_eq!(fetched.depth, 0);
        assert_eq!(store.list_events(&id, 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_active_pair_is_rejected() {
        let key = test_key();
        let store = MemoryStore::new();
        let (record, established) = new_relationship(&key, "r1");
        store.create(record, established).await.unwrap();

        // Same pair, fresh id.
        let (mut record2, _) = new_relationship(&key, "r2");
        record2.initiator = ParticipantId::new("r1-initiator");
        record2.responder = ParticipantId::new("r1-responder");
        let established2 = seal_event(
            &key,
            0,
            Utc::now(),
            GENESIS_HASH,
            EventPayload::RelationshipEstablished {
                initiator: record2.initiator.clone(),
                responder: record2.responder.clone(),
                trust_level: record2.trust_level,
                max_depth: record2.max_depth,
                timebox: record2.timebox.clone(),
                continuation_of: None,
                context_snapshot: BTreeMap::new(),
            },
        )
        .unwrap();
        record2.chain_head = established2.hash;

        let result = store.create(record2, established2).await;
        assert!(matches!(result, Err(StoreError::Duplicate(_))));
    }

    #[tokio::test]
    async fn append_with_stale_head_conflicts() {
        let key = test_key();
        let store = MemoryStore::new();
        let (record, established) = new_relationship(&key, "r1");
        let id = record.id.clone();
        let genesis_head = established.hash;
        store.create(record, established).await.unwrap();

        // First append moves the head.
        append_sealed(
            &store,
            &key,
            &id,
            Utc::now(),
            rejection_payload(),
            AppendEffects {
                stat: StatBump::Rejected,
                ..Default::default()
            },
        )
        .await
        .unwrap();

        // A raw append using the stale head must conflict.
        let stale = seal_event(&key, 2, Utc::now(), genesis_head, rejection_payload()).unwrap();
        let result = store
            .append_event(&id, &genesis_head, stale, AppendEffects::default())
            .await;
        assert!(matches!(result, Err(StoreError::ChainConflict(_))));
    }

    #[tokio::test]
    async fn append_sealed_applies_effects() {
        let key = test_key();
        let store = MemoryStore::new();
        let (record, established) = new_relationship(&key, "r1");
        let id = record.id.clone();
        store.create(record, established).await.unwrap();

        let now = Utc::now();
        let expires = now + Duration::hours(24);
        append_sealed(
            &store,
            &key,
            &id,
            now,
            EventPayload::IntentAdmitted {
                intent_id: accord_types::IntentId::generate(),
                kind: IntentKind::new("greet"),
                sender: ParticipantId::new("r1-initiator"),
                digest: "00".to_string(),
                risk_score: 1.0,
                policy_version: 1,
                within_grace: false,
                legal_hold: false,
            },
            AppendEffects {
                touch_activity: true,
                increment_depth: true,
                new_expires_at: Some(expires),
                stat: StatBump::Admitted,
            },
        )
        .await
        .unwrap();

        let record = store.get(&id).await.unwrap().unwrap();
        assert_eq!(record.depth, 1);
        assert_eq!(record.stats.intents_admitted, 1);
        assert_eq!(record.last_activity_at, now);
        assert_eq!(record.expires_at, expires);
    }

    #[tokio::test]
    async fn closed_relationship_refuses_appends() {
        let key = test_key();
        let store = MemoryStore::new();
        let (record, established) = new_relationship(&key, "r1");
        let id = record.id.clone();
        store.create(record, established).await.unwrap();

        store
            .update_state(
                &id,
                RelationshipState::Active,
                RelationshipState::Closed,
                Some(CloseReason::UserRequested),
                Some(Utc::now()),
            )
            .await
            .unwrap();

        let result = append_sealed(
            &store,
            &key,
            &id,
            Utc::now(),
            rejection_payload(),
            AppendEffects::default(),
        )
        .await;
        assert!(matches!(result, Err(StoreError::Closed(_))));
    }

    #[tokio::test]
    async fn closing_without_timestamp_is_invalid() {
        let key = test_key();
        let store = MemoryStore::new();
        let (record, established) = new_relationship(&key, "r1");
        let id = record.id.clone();
        store.create(record, established).await.unwrap();

        let result = store
            .update_state(
                &id,
                RelationshipState::Active,
                RelationshipState::Closed,
                Some(CloseReason::Completed),
                None,
            )
            .await;
        assert!(matches!(result, Err(StoreError::InvariantViolation(_))));
    }

    #[tokio::test]
    async fn list_events_from_sequence() {
        let key = test_key();
        let store = MemoryStore::new();
        let (record, established) = new_relationship(&key, "r1");
        let id = record.id.clone();
        store.create(record, established).await.unwrap();

        for _ in 0..3 {
            append_sealed(
                &store,
                &key,
                &id,
                Utc::now(),
                rejection_payload(),
                AppendEffects {
                    stat: StatBump::Rejected,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        }

        let tail = store.list_events(&id, 2).await.unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].sequence, 2);
        assert_eq!(tail[1].sequence, 3);
    }

    #[tokio::test]
    async fn statistics_aggregate_counters() {
        let key = test_key();
        let store = MemoryStore::new();
        let (record, established) = new_relationship(&key, "r1");
        let id = record.id.clone();
        store.create(record, established).await.unwrap();

        append_sealed(
            &store,
            &key,
            &id,
            Utc::now(),
            rejection_payload(),
            AppendEffects {
                stat: StatBump::Rejected,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        store.note_breach(&id).await.unwrap();

        let stats = store.statistics().await.unwrap();
        assert_eq!(stats.relationships_total, 1);
        assert_eq!(stats.relationships_active, 1);
        assert_eq!(stats.intents_rejected, 1);
        assert_eq!(stats.breach_attempts, 1);
    }
}
