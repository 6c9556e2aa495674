//! ACCORD Lifecycle - relationship state transitions.
//!
//! One engine instance manages every relationship's lifecycle: creation
//! (including continuation from a closed predecessor), idempotent close with
//! a sealed summary event, and the periodic sweep that expires idle
//! activity-based relationships. Admission-time enforcement stays the
//! authoritative expiry check; the sweep only converges records that nobody
//! touched in the meantime.

#![deny(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

use accord_chain::ChainKey;
use accord_delivery::{DeliveryHub, ResponseNotice};
use accord_store::{
    append_sealed, AppendEffects, RelationshipLocks, RelationshipStore, StatBump, StoreError,
};
use accord_types::{
    CloseReason, EventHash, EventPayload, ParticipantId, Relationship, RelationshipId,
    RelationshipState, RelationshipStats, ResponseOutcome, TimeboxPolicy, TrustLevel,
    GENESIS_HASH,
};

/// Lifecycle tuning knobs.
#[derive(Clone, Copy, Debug)]
pub struct LifecycleConfig {
    pub default_timebox_hours: u32,
    pub default_max_depth: u32,
    pub sweep_interval_secs: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            default_timebox_hours: 24,
            default_max_depth: 5,
            sweep_interval_secs: 60,
        }
    }
}

/// Verified creation parameters for a new relationship. Signature checking
/// happens before this type is built.
#[derive(Clone, Debug)]
pub struct RelationshipProposal {
    pub initiator: ParticipantId,
    pub responder: ParticipantId,
    pub timebox: Option<TimeboxPolicy>,
    pub max_depth: Option<u32>,
    pub context_snapshot: BTreeMap<String, serde_json::Value>,
}

/// What a close returns: enough for the caller to classify the outcome
/// without replaying the chain.
#[derive(Clone, Debug)]
pub struct CloseSummary {
    pub relationship_id: RelationshipId,
    pub reason: CloseReason,
    pub total_events: u64,
    pub depth: u32,
    pub stats: RelationshipStats,
    pub final_hash: EventHash,
}

/// Lifecycle-related errors.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("relationship not found: {0}")]
    NotFound(String),

    #[error("relationship already closed: {0}")]
    AlreadyClosed(String),

    #[error("predecessor is still active: {0}")]
    PredecessorActive(String),

    #[error("continuation participants do not match the predecessor")]
    ParticipantMismatch,

    #[error("invalid proposal: {0}")]
    InvalidProposal(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The lifecycle engine.
pub struct LifecycleEngine {
    store: Arc<dyn RelationshipStore>,
    locks: Arc<RelationshipLocks>,
    delivery: Arc<DeliveryHub>,
    chain_key: ChainKey,
    config: LifecycleConfig,
}

impl LifecycleEngine {
    pub fn new(
        store: Arc<dyn RelationshipStore>,
        locks: Arc<RelationshipLocks>,
        delivery: Arc<DeliveryHub>,
        chain_key: ChainKey,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            store,
            locks,
            delivery,
            chain_key,
            config,
        }
    }

    /// Create a new relationship from a verified proposal. The sequence-0
    /// `relationship_established` event seals the creation parameters.
    pub async fn establish(
        &self,
        proposal: RelationshipProposal,
        trust_level: TrustLevel,
    ) -> Result<Relationship, LifecycleError> {
        self.create_record(proposal, trust_level, None).await
    }

    /// Create a successor relationship linked back to a closed predecessor
    /// with the same participant pair. Only the predecessor's `open_items`
    /// travel forward.
    pub async fn continue_from(
        &self,
        predecessor_id: &RelationshipId,
        proposal: RelationshipProposal,
        trust_level: TrustLevel,
    ) -> Result<Relationship, LifecycleError> {
        let predecessor = self
            .store
            .get(predecessor_id)
            .await?
            .ok_or_else(|| LifecycleError::NotFound(predecessor_id.0.clone()))?;

        if predecessor.state == RelationshipState::Active {
            return Err(LifecycleError::PredecessorActive(predecessor_id.0.clone()));
        }
        if predecessor.initiator != proposal.initiator
            || predecessor.responder != proposal.responder
        {
            return Err(LifecycleError::ParticipantMismatch);
        }

        let open_items = predecessor.open_items().cloned();
        let mut proposal = proposal;
        if let Some(items) = open_items.clone() {
            proposal
                .context_snapshot
                .insert("open_items".to_string(), items);
        }

        let successor = self
            .create_record(proposal, trust_level, Some(predecessor_id.clone()))
            .await?;

        // Seal the inheritance as the second chain entry.
        let guard = self.locks.acquire(&successor.id).await;
        append_sealed(
            self.store.as_ref(),
            &self.chain_key,
            &successor.id,
            Utc::now(),
            EventPayload::RelationshipContinued {
                predecessor: predecessor_id.clone(),
                open_items,
            },
            AppendEffects::default(),
        )
        .await?;
        drop(guard);

        info!(
            relationship_id = %successor.id,
            predecessor = %predecessor_id,
            "relationship continued"
        );
        self.store
            .get(&successor.id)
            .await?
            .ok_or_else(|| LifecycleError::NotFound(successor.id.0.clone()))
    }

    async fn create_record(
        &self,
        proposal: RelationshipProposal,
        trust_level: TrustLevel,
        continuation_of: Option<RelationshipId>,
    ) -> Result<Relationship, LifecycleError> {
        if proposal.initiator == proposal.responder {
            return Err(LifecycleError::InvalidProposal(
                "initiator and responder must differ".to_string(),
            ));
        }
        let timebox = proposal.timebox.unwrap_or(TimeboxPolicy::ActivityBased {
            idle_hours: self.config.default_timebox_hours,
        });
        if let TimeboxPolicy::AppointmentBased { start, end } = &timebox {
            if start >= end {
                return Err(LifecycleError::InvalidProposal(
                    "appointment start must precede its end".to_string(),
                ));
            }
        }

        let now = Utc::now();
        let id = RelationshipId::generate();
        let max_depth = proposal.max_depth.unwrap_or(self.config.default_max_depth);

        let established = accord_chain::seal_event(
            &self.chain_key,
            0,
            now,
            GENESIS_HASH,
            EventPayload::RelationshipEstablished {
                initiator: proposal.initiator.clone(),
                responder: proposal.responder.clone(),
                trust_level,
                max_depth,
                timebox: timebox.clone(),
                continuation_of: continuation_of.clone(),
                context_snapshot: proposal.context_snapshot.clone(),
            },
        )
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        let record = Relationship {
            id: id.clone(),
            initiator: proposal.initiator,
            responder: proposal.responder,
            trust_level,
            state: RelationshipState::Active,
            close_reason: None,
            depth: 0,
            max_depth,
            timebox: timebox.clone(),
            created_at: now,
            last_activity_at: now,
            expires_at: timebox.expiry_from(now),
            closed_at: None,
            continuation_of,
            context_snapshot: proposal.context_snapshot,
            chain_head: established.hash,
            stats: RelationshipStats::default(),
        };

        self.store.create(record.clone(), established).await?;
        info!(
            relationship_id = %record.id,
            initiator = %record.initiator,
            responder = %record.responder,
            trust_level = %trust_level,
            "relationship established"
        );
        Ok(record)
    }

    /// Close a relationship. Idempotent: closing a closed relationship
    /// returns [`LifecycleError::AlreadyClosed`] and changes nothing.
    pub async fn close(
        &self,
        id: &RelationshipId,
        reason: CloseReason,
    ) -> Result<CloseSummary, LifecycleError> {
        let guard = self.locks.acquire(id).await;
        let result = self.close_locked(id, reason).await;
        drop(guard);
        if result.is_ok() {
            // The record takes no further mutations; free its lock entry.
            self.locks.discard(id).await;
        }
        result
    }

    /// Close while the caller already holds the relationship lock (the
    /// admission pipeline's auto-close path).
    pub async fn close_locked(
        &self,
        id: &RelationshipId,
        reason: CloseReason,
    ) -> Result<CloseSummary, LifecycleError> {
        let record = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| LifecycleError::NotFound(id.0.clone()))?;
        if record.state == RelationshipState::Closed {
            return Err(LifecycleError::AlreadyClosed(id.0.clone()));
        }

        let now = Utc::now();

        // Finalize whatever is still awaiting delivery before sealing the
        // chain; nothing may follow the closing event.
        let canceled = self.delivery.cancel_relationship(id).await;
        for notice in &canceled {
            let outcome = ResponseOutcome::Rejected {
                reason: "relationship_closed".to_string(),
            };
            append_sealed(
                self.store.as_ref(),
                &self.chain_key,
                id,
                now,
                EventPayload::ResponseRecorded {
                    intent_sequence: notice.sequence,
                    outcome: outcome.clone(),
                    data: serde_json::Value::Null,
                },
                AppendEffects {
                    stat: StatBump::Response,
                    ..Default::default()
                },
            )
            .await?;
            self.delivery
                .push_response(
                    &record.initiator,
                    ResponseNotice {
                        relationship_id: id.clone(),
                        intent_sequence: notice.sequence,
                        outcome,
                        data: serde_json::Value::Null,
                    },
                )
                .await;
        }
        if !canceled.is_empty() {
            debug!(
                relationship_id = %id,
                canceled = canceled.len(),
                "pending deliveries finalized at close"
            );
        }

        let refreshed = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| LifecycleError::NotFound(id.0.clone()))?;
        let sequence = self.store.list_events(id, 0).await?.len() as u64;
        let closing = append_sealed(
            self.store.as_ref(),
            &self.chain_key,
            id,
            now,
            EventPayload::RelationshipClosed {
                reason,
                total_events: sequence + 1,
                depth: refreshed.depth,
                stats: refreshed.stats,
                open_items: refreshed.open_items().cloned(),
            },
            AppendEffects::default(),
        )
        .await?;

        self.store
            .update_state(
                id,
                RelationshipState::Active,
                RelationshipState::Closed,
                Some(reason),
                Some(now),
            )
            .await?;

        info!(relationship_id = %id, reason = %reason, "relationship closed");
        Ok(CloseSummary {
            relationship_id: id.clone(),
            reason,
            total_events: closing.sequence + 1,
            depth: refreshed.depth,
            stats: refreshed.stats,
            final_hash: closing.hash,
        })
    }

    /// One sweep pass: close every activity-based relationship whose
    /// expiry lies in the past. Returns how many were closed.
    pub async fn sweep_once(&self) -> Result<u64, LifecycleError> {
        let now = Utc::now();
        let mut closed = 0u64;
        for record in self.store.list_active().await? {
            if record.timebox.is_appointment() {
                continue;
            }
            if record.expires_at < now {
                match self.close(&record.id, CloseReason::Expired).await {
                    Ok(_) => closed += 1,
                    // Someone else closed it between listing and locking.
                    Err(LifecycleError::AlreadyClosed(_)) => {}
                    Err(e) => {
                        warn!(relationship_id = %record.id, error = %e, "sweep close failed");
                    }
                }
            }
        }
        if closed > 0 {
            info!(closed, "expiry sweep closed relationships");
        }
        Ok(closed)
    }

    /// Run the sweep at the configured coarse interval until aborted.
    pub fn spawn_sweep(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(engine.config.sweep_interval_secs));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = engine.sweep_once().await {
                    warn!(error = %e, "expiry sweep failed");
                }
            }
        })
    }

    /// Expiry check used by the admission pipeline: `true` when an
    /// activity-based relationship is past its deadline at `now`.
    pub fn is_expired(record: &Relationship, now: DateTime<Utc>) -> bool {
        !record.timebox.is_appointment() && now > record.expires_at
    }
}
