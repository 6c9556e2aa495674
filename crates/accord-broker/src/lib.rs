//! ACCORD Broker - the unified intent-coordination service.
//!
//! The broker mediates authenticated, time-bounded, context-carrying intents
//! between an initiator and a responder over a long-lived trust
//! relationship. Every inbound message passes signature verification, then
//! the admission pipeline; everything that happens is sealed into the
//! relationship's tamper-evident event chain.
//!
//! This crate is the wiring layer: it owns one instance of each component
//! and exposes the request/reply verbs (`establish`, `send_intent`,
//! `respond`, `close`, `continue_from`, reads) plus the subscription
//! streams. Transport framing is the embedding application's concern.

#![deny(unsafe_code)]

mod config;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use accord_admission::{AdmissionPipeline, AdmissionVerdict, ResponseVerdict};
use accord_chain::{verify_chain, ChainKey, ChainReport};
use accord_delivery::{DeliveryHub, SubscriberHandle};
use accord_identity::{SignatureVerifier, VerifyOutcome};
use accord_lifecycle::{
    CloseSummary, LifecycleEngine, LifecycleError, RelationshipProposal,
};
use accord_policy::{PolicyLookup, PolicyRegistry};
use accord_store::{MemoryStore, RelationshipLocks, RelationshipStore};
use accord_types::{
    canonical_bytes, CloseReason, Event, Intent, IntentKind, ParticipantId, RejectionKind,
    Relationship, RelationshipId, Response, Signature, TimeboxPolicy, TrustLevel,
};

pub use accord_admission::AdmissionConfig;
pub use accord_delivery::{AckFrame, DeliveryFrame, IntentNotice, ResponseNotice};
pub use config::BrokerConfig;

/// A signed proposal to create a new relationship.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EstablishRequest {
    pub initiator: ParticipantId,
    pub responder: ParticipantId,
    /// Human-identifier binding asserted by the initiator, verified by the
    /// identity layer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub human_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timebox: Option<TimeboxPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_depth: Option<u32>,
    #[serde(default)]
    pub context_snapshot: BTreeMap<String, serde_json::Value>,
    #[serde(skip)]
    pub signature: Signature,
}

/// Successful establishment.
#[derive(Clone, Debug)]
pub struct Established {
    pub relationship_id: RelationshipId,
    pub trust_level: TrustLevel,
}

/// Successful intent admission.
#[derive(Clone, Debug)]
pub struct IntentReceipt {
    pub sequence: u64,
    pub risk_score: f64,
    pub within_grace: bool,
}

/// Successful response recording.
#[derive(Clone, Debug)]
pub struct ResponseReceipt {
    pub sequence: u64,
}

/// A breach attempt raised out-of-band for oversight subscribers.
#[derive(Clone, Debug)]
pub struct OversightNotice {
    pub relationship_id: RelationshipId,
    pub intent_kind: Option<IntentKind>,
    pub reason: RejectionKind,
    pub detail: String,
    pub at: DateTime<Utc>,
}

/// Aggregate broker counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct BrokerStatistics {
    pub relationships_total: u64,
    pub relationships_active: u64,
    pub relationships_closed: u64,
    pub intents_admitted: u64,
    pub intents_rejected: u64,
    pub breach_attempts: u64,
    pub responses_recorded: u64,
    pub responder_sessions: u64,
    pub initiator_sessions: u64,
    pub pending_intents: u64,
    pub pending_responses: u64,
}

/// Public broker errors: a typed denial, or `internal_error` with a
/// correlation identifier for operator lookup.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("{kind}: {detail}")]
    Denied {
        kind: RejectionKind,
        /// Sequence of the rejection event, when one was written.
        sequence: Option<u64>,
        detail: String,
    },

    #[error("internal error (correlation {correlation_id})")]
    Internal { correlation_id: uuid::Uuid },
}

impl BrokerError {
    fn denied(kind: RejectionKind, detail: impl Into<String>) -> Self {
        BrokerError::Denied {
            kind,
            sequence: None,
            detail: detail.into(),
        }
    }

    fn internal(source: impl std::fmt::Display) -> Self {
        let correlation_id = uuid::Uuid::new_v4();
        error!(correlation_id = %correlation_id, error = %source, "internal broker error");
        BrokerError::Internal { correlation_id }
    }

    /// The public failure kind.
    pub fn kind(&self) -> RejectionKind {
        match self {
            BrokerError::Denied { kind, .. } => *kind,
            BrokerError::Internal { .. } => RejectionKind::InternalError,
        }
    }
}

fn map_lifecycle(e: LifecycleError) -> BrokerError {
    match e {
        LifecycleError::NotFound(id) => {
            BrokerError::denied(RejectionKind::UnknownRelationship, format!("no relationship {id}"))
        }
        LifecycleError::AlreadyClosed(id) => {
            BrokerError::denied(RejectionKind::AlreadyClosed, format!("{id} is already closed"))
        }
        LifecycleError::PredecessorActive(id) => BrokerError::denied(
            RejectionKind::PredecessorActive,
            format!("{id} is still active"),
        ),
        LifecycleError::ParticipantMismatch => BrokerError::denied(
            RejectionKind::ParticipantMismatch,
            "participants do not match the predecessor",
        ),
        LifecycleError::InvalidProposal(detail) => {
            BrokerError::denied(RejectionKind::PolicyDenies, detail)
        }
        LifecycleError::Store(accord_store::StoreError::Duplicate(detail)) => {
            BrokerError::denied(RejectionKind::Duplicate, detail)
        }
        LifecycleError::Store(e) => BrokerError::internal(e),
    }
}

/// The broker.
pub struct Broker {
    store: Arc<dyn RelationshipStore>,
    policy: Arc<PolicyRegistry>,
    verifier: Arc<dyn SignatureVerifier>,
    delivery: Arc<DeliveryHub>,
    lifecycle: Arc<LifecycleEngine>,
    admission: AdmissionPipeline,
    chain_key: ChainKey,
    oversight: broadcast::Sender<OversightNotice>,
    sweep: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Broker {
    /// Build a broker over the in-memory reference store.
    pub fn new(
        chain_key: ChainKey,
        policy: PolicyRegistry,
        verifier: Arc<dyn SignatureVerifier>,
        config: BrokerConfig,
    ) -> Self {
        Self::with_store(Arc::new(MemoryStore::new()), chain_key, policy, verifier, config)
    }

    /// Build a broker over an explicit storage backend.
    pub fn with_store(
        store: Arc<dyn RelationshipStore>,
        chain_key: ChainKey,
        policy: PolicyRegistry,
        verifier: Arc<dyn SignatureVerifier>,
        config: BrokerConfig,
    ) -> Self {
        let locks = Arc::new(RelationshipLocks::new());
        let policy = Arc::new(policy);
        let delivery = Arc::new(DeliveryHub::new(
            store.clone(),
            locks.clone(),
            chain_key.clone(),
            config.delivery(),
        ));
        let lifecycle = Arc::new(LifecycleEngine::new(
            store.clone(),
            locks.clone(),
            delivery.clone(),
            chain_key.clone(),
            config.lifecycle(),
        ));
        let admission = AdmissionPipeline::new(
            store.clone(),
            locks,
            policy.clone(),
            lifecycle.clone(),
            delivery.clone(),
            chain_key.clone(),
            config.admission(),
        );
        let (oversight, _) = broadcast::channel(64);
        let sweep = lifecycle.spawn_sweep();

        info!("broker initialized");
        Self {
            store,
            policy,
            verifier,
            delivery,
            lifecycle,
            admission,
            chain_key,
            oversight,
            sweep: std::sync::Mutex::new(Some(sweep)),
        }
    }

    async fn verify_signature<T: Serialize>(
        &self,
        sender: &ParticipantId,
        human_id: Option<&str>,
        message: &T,
        signature: &Signature,
    ) -> Result<(), BrokerError> {
        let bytes = canonical_bytes(message).map_err(BrokerError::internal)?;
        match self.verifier.verify(sender, human_id, &bytes, signature).await {
            VerifyOutcome::Valid => Ok(()),
            VerifyOutcome::UnknownSender => Err(BrokerError::denied(
                RejectionKind::UnknownSender,
                format!("unknown sender {sender}"),
            )),
            VerifyOutcome::BadSignature => Err(BrokerError::denied(
                RejectionKind::BadSignature,
                "signature does not cover the canonical message",
            )),
            VerifyOutcome::BindingMismatch => Err(BrokerError::denied(
                RejectionKind::BindingMismatch,
                "declared human binding does not match the registry",
            )),
            VerifyOutcome::ExpiredKey => Err(BrokerError::denied(
                RejectionKind::ExpiredKey,
                format!("verification key for {sender} has expired"),
            )),
        }
    }

    /// Create a new relationship from a signed proposal. The trust level
    /// comes from the admission policy for the pair.
    pub async fn establish(&self, request: EstablishRequest) -> Result<Established, BrokerError> {
        self.verify_signature(
            &request.initiator,
            request.human_id.as_deref(),
            &request,
            &request.signature,
        )
        .await?;

        let trust_level = self
            .policy
            .assign_trust(&request.initiator, &request.responder)
            .ok_or_else(|| {
                BrokerError::denied(
                    RejectionKind::PolicyDenies,
                    format!(
                        "policy denies a relationship between {} and {}",
                        request.initiator, request.responder
                    ),
                )
            })?;

        let record = self
            .lifecycle
            .establish(
                RelationshipProposal {
                    initiator: request.initiator,
                    responder: request.responder,
                    timebox: request.timebox,
                    max_depth: request.max_depth,
                    context_snapshot: request.context_snapshot,
                },
                trust_level,
            )
            .await
            .map_err(map_lifecycle)?;

        Ok(Established {
            relationship_id: record.id,
            trust_level,
        })
    }

    /// Submit an intent on an existing relationship.
    pub async fn send_intent(&self, intent: Intent) -> Result<IntentReceipt, BrokerError> {
        self.verify_signature(&intent.sender, None, &intent, &intent.signature)
            .await?;

        let relationship_id = intent.relationship_id.clone();
        let intent_kind = intent.kind.clone();
        let verdict = self
            .admission
            .admit(intent)
            .await
            .map_err(BrokerError::internal)?;

        match verdict {
            AdmissionVerdict::Admitted {
                sequence,
                risk_score,
                within_grace,
            } => Ok(IntentReceipt {
                sequence,
                risk_score,
                within_grace,
            }),
            AdmissionVerdict::Rejected {
                kind,
                sequence,
                detail,
                breach,
            } => {
                if breach {
                    self.raise_oversight(&relationship_id, Some(intent_kind), kind, &detail)
                        .await;
                }
                Err(BrokerError::Denied {
                    kind,
                    sequence,
                    detail,
                })
            }
        }
    }

    /// Record a responder's reply to an admitted intent.
    pub async fn respond(&self, response: Response) -> Result<ResponseReceipt, BrokerError> {
        self.verify_signature(&response.sender, None, &response, &response.signature)
            .await?;

        let verdict = self
            .admission
            .respond(response)
            .await
            .map_err(BrokerError::internal)?;
        match verdict {
            ResponseVerdict::Recorded { sequence } => Ok(ResponseReceipt { sequence }),
            ResponseVerdict::Rejected {
                kind,
                sequence,
                detail,
            } => Err(BrokerError::Denied {
                kind,
                sequence,
                detail,
            }),
        }
    }

    /// Explicitly close a relationship.
    pub async fn close(
        &self,
        id: &RelationshipId,
        reason: CloseReason,
    ) -> Result<CloseSummary, BrokerError> {
        self.lifecycle.close(id, reason).await.map_err(map_lifecycle)
    }

    /// Create a successor relationship linked back to a closed predecessor.
    pub async fn continue_from(
        &self,
        predecessor: &RelationshipId,
        request: EstablishRequest,
    ) -> Result<Established, BrokerError> {
        self.verify_signature(
            &request.initiator,
            request.human_id.as_deref(),
            &request,
            &request.signature,
        )
        .await?;

        let trust_level = self
            .policy
            .assign_trust(&request.initiator, &request.responder)
            .ok_or_else(|| {
                BrokerError::denied(
                    RejectionKind::PolicyDenies,
                    format!(
                        "policy denies a relationship between {} and {}",
                        request.initiator, request.responder
                    ),
                )
            })?;

        let record = self
            .lifecycle
            .continue_from(
                predecessor,
                RelationshipProposal {
                    initiator: request.initiator,
                    responder: request.responder,
                    timebox: request.timebox,
                    max_depth: request.max_depth,
                    context_snapshot: request.context_snapshot,
                },
                trust_level,
            )
            .await
            .map_err(map_lifecycle)?;

        Ok(Established {
            relationship_id: record.id,
            trust_level,
        })
    }

    /// Read a relationship record. Only its participants may read it.
    pub async fn get_relationship(
        &self,
        id: &RelationshipId,
        as_participant: &ParticipantId,
    ) -> Result<Relationship, BrokerError> {
        let record = self
            .store
            .get(id)
            .await
            .map_err(BrokerError::internal)?
            .ok_or_else(|| {
                BrokerError::denied(RejectionKind::NotFound, format!("no relationship {id}"))
            })?;
        self.authorize(&record, as_participant)?;
        Ok(record)
    }

    /// Read a relationship's event log in sequence order.
    pub async fn get_events(
        &self,
        id: &RelationshipId,
        as_participant: &ParticipantId,
        from_sequence: u64,
    ) -> Result<Vec<Event>, BrokerError> {
        let record = self
            .store
            .get(id)
            .await
            .map_err(BrokerError::internal)?
            .ok_or_else(|| {
                BrokerError::denied(RejectionKind::NotFound, format!("no relationship {id}"))
            })?;
        self.authorize(&record, as_participant)?;
        self.store
            .list_events(id, from_sequence)
            .await
            .map_err(BrokerError::internal)
    }

    fn authorize(
        &self,
        record: &Relationship,
        participant: &ParticipantId,
    ) -> Result<(), BrokerError> {
        if &record.initiator != participant && &record.responder != participant {
            return Err(BrokerError::denied(
                RejectionKind::Unauthorized,
                format!("{participant} is not a participant of {}", record.id),
            ));
        }
        Ok(())
    }

    /// Replay a relationship's chain and recompute every continuity hash.
    pub async fn audit_chain(&self, id: &RelationshipId) -> Result<ChainReport, BrokerError> {
        let events = self
            .store
            .list_events(id, 0)
            .await
            .map_err(|e| match e {
                accord_store::StoreError::NotFound(id) => {
                    BrokerError::denied(RejectionKind::NotFound, format!("no relationship {id}"))
                }
                other => BrokerError::internal(other),
            })?;
        verify_chain(&self.chain_key, &events).map_err(BrokerError::internal)
    }

    /// Subscribe to admitted intents aimed at this participant.
    pub async fn subscribe_as_responder(
        self: &Arc<Self>,
        participant: &ParticipantId,
    ) -> SubscriberHandle {
        self.delivery.subscribe_responder(participant).await
    }

    /// Subscribe to response notices for intents this participant sent.
    pub async fn subscribe_as_initiator(
        self: &Arc<Self>,
        participant: &ParticipantId,
    ) -> SubscriberHandle {
        self.delivery.subscribe_initiator(participant).await
    }

    /// Out-of-band stream of breach attempts whose policy entries request
    /// oversight.
    pub fn subscribe_oversight(&self) -> broadcast::Receiver<OversightNotice> {
        self.oversight.subscribe()
    }

    async fn raise_oversight(
        &self,
        relationship_id: &RelationshipId,
        intent_kind: Option<IntentKind>,
        reason: RejectionKind,
        detail: &str,
    ) {
        let flagged = match (&intent_kind, self.store.get(relationship_id).await) {
            (Some(kind), Ok(Some(record))) => {
                matches!(
                    self.policy.lookup(kind, record.trust_level),
                    PolicyLookup::Entry(entry) if entry.oversight_on_breach
                )
            }
            _ => false,
        };
        if !flagged {
            return;
        }
        let notice = OversightNotice {
            relationship_id: relationship_id.clone(),
            intent_kind,
            reason,
            detail: detail.to_string(),
            at: Utc::now(),
        };
        if self.oversight.send(notice).is_err() {
            warn!(relationship_id = %relationship_id, "breach flagged for oversight but nobody is listening");
        }
    }

    /// Aggregate counters for operators.
    pub async fn statistics(&self) -> Result<BrokerStatistics, BrokerError> {
        let store = self
            .store
            .statistics()
            .await
            .map_err(BrokerError::internal)?;
        let delivery = self.delivery.stats().await;
        Ok(BrokerStatistics {
            relationships_total: store.relationships_total,
            relationships_active: store.relationships_active,
            relationships_closed: store.relationships_closed,
            intents_admitted: store.intents_admitted,
            intents_rejected: store.intents_rejected,
            breach_attempts: store.breach_attempts,
            responses_recorded: store.responses_recorded,
            responder_sessions: delivery.responder_sessions,
            initiator_sessions: delivery.initiator_sessions,
            pending_intents: delivery.pending_intents,
            pending_responses: delivery.pending_responses,
        })
    }

    /// One manual expiry-sweep pass (the background sweep runs on its own).
    pub async fn sweep_once(&self) -> Result<u64, BrokerError> {
        self.lifecycle.sweep_once().await.map_err(map_lifecycle)
    }

    /// Stop the background sweep and every subscription session.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.sweep.lock().ok().and_then(|mut s| s.take()) {
            handle.abort();
        }
        self.delivery.shutdown().await;
        info!("broker shut down");
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        if let Some(handle) = self.sweep.lock().ok().and_then(|mut s| s.take()) {
            handle.abort();
        }
    }
}
