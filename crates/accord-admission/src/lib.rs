//! ACCORD Admission - the ordered checks every inbound intent traverses.
//!
//! The pipeline runs exactly once per intent. Each step either passes
//! control to the next or produces a typed rejection and terminates; the
//! single state-mutating step is the final one. Rejections write one
//! rejection event (or a breach-attempt event where the failure is a misuse
//! signal) and never touch depth or activity accounting.
//!
//! Responses traverse a shorter, analogous pipeline that never charges
//! depth.

#![deny(unsafe_code)]

mod window;

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use thiserror::Error;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

use accord_chain::{content_digest, ChainError, ChainKey};
use accord_delivery::{DeliveryHub, IntentNotice, ResponseNotice};
use accord_lifecycle::{LifecycleEngine, LifecycleError};
use accord_policy::{ContentVerdict, PolicyEntry, PolicyLookup, PolicyRegistry, RiskSignals};
use accord_store::{
    append_sealed, AppendEffects, RelationshipLocks, RelationshipStore, StatBump, StoreError,
};
use accord_types::{
    CloseReason, EventKind, EventPayload, Intent, IntentKind, RejectionKind, Relationship,
    RelationshipId, Response, TrustLevel,
};

pub use window::{check_window, WindowVerdict};

/// Admission tuning knobs.
#[derive(Clone, Copy, Debug)]
pub struct AdmissionConfig {
    /// Total deadline for one admission run.
    pub admission_deadline_secs: u64,
    /// Grace margin applied around appointment windows under lenient policy.
    pub grace_period_secs: i64,
    /// Breach attempts tolerated before the relationship is closed.
    pub breach_close_threshold: u64,
    /// Whether recorded responses push the activity timebox forward.
    pub responses_extend_timebox: bool,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            admission_deadline_secs: 2,
            grace_period_secs: 300,
            breach_close_threshold: 3,
            responses_extend_timebox: false,
        }
    }
}

/// Outcome of one admission run.
#[derive(Clone, Debug)]
pub enum AdmissionVerdict {
    Admitted {
        sequence: u64,
        risk_score: f64,
        within_grace: bool,
    },
    Rejected {
        kind: RejectionKind,
        /// Sequence of the rejection event, when one was written.
        sequence: Option<u64>,
        detail: String,
        /// The rejection was recorded as a breach attempt.
        breach: bool,
    },
}

/// Outcome of one response run.
#[derive(Clone, Debug)]
pub enum ResponseVerdict {
    Recorded {
        sequence: u64,
    },
    Rejected {
        kind: RejectionKind,
        sequence: Option<u64>,
        detail: String,
    },
}

/// Admission-internal errors (everything a caller sees as `internal_error`).
#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error("canonical encoding failed: {0}")]
    Chain(String),
}

impl From<ChainError> for AdmissionError {
    fn from(e: ChainError) -> Self {
        AdmissionError::Chain(e.to_string())
    }
}

/// The admission pipeline.
pub struct AdmissionPipeline {
    store: Arc<dyn RelationshipStore>,
    locks: Arc<RelationshipLocks>,
    policy: Arc<PolicyRegistry>,
    lifecycle: Arc<LifecycleEngine>,
    delivery: Arc<DeliveryHub>,
    chain_key: ChainKey,
    config: AdmissionConfig,
}

impl AdmissionPipeline {
    pub fn new(
        store: Arc<dyn RelationshipStore>,
        locks: Arc<RelationshipLocks>,
        policy: Arc<PolicyRegistry>,
        lifecycle: Arc<LifecycleEngine>,
        delivery: Arc<DeliveryHub>,
        chain_key: ChainKey,
        config: AdmissionConfig,
    ) -> Self {
        Self {
            store,
            locks,
            policy,
            lifecycle,
            delivery,
            chain_key,
            config,
        }
    }

    /// Run the full pipeline for one intent, bounded by the admission
    /// deadline. The message's signature must already be verified.
    pub async fn admit(&self, intent: Intent) -> Result<AdmissionVerdict, AdmissionError> {
        let deadline = Duration::from_secs(self.config.admission_deadline_secs);
        match timeout(deadline, self.admit_inner(&intent)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    relationship_id = %intent.relationship_id,
                    kind = %intent.kind,
                    "admission deadline exceeded"
                );
                let sequence = self
                    .record_late_timeout(&intent)
                    .await
                    .unwrap_or_default();
                Ok(AdmissionVerdict::Rejected {
                    kind: RejectionKind::Timeout,
                    sequence,
                    detail: "admission deadline exceeded".to_string(),
                    breach: false,
                })
            }
        }
    }

    /// Best-effort rejection event after the deadline fired. The admission
    /// future has been dropped, so the relationship lock is free again.
    async fn record_late_timeout(&self, intent: &Intent) -> Option<Option<u64>> {
        let _guard = self.locks.acquire(&intent.relationship_id).await;
        let record = self.store.get(&intent.relationship_id).await.ok()??;
        if !record.is_active() {
            return Some(None);
        }
        let event = append_sealed(
            self.store.as_ref(),
            &self.chain_key,
            &intent.relationship_id,
            Utc::now(),
            EventPayload::IntentRejected {
                kind: Some(intent.kind.clone()),
                reason: RejectionKind::Timeout,
                detail: "admission deadline exceeded".to_string(),
                signals: vec![],
            },
            AppendEffects {
                stat: StatBump::Rejected,
                ..Default::default()
            },
        )
        .await
        .ok()?;
        Some(Some(event.sequence))
    }

    async fn admit_inner(&self, intent: &Intent) -> Result<AdmissionVerdict, AdmissionError> {
        let relationship_id = intent.relationship_id.clone();
        let _guard = self.locks.acquire(&relationship_id).await;
        let now = Utc::now();

        // Step 1: the relationship exists and is active.
        let Some(record) = self.store.get(&relationship_id).await? else {
            return Ok(AdmissionVerdict::Rejected {
                kind: RejectionKind::UnknownRelationship,
                sequence: None,
                detail: format!("no relationship {relationship_id}"),
                breach: false,
            });
        };
        if !record.is_active() {
            // The chain is sealed by its closing event; the attempt is
            // charged against the record's breach counter instead.
            let breaches = self.store.note_breach(&relationship_id).await?;
            warn!(
                relationship_id = %relationship_id,
                kind = %intent.kind,
                breaches,
                "intent aimed at a closed relationship"
            );
            return Ok(AdmissionVerdict::Rejected {
                kind: RejectionKind::ClosedRelationship,
                sequence: None,
                detail: "relationship is closed".to_string(),
                breach: true,
            });
        }

        // Step 2: sender direction. Responders use the response channel.
        if intent.sender != record.initiator {
            return self
                .reject(
                    &record,
                    intent,
                    RejectionKind::WrongDirection,
                    "sender is not the relationship initiator".to_string(),
                    vec![],
                )
                .await;
        }

        // Step 3: trust-level floor, via the policy registry.
        let entry = match self.policy.lookup(&intent.kind, record.trust_level) {
            PolicyLookup::Entry(entry) => entry,
            PolicyLookup::UnregisteredKind => {
                return self
                    .reject(
                        &record,
                        intent,
                        RejectionKind::FilterRejected,
                        format!("intent kind '{}' is not registered", intent.kind),
                        vec![],
                    )
                    .await;
            }
            PolicyLookup::NoEntryAtLevel => {
                return self
                    .reject(
                        &record,
                        intent,
                        RejectionKind::TrustLevelInsufficient,
                        format!(
                            "no policy for '{}' at trust level {}",
                            intent.kind, record.trust_level
                        ),
                        vec![],
                    )
                    .await;
            }
        };
        if entry.trust_floor > record.trust_level {
            return self
                .reject(
                    &record,
                    intent,
                    RejectionKind::TrustLevelInsufficient,
                    format!(
                        "trust floor {} exceeds relationship level {}",
                        entry.trust_floor, record.trust_level
                    ),
                    vec![],
                )
                .await;
        }

        // Step 4: timebox / appointment window.
        let grace = ChronoDuration::seconds(self.config.grace_period_secs);
        let within_grace = match check_window(&record, entry.appointment, grace, now) {
            WindowVerdict::Ok { within_grace } => within_grace,
            WindowVerdict::Expired => {
                let verdict = self
                    .reject(
                        &record,
                        intent,
                        RejectionKind::Expired,
                        "activity timebox ran out".to_string(),
                        vec![],
                    )
                    .await?;
                self.lifecycle
                    .close_locked(&relationship_id, CloseReason::Expired)
                    .await?;
                return Ok(verdict);
            }
            WindowVerdict::OutsideWindow { breach: true, detail } => {
                return self.breach(&record, intent, entry, RejectionKind::OutsideWindow, detail).await;
            }
            WindowVerdict::OutsideWindow {
                breach: false,
                detail,
            } => {
                return self
                    .reject(&record, intent, RejectionKind::OutsideWindow, detail, vec![])
                    .await;
            }
        };

        // Step 5: depth cap. Only admitted initiator intents count.
        if record.depth >= record.max_depth {
            let verdict = self
                .reject(
                    &record,
                    intent,
                    RejectionKind::DepthExceeded,
                    format!("depth {} reached maximum {}", record.depth, record.max_depth),
                    vec![],
                )
                .await?;
            self.lifecycle
                .close_locked(&relationship_id, CloseReason::MaxDepthReached)
                .await?;
            return Ok(verdict);
        }

        // Step 6: prior consent, when the policy demands it.
        if entry.requires_consent && !record.consent_granted(&intent.kind) {
            return self
                .reject(
                    &record,
                    intent,
                    RejectionKind::ConsentMissing,
                    format!("no consent entry for '{}'", intent.kind),
                    vec![],
                )
                .await;
        }

        // Step 7: content filter.
        match entry.content.check(intent) {
            ContentVerdict::Pass => {}
            ContentVerdict::Rejected { detail } => {
                return self
                    .reject(&record, intent, RejectionKind::FilterRejected, detail, vec![])
                    .await;
            }
            ContentVerdict::Violation { detail } => {
                return self
                    .breach(&record, intent, entry, RejectionKind::FilterRejected, detail)
                    .await;
            }
        }

        // Step 8: deterministic risk score against the trust-level
        // threshold. Grace-window admissions are scored one level stricter.
        let risk = self.policy.risk();
        let signals = RiskSignals {
            brief_explanation: intent.explanatory_text().chars().count()
                < risk.min_explanation_len,
            recent_rejections: self.has_recent_rejections(&relationship_id, risk.recent_window).await?,
            constraints_excessive: risk.constraints_excessive(&intent.constraints, now),
            first_contact_probation: now - record.created_at
                < ChronoDuration::seconds(risk.probation_secs),
            responder_overloaded: !self.delivery.has_capacity(&record.responder).await,
        };
        let score = signals.score(&risk.weights);
        let effective_trust = if within_grace {
            TrustLevel(record.trust_level.0.saturating_sub(1))
        } else {
            record.trust_level
        };
        if score < risk.threshold_for(effective_trust) {
            return self
                .reject(
                    &record,
                    intent,
                    RejectionKind::RiskTooLow,
                    format!(
                        "risk score {score:.2} below threshold {:.2}",
                        risk.threshold_for(effective_trust)
                    ),
                    signals.firing(),
                )
                .await;
        }

        // Step 9: admit. The only state-mutating step.
        let digest = content_digest(intent)?;
        let new_expires_at = if record.timebox.is_appointment() {
            None
        } else {
            Some(record.timebox.expiry_from(now))
        };
        let event = append_sealed(
            self.store.as_ref(),
            &self.chain_key,
            &relationship_id,
            now,
            EventPayload::IntentAdmitted {
                intent_id: intent.id.clone(),
                kind: intent.kind.clone(),
                sender: intent.sender.clone(),
                digest,
                risk_score: score,
                policy_version: entry.version,
                within_grace,
                legal_hold: entry.legal_hold,
            },
            AppendEffects {
                touch_activity: true,
                increment_depth: true,
                new_expires_at,
                stat: StatBump::Admitted,
            },
        )
        .await?;

        self.delivery
            .enqueue_intent(
                &record.responder,
                IntentNotice {
                    relationship_id: relationship_id.clone(),
                    sequence: event.sequence,
                    kind: intent.kind.clone(),
                    context: intent.context.clone(),
                    explanation: intent.explanation.clone(),
                    constraints: intent.constraints.clone(),
                    window: intent.window.clone(),
                },
            )
            .await;

        info!(
            relationship_id = %relationship_id,
            kind = %intent.kind,
            sequence = event.sequence,
            risk_score = score,
            "intent admitted"
        );
        Ok(AdmissionVerdict::Admitted {
            sequence: event.sequence,
            risk_score: score,
            within_grace,
        })
    }

    /// The shorter responder-to-initiator pipeline. Never touches depth and,
    /// by default, never extends the timebox.
    pub async fn respond(&self, response: Response) -> Result<ResponseVerdict, AdmissionError> {
        let relationship_id = response.relationship_id.clone();
        let _guard = self.locks.acquire(&relationship_id).await;
        let now = Utc::now();

        let Some(record) = self.store.get(&relationship_id).await? else {
            return Ok(ResponseVerdict::Rejected {
                kind: RejectionKind::UnknownRelationship,
                sequence: None,
                detail: format!("no relationship {relationship_id}"),
            });
        };
        if !record.is_active() {
            return Ok(ResponseVerdict::Rejected {
                kind: RejectionKind::ClosedRelationship,
                sequence: None,
                detail: "relationship is closed".to_string(),
            });
        }

        // The sender must be the relationship's responder.
        if response.sender != record.responder {
            let sequence = self
                .append_rejection(
                    &relationship_id,
                    None,
                    RejectionKind::WrongDirection,
                    "sender is not the relationship responder".to_string(),
                    vec![],
                )
                .await?;
            return Ok(ResponseVerdict::Rejected {
                kind: RejectionKind::WrongDirection,
                sequence: Some(sequence),
                detail: "sender is not the relationship responder".to_string(),
            });
        }

        // The referenced intent must be admitted and not yet finalized.
        let events = self.store.list_events(&relationship_id, 0).await?;
        let admitted = events
            .iter()
            .any(|e| e.kind == EventKind::IntentAdmitted && e.sequence == response.intent_sequence);
        if !admitted {
            let detail = format!(
                "sequence {} is not an admitted intent",
                response.intent_sequence
            );
            let sequence = self
                .append_rejection(
                    &relationship_id,
                    None,
                    RejectionKind::NotAdmitted,
                    detail.clone(),
                    vec![],
                )
                .await?;
            return Ok(ResponseVerdict::Rejected {
                kind: RejectionKind::NotAdmitted,
                sequence: Some(sequence),
                detail,
            });
        }
        let finalized = events.iter().any(|e| {
            matches!(
                &e.payload,
                EventPayload::ResponseRecorded { intent_sequence, outcome, .. }
                    if *intent_sequence == response.intent_sequence && outcome.is_final()
            )
        });
        if finalized {
            let detail = format!("intent {} is already finalized", response.intent_sequence);
            let sequence = self
                .append_rejection(
                    &relationship_id,
                    None,
                    RejectionKind::AlreadyFinalized,
                    detail.clone(),
                    vec![],
                )
                .await?;
            return Ok(ResponseVerdict::Rejected {
                kind: RejectionKind::AlreadyFinalized,
                sequence: Some(sequence),
                detail,
            });
        }

        let new_expires_at = if self.config.responses_extend_timebox
            && !record.timebox.is_appointment()
        {
            Some(record.timebox.expiry_from(now))
        } else {
            None
        };
        let event = append_sealed(
            self.store.as_ref(),
            &self.chain_key,
            &relationship_id,
            now,
            EventPayload::ResponseRecorded {
                intent_sequence: response.intent_sequence,
                outcome: response.outcome.clone(),
                data: response.data.clone(),
            },
            AppendEffects {
                touch_activity: true,
                new_expires_at,
                stat: StatBump::Response,
                ..Default::default()
            },
        )
        .await?;

        self.delivery
            .push_response(
                &record.initiator,
                ResponseNotice {
                    relationship_id: relationship_id.clone(),
                    intent_sequence: response.intent_sequence,
                    outcome: response.outcome.clone(),
                    data: response.data,
                },
            )
            .await;

        debug!(
            relationship_id = %relationship_id,
            intent_sequence = response.intent_sequence,
            sequence = event.sequence,
            "response recorded"
        );
        Ok(ResponseVerdict::Recorded {
            sequence: event.sequence,
        })
    }

    async fn has_recent_rejections(
        &self,
        relationship_id: &RelationshipId,
        window: usize,
    ) -> Result<bool, AdmissionError> {
        let events = self.store.list_events(relationship_id, 0).await?;
        let tail = events.len().saturating_sub(window);
        Ok(events[tail..].iter().any(|e| {
            matches!(
                e.kind,
                EventKind::IntentRejected | EventKind::BreachAttempt
            )
        }))
    }

    /// Write a benign rejection event and build the verdict.
    async fn reject(
        &self,
        record: &Relationship,
        intent: &Intent,
        kind: RejectionKind,
        detail: String,
        signals: Vec<String>,
    ) -> Result<AdmissionVerdict, AdmissionError> {
        let sequence = self
            .append_rejection(&record.id, Some(intent.kind.clone()), kind, detail.clone(), signals)
            .await?;
        debug!(
            relationship_id = %record.id,
            kind = %intent.kind,
            reason = %kind,
            "intent rejected"
        );
        Ok(AdmissionVerdict::Rejected {
            kind,
            sequence: Some(sequence),
            detail,
            breach: false,
        })
    }

    async fn append_rejection(
        &self,
        relationship_id: &RelationshipId,
        kind: Option<IntentKind>,
        reason: RejectionKind,
        detail: String,
        signals: Vec<String>,
    ) -> Result<u64, AdmissionError> {
        let event = append_sealed(
            self.store.as_ref(),
            &self.chain_key,
            relationship_id,
            Utc::now(),
            EventPayload::IntentRejected {
                kind,
                reason,
                detail,
                signals,
            },
            AppendEffects {
                stat: StatBump::Rejected,
                ..Default::default()
            },
        )
        .await?;
        Ok(event.sequence)
    }

    /// Write a breach-attempt event, and close the relationship when the
    /// breach counter reaches the configured cap.
    async fn breach(
        &self,
        record: &Relationship,
        intent: &Intent,
        entry: &PolicyEntry,
        kind: RejectionKind,
        detail: String,
    ) -> Result<AdmissionVerdict, AdmissionError> {
        let event = append_sealed(
            self.store.as_ref(),
            &self.chain_key,
            &record.id,
            Utc::now(),
            EventPayload::BreachAttempt {
                kind: Some(intent.kind.clone()),
                reason: kind,
                detail: detail.clone(),
            },
            AppendEffects {
                stat: StatBump::Breach,
                ..Default::default()
            },
        )
        .await?;
        warn!(
            relationship_id = %record.id,
            kind = %intent.kind,
            reason = %kind,
            oversight = entry.oversight_on_breach,
            "breach attempt recorded"
        );

        let refreshed = self
            .store
            .get(&record.id)
            .await?
            .ok_or_else(|| StoreError::NotFound(record.id.0.clone()))?;
        if refreshed.stats.breach_attempts >= self.config.breach_close_threshold {
            self.lifecycle
                .close_locked(&record.id, CloseReason::Breach)
                .await?;
        }

        Ok(AdmissionVerdict::Rejected {
            kind,
            sequence: Some(event.sequence),
            detail,
            breach: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use accord_delivery::DeliveryConfig;
    use accord_lifecycle::{LifecycleConfig, RelationshipProposal};
    use accord_policy::{AppointmentMode, ContentRules};
    use accord_store::MemoryStore;
    use accord_types::{
        Constraints, IntentId, ParticipantId, RelationshipState, Signature, TimeWindow,
        TimeboxPolicy,
    };
    use chrono::Utc;
    use std::collections::BTreeMap;

    struct Fixture {
        store: Arc<MemoryStore>,
        delivery: Arc<DeliveryHub>,
        lifecycle: Arc<LifecycleEngine>,
        pipeline: AdmissionPipeline,
    }

    fn default_registry() -> PolicyRegistry {
        let mut registry = PolicyRegistry::new();
        for kind in ["greet", "share", "bye"] {
            registry.register_kind(IntentKind::new(kind), PolicyEntry::permissive()).unwrap();
        }
        registry
    }

    fn fixture_with(registry: PolicyRegistry, delivery_config: DeliveryConfig) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let locks = Arc::new(RelationshipLocks::new());
        let chain_key = ChainKey::derive(b"admission-test-key");
        let delivery = Arc::new(DeliveryHub::new(
            store.clone(),
            locks.clone(),
            chain_key.clone(),
            delivery_config,
        ));
        let lifecycle = Arc::new(LifecycleEngine::new(
            store.clone(),
            locks.clone(),
            delivery.clone(),
            chain_key.clone(),
            LifecycleConfig::default(),
        ));
        let pipeline = AdmissionPipeline::new(
            store.clone(),
            locks,
            Arc::new(registry),
            lifecycle.clone(),
            delivery.clone(),
            chain_key,
            AdmissionConfig::default(),
        );
        Fixture {
            store,
            delivery,
            lifecycle,
            pipeline,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(default_registry(), DeliveryConfig::default())
    }

    async fn establish(
        fx: &Fixture,
        trust: u8,
        timebox: Option<TimeboxPolicy>,
        max_depth: Option<u32>,
        snapshot: BTreeMap<String, serde_json::Value>,
    ) -> Relationship {
        fx.lifecycle
            .establish(
                RelationshipProposal {
                    initiator: ParticipantId::new("p1"),
                    responder: ParticipantId::new("p2"),
                    timebox,
                    max_depth,
                    context_snapshot: snapshot,
                },
                TrustLevel::new(trust),
            )
            .await
            .unwrap()
    }

    fn intent(record: &Relationship, kind: &str, sender: &str) -> Intent {
        Intent {
            id: IntentId::generate(),
            relationship_id: record.id.clone(),
            kind: IntentKind::new(kind),
            window: TimeWindow::immediate(),
            context: BTreeMap::new(),
            explanation: Some(format!("a well explained {kind} message")),
            constraints: Constraints::default(),
            sender: ParticipantId::new(sender),
            signature: Signature::empty(),
        }
    }

    fn response(record: &Relationship, intent_sequence: u64, sender: &str) -> Response {
        Response {
            relationship_id: record.id.clone(),
            intent_sequence,
            outcome: accord_types::ResponseOutcome::Completed,
            data: serde_json::json!({"done": true}),
            sender: ParticipantId::new(sender),
            signature: Signature::empty(),
        }
    }

    #[tokio::test]
    async fn conversation_admits_in_order() {
        let fx = fixture();
        let record = establish(&fx, 1, None, None, BTreeMap::new()).await;

        for (expected_sequence, kind) in [(1u64, "greet"), (2, "share"), (3, "bye")] {
            let verdict = fx.pipeline.admit(intent(&record, kind, "p1")).await.unwrap();
            match verdict {
                AdmissionVerdict::Admitted {
                    sequence,
                    within_grace,
                    ..
                } => {
                    assert_eq!(sequence, expected_sequence);
                    assert!(!within_grace);
                }
                other => panic!("expected admission, got {other:?}"),
            }
        }

        let refreshed = fx.store.get(&record.id).await.unwrap().unwrap();
        assert_eq!(refreshed.depth, 3);
        assert_eq!(refreshed.state, RelationshipState::Active);
        assert_eq!(refreshed.stats.intents_admitted, 3);
    }

    #[tokio::test]
    async fn wrong_direction_is_rejected_without_charging_depth() {
        let fx = fixture();
        let record = establish(&fx, 1, None, None, BTreeMap::new()).await;

        let verdict = fx
            .pipeline
            .admit(intent(&record, "greet", "p2"))
            .await
            .unwrap();
        match verdict {
            AdmissionVerdict::Rejected {
                kind,
                sequence,
                breach,
                ..
            } => {
                assert_eq!(kind, RejectionKind::WrongDirection);
                assert_eq!(sequence, Some(1));
                assert!(!breach);
            }
            other => panic!("expected rejection, got {other:?}"),
        }

        let refreshed = fx.store.get(&record.id).await.unwrap().unwrap();
        assert_eq!(refreshed.depth, 0);
        assert_eq!(refreshed.stats.intents_rejected, 1);
        let events = fx.store.list_events(&record.id, 0).await.unwrap();
        assert_eq!(events.last().unwrap().kind, EventKind::IntentRejected);
    }

    #[tokio::test]
    async fn unknown_relationship_is_rejected_without_events() {
        let fx = fixture();
        let record = establish(&fx, 1, None, None, BTreeMap::new()).await;
        let mut msg = intent(&record, "greet", "p1");
        msg.relationship_id = RelationshipId::new("missing");

        let verdict = fx.pipeline.admit(msg).await.unwrap();
        match verdict {
            AdmissionVerdict::Rejected { kind, sequence, .. } => {
                assert_eq!(kind, RejectionKind::UnknownRelationship);
                assert_eq!(sequence, None);
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn depth_cap_rejects_and_closes() {
        let fx = fixture();
        let record = establish(&fx, 1, None, Some(2), BTreeMap::new()).await;

        for kind in ["greet", "share"] {
            let verdict = fx.pipeline.admit(intent(&record, kind, "p1")).await.unwrap();
            assert!(matches!(verdict, AdmissionVerdict::Admitted { .. }));
        }

        let verdict = fx
            .pipeline
            .admit(intent(&record, "bye", "p1"))
            .await
            .unwrap();
        match verdict {
            AdmissionVerdict::Rejected { kind, .. } => {
                assert_eq!(kind, RejectionKind::DepthExceeded);
            }
            other => panic!("expected rejection, got {other:?}"),
        }

        let refreshed = fx.store.get(&record.id).await.unwrap().unwrap();
        assert_eq!(refreshed.state, RelationshipState::Closed);
        assert_eq!(refreshed.close_reason, Some(CloseReason::MaxDepthReached));
        assert_eq!(refreshed.depth, 2);

        let events = fx.store.list_events(&record.id, 0).await.unwrap();
        let kinds: Vec<EventKind> = events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::RelationshipEstablished,
                EventKind::IntentAdmitted,
                EventKind::IntentAdmitted,
                EventKind::IntentRejected,
                EventKind::RelationshipClosed,
            ]
        );
    }

    #[tokio::test]
    async fn closed_relationship_attempt_is_a_breach_without_events() {
        let fx = fixture();
        let record = establish(&fx, 1, None, None, BTreeMap::new()).await;
        fx.lifecycle
            .close(&record.id, CloseReason::Completed)
            .await
            .unwrap();
        let events_before = fx.store.list_events(&record.id, 0).await.unwrap().len();

        let verdict = fx
            .pipeline
            .admit(intent(&record, "greet", "p1"))
            .await
            .unwrap();
        match verdict {
            AdmissionVerdict::Rejected { kind, breach, .. } => {
                assert_eq!(kind, RejectionKind::ClosedRelationship);
                assert!(breach);
            }
            other => panic!("expected rejection, got {other:?}"),
        }

        // The sealed chain gains no event; the breach lands on the counter.
        let events_after = fx.store.list_events(&record.id, 0).await.unwrap();
        assert_eq!(events_after.len(), events_before);
        let refreshed = fx.store.get(&record.id).await.unwrap().unwrap();
        assert_eq!(refreshed.stats.breach_attempts, 1);
    }

    #[tokio::test]
    async fn trust_floor_gates_admission() {
        let mut registry = default_registry();
        registry.register_kind(
            IntentKind::new("delete_data"),
            PolicyEntry::permissive().with_trust_floor(TrustLevel::new(4)),
        ).unwrap();
        let fx = fixture_with(registry, DeliveryConfig::default());
        let record = establish(&fx, 1, None, None, BTreeMap::new()).await;

        let verdict = fx
            .pipeline
            .admit(intent(&record, "delete_data", "p1"))
            .await
            .unwrap();
        match verdict {
            AdmissionVerdict::Rejected { kind, .. } => {
                assert_eq!(kind, RejectionKind::TrustLevelInsufficient);
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unregistered_kind_is_filtered() {
        let fx = fixture();
        let record = establish(&fx, 1, None, None, BTreeMap::new()).await;

        let verdict = fx
            .pipeline
            .admit(intent(&record, "launch_rocket", "p1"))
            .await
            .unwrap();
        match verdict {
            AdmissionVerdict::Rejected { kind, .. } => {
                assert_eq!(kind, RejectionKind::FilterRejected);
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn consent_is_required_when_policy_says_so() {
        let mut registry = default_registry();
        registry.register_kind(
            IntentKind::new("share_location"),
            PolicyEntry::permissive().with_consent_required(),
        ).unwrap();
        let fx = fixture_with(registry, DeliveryConfig::default());

        let record = establish(&fx, 1, None, None, BTreeMap::new()).await;
        let verdict = fx
            .pipeline
            .admit(intent(&record, "share_location", "p1"))
            .await
            .unwrap();
        assert!(matches!(
            verdict,
            AdmissionVerdict::Rejected {
                kind: RejectionKind::ConsentMissing,
                ..
            }
        ));

        // With the consent entry present the same intent is admitted.
        let mut snapshot = BTreeMap::new();
        snapshot.insert(
            "consent:share_location".to_string(),
            serde_json::json!("granted"),
        );
        let consented = fx
            .lifecycle
            .establish(
                RelationshipProposal {
                    initiator: ParticipantId::new("p3"),
                    responder: ParticipantId::new("p4"),
                    timebox: None,
                    max_depth: None,
                    context_snapshot: snapshot,
                },
                TrustLevel::new(1),
            )
            .await
            .unwrap();
        let mut msg = intent(&consented, "share_location", "p3");
        msg.sender = ParticipantId::new("p3");
        let verdict = fx.pipeline.admit(msg).await.unwrap();
        assert!(matches!(verdict, AdmissionVerdict::Admitted { .. }));
    }

    #[tokio::test]
    async fn strict_window_violation_is_a_breach_and_leaves_it_active() {
        let mut registry = default_registry();
        registry.register_kind(
            IntentKind::new("meet"),
            PolicyEntry::permissive().with_appointment(AppointmentMode::Strict),
        ).unwrap();
        let fx = fixture_with(registry, DeliveryConfig::default());

        let now = Utc::now();
        let timebox = TimeboxPolicy::AppointmentBased {
            start: now - chrono::Duration::minutes(30),
            end: now - chrono::Duration::minutes(10),
        };
        let record = establish(&fx, 1, Some(timebox), None, BTreeMap::new()).await;

        let verdict = fx
            .pipeline
            .admit(intent(&record, "meet", "p1"))
            .await
            .unwrap();
        match verdict {
            AdmissionVerdict::Rejected { kind, breach, .. } => {
                assert_eq!(kind, RejectionKind::OutsideWindow);
                assert!(breach);
            }
            other => panic!("expected rejection, got {other:?}"),
        }

        let refreshed = fx.store.get(&record.id).await.unwrap().unwrap();
        assert_eq!(refreshed.state, RelationshipState::Active);
        let events = fx.store.list_events(&record.id, 0).await.unwrap();
        assert_eq!(events.last().unwrap().kind, EventKind::BreachAttempt);
    }

    #[tokio::test]
    async fn grace_margin_admission_is_tagged() {
        let mut registry = default_registry();
        registry.register_kind(
            IntentKind::new("meet"),
            PolicyEntry::permissive().with_appointment(AppointmentMode::GracePeriod),
        ).unwrap();
        let fx = fixture_with(registry, DeliveryConfig::default());

        // Window ended two minutes ago; the default grace is five minutes.
        // Trust 2 so the one-level-stricter grace scoring still admits.
        let now = Utc::now();
        let timebox = TimeboxPolicy::AppointmentBased {
            start: now - chrono::Duration::minutes(30),
            end: now - chrono::Duration::minutes(2),
        };
        let record = establish(&fx, 2, Some(timebox), None, BTreeMap::new()).await;

        let verdict = fx
            .pipeline
            .admit(intent(&record, "meet", "p1"))
            .await
            .unwrap();
        match verdict {
            AdmissionVerdict::Admitted { within_grace, .. } => assert!(within_grace),
            other => panic!("expected admission, got {other:?}"),
        }

        let events = fx.store.list_events(&record.id, 0).await.unwrap();
        match &events.last().unwrap().payload {
            EventPayload::IntentAdmitted { within_grace, .. } => assert!(within_grace),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn expired_activity_relationship_auto_closes() {
        let fx = fixture();
        let record = establish(
            &fx,
            1,
            Some(TimeboxPolicy::ActivityBased { idle_hours: 0 }),
            None,
            BTreeMap::new(),
        )
        .await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let verdict = fx
            .pipeline
            .admit(intent(&record, "greet", "p1"))
            .await
            .unwrap();
        assert!(matches!(
            verdict,
            AdmissionVerdict::Rejected {
                kind: RejectionKind::Expired,
                ..
            }
        ));

        let refreshed = fx.store.get(&record.id).await.unwrap().unwrap();
        assert_eq!(refreshed.state, RelationshipState::Closed);
        assert_eq!(refreshed.close_reason, Some(CloseReason::Expired));
    }

    #[tokio::test]
    async fn overloaded_responder_rejects_at_the_risk_step() {
        let fx = fixture_with(
            default_registry(),
            DeliveryConfig {
                queue_size: 0,
                ..Default::default()
            },
        );
        let record = establish(&fx, 5, None, None, BTreeMap::new()).await;

        let verdict = fx
            .pipeline
            .admit(intent(&record, "greet", "p1"))
            .await
            .unwrap();
        assert!(matches!(
            verdict,
            AdmissionVerdict::Rejected {
                kind: RejectionKind::RiskTooLow,
                ..
            }
        ));

        let events = fx.store.list_events(&record.id, 0).await.unwrap();
        match &events.last().unwrap().payload {
            EventPayload::IntentRejected { signals, .. } => {
                assert!(signals.iter().any(|s| s == "responder_overloaded"));
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn repeated_violations_close_the_relationship_as_breach() {
        let mut registry = default_registry();
        registry.register_kind(
            IntentKind::new("fly"),
            PolicyEntry::permissive().with_content(ContentRules {
                forbidden_tokens: vec!["airport".to_string()],
                ..Default::default()
            }),
        ).unwrap();
        let fx = fixture_with(registry, DeliveryConfig::default());
        let record = establish(&fx, 1, None, None, BTreeMap::new()).await;

        for attempt in 0..3 {
            let mut msg = intent(&record, "fly", "p1");
            msg.explanation = Some("fly towards the airport please".to_string());
            let verdict = fx.pipeline.admit(msg).await.unwrap();
            match verdict {
                AdmissionVerdict::Rejected { breach, .. } => assert!(breach, "attempt {attempt}"),
                other => panic!("expected rejection, got {other:?}"),
            }
        }

        let refreshed = fx.store.get(&record.id).await.unwrap().unwrap();
        assert_eq!(refreshed.state, RelationshipState::Closed);
        assert_eq!(refreshed.close_reason, Some(CloseReason::Breach));
        assert_eq!(refreshed.stats.breach_attempts, 3);
    }

    #[tokio::test]
    async fn admitted_intents_reach_the_delivery_lane() {
        let fx = fixture();
        let record = establish(&fx, 1, None, None, BTreeMap::new()).await;

        fx.pipeline
            .admit(intent(&record, "greet", "p1"))
            .await
            .unwrap();
        assert_eq!(fx.delivery.stats().await.pending_intents, 1);
    }

    #[tokio::test]
    async fn legal_hold_policy_marks_admitted_events() {
        let mut registry = default_registry();
        registry
            .register_kind(
                IntentKind::new("export_records"),
                PolicyEntry::permissive().with_legal_hold(),
            )
            .unwrap();
        let fx = fixture_with(registry, DeliveryConfig::default());
        let record = establish(&fx, 1, None, None, BTreeMap::new()).await;

        let verdict = fx
            .pipeline
            .admit(intent(&record, "export_records", "p1"))
            .await
            .unwrap();
        assert!(matches!(verdict, AdmissionVerdict::Admitted { .. }));

        let events = fx.store.list_events(&record.id, 0).await.unwrap();
        match &events.last().unwrap().payload {
            EventPayload::IntentAdmitted { legal_hold, .. } => assert!(legal_hold),
            other => panic!("unexpected payload {other:?}"),
        }

        // An ordinary kind stays unmarked.
        let plain = fx
            .pipeline
            .admit(intent(&record, "greet", "p1"))
            .await
            .unwrap();
        assert!(matches!(plain, AdmissionVerdict::Admitted { .. }));
        let events = fx.store.list_events(&record.id, 0).await.unwrap();
        match &events.last().unwrap().payload {
            EventPayload::IntentAdmitted { legal_hold, .. } => assert!(!legal_hold),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn response_roundtrip_and_finalization_rules() {
        let fx = fixture();
        let record = establish(&fx, 1, None, None, BTreeMap::new()).await;
        fx.pipeline
            .admit(intent(&record, "greet", "p1"))
            .await
            .unwrap();

        // Responder answers the admitted intent at sequence 1.
        let verdict = fx.pipeline.respond(response(&record, 1, "p2")).await.unwrap();
        match verdict {
            ResponseVerdict::Recorded { sequence } => assert_eq!(sequence, 2),
            other => panic!("expected recorded, got {other:?}"),
        }

        // Depth is untouched by responses.
        let refreshed = fx.store.get(&record.id).await.unwrap().unwrap();
        assert_eq!(refreshed.depth, 1);
        assert_eq!(refreshed.stats.responses_recorded, 1);

        // A second terminal response is refused.
        let verdict = fx.pipeline.respond(response(&record, 1, "p2")).await.unwrap();
        assert!(matches!(
            verdict,
            ResponseVerdict::Rejected {
                kind: RejectionKind::AlreadyFinalized,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn response_to_unadmitted_sequence_is_refused() {
        let fx = fixture();
        let record = establish(&fx, 1, None, None, BTreeMap::new()).await;

        let verdict = fx
            .pipeline
            .respond(response(&record, 7, "p2"))
            .await
            .unwrap();
        assert!(matches!(
            verdict,
            ResponseVerdict::Rejected {
                kind: RejectionKind::NotAdmitted,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn response_from_initiator_is_wrong_direction() {
        let fx = fixture();
        let record = establish(&fx, 1, None, None, BTreeMap::new()).await;
        fx.pipeline
            .admit(intent(&record, "greet", "p1"))
            .await
            .unwrap();

        let verdict = fx
            .pipeline
            .respond(response(&record, 1, "p1"))
            .await
            .unwrap();
        assert!(matches!(
            verdict,
            ResponseVerdict::Rejected {
                kind: RejectionKind::WrongDirection,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn interim_accepted_response_does_not_finalize() {
        let fx = fixture();
        let record = establish(&fx, 1, None, None, BTreeMap::new()).await;
        fx.pipeline
            .admit(intent(&record, "greet", "p1"))
            .await
            .unwrap();

        let mut interim = response(&record, 1, "p2");
        interim.outcome = accord_types::ResponseOutcome::Accepted;
        let verdict = fx.pipeline.respond(interim).await.unwrap();
        assert!(matches!(verdict, ResponseVerdict::Recorded { .. }));

        // A terminal response may still follow.
        let verdict = fx.pipeline.respond(response(&record, 1, "p2")).await.unwrap();
        assert!(matches!(verdict, ResponseVerdict::Recorded { .. }));
    }
}
