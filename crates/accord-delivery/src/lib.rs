//! ACCORD Delivery - subscription sessions and at-most-once fanout.
//!
//! Each participant gets a bounded pending lane per role (responder lanes
//! carry admitted intents, initiator lanes carry response notices). A
//! subscription session drains its lane one frame at a time: push, wait for
//! the ack, then move on. An unacknowledged frame is requeued exactly once,
//! after which the intent is finalized as a delivery timeout. Sessions
//! heartbeat; two unanswered heartbeats close the session and its
//! in-flight frame returns to the lane.
//!
//! Within one relationship, intents reach the responder in admission order.
//! Across relationships there is no ordering guarantee.

#![deny(unsafe_code)]

mod frame;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use accord_chain::ChainKey;
use accord_store::{append_sealed, AppendEffects, RelationshipLocks, RelationshipStore, StatBump};
use accord_types::{
    EventPayload, ParticipantId, RelationshipId, ResponseOutcome, SubscriptionId,
};

pub use frame::{AckFrame, DeliveryFrame, IntentNotice, ResponseNotice, SubscriberHandle};

/// Delivery-related errors.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("subscription session closed")]
    SessionClosed,
}

/// Delivery tuning knobs.
#[derive(Clone, Copy, Debug)]
pub struct DeliveryConfig {
    pub ack_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
    /// Bound on each responder's pending lane; enforced at admission time.
    pub queue_size: usize,
    /// Capacity of the per-session frame channel.
    pub channel_capacity: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            ack_timeout_secs: 10,
            heartbeat_interval_secs: 5,
            queue_size: 64,
            channel_capacity: 32,
        }
    }
}

/// Counters surfaced to operators.
#[derive(Clone, Copy, Debug, Default)]
pub struct DeliveryStats {
    pub responder_sessions: u64,
    pub initiator_sessions: u64,
    pub pending_intents: u64,
    pub pending_responses: u64,
}

#[derive(Clone, Debug)]
enum ItemBody {
    Intent(IntentNotice),
    Response(ResponseNotice),
}

impl ItemBody {
    fn relationship_id(&self) -> &RelationshipId {
        match self {
            ItemBody::Intent(notice) => &notice.relationship_id,
            ItemBody::Response(notice) => &notice.relationship_id,
        }
    }

    fn to_frame(&self, delivery_id: u64) -> DeliveryFrame {
        match self {
            ItemBody::Intent(notice) => DeliveryFrame::Intent {
                delivery_id,
                notice: notice.clone(),
            },
            ItemBody::Response(notice) => DeliveryFrame::Response {
                delivery_id,
                notice: notice.clone(),
            },
        }
    }
}

#[derive(Clone, Debug)]
struct QueuedItem {
    body: ItemBody,
    attempts: u32,
}

struct ActiveSession {
    id: SubscriptionId,
    task: JoinHandle<()>,
}

/// One participant's pending deliveries plus its (at most one) session.
#[derive(Default)]
struct Lane {
    queue: Mutex<VecDeque<QueuedItem>>,
    in_flight: Mutex<Option<QueuedItem>>,
    notify: Notify,
    session: Mutex<Option<ActiveSession>>,
}

impl Lane {
    async fn requeue_in_flight(&self) {
        if let Some(item) = self.in_flight.lock().await.take() {
            self.queue.lock().await.push_front(item);
            self.notify.notify_one();
        }
    }
}

/// The delivery subsystem.
pub struct DeliveryHub {
    store: Arc<dyn RelationshipStore>,
    locks: Arc<RelationshipLocks>,
    chain_key: ChainKey,
    config: DeliveryConfig,
    responder_lanes: Mutex<HashMap<ParticipantId, Arc<Lane>>>,
    initiator_lanes: Mutex<HashMap<ParticipantId, Arc<Lane>>>,
    next_delivery_id: AtomicU64,
}

impl DeliveryHub {
    pub fn new(
        store: Arc<dyn RelationshipStore>,
        locks: Arc<RelationshipLocks>,
        chain_key: ChainKey,
        config: DeliveryConfig,
    ) -> Self {
        Self {
            store,
            locks,
            chain_key,
            config,
            responder_lanes: Mutex::new(HashMap::new()),
            initiator_lanes: Mutex::new(HashMap::new()),
            next_delivery_id: AtomicU64::new(1),
        }
    }

    fn allocate_delivery_id(&self) -> u64 {
        self.next_delivery_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn lane(
        lanes: &Mutex<HashMap<ParticipantId, Arc<Lane>>>,
        participant: &ParticipantId,
    ) -> Arc<Lane> {
        let mut lanes = lanes.lock().await;
        lanes
            .entry(participant.clone())
            .or_insert_with(|| Arc::new(Lane::default()))
            .clone()
    }

    /// Whether the responder's pending lane can take another admission.
    /// Consulted by the risk check; a full lane rejects rather than buffers.
    pub async fn has_capacity(&self, responder: &ParticipantId) -> bool {
        let lane = Self::lane(&self.responder_lanes, responder).await;
        let queued = lane.queue.lock().await.len();
        queued < self.config.queue_size
    }

    /// Queue an admitted intent for its responder.
    pub async fn enqueue_intent(&self, responder: &ParticipantId, notice: IntentNotice) {
        let lane = Self::lane(&self.responder_lanes, responder).await;
        lane.queue.lock().await.push_back(QueuedItem {
            body: ItemBody::Intent(notice),
            attempts: 0,
        });
        lane.notify.notify_one();
    }

    /// Queue a response notice for its initiator.
    pub async fn push_response(&self, initiator: &ParticipantId, notice: ResponseNotice) {
        let lane = Self::lane(&self.initiator_lanes, initiator).await;
        lane.queue.lock().await.push_back(QueuedItem {
            body: ItemBody::Response(notice),
            attempts: 0,
        });
        lane.notify.notify_one();
    }

    /// Open a responder subscription. Replaces any existing session for the
    /// participant; the replaced session's in-flight frame is requeued.
    pub async fn subscribe_responder(
        self: &Arc<Self>,
        participant: &ParticipantId,
    ) -> SubscriberHandle {
        let lane = Self::lane(&self.responder_lanes, participant).await;
        self.open_session(participant, lane).await
    }

    /// Open an initiator subscription for response notices.
    pub async fn subscribe_initiator(
        self: &Arc<Self>,
        participant: &ParticipantId,
    ) -> SubscriberHandle {
        let lane = Self::lane(&self.initiator_lanes, participant).await;
        self.open_session(participant, lane).await
    }

    async fn open_session(
        self: &Arc<Self>,
        participant: &ParticipantId,
        lane: Arc<Lane>,
    ) -> SubscriberHandle {
        let session_id = SubscriptionId::new();
        let (frames_tx, frames_rx) = mpsc::channel(self.config.channel_capacity);
        let (acks_tx, acks_rx) = mpsc::channel(self.config.channel_capacity);

        {
            let mut session = lane.session.lock().await;
            if let Some(previous) = session.take() {
                debug!(participant = %participant, "replacing subscription session");
                previous.task.abort();
            }
            lane.requeue_in_flight().await;

            let task = tokio::spawn(run_session(
                self.clone(),
                lane.clone(),
                session_id.clone(),
                frames_tx,
                acks_rx,
            ));
            *session = Some(ActiveSession {
                id: session_id.clone(),
                task,
            });
        }

        debug!(participant = %participant, session = %session_id, "subscription opened");
        SubscriberHandle::new(session_id, frames_rx, acks_tx)
    }

    /// Remove every pending or in-flight intent for a relationship, without
    /// finalizing them. Returns the removed intent notices so the lifecycle
    /// engine can record their cancellation before sealing the chain.
    pub async fn cancel_relationship(&self, relationship: &RelationshipId) -> Vec<IntentNotice> {
        let mut removed = Vec::new();

        let responder_lanes: Vec<Arc<Lane>> = {
            let lanes = self.responder_lanes.lock().await;
            lanes.values().cloned().collect()
        };
        for lane in responder_lanes {
            let mut queue = lane.queue.lock().await;
            queue.retain(|item| {
                if item.body.relationship_id() == relationship {
                    if let ItemBody::Intent(notice) = &item.body {
                        removed.push(notice.clone());
                    }
                    false
                } else {
                    true
                }
            });
            drop(queue);
            let mut in_flight = lane.in_flight.lock().await;
            if let Some(item) = in_flight.as_ref() {
                if item.body.relationship_id() == relationship {
                    if let Some(QueuedItem {
                        body: ItemBody::Intent(notice),
                        ..
                    }) = in_flight.take()
                    {
                        removed.push(notice);
                    }
                }
            }
        }

        let initiator_lanes: Vec<Arc<Lane>> = {
            let lanes = self.initiator_lanes.lock().await;
            lanes.values().cloned().collect()
        };
        for lane in initiator_lanes {
            lane.queue
                .lock()
                .await
                .retain(|item| item.body.relationship_id() != relationship);
        }

        removed
    }

    /// Abort every session and requeue all in-flight frames.
    pub async fn shutdown(&self) {
        for lanes in [&self.responder_lanes, &self.initiator_lanes] {
            let lanes: Vec<Arc<Lane>> = lanes.lock().await.values().cloned().collect();
            for lane in lanes {
                let mut session = lane.session.lock().await;
                if let Some(active) = session.take() {
                    active.task.abort();
                }
                drop(session);
                lane.requeue_in_flight().await;
            }
        }
    }

    pub async fn stats(&self) -> DeliveryStats {
        let mut stats = DeliveryStats::default();
        {
            let lanes = self.responder_lanes.lock().await;
            for lane in lanes.values() {
                if lane.session.lock().await.is_some() {
                    stats.responder_sessions += 1;
                }
                stats.pending_intents += lane.queue.lock().await.len() as u64;
            }
        }
        {
            let lanes = self.initiator_lanes.lock().await;
            for lane in lanes.values() {
                if lane.session.lock().await.is_some() {
                    stats.initiator_sessions += 1;
                }
                stats.pending_responses += lane.queue.lock().await.len() as u64;
            }
        }
        stats
    }

    /// Record the terminal failure of an intent that could not be delivered,
    /// and tell the initiator.
    async fn finalize_timed_out(&self, notice: IntentNotice) {
        let relationship_id = notice.relationship_id.clone();
        let _guard = self.locks.acquire(&relationship_id).await;

        let record = match self.store.get(&relationship_id).await {
            Ok(Some(record)) if record.is_active() => record,
            Ok(_) => {
                debug!(relationship_id = %relationship_id, "skipping finalization, relationship gone or closed");
                return;
            }
            Err(e) => {
                warn!(relationship_id = %relationship_id, error = %e, "finalization load failed");
                return;
            }
        };

        let outcome = ResponseOutcome::Rejected {
            reason: "delivery_timeout".to_string(),
        };
        let payload = EventPayload::ResponseRecorded {
            intent_sequence: notice.sequence,
            outcome: outcome.clone(),
            data: serde_json::Value::Null,
        };
        let effects = AppendEffects {
            touch_activity: true,
            stat: StatBump::Response,
            ..Default::default()
        };
        if let Err(e) = append_sealed(
            self.store.as_ref(),
            &self.chain_key,
            &relationship_id,
            Utc::now(),
            payload,
            effects,
        )
        .await
        {
            warn!(relationship_id = %relationship_id, error = %e, "failed to record delivery timeout");
            return;
        }

        warn!(
            relationship_id = %relationship_id,
            sequence = notice.sequence,
            "intent finalized after delivery timeout"
        );

        self.push_response(
            &record.initiator,
            ResponseNotice {
                relationship_id,
                intent_sequence: notice.sequence,
                outcome,
                data: serde_json::Value::Null,
            },
        )
        .await;
    }
}

enum AckWait {
    Acked,
    TimedOut,
    Gone,
}

async fn wait_for_ack(
    acks_rx: &mut mpsc::Receiver<AckFrame>,
    delivery_id: u64,
    ack_timeout: Duration,
    outstanding_heartbeats: &mut u32,
) -> AckWait {
    let deadline = Instant::now() + ack_timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return AckWait::TimedOut;
        }
        match tokio::time::timeout(remaining, acks_rx.recv()).await {
            Err(_) => return AckWait::TimedOut,
            Ok(None) => return AckWait::Gone,
            Ok(Some(ack)) => {
                *outstanding_heartbeats = 0;
                if ack.delivery_id == delivery_id {
                    return AckWait::Acked;
                }
                // Stale ack from a requeued or heartbeat frame.
            }
        }
    }
}

async fn run_session(
    hub: Arc<DeliveryHub>,
    lane: Arc<Lane>,
    session_id: SubscriptionId,
    frames_tx: mpsc::Sender<DeliveryFrame>,
    mut acks_rx: mpsc::Receiver<AckFrame>,
) {
    let ack_timeout = Duration::from_secs(hub.config.ack_timeout_secs);
    let mut heartbeat = interval(Duration::from_secs(hub.config.heartbeat_interval_secs));
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut outstanding_heartbeats = 0u32;

    'session: loop {
        // Drain the lane before sleeping.
        loop {
            let item = lane.queue.lock().await.pop_front();
            let Some(item) = item else { break };

            *lane.in_flight.lock().await = Some(item.clone());
            let delivery_id = hub.allocate_delivery_id();
            if frames_tx.send(item.body.to_frame(delivery_id)).await.is_err() {
                lane.requeue_in_flight().await;
                break 'session;
            }

            match wait_for_ack(
                &mut acks_rx,
                delivery_id,
                ack_timeout,
                &mut outstanding_heartbeats,
            )
            .await
            {
                AckWait::Acked => {
                    // A cancellation may have already taken the slot.
                    lane.in_flight.lock().await.take();
                }
                AckWait::TimedOut => {
                    let taken = lane.in_flight.lock().await.take();
                    if let Some(mut item) = taken {
                        item.attempts += 1;
                        if item.attempts >= 2 {
                            match item.body {
                                ItemBody::Intent(notice) => {
                                    hub.finalize_timed_out(notice).await;
                                }
                                ItemBody::Response(notice) => {
                                    warn!(
                                        relationship_id = %notice.relationship_id,
                                        intent_sequence = notice.intent_sequence,
                                        "dropping response notice after repeated ack timeouts"
                                    );
                                }
                            }
                        } else {
                            debug!(session = %session_id, "ack timeout, requeueing frame once");
                            lane.queue.lock().await.push_front(item);
                        }
                    }
                }
                AckWait::Gone => {
                    lane.requeue_in_flight().await;
                    break 'session;
                }
            }
        }

        tokio::select! {
            _ = lane.notify.notified() => {}
            _ = heartbeat.tick() => {
                if outstanding_heartbeats >= 2 {
                    warn!(session = %session_id, "two heartbeats unanswered, closing session");
                    break 'session;
                }
                let delivery_id = hub.allocate_delivery_id();
                if frames_tx.send(DeliveryFrame::Heartbeat { delivery_id }).await.is_err() {
                    break 'session;
                }
                outstanding_heartbeats += 1;
            }
            ack = acks_rx.recv() => {
                match ack {
                    Some(_) => outstanding_heartbeats = 0,
                    None => break 'session,
                }
            }
        }
    }

    lane.requeue_in_flight().await;
    let mut session = lane.session.lock().await;
    if session.as_ref().map(|s| s.id == session_id).unwrap_or(false) {
        *session = None;
    }
}
