//! Frames exchanged with subscription sessions.
//!
//! Subscribers pull frames from a bounded channel and acknowledge each one
//! by delivery identifier; they may send a response frame at any later time
//! through the broker's `respond` verb.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use accord_types::{
    Constraints, IntentKind, RelationshipId, ResponseOutcome, SubscriptionId, TimeWindow,
};

use crate::DeliveryError;

/// What a responder sees for an admitted intent.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IntentNotice {
    pub relationship_id: RelationshipId,
    /// Sequence of the `intent_admitted` event; responses reference it.
    pub sequence: u64,
    pub kind: IntentKind,
    pub context: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    pub constraints: Constraints,
    pub window: TimeWindow,
}

/// What an initiator sees for a recorded response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResponseNotice {
    pub relationship_id: RelationshipId,
    pub intent_sequence: u64,
    pub outcome: ResponseOutcome,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// One push on a subscription stream. Every frame expects an ack within the
/// acknowledgment timeout.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum DeliveryFrame {
    Intent {
        delivery_id: u64,
        notice: IntentNotice,
    },
    Response {
        delivery_id: u64,
        notice: ResponseNotice,
    },
    Heartbeat {
        delivery_id: u64,
    },
}

impl DeliveryFrame {
    pub fn delivery_id(&self) -> u64 {
        match self {
            DeliveryFrame::Intent { delivery_id, .. }
            | DeliveryFrame::Response { delivery_id, .. }
            | DeliveryFrame::Heartbeat { delivery_id } => *delivery_id,
        }
    }
}

/// Acknowledgment of a received frame.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct AckFrame {
    pub delivery_id: u64,
}

/// Subscriber end of a session: a frame stream plus an ack channel.
pub struct SubscriberHandle {
    pub session_id: SubscriptionId,
    pub frames: mpsc::Receiver<DeliveryFrame>,
    acks: mpsc::Sender<AckFrame>,
}

impl SubscriberHandle {
    pub(crate) fn new(
        session_id: SubscriptionId,
        frames: mpsc::Receiver<DeliveryFrame>,
        acks: mpsc::Sender<AckFrame>,
    ) -> Self {
        Self {
            session_id,
            frames,
            acks,
        }
    }

    /// Acknowledge a frame by its delivery identifier.
    pub async fn ack(&self, delivery_id: u64) -> Result<(), DeliveryError> {
        self.acks
            .send(AckFrame { delivery_id })
            .await
            .map_err(|_| DeliveryError::SessionClosed)
    }
}
