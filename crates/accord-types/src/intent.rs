//! Intents and responses - the two message kinds exchanged on a
//! relationship.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{IntentId, IntentKind, ParticipantId, RelationshipId, Signature};

/// Optional execution window declared on an intent. Either bound may be
/// absent, meaning "immediately" / "no upper bound".
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeWindow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_after: Option<DateTime<Utc>>,
}

impl TimeWindow {
    /// Immediate execution, no bounds.
    pub fn immediate() -> Self {
        Self::default()
    }

    /// A window from now running for the given number of seconds.
    pub fn from_now_secs(secs: i64) -> Self {
        let now = Utc::now();
        Self {
            not_before: Some(now),
            not_after: Some(now + Duration::seconds(secs)),
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        if let Some(start) = self.not_before {
            if at < start {
                return false;
            }
        }
        if let Some(end) = self.not_after {
            if at > end {
                return false;
            }
        }
        true
    }
}

/// Caller-declared execution constraints.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Constraints {
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    /// 0 (lowest) to 9 (highest).
    pub priority: u8,
}

impl Default for Constraints {
    fn default() -> Self {
        Self {
            max_retries: 3,
            deadline: None,
            priority: 5,
        }
    }
}

/// A single inbound message on a relationship.
///
/// An intent is ephemeral: it either becomes one `intent_admitted` event
/// (possibly followed later by `response_recorded`) or one rejection event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Intent {
    pub id: IntentId,
    pub relationship_id: RelationshipId,
    pub kind: IntentKind,
    #[serde(default)]
    pub window: TimeWindow,
    /// Free-form machine-readable context.
    pub context: BTreeMap<String, serde_json::Value>,
    /// Human-readable rationale accompanying the context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    #[serde(default)]
    pub constraints: Constraints,
    pub sender: ParticipantId,
    #[serde(skip)]
    pub signature: Signature,
}

impl Intent {
    /// The text the content filter and risk scorer measure: the explanation
    /// when present, the serialized context otherwise.
    pub fn explanatory_text(&self) -> String {
        match &self.explanation {
            Some(text) => text.clone(),
            None => serde_json::to_string(&self.context).unwrap_or_default(),
        }
    }
}

/// Outcome carried by a response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ResponseOutcome {
    /// Interim acknowledgment; the intent is not yet finalized.
    Accepted,
    /// Terminal success.
    Completed,
    /// Terminal refusal.
    Rejected { reason: String },
}

impl ResponseOutcome {
    /// Whether this outcome finalizes the intent.
    pub fn is_final(&self) -> bool {
        !matches!(self, ResponseOutcome::Accepted)
    }
}

/// A responder-originated reply to a previously admitted intent.
///
/// Responses never increment the relationship depth.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Response {
    pub relationship_id: RelationshipId,
    /// Sequence number of the `intent_admitted` event being answered.
    pub intent_sequence: u64,
    pub outcome: ResponseOutcome,
    #[serde(default)]
    pub data: serde_json::Value,
    pub sender: ParticipantId,
    #[serde(skip)]
    pub signature: Signature,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn immediate_window_contains_any_time() {
        let window = TimeWindow::immediate();
        assert!(window.contains(Utc::now()));
        assert!(window.contains(Utc::now() + Duration::days(365)));
    }

    #[test]
    fn bounded_window_excludes_outside() {
        let now = Utc::now();
        let window = TimeWindow {
            not_before: Some(now),
            not_after: Some(now + Duration::minutes(5)),
        };
        assert!(window.contains(now));
        assert!(window.contains(now + Duration::minutes(5)));
        assert!(!window.contains(now - Duration::seconds(1)));
        assert!(!window.contains(now + Duration::minutes(6)));
    }

    #[test]
    fn explanatory_text_prefers_explanation() {
        let mut context = BTreeMap::new();
        context.insert("room".to_string(), serde_json::json!("kitchen"));

        let mut intent = Intent {
            id: IntentId::generate(),
            relationship_id: RelationshipId::generate(),
            kind: IntentKind::new("greet"),
            window: TimeWindow::immediate(),
            context,
            explanation: Some("good morning".to_string()),
            constraints: Constraints::default(),
            sender: ParticipantId::new("p1"),
            signature: Signature::empty(),
        };
        assert_eq!(intent.explanatory_text(), "good morning");

        intent.explanation = None;
        assert!(intent.explanatory_text().contains("kitchen"));
    }

    #[test]
    fn accepted_outcome_is_not_final() {
        assert!(!ResponseOutcome::Accepted.is_final());
        assert!(ResponseOutcome::Completed.is_final());
        assert!(ResponseOutcome::Rejected {
            reason: "busy".to_string()
        }
        .is_final());
    }
}
