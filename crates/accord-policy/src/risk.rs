//! Deterministic risk scoring for the final admission check.
//!
//! The score is computed from a fixed set of signals so it is reproducible
//! from the event log alone: the firing signal names are recorded in the
//! rejection payload, and the weights live here in configuration.

use chrono::Duration;
use serde::{Deserialize, Serialize};

use accord_types::{Constraints, TrustLevel};

/// Weight subtracted from the score for each firing signal.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct RiskWeights {
    pub brief_explanation: f64,
    pub recent_rejections: f64,
    pub constraints_excessive: f64,
    pub first_contact_probation: f64,
    /// Weight 1.0 guarantees an overloaded responder always rejects.
    pub responder_overloaded: f64,
}

impl Default for RiskWeights {
    fn default() -> Self {
        Self {
            brief_explanation: 0.3,
            recent_rejections: 0.25,
            constraints_excessive: 0.25,
            first_contact_probation: 0.15,
            responder_overloaded: 1.0,
        }
    }
}

/// Risk-scoring configuration. Defaults are fixed constants so scores stay
/// reproducible across deployments that do not override them.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RiskConfig {
    pub weights: RiskWeights,
    /// Minimum score required per trust level (index 0-5).
    pub thresholds: [f64; 6],
    /// Explanatory text below this length fires `brief_explanation`.
    pub min_explanation_len: usize,
    /// How many trailing events to scan for rejections.
    pub recent_window: usize,
    /// Relationships younger than this are in first-contact probation.
    pub probation_secs: i64,
    /// Constraint caps; exceeding any fires `constraints_excessive`.
    pub max_retries_cap: u32,
    pub priority_cap: u8,
    pub deadline_horizon_hours: i64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            weights: RiskWeights::default(),
            thresholds: [0.9, 0.8, 0.7, 0.6, 0.5, 0.4],
            min_explanation_len: 8,
            recent_window: 10,
            probation_secs: 3600,
            max_retries_cap: 5,
            priority_cap: 8,
            deadline_horizon_hours: 24 * 7,
        }
    }
}

impl RiskConfig {
    pub fn threshold_for(&self, level: TrustLevel) -> f64 {
        self.thresholds[usize::from(level.0.min(5))]
    }

    /// Whether declared constraints exceed the conservative caps.
    pub fn constraints_excessive(
        &self,
        constraints: &Constraints,
        now: chrono::DateTime<chrono::Utc>,
    ) -> bool {
        if constraints.max_retries > self.max_retries_cap {
            return true;
        }
        if constraints.priority > self.priority_cap {
            return true;
        }
        if let Some(deadline) = constraints.deadline {
            if deadline > now + Duration::hours(self.deadline_horizon_hours) {
                return true;
            }
        }
        false
    }
}

/// The deterministic signals feeding one admission's risk score.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct RiskSignals {
    pub brief_explanation: bool,
    pub recent_rejections: bool,
    pub constraints_excessive: bool,
    pub first_contact_probation: bool,
    pub responder_overloaded: bool,
}

impl RiskSignals {
    /// Names of the firing signals, recorded in rejection payloads.
    pub fn firing(&self) -> Vec<String> {
        let mut names = Vec::new();
        if self.brief_explanation {
            names.push("brief_explanation".to_string());
        }
        if self.recent_rejections {
            names.push("recent_rejections".to_string());
        }
        if self.constraints_excessive {
            names.push("constraints_excessive".to_string());
        }
        if self.first_contact_probation {
            names.push("first_contact_probation".to_string());
        }
        if self.responder_overloaded {
            names.push("responder_overloaded".to_string());
        }
        names
    }

    /// Score in [0.0, 1.0]: start at 1.0, subtract the weight of each firing
    /// signal, clamp at zero.
    pub fn score(&self, weights: &RiskWeights) -> f64 {
        let mut score = 1.0;
        if self.brief_explanation {
            score -= weights.brief_explanation;
        }
        if self.recent_rejections {
            score -= weights.recent_rejections;
        }
        if self.constraints_excessive {
            score -= weights.constraints_excessive;
        }
        if self.first_contact_probation {
            score -= weights.first_contact_probation;
        }
        if self.responder_overloaded {
            score -= weights.responder_overloaded;
        }
        score.max(0.0)
    }
}
