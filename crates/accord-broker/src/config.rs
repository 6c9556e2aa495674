//! Broker configuration. Every knob has a default; the chain-hashing key is
//! supplied separately at construction and never serialized.

use serde::{Deserialize, Serialize};

use accord_admission::AdmissionConfig;
use accord_delivery::DeliveryConfig;
use accord_lifecycle::LifecycleConfig;

/// Tuning knobs for a broker instance.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Inactivity expiry for activity-based relationships.
    pub default_timebox_hours: u32,
    /// Depth cap applied when a proposal does not set its own.
    pub default_max_depth: u32,
    /// Total deadline for one admission run.
    pub admission_deadline_secs: u64,
    /// How long a subscriber may take to acknowledge a frame.
    pub delivery_ack_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
    /// Bound on each responder's pending-intent queue.
    pub responder_queue_size: usize,
    /// Margin around appointment windows under lenient policy.
    pub grace_period_secs: i64,
    /// Cadence of the expiry sweep.
    pub sweep_interval_secs: u64,
    /// Breach attempts tolerated before auto-close.
    pub breach_close_threshold: u64,
    /// Whether recorded responses push the activity timebox forward.
    pub responses_extend_timebox: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            default_timebox_hours: 24,
            default_max_depth: 5,
            admission_deadline_secs: 2,
            delivery_ack_timeout_secs: 10,
            heartbeat_interval_secs: 5,
            responder_queue_size: 64,
            grace_period_secs: 300,
            sweep_interval_secs: 60,
            breach_close_threshold: 3,
            responses_extend_timebox: false,
        }
    }
}

impl BrokerConfig {
    pub(crate) fn admission(&self) -> AdmissionConfig {
        AdmissionConfig {
            admission_deadline_secs: self.admission_deadline_secs,
            grace_period_secs: self.grace_period_secs,
            breach_close_threshold: self.breach_close_threshold,
            responses_extend_timebox: self.responses_extend_timebox,
        }
    }

    pub(crate) fn delivery(&self) -> DeliveryConfig {
        DeliveryConfig {
            ack_timeout_secs: self.delivery_ack_timeout_secs,
            heartbeat_interval_secs: self.heartbeat_interval_secs,
            queue_size: self.responder_queue_size,
            channel_capacity: 32,
        }
    }

    pub(crate) fn lifecycle(&self) -> LifecycleConfig {
        LifecycleConfig {
            default_timebox_hours: self.default_timebox_hours,
            default_max_depth: self.default_max_depth,
            sweep_interval_secs: self.sweep_interval_secs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let config = BrokerConfig::default();
        assert_eq!(config.default_timebox_hours, 24);
        assert_eq!(config.default_max_depth, 5);
        assert_eq!(config.admission_deadline_secs, 2);
        assert_eq!(config.delivery_ack_timeout_secs, 10);
        assert_eq!(config.responder_queue_size, 64);
        assert_eq!(config.grace_period_secs, 300);
        assert!(!config.responses_extend_timebox);
    }
}
