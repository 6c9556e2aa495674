//! ACCORD Policy - the declarative rules that govern intent admission.
//!
//! Policies are rows keyed by `(intent kind, trust level)`. The registry is
//! effectively immutable at runtime: it is populated before the broker
//! starts serving and readers take no lock. Every admission path looks up a
//! single entry; there are no intent-kind strings scattered across code
//! paths.

#![deny(unsafe_code)]

pub mod content;
pub mod risk;

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use accord_types::{IntentKind, ParticipantId, TrustLevel};

pub use content::{ContentRules, ContentVerdict};
pub use risk::{RiskConfig, RiskSignals, RiskWeights};

/// How the appointment window is enforced for an intent kind.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentMode {
    /// No appointment requirement; appointment-based relationships still get
    /// the lenient (grace) check.
    #[default]
    None,
    /// Window plus the configured grace period on both sides; admissions in
    /// the grace margin are tagged.
    GracePeriod,
    /// Window to the second; violations are breach attempts. Requires an
    /// appointment-based relationship.
    Strict,
}

impl AppointmentMode {
    /// Whether this mode refuses activity-based relationships outright.
    pub fn requires_appointment(&self) -> bool {
        matches!(self, AppointmentMode::Strict)
    }
}

/// One policy row: the declarative admission rules for an intent kind at a
/// trust level.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PolicyEntry {
    /// Relationships below this trust level cannot carry the intent kind.
    pub trust_floor: TrustLevel,
    pub appointment: AppointmentMode,
    /// Admission requires a positive consent entry in the relationship's
    /// context snapshot.
    pub requires_consent: bool,
    pub content: ContentRules,
    /// Breach attempts for this kind are raised on the oversight channel.
    pub oversight_on_breach: bool,
    /// Events for this kind are marked for retention under legal hold.
    pub legal_hold: bool,
    /// Version recorded on every event this entry admits.
    pub version: u32,
}

impl PolicyEntry {
    /// A permissive entry: trust floor 0, no appointment requirement, no
    /// consent, default content rules.
    pub fn permissive() -> Self {
        Self {
            trust_floor: TrustLevel::MIN,
            appointment: AppointmentMode::None,
            requires_consent: false,
            content: ContentRules::default(),
            oversight_on_breach: false,
            legal_hold: false,
            version: 1,
        }
    }

    pub fn with_trust_floor(mut self, floor: TrustLevel) -> Self {
        self.trust_floor = floor;
        self
    }

    pub fn with_appointment(mut self, mode: AppointmentMode) -> Self {
        self.appointment = mode;
        self
    }

    pub fn with_consent_required(mut self) -> Self {
        self.requires_consent = true;
        self
    }

    pub fn with_content(mut self, content: ContentRules) -> Self {
        self.content = content;
        self
    }

    pub fn with_oversight(mut self) -> Self {
        self.oversight_on_breach = true;
        self
    }

    pub fn with_legal_hold(mut self) -> Self {
        self.legal_hold = true;
        self
    }
}

/// Result of a policy lookup.
#[derive(Clone, Debug)]
pub enum PolicyLookup<'a> {
    /// The entry at the requested level, or the nearest lower level.
    Entry(&'a PolicyEntry),
    /// The intent kind is not registered at all; admission is denied.
    UnregisteredKind,
    /// The kind is registered, but only above the requested trust level.
    NoEntryAtLevel,
}

/// The policy registry. Populated at startup, read-only afterwards.
pub struct PolicyRegistry {
    entries: HashMap<IntentKind, BTreeMap<u8, PolicyEntry>>,
    /// Explicit trust grants for participant pairs, keyed
    /// `(initiator, responder)`.
    trust_grants: HashMap<(ParticipantId, ParticipantId), TrustLevel>,
    /// Trust level assigned to pairs without an explicit grant; `None`
    /// denies establishment outright.
    default_trust: Option<TrustLevel>,
    risk: RiskConfig,
}

impl PolicyRegistry {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            trust_grants: HashMap::new(),
            default_trust: Some(TrustLevel::new(1)),
            risk: RiskConfig::default(),
        }
    }

    /// Register a policy entry for an intent kind at a trust level.
    ///
    /// Rejects contradictory definitions: an entry whose trust floor lies
    /// above the level it is registered at could never admit anything, and
    /// an empty forbidden token would block every intent.
    pub fn register(
        &mut self,
        kind: IntentKind,
        level: TrustLevel,
        entry: PolicyEntry,
    ) -> Result<(), PolicyError> {
        if entry.trust_floor > level {
            return Err(PolicyError::InvalidDefinition(format!(
                "'{kind}': trust floor {} exceeds registration level {level}",
                entry.trust_floor
            )));
        }
        if entry.content.forbidden_tokens.iter().any(|t| t.is_empty()) {
            return Err(PolicyError::InvalidDefinition(format!(
                "'{kind}': empty forbidden token matches everything"
            )));
        }
        self.entries.entry(kind).or_default().insert(level.0, entry);
        Ok(())
    }

    /// Register the same entry at the entry's own trust floor. Convenience
    /// for single-row kinds.
    pub fn register_kind(&mut self, kind: IntentKind, entry: PolicyEntry) -> Result<(), PolicyError> {
        let level = entry.trust_floor;
        self.register(kind, level, entry)
    }

    /// Grant a fixed trust level to a directional participant pair.
    pub fn grant_trust(
        &mut self,
        initiator: ParticipantId,
        responder: ParticipantId,
        level: TrustLevel,
    ) {
        self.trust_grants.insert((initiator, responder), level);
    }

    /// Set (or clear) the trust level assigned to ungranted pairs.
    pub fn set_default_trust(&mut self, level: Option<TrustLevel>) {
        self.default_trust = level;
    }

    pub fn set_risk(&mut self, risk: RiskConfig) {
        self.risk = risk;
    }

    pub fn risk(&self) -> &RiskConfig {
        &self.risk
    }

    /// Look up the policy entry for `(kind, level)`.
    ///
    /// On a miss at the exact level, the entry for the nearest lower trust
    /// level applies. An unregistered kind denies admission.
    pub fn lookup(&self, kind: &IntentKind, level: TrustLevel) -> PolicyLookup<'_> {
        let Some(by_level) = self.entries.get(kind) else {
            return PolicyLookup::UnregisteredKind;
        };
        match by_level.range(..=level.0).next_back() {
            Some((_, entry)) => PolicyLookup::Entry(entry),
            None => PolicyLookup::NoEntryAtLevel,
        }
    }

    /// Trust level the admission policy assigns to a new relationship
    /// between this pair, or `None` if policy denies establishment.
    pub fn assign_trust(
        &self,
        initiator: &ParticipantId,
        responder: &ParticipantId,
    ) -> Option<TrustLevel> {
        self.trust_grants
            .get(&(initiator.clone(), responder.clone()))
            .copied()
            .or(self.default_trust)
    }
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Policy-related errors.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("invalid policy definition: {0}")]
    InvalidDefinition(String),
}
