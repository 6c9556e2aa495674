//! Intent-kind-specific content rules (the safety filter of the admission
//! pipeline).
//!
//! Two failure classes come out of here: benign shortfalls (missing fields,
//! explanation too short) and safety violations (forbidden tokens, numeric
//! parameter caps), which are misuse signals and recorded as breach
//! attempts.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use accord_types::Intent;

/// Declarative content rules for one intent kind.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ContentRules {
    /// Minimum length of the explanatory text.
    pub min_explanation_len: usize,
    /// Case-insensitive substrings that must not appear anywhere in the
    /// explanatory text or context values.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub forbidden_tokens: Vec<String>,
    /// Context keys that must be present.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_fields: Vec<String>,
    /// Upper bounds on numeric context values, keyed by context key.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameter_caps: BTreeMap<String, f64>,
}

/// Result of filtering an intent against [`ContentRules`].
#[derive(Clone, Debug, PartialEq)]
pub enum ContentVerdict {
    Pass,
    /// Benign shortfall; a corrected resubmission may pass.
    Rejected { detail: String },
    /// Safety violation; recorded as a breach attempt.
    Violation { detail: String },
}

impl ContentRules {
    /// Apply the rules to an intent. Violations are checked before benign
    /// shortfalls so a message that trips both is classified as a breach.
    pub fn check(&self, intent: &Intent) -> ContentVerdict {
        let text = intent.explanatory_text();
        let haystack = text.to_lowercase();

        for token in &self.forbidden_tokens {
            let needle = token.to_lowercase();
            if haystack.contains(&needle) || self.context_contains(intent, &needle) {
                return ContentVerdict::Violation {
                    detail: format!("forbidden token '{token}'"),
                };
            }
        }

        for (key, cap) in &self.parameter_caps {
            if let Some(value) = intent.context.get(key).and_then(|v| v.as_f64()) {
                if value > *cap {
                    return ContentVerdict::Violation {
                        detail: format!("parameter '{key}' ({value}) exceeds cap ({cap})"),
                    };
                }
            }
        }

        for field in &self.required_fields {
            if !intent.context.contains_key(field) {
                return ContentVerdict::Rejected {
                    detail: format!("missing required field '{field}'"),
                };
            }
        }

        if text.chars().count() < self.min_explanation_len {
            return ContentVerdict::Rejected {
                detail: format!(
                    "explanation shorter than {} characters",
                    self.min_explanation_len
                ),
            };
        }

        ContentVerdict::Pass
    }

    fn context_contains(&self, intent: &Intent, needle: &str) -> bool {
        intent.context.values().any(|value| {
            value
                .as_str()
                .map(|s| s.to_lowercase().contains(needle))
                .unwrap_or(false)
        })
    }
}
