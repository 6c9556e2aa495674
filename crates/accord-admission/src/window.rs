//! Timebox and appointment-window enforcement (pipeline step 4).

use chrono::{DateTime, Duration, Utc};

use accord_policy::AppointmentMode;
use accord_types::{Relationship, TimeboxPolicy};

/// Outcome of the window check.
#[derive(Clone, Debug, PartialEq)]
pub enum WindowVerdict {
    Ok {
        /// Admitted inside the grace margin of an appointment window.
        within_grace: bool,
    },
    /// Activity-based timebox ran out; the relationship auto-closes.
    Expired,
    /// Outside an appointment window. Strict-policy violations are breach
    /// attempts; lenient ones are benign rejections.
    OutsideWindow { breach: bool, detail: String },
}

/// Evaluate the relationship's timebox at `now` under the policy's
/// appointment mode.
///
/// Boundary semantics: an activity timebox admits at `expires_at` exactly; a
/// strict appointment admits at `end` exactly and rejects any instant past
/// it.
pub fn check_window(
    record: &Relationship,
    mode: AppointmentMode,
    grace: Duration,
    now: DateTime<Utc>,
) -> WindowVerdict {
    match &record.timebox {
        TimeboxPolicy::ActivityBased { .. } => {
            if mode.requires_appointment() {
                return WindowVerdict::OutsideWindow {
                    breach: false,
                    detail: "intent kind requires an appointment-based relationship".to_string(),
                };
            }
            if now <= record.expires_at {
                WindowVerdict::Ok {
                    within_grace: false,
                }
            } else {
                WindowVerdict::Expired
            }
        }
        TimeboxPolicy::AppointmentBased { start, end } => match mode {
            AppointmentMode::Strict => {
                if *start <= now && now <= *end {
                    WindowVerdict::Ok {
                        within_grace: false,
                    }
                } else {
                    WindowVerdict::OutsideWindow {
                        breach: true,
                        detail: format!("outside strict window [{start}, {end}]"),
                    }
                }
            }
            AppointmentMode::GracePeriod | AppointmentMode::None => {
                if *start - grace <= now && now <= *end + grace {
                    WindowVerdict::Ok {
                        within_grace: now < *start || now > *end,
                    }
                } else {
                    WindowVerdict::OutsideWindow {
                        breach: false,
                        detail: format!(
                            "outside window [{start}, {end}] plus {}s grace",
                            grace.num_seconds()
                        ),
                    }
                }
            }
        },
    }
}
