//! Escalation policy: what to show a user at each risk level.

use serde::{Deserialize, Serialize};

use crate::models::{RecommendedAction, RiskLevel, UserViolationProfile};

/// Seconds before an info advisory disappears on its own.
pub const INFO_AUTO_DISMISS_SECS: u64 = 10;

const SAFE_MESSAGE: &str = "✅ Your chat is in good standing";
const WARNING_MESSAGE: &str = "⚠️ WARNING - Repeated policy violations detected";
const DANGER_MESSAGE: &str =
    "⛔ DANGER - Sharing personal contact information is STRICTLY FORBIDDEN";
const FINAL_WARNING_MESSAGE: &str =
    "🚨 FINAL WARNING - One more violation will deactivate your chat permanently";
const CRITICAL_MESSAGE: &str = "🚫 CHAT DEACTIVATED - Multiple serious policy violations detected";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdvisorySeverity {
    Info,
    Warning,
    Danger,
    Critical,
}

/// A user-facing notice derived from a risk level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advisory {
    pub message: String,
    pub severity: AdvisorySeverity,
    pub show_percentage: bool,
    pub can_dismiss: bool,
    /// Only info advisories expire on their own.
    pub auto_dismiss_after: Option<u64>,
    pub recommended_action: Option<RecommendedAction>,
}

/// Map a risk level to its advisory.
pub fn advise(risk_level: RiskLevel) -> Advisory {
    match risk_level {
        RiskLevel::Safe => Advisory {
            message: SAFE_MESSAGE.to_string(),
            severity: AdvisorySeverity::Info,
            show_percentage: false,
            can_dismiss: true,
            auto_dismiss_after: Some(INFO_AUTO_DISMISS_SECS),
            recommended_action: None,
        },
        RiskLevel::Warning => Advisory {
            message: WARNING_MESSAGE.to_string(),
            severity: AdvisorySeverity::Warning,
            show_percentage: true,
            can_dismiss: true,
            auto_dismiss_after: None,
            recommended_action: Some(RecommendedAction::Warn),
        },
        RiskLevel::Danger => Advisory {
            message: DANGER_MESSAGE.to_string(),
            severity: AdvisorySeverity::Danger,
            show_percentage: true,
            can_dismiss: true,
            auto_dismiss_after: None,
            recommended_action: Some(RecommendedAction::Restrict),
        },
        RiskLevel::Critical => Advisory {
            message: CRITICAL_MESSAGE.to_string(),
            severity: AdvisorySeverity::Critical,
            show_percentage: true,
            can_dismiss: false,
            auto_dismiss_after: None,
            recommended_action: Some(RecommendedAction::Escalate),
        },
    }
}

/// Advisory for a profile, using the final-warning copy past that cutoff.
pub fn advise_profile(profile: &UserViolationProfile) -> Advisory {
    let mut advisory = advise(profile.risk_level);
    if profile.final_warning && profile.risk_level == RiskLevel::Danger {
        advisory.message = FINAL_WARNING_MESSAGE.to_string();
    }
    advisory
}
