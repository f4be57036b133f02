//! Core data models for chatshield.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Result, ShieldError};

/// An outbound chat message as seen by the moderation engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub text: String,
    pub user_id: String,
    pub chat_id: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Create a message stamped with the current time.
    pub fn new(
        user_id: impl Into<String>,
        chat_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self::at(user_id, chat_id, text, Utc::now())
    }

    /// Create a message with an explicit timestamp.
    pub fn at(
        user_id: impl Into<String>,
        chat_id: impl Into<String>,
        text: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            text: text.into(),
            user_id: user_id.into(),
            chat_id: chat_id.into(),
            timestamp,
        }
    }

    /// Reject messages that cannot be attributed or carry no content.
    pub fn validate(&self) -> Result<()> {
        if self.user_id.trim().is_empty() {
            return Err(ShieldError::InvalidInput("user_id is empty".to_string()));
        }
        if self.chat_id.trim().is_empty() {
            return Err(ShieldError::InvalidInput("chat_id is empty".to_string()));
        }
        if self.text.trim().is_empty() {
            return Err(ShieldError::InvalidInput("message text is empty".to_string()));
        }
        Ok(())
    }
}

/// Kind of conversation a message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatType {
    #[default]
    General,
    Booking,
    Support,
}

impl ChatType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::General => "general",
            Self::Booking => "booking",
            Self::Support => "support",
        }
    }
}

/// Severity of a filter verdict or violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

/// Why the content filter rejected a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterReason {
    RateLimit,
    PhoneNumber,
    Profanity,
    BlockedWord,
    Spam,
}

impl FilterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimit => "rate_limit",
            Self::PhoneNumber => "phone_number",
            Self::Profanity => "profanity",
            Self::BlockedWord => "blocked_word",
            Self::Spam => "spam",
        }
    }
}

/// Verdict of the content filter for a single message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentFilterResult {
    pub is_allowed: bool,
    pub reason: Option<FilterReason>,
    pub severity: Severity,
    /// Redacted copy of the message, present when something was masked.
    pub filtered_content: Option<String>,
    pub warning: Option<String>,
    pub suggestions: Vec<String>,
}

impl ContentFilterResult {
    /// A passing verdict.
    pub fn allowed() -> Self {
        Self {
            is_allowed: true,
            reason: None,
            severity: Severity::Low,
            filtered_content: None,
            warning: None,
            suggestions: Vec::new(),
        }
    }

    /// A rejecting verdict.
    pub fn rejected(
        reason: FilterReason,
        severity: Severity,
        warning: impl Into<String>,
        suggestions: &[&str],
    ) -> Self {
        Self {
            is_allowed: false,
            reason: Some(reason),
            severity,
            filtered_content: None,
            warning: Some(warning.into()),
            suggestions: suggestions.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn with_filtered_content(mut self, content: String) -> Self {
        self.filtered_content = Some(content);
        self
    }

    /// Whether a caller may offer "send anyway" for this verdict.
    ///
    /// Never true for high severity rejections.
    pub fn allows_override(&self) -> bool {
        !self.is_allowed && self.severity != Severity::High
    }
}

/// Which split-detection strategy produced a detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionType {
    NumericSplit,
    TextSplit,
    MixedPattern,
    SocialMediaSplit,
}

impl DetectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NumericSplit => "numeric_split",
            Self::TextSplit => "text_split",
            Self::MixedPattern => "mixed_pattern",
            Self::SocialMediaSplit => "social_media_split",
        }
    }
}

/// A phone number or handle reconstructed from several messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitPhoneDetection {
    pub messages: Vec<String>,
    pub reconstructed_number: String,
    pub confidence: f64,
    pub detection_type: DetectionType,
    pub timespan_minutes: f64,
    pub is_high_risk: bool,
    pub detected_at: DateTime<Utc>,
}

/// Category of a recorded violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationType {
    PhoneNumber,
    SplitPhoneAttempt,
    Spam,
    Profanity,
    Inappropriate,
}

impl ViolationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PhoneNumber => "phone_number",
            Self::SplitPhoneAttempt => "split_phone_attempt",
            Self::Spam => "spam",
            Self::Profanity => "profanity",
            Self::Inappropriate => "inappropriate",
        }
    }

    /// Contact-sharing violations count toward the 24h attempt signal.
    pub fn is_contact_attempt(&self) -> bool {
        matches!(self, Self::PhoneNumber | Self::SplitPhoneAttempt)
    }
}

impl From<FilterReason> for ViolationType {
    fn from(reason: FilterReason) -> Self {
        match reason {
            FilterReason::PhoneNumber => Self::PhoneNumber,
            FilterReason::Profanity => Self::Profanity,
            FilterReason::BlockedWord => Self::Inappropriate,
            FilterReason::RateLimit | FilterReason::Spam => Self::Spam,
        }
    }
}

/// Append-only ledger entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViolationRecord {
    pub id: String,
    pub user_id: String,
    pub chat_id: String,
    pub violation_type: ViolationType,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
    pub details: String,
    /// Truncated SHA-256 of the offending text; the text itself is not kept.
    pub content_hash: Option<String>,
    pub resolved: bool,
}

/// A violation event handed to the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewViolation {
    pub user_id: String,
    pub chat_id: String,
    pub violation_type: ViolationType,
    pub severity: Severity,
    pub details: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl NewViolation {
    pub fn new(
        user_id: impl Into<String>,
        chat_id: impl Into<String>,
        violation_type: ViolationType,
        severity: Severity,
        details: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            chat_id: chat_id.into(),
            violation_type,
            severity,
            details: details.into(),
            content: None,
            timestamp: None,
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// Account-level risk classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Safe,
    Warning,
    Danger,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Safe => "safe",
            Self::Warning => "warning",
            Self::Danger => "danger",
            Self::Critical => "critical",
        }
    }
}

/// Restrictions derived from a profile's risk level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Restrictions {
    pub chat_disabled: bool,
    pub booking_restricted: bool,
    pub account_flagged: bool,
}

/// Per-user violation summary, always recomputed from the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserViolationProfile {
    pub user_id: String,
    pub total_messages: u64,
    pub total_violations: u64,
    pub violation_percentage: u8,
    pub recent_attempts: u32,
    pub risk_level: RiskLevel,
    /// Danger-level profile past the final-warning cutoff.
    pub final_warning: bool,
    pub chat_deactivated: bool,
    pub last_violation_time: Option<DateTime<Utc>>,
    /// Most recent records, newest first.
    pub violation_history: Vec<ViolationRecord>,
    pub restrictions: Restrictions,
}

/// Risk level of repeated split attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircumventionRiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// What the caller should do about a risk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    Warn,
    Restrict,
    Block,
    Escalate,
}

impl From<CircumventionRiskLevel> for RecommendedAction {
    fn from(level: CircumventionRiskLevel) -> Self {
        match level {
            CircumventionRiskLevel::Low => Self::Warn,
            CircumventionRiskLevel::Medium => Self::Restrict,
            CircumventionRiskLevel::High => Self::Block,
            CircumventionRiskLevel::Critical => Self::Escalate,
        }
    }
}

/// Assessment of a user's split-attempt history over the last 24 hours.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircumventionAlert {
    pub user_id: String,
    pub attempt_count: u32,
    pub risk_level: CircumventionRiskLevel,
    pub detection_history: Vec<SplitPhoneDetection>,
    pub recommended_action: RecommendedAction,
}

impl CircumventionAlert {
    /// High and critical circumvention risk blocks the send.
    pub fn blocks_send(&self) -> bool {
        self.risk_level >= CircumventionRiskLevel::High
    }
}

/// Short, stable digest of message content for the ledger.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    let result = hasher.finalize();
    hex::encode(&result[..8])
}
