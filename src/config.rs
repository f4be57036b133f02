//! Configuration loading and runtime-adjustable settings.
//!
//! Filter settings and risk thresholds are read from the environment at
//! startup and can be patched at runtime through [`SettingsUpdate`] and
//! [`ThresholdsUpdate`].

use std::env;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ShieldError};

/// Default cap on messages per user in the trailing rate-limit window.
pub const DEFAULT_MAX_MESSAGES_PER_WINDOW: usize = 10;

/// Default rate-limit window in seconds.
pub const DEFAULT_RATE_LIMIT_WINDOW_SECS: u64 = 60;

/// Default filter-history capacity per user.
pub const DEFAULT_HISTORY_CAPACITY: usize = 50;

/// Content filter settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterSettings {
    pub max_messages_per_window: usize,
    pub rate_limit_window_secs: u64,
    /// Similarity above which two messages count as near-duplicates.
    pub similarity_threshold: f64,
    /// Near-duplicates tolerated inside the similarity window.
    pub max_similar_messages: usize,
    pub similarity_window_secs: u64,
    pub history_capacity: usize,
    /// Admin-managed words, applied even when profanity filtering is off.
    pub blocked_words: Vec<String>,
    pub enable_phone_filter: bool,
    pub enable_profanity_filter: bool,
    pub enable_spam_detection: bool,
    pub enable_rate_limit: bool,
}

impl Default for FilterSettings {
    fn default() -> Self {
        Self {
            max_messages_per_window: DEFAULT_MAX_MESSAGES_PER_WINDOW,
            rate_limit_window_secs: DEFAULT_RATE_LIMIT_WINDOW_SECS,
            similarity_threshold: 0.8,
            max_similar_messages: 3,
            similarity_window_secs: 300,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            blocked_words: Vec::new(),
            enable_phone_filter: true,
            enable_profanity_filter: true,
            enable_spam_detection: true,
            enable_rate_limit: true,
        }
    }
}

impl FilterSettings {
    /// Apply a partial update, returning the merged settings.
    pub fn merged(&self, update: &SettingsUpdate) -> Self {
        let mut next = self.clone();
        if let Some(v) = update.max_messages_per_window {
            next.max_messages_per_window = v;
        }
        if let Some(v) = update.rate_limit_window_secs {
            next.rate_limit_window_secs = v;
        }
        if let Some(v) = update.similarity_threshold {
            next.similarity_threshold = v;
        }
        if let Some(v) = update.max_similar_messages {
            next.max_similar_messages = v;
        }
        if let Some(v) = update.similarity_window_secs {
            next.similarity_window_secs = v;
        }
        if let Some(words) = &update.blocked_words {
            next.blocked_words = words.clone();
        }
        if let Some(v) = update.enable_phone_filter {
            next.enable_phone_filter = v;
        }
        if let Some(v) = update.enable_profanity_filter {
            next.enable_profanity_filter = v;
        }
        if let Some(v) = update.enable_spam_detection {
            next.enable_spam_detection = v;
        }
        if let Some(v) = update.enable_rate_limit {
            next.enable_rate_limit = v;
        }
        next
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_messages_per_window == 0 {
            return Err(ShieldError::Config(
                "max_messages_per_window must be at least 1".to_string(),
            ));
        }
        if self.rate_limit_window_secs == 0 {
            return Err(ShieldError::Config(
                "rate_limit_window_secs must be at least 1".to_string(),
            ));
        }
        if !(self.similarity_threshold > 0.0 && self.similarity_threshold <= 1.0) {
            return Err(ShieldError::Config(format!(
                "similarity_threshold must be in (0, 1], got {}",
                self.similarity_threshold
            )));
        }
        if self.max_similar_messages == 0 {
            return Err(ShieldError::Config(
                "max_similar_messages must be at least 1".to_string(),
            ));
        }
        if self.history_capacity < self.max_messages_per_window {
            return Err(ShieldError::Config(format!(
                "history_capacity {} cannot hold the rate-limit window of {}",
                self.history_capacity, self.max_messages_per_window
            )));
        }
        Ok(())
    }
}

/// Partial filter settings update from an admin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingsUpdate {
    #[serde(default)]
    pub max_messages_per_window: Option<usize>,
    #[serde(default)]
    pub rate_limit_window_secs: Option<u64>,
    #[serde(default)]
    pub similarity_threshold: Option<f64>,
    #[serde(default)]
    pub max_similar_messages: Option<usize>,
    #[serde(default)]
    pub similarity_window_secs: Option<u64>,
    #[serde(default)]
    pub blocked_words: Option<Vec<String>>,
    #[serde(default)]
    pub enable_phone_filter: Option<bool>,
    #[serde(default)]
    pub enable_profanity_filter: Option<bool>,
    #[serde(default)]
    pub enable_spam_detection: Option<bool>,
    #[serde(default)]
    pub enable_rate_limit: Option<bool>,
}

/// Cutoffs for the risk classification.
///
/// Percentages and 24h attempt counts are OR-ed at every level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskThresholds {
    pub warning_percentage: u8,
    pub danger_percentage: u8,
    /// Still `danger`, but shown with the final-warning copy.
    pub final_warning_percentage: u8,
    pub critical_percentage: u8,
    pub warning_attempts: u32,
    pub danger_attempts: u32,
    pub critical_attempts: u32,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            warning_percentage: 40,
            danger_percentage: 60,
            final_warning_percentage: 75,
            critical_percentage: 90,
            warning_attempts: 3,
            danger_attempts: 7,
            critical_attempts: 10,
        }
    }
}

impl RiskThresholds {
    pub fn merged(&self, update: &ThresholdsUpdate) -> Self {
        Self {
            warning_percentage: update.warning_percentage.unwrap_or(self.warning_percentage),
            danger_percentage: update.danger_percentage.unwrap_or(self.danger_percentage),
            final_warning_percentage: update
                .final_warning_percentage
                .unwrap_or(self.final_warning_percentage),
            critical_percentage: update
                .critical_percentage
                .unwrap_or(self.critical_percentage),
            warning_attempts: update.warning_attempts.unwrap_or(self.warning_attempts),
            danger_attempts: update.danger_attempts.unwrap_or(self.danger_attempts),
            critical_attempts: update.critical_attempts.unwrap_or(self.critical_attempts),
        }
    }

    /// Cutoffs must be strictly increasing (final warning may equal danger).
    pub fn validate(&self) -> Result<()> {
        let pct_ok = self.warning_percentage > 0
            && self.warning_percentage < self.danger_percentage
            && self.danger_percentage <= self.final_warning_percentage
            && self.final_warning_percentage < self.critical_percentage
            && self.critical_percentage <= 100;
        if !pct_ok {
            return Err(ShieldError::Config(format!(
                "percentage thresholds out of order: warning={} danger={} final_warning={} critical={}",
                self.warning_percentage,
                self.danger_percentage,
                self.final_warning_percentage,
                self.critical_percentage
            )));
        }

        let attempts_ok = self.warning_attempts > 0
            && self.warning_attempts < self.danger_attempts
            && self.danger_attempts < self.critical_attempts;
        if !attempts_ok {
            return Err(ShieldError::Config(format!(
                "attempt thresholds out of order: warning={} danger={} critical={}",
                self.warning_attempts, self.danger_attempts, self.critical_attempts
            )));
        }
        Ok(())
    }
}

/// Partial threshold update from an admin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThresholdsUpdate {
    #[serde(default)]
    pub warning_percentage: Option<u8>,
    #[serde(default)]
    pub danger_percentage: Option<u8>,
    #[serde(default)]
    pub final_warning_percentage: Option<u8>,
    #[serde(default)]
    pub critical_percentage: Option<u8>,
    #[serde(default)]
    pub warning_attempts: Option<u32>,
    #[serde(default)]
    pub danger_attempts: Option<u32>,
    #[serde(default)]
    pub critical_attempts: Option<u32>,
}

/// Blocklist file format.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlocklistFile {
    #[serde(default)]
    pub words: Vec<String>,
}

/// Startup configuration.
#[derive(Debug, Clone, Default)]
pub struct ShieldConfig {
    pub filter: FilterSettings,
    pub thresholds: RiskThresholds,
}

impl ShieldConfig {
    /// Load configuration from environment variables.
    ///
    /// Optional environment variables:
    /// - `RATE_LIMIT_MAX_MESSAGES`: Messages per window (default: 10)
    /// - `RATE_LIMIT_WINDOW_SECS`: Rate-limit window (default: 60)
    /// - `SPAM_SIMILARITY_THRESHOLD`: Near-duplicate cutoff (default: 0.8)
    /// - `MAX_SIMILAR_MESSAGES`: Near-duplicates tolerated (default: 3)
    /// - `BLOCKLIST_PATH`: Path to JSON file with `{"words": [...]}`
    /// - `BLOCKLIST_WORDS`: Comma-separated blocked words
    /// - `ENABLE_PHONE_FILTER`, `ENABLE_PROFANITY_FILTER`,
    ///   `ENABLE_SPAM_DETECTION`, `ENABLE_RATE_LIMIT`: toggles (default: true)
    /// - `RISK_WARNING_PCT`, `RISK_DANGER_PCT`, `RISK_FINAL_WARNING_PCT`,
    ///   `RISK_CRITICAL_PCT`: percentage cutoffs (defaults: 40/60/75/90)
    pub fn from_env() -> Result<Self> {
        let defaults = FilterSettings::default();

        let mut blocked_words = match env::var("BLOCKLIST_PATH") {
            Ok(path) => load_blocklist_from_file(&path)?,
            Err(_) => Vec::new(),
        };
        blocked_words.extend(parse_word_list("BLOCKLIST_WORDS"));

        let filter = FilterSettings {
            max_messages_per_window: parse_var("RATE_LIMIT_MAX_MESSAGES")
                .unwrap_or(defaults.max_messages_per_window),
            rate_limit_window_secs: parse_var("RATE_LIMIT_WINDOW_SECS")
                .unwrap_or(defaults.rate_limit_window_secs),
            similarity_threshold: parse_var("SPAM_SIMILARITY_THRESHOLD")
                .unwrap_or(defaults.similarity_threshold),
            max_similar_messages: parse_var("MAX_SIMILAR_MESSAGES")
                .unwrap_or(defaults.max_similar_messages),
            blocked_words,
            enable_phone_filter: parse_flag("ENABLE_PHONE_FILTER")
                .unwrap_or(defaults.enable_phone_filter),
            enable_profanity_filter: parse_flag("ENABLE_PROFANITY_FILTER")
                .unwrap_or(defaults.enable_profanity_filter),
            enable_spam_detection: parse_flag("ENABLE_SPAM_DETECTION")
                .unwrap_or(defaults.enable_spam_detection),
            enable_rate_limit: parse_flag("ENABLE_RATE_LIMIT")
                .unwrap_or(defaults.enable_rate_limit),
            ..defaults
        };
        filter.validate()?;

        let thresholds = RiskThresholds::default().merged(&ThresholdsUpdate {
            warning_percentage: parse_var("RISK_WARNING_PCT"),
            danger_percentage: parse_var("RISK_DANGER_PCT"),
            final_warning_percentage: parse_var("RISK_FINAL_WARNING_PCT"),
            critical_percentage: parse_var("RISK_CRITICAL_PCT"),
            ..Default::default()
        });
        thresholds.validate()?;

        Ok(Self { filter, thresholds })
    }
}

/// Load blocked words from a JSON file.
fn load_blocklist_from_file(path: &str) -> Result<Vec<String>> {
    let path = Path::new(path);
    let content = fs::read_to_string(path)
        .map_err(|e| ShieldError::Config(format!("Failed to read blocklist file: {}", e)))?;

    let file: BlocklistFile = serde_json::from_str(&content)
        .map_err(|e| ShieldError::Config(format!("Failed to parse blocklist file: {}", e)))?;
    Ok(file.words)
}

/// Parse a comma-separated list from an environment variable.
fn parse_word_list(var_name: &str) -> Vec<String> {
    env::var(var_name)
        .ok()
        .map(|s| {
            s.split(',')
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn parse_var<T: std::str::FromStr>(var_name: &str) -> Option<T> {
    env::var(var_name).ok().and_then(|s| s.trim().parse().ok())
}

fn parse_flag(var_name: &str) -> Option<bool> {
    let value = env::var(var_name).ok()?;
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn default_settings_are_valid() {
        assert!(FilterSettings::default().validate().is_ok());
        assert!(RiskThresholds::default().validate().is_ok());
    }

    #[test]
    fn settings_update_only_touches_given_fields() {
        let base = FilterSettings::default();
        let merged = base.merged(&SettingsUpdate {
            enable_spam_detection: Some(false),
            blocked_words: Some(vec!["cashback".to_string()]),
            ..Default::default()
        });

        assert!(!merged.enable_spam_detection);
        assert_eq!(merged.blocked_words, vec!["cashback".to_string()]);
        assert_eq!(merged.max_messages_per_window, base.max_messages_per_window);
        assert!(merged.enable_phone_filter);
    }

    #[test]
    fn invalid_similarity_threshold_rejected() {
        let settings = FilterSettings {
            similarity_threshold: 1.5,
            ..Default::default()
        };
        assert!(matches!(settings.validate(), Err(ShieldError::Config(_))));
    }

    #[test]
    fn thresholds_must_be_ordered() {
        let bad = RiskThresholds::default().merged(&ThresholdsUpdate {
            danger_percentage: Some(95),
            ..Default::default()
        });
        assert!(bad.validate().is_err());

        let good = RiskThresholds::default().merged(&ThresholdsUpdate {
            warning_percentage: Some(30),
            critical_percentage: Some(95),
            ..Default::default()
        });
        assert!(good.validate().is_ok());
        assert_eq!(good.danger_percentage, 60);
    }

    #[test]
    fn attempt_thresholds_must_be_ordered() {
        let bad = RiskThresholds::default().merged(&ThresholdsUpdate {
            critical_attempts: Some(5),
            ..Default::default()
        });
        assert!(bad.validate().is_err());
    }

    #[test]
    fn settings_update_deserializes_partial_json() {
        let update: SettingsUpdate =
            serde_json::from_str(r#"{"enable_rate_limit": false}"#).expect("deserialize");
        assert_eq!(update.enable_rate_limit, Some(false));
        assert!(update.blocked_words.is_none());
    }

    #[test]
    fn parse_word_list_multiple() {
        let var_name = "CHATSHIELD_TEST_WORDS_MULTI";
        env::set_var(var_name, "promo, cashback ,,transfer");
        let result = parse_word_list(var_name);
        assert_eq!(result, vec!["promo", "cashback", "transfer"]);
        env::remove_var(var_name);
    }

    #[test]
    fn parse_word_list_missing() {
        let var_name = "CHATSHIELD_TEST_WORDS_MISSING";
        env::remove_var(var_name);
        assert!(parse_word_list(var_name).is_empty());
    }

    #[test]
    fn parse_flag_values() {
        let var_name = "CHATSHIELD_TEST_FLAG";
        env::set_var(var_name, "off");
        assert_eq!(parse_flag(var_name), Some(false));
        env::set_var(var_name, "YES");
        assert_eq!(parse_flag(var_name), Some(true));
        env::set_var(var_name, "maybe");
        assert_eq!(parse_flag(var_name), None);
        env::remove_var(var_name);
    }

    #[test]
    fn blocklist_loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(file, r#"{{"words": ["transfer langsung", "rekening"]}}"#).expect("write");

        let words = load_blocklist_from_file(file.path().to_str().expect("utf8 path"))
            .expect("load");
        assert_eq!(words, vec!["transfer langsung", "rekening"]);
    }

    #[test]
    fn blocklist_file_missing_is_config_error() {
        let result = load_blocklist_from_file("/nonexistent/chatshield/blocklist.json");
        assert!(matches!(result, Err(ShieldError::Config(_))));
    }
}

#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Merging an empty update is the identity.
        #[test]
        fn prop_empty_update_is_identity(
            max in 1usize..50,
            threshold in 0.1f64..1.0,
        ) {
            let settings = FilterSettings {
                max_messages_per_window: max,
                similarity_threshold: threshold,
                ..Default::default()
            };
            prop_assert_eq!(settings.merged(&SettingsUpdate::default()), settings);
        }
    }
}
