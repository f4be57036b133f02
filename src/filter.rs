//! Content filter for outbound chat messages.
//!
//! Checks run in a fixed order and stop at the first violation: rate limit,
//! phone numbers, profanity and blocked words, then spam. Only messages that
//! pass are appended to the user's filter history.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use tracing::{debug, info};

use crate::config::{FilterSettings, SettingsUpdate};
use crate::error::{Result, ShieldError};
use crate::history::{filter_key, StoredMessage, UserHistoryStore, UserLocks};
use crate::lexicon::{word_list_regex, Lexicon};
use crate::models::{ChatType, ContentFilterResult, FilterReason, Severity};
use crate::similarity::similarity;

const RATE_LIMIT_WARNING: &str = "You're sending messages too quickly. Please slow down.";
const PHONE_WARNING: &str = "Sharing phone numbers or contact details is not allowed. Please keep all communication on the platform.";
const PROFANITY_WARNING: &str = "Please keep the conversation respectful.";
const BLOCKED_WORD_WARNING: &str =
    "This message contains words that are not allowed on the platform.";
const SIMILAR_SPAM_WARNING: &str = "You've sent this message several times already.";
const STRUCTURAL_SPAM_WARNING: &str = "This message looks like spam.";

const RATE_LIMIT_SUGGESTIONS: &[&str] = &[
    "Wait a minute before sending another message",
    "Combine your thoughts into one message",
];
const PHONE_SUGGESTIONS: &[&str] = &[
    "Use the in-app chat to arrange your booking",
    "Share the location or time instead of contact details",
    "Payments and confirmations are handled through the platform",
];
const PROFANITY_SUGGESTIONS: &[&str] = &[
    "Rephrase your message politely",
    "Contact support if you have a problem with a booking",
];
const SPAM_SUGGESTIONS: &[&str] = &[
    "Avoid repeating the same message",
    "Write in normal case without repeated characters",
];

/// Minimum run of identical characters treated as spam.
const REPEATED_CHAR_RUN: usize = 5;

struct FilterState {
    settings: FilterSettings,
    /// Compiled from `settings.blocked_words`.
    blocklist: Option<Regex>,
}

impl FilterState {
    fn new(settings: FilterSettings) -> Result<Self> {
        let blocklist = word_list_regex(&settings.blocked_words)?;
        Ok(Self {
            settings,
            blocklist,
        })
    }
}

/// Per-message content filter with runtime-configurable settings.
pub struct ContentFilter {
    lexicon: Arc<Lexicon>,
    store: Arc<dyn UserHistoryStore>,
    state: RwLock<FilterState>,
    locks: UserLocks,
}

impl ContentFilter {
    pub fn new(
        lexicon: Arc<Lexicon>,
        store: Arc<dyn UserHistoryStore>,
        settings: FilterSettings,
    ) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            lexicon,
            store,
            state: RwLock::new(FilterState::new(settings)?),
            locks: UserLocks::new(),
        })
    }

    /// Filter a message sent now.
    pub fn filter_message(
        &self,
        user_id: &str,
        text: &str,
        chat_type: ChatType,
    ) -> Result<ContentFilterResult> {
        self.filter_message_at(user_id, "", text, chat_type, Utc::now())
    }

    /// Filter a message at an explicit time and record it if it passes.
    pub fn filter_message_at(
        &self,
        user_id: &str,
        chat_id: &str,
        text: &str,
        chat_type: ChatType,
        now: DateTime<Utc>,
    ) -> Result<ContentFilterResult> {
        if user_id.trim().is_empty() {
            return Err(ShieldError::InvalidInput("user_id is empty".to_string()));
        }
        if text.trim().is_empty() {
            return Err(ShieldError::InvalidInput("message text is empty".to_string()));
        }

        let state = self
            .state
            .read()
            .map_err(|_| ShieldError::InternalState("filter settings lock poisoned".to_string()))?;

        let key = filter_key(user_id);
        let result = self.locks.with_user(user_id, || {
            let history = self.store.messages(&key);
            let result = self.evaluate(&state, &history, text, now);
            if result.is_allowed {
                self.store.push_message(
                    &key,
                    StoredMessage {
                        text: text.to_string(),
                        chat_id: chat_id.to_string(),
                        chat_type,
                        timestamp: now,
                    },
                    state.settings.history_capacity,
                );
            }
            Ok(result)
        })?;

        if result.is_allowed {
            debug!(user_id = %user_id, chat_type = chat_type.as_str(), "Message passed filter");
        } else {
            info!(
                user_id = %user_id,
                chat_type = chat_type.as_str(),
                reason = result.reason.map(|r| r.as_str()).unwrap_or("unknown"),
                severity = result.severity.as_str(),
                "Message blocked by content filter"
            );
        }

        Ok(result)
    }

    /// Record a message the user sent through an override.
    ///
    /// It joins the filter history so later rate and spam checks see it.
    pub fn record_accepted(
        &self,
        user_id: &str,
        chat_id: &str,
        text: &str,
        chat_type: ChatType,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let capacity = self.settings()?.history_capacity;
        self.locks.with_user(user_id, || {
            self.store.push_message(
                &filter_key(user_id),
                StoredMessage {
                    text: text.to_string(),
                    chat_id: chat_id.to_string(),
                    chat_type,
                    timestamp: now,
                },
                capacity,
            );
            Ok(())
        })
    }

    /// Drop per-user locks that are not held.
    pub fn prune_locks(&self) -> usize {
        self.locks.prune()
    }

    /// Evaluate without touching history.
    ///
    /// The same history and text always produce the same verdict.
    pub fn check(
        &self,
        history: &[StoredMessage],
        text: &str,
        now: DateTime<Utc>,
    ) -> Result<ContentFilterResult> {
        let state = self
            .state
            .read()
            .map_err(|_| ShieldError::InternalState("filter settings lock poisoned".to_string()))?;
        Ok(self.evaluate(&state, history, text, now))
    }

    fn evaluate(
        &self,
        state: &FilterState,
        history: &[StoredMessage],
        text: &str,
        now: DateTime<Utc>,
    ) -> ContentFilterResult {
        let settings = &state.settings;

        if settings.enable_rate_limit {
            let cutoff = now - Duration::seconds(settings.rate_limit_window_secs as i64);
            let recent = history.iter().filter(|m| m.timestamp > cutoff).count();
            if recent >= settings.max_messages_per_window {
                return ContentFilterResult::rejected(
                    FilterReason::RateLimit,
                    Severity::High,
                    RATE_LIMIT_WARNING,
                    RATE_LIMIT_SUGGESTIONS,
                );
            }
        }

        if settings.enable_phone_filter && self.lexicon.contains_phone(text) {
            return ContentFilterResult::rejected(
                FilterReason::PhoneNumber,
                Severity::High,
                PHONE_WARNING,
                PHONE_SUGGESTIONS,
            )
            .with_filtered_content(self.lexicon.redact_phones(text));
        }

        let profanity = if settings.enable_profanity_filter {
            self.lexicon.profanity()
        } else {
            None
        };
        let blocklist = state.blocklist.as_ref();
        let profane = profanity.is_some_and(|p| p.is_match(text));
        let blocked = blocklist.is_some_and(|b| b.is_match(text));
        if profane || blocked {
            let masked = [profanity, blocklist]
                .into_iter()
                .flatten()
                .fold(text.to_string(), |acc, pattern| mask(pattern, &acc));
            let (reason, warning) = if profane {
                (FilterReason::Profanity, PROFANITY_WARNING)
            } else {
                (FilterReason::BlockedWord, BLOCKED_WORD_WARNING)
            };
            return ContentFilterResult::rejected(
                reason,
                Severity::Medium,
                warning,
                PROFANITY_SUGGESTIONS,
            )
            .with_filtered_content(masked);
        }

        if settings.enable_spam_detection {
            let cutoff = now - Duration::seconds(settings.similarity_window_secs as i64);
            let similar = history
                .iter()
                .filter(|m| m.timestamp > cutoff)
                .filter(|m| similarity(&m.text, text) > settings.similarity_threshold)
                .count();
            if similar >= settings.max_similar_messages {
                return ContentFilterResult::rejected(
                    FilterReason::Spam,
                    Severity::High,
                    SIMILAR_SPAM_WARNING,
                    SPAM_SUGGESTIONS,
                );
            }

            if has_repeated_run(text, REPEATED_CHAR_RUN)
                || self.lexicon.has_uppercase_run(text)
                || self.lexicon.has_currency_urgency(text)
            {
                return ContentFilterResult::rejected(
                    FilterReason::Spam,
                    Severity::Medium,
                    STRUCTURAL_SPAM_WARNING,
                    SPAM_SUGGESTIONS,
                );
            }
        }

        ContentFilterResult::allowed()
    }

    /// Apply a partial settings update.
    ///
    /// The merged settings are validated and the blocklist recompiled before
    /// anything is swapped in.
    pub fn update_settings(&self, update: &SettingsUpdate) -> Result<FilterSettings> {
        let mut state = self
            .state
            .write()
            .map_err(|_| ShieldError::InternalState("filter settings lock poisoned".to_string()))?;

        let merged = state.settings.merged(update);
        merged.validate()?;
        *state = FilterState::new(merged)?;

        info!(
            phone = state.settings.enable_phone_filter,
            profanity = state.settings.enable_profanity_filter,
            spam = state.settings.enable_spam_detection,
            rate_limit = state.settings.enable_rate_limit,
            blocked_words = state.settings.blocked_words.len(),
            "Filter settings updated"
        );
        Ok(state.settings.clone())
    }

    pub fn settings(&self) -> Result<FilterSettings> {
        let state = self
            .state
            .read()
            .map_err(|_| ShieldError::InternalState("filter settings lock poisoned".to_string()))?;
        Ok(state.settings.clone())
    }
}

/// Replace every match with asterisks of the same length.
fn mask(pattern: &Regex, text: &str) -> String {
    pattern
        .replace_all(text, |caps: &regex::Captures| {
            "*".repeat(caps[0].chars().count())
        })
        .into_owned()
}

/// A run of `min` identical characters, ignoring digits and whitespace.
fn has_repeated_run(text: &str, min: usize) -> bool {
    let mut prev: Option<char> = None;
    let mut run = 0;
    for ch in text.chars() {
        if ch.is_ascii_digit() || ch.is_whitespace() {
            prev = None;
            run = 0;
            continue;
        }
        let ch = ch.to_lowercase().next().unwrap_or(ch);
        if prev == Some(ch) {
            run += 1;
        } else {
            prev = Some(ch);
            run = 1;
        }
        if run >= min {
            return true;
        }
    }
    false
}
