//! Moderation counters for the admin dashboard.
//!
//! Counters are lock-free atomics bumped on the send path and read as a
//! serializable snapshot.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{ContentFilterResult, FilterReason};

/// Point-in-time view of the counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModerationStats {
    pub messages_evaluated: u64,
    pub messages_filtered: u64,
    pub spam_prevented: u64,
    pub phone_numbers_blocked: u64,
    pub profanity_filtered: u64,
    pub rate_limit_hits: u64,
    pub split_attempts_detected: u64,
    pub active_users: u64,
    pub since: DateTime<Utc>,
}

/// Running totals since process start.
#[derive(Debug)]
pub struct ModerationMetrics {
    messages_evaluated: AtomicU64,
    messages_filtered: AtomicU64,
    spam_prevented: AtomicU64,
    phone_numbers_blocked: AtomicU64,
    profanity_filtered: AtomicU64,
    rate_limit_hits: AtomicU64,
    split_attempts_detected: AtomicU64,
    since: DateTime<Utc>,
}

impl ModerationMetrics {
    pub fn new() -> Self {
        Self {
            messages_evaluated: AtomicU64::new(0),
            messages_filtered: AtomicU64::new(0),
            spam_prevented: AtomicU64::new(0),
            phone_numbers_blocked: AtomicU64::new(0),
            profanity_filtered: AtomicU64::new(0),
            rate_limit_hits: AtomicU64::new(0),
            split_attempts_detected: AtomicU64::new(0),
            since: Utc::now(),
        }
    }

    /// Count a content filter verdict.
    pub fn record_filter(&self, result: &ContentFilterResult) {
        self.messages_evaluated.fetch_add(1, Ordering::Relaxed);
        let Some(reason) = result.reason.filter(|_| !result.is_allowed) else {
            return;
        };
        self.messages_filtered.fetch_add(1, Ordering::Relaxed);
        let counter = match reason {
            FilterReason::RateLimit => &self.rate_limit_hits,
            FilterReason::PhoneNumber => &self.phone_numbers_blocked,
            FilterReason::Profanity | FilterReason::BlockedWord => &self.profanity_filtered,
            FilterReason::Spam => &self.spam_prevented,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_split_detection(&self) {
        self.split_attempts_detected.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot the counters. `active_users` comes from the history store.
    pub fn snapshot(&self, active_users: u64) -> ModerationStats {
        ModerationStats {
            messages_evaluated: self.messages_evaluated.load(Ordering::Relaxed),
            messages_filtered: self.messages_filtered.load(Ordering::Relaxed),
            spam_prevented: self.spam_prevented.load(Ordering::Relaxed),
            phone_numbers_blocked: self.phone_numbers_blocked.load(Ordering::Relaxed),
            profanity_filtered: self.profanity_filtered.load(Ordering::Relaxed),
            rate_limit_hits: self.rate_limit_hits.load(Ordering::Relaxed),
            split_attempts_detected: self.split_attempts_detected.load(Ordering::Relaxed),
            active_users,
            since: self.since,
        }
    }
}

impl Default for ModerationMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ModerationStats {
    /// Format as Prometheus exposition text.
    pub fn to_prometheus(&self) -> String {
        let counters = [
            ("messages_evaluated", "Messages run through the filter", self.messages_evaluated),
            ("messages_filtered", "Messages rejected by the filter", self.messages_filtered),
            ("spam_prevented", "Messages rejected as spam", self.spam_prevented),
            ("phone_numbers_blocked", "Messages rejected for phone numbers", self.phone_numbers_blocked),
            ("profanity_filtered", "Messages rejected for profanity or blocked words", self.profanity_filtered),
            ("rate_limit_hits", "Messages rejected by the rate limit", self.rate_limit_hits),
            ("split_attempts_detected", "Split contact attempts detected", self.split_attempts_detected),
        ];

        let mut output = String::new();
        for (name, help, value) in counters {
            output.push_str(&format!("# HELP chatshield_{} {}\n", name, help));
            output.push_str(&format!("# TYPE chatshield_{} counter\n", name));
            output.push_str(&format!("chatshield_{} {}\n", name, value));
        }
        output.push_str("# HELP chatshield_active_users Users with buffered state\n");
        output.push_str("# TYPE chatshield_active_users gauge\n");
        output.push_str(&format!("chatshield_active_users {}\n", self.active_users));
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Severity;

    fn rejected(reason: FilterReason) -> ContentFilterResult {
        ContentFilterResult::rejected(reason, Severity::High, "blocked", &[])
    }

    #[test]
    fn counts_by_reason() {
        let metrics = ModerationMetrics::new();
        metrics.record_filter(&ContentFilterResult::allowed());
        metrics.record_filter(&rejected(FilterReason::PhoneNumber));
        metrics.record_filter(&rejected(FilterReason::PhoneNumber));
        metrics.record_filter(&rejected(FilterReason::BlockedWord));
        metrics.record_filter(&rejected(FilterReason::RateLimit));
        metrics.record_split_detection();

        let stats = metrics.snapshot(3);
        assert_eq!(stats.messages_evaluated, 5);
        assert_eq!(stats.messages_filtered, 4);
        assert_eq!(stats.phone_numbers_blocked, 2);
        assert_eq!(stats.profanity_filtered, 1);
        assert_eq!(stats.rate_limit_hits, 1);
        assert_eq!(stats.spam_prevented, 0);
        assert_eq!(stats.split_attempts_detected, 1);
        assert_eq!(stats.active_users, 3);
    }

    #[test]
    fn prometheus_format() {
        let metrics = ModerationMetrics::new();
        metrics.record_filter(&rejected(FilterReason::Spam));
        let output = metrics.snapshot(1).to_prometheus();

        assert!(output.contains("# TYPE chatshield_spam_prevented counter"));
        assert!(output.contains("chatshield_spam_prevented 1"));
        assert!(output.contains("chatshield_active_users 1"));
    }
}

#[cfg(test)]
mod property_tests {
    use super::*;
    use crate::models::Severity;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Filtered never exceeds evaluated, and per-reason counts add up.
        #[test]
        fn prop_counts_add_up(reasons in prop::collection::vec(0u8..6, 0..50)) {
            let metrics = ModerationMetrics::new();
            for r in &reasons {
                let result = match r {
                    0 => ContentFilterResult::allowed(),
                    1 => ContentFilterResult::rejected(FilterReason::RateLimit, Severity::High, "x", &[]),
                    2 => ContentFilterResult::rejected(FilterReason::PhoneNumber, Severity::High, "x", &[]),
                    3 => ContentFilterResult::rejected(FilterReason::Profanity, Severity::Medium, "x", &[]),
                    4 => ContentFilterResult::rejected(FilterReason::BlockedWord, Severity::Medium, "x", &[]),
                    _ => ContentFilterResult::rejected(FilterReason::Spam, Severity::Medium, "x", &[]),
                };
                metrics.record_filter(&result);
            }

            let s = metrics.snapshot(0);
            prop_assert_eq!(s.messages_evaluated, reasons.len() as u64);
            prop_assert!(s.messages_filtered <= s.messages_evaluated);
            prop_assert_eq!(
                s.messages_filtered,
                s.rate_limit_hits + s.phone_numbers_blocked + s.profanity_filtered + s.spam_prevented
            );
        }
    }
}
