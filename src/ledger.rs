//! Violation ledger and risk scoring.
//!
//! The ledger is append-only. A user's profile is always derived from the full
//! log plus the message count; it is never patched in place. Profiles are
//! cached briefly and the entry is dropped on every write.

use std::sync::{Arc, RwLock};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use moka::sync::Cache;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{RiskThresholds, ThresholdsUpdate};
use crate::error::{Result, ShieldError};
use crate::events::{EventBus, ModerationEvent};
use crate::history::{UserHistoryStore, UserLocks};
use crate::models::{
    content_hash, NewViolation, Restrictions, RiskLevel, UserViolationProfile, ViolationRecord,
};

/// Records shown in a profile's history.
pub const PROFILE_HISTORY_LEN: usize = 10;

/// Window for counting recent contact-sharing attempts.
pub const ATTEMPT_WINDOW_HOURS: i64 = 24;

/// Profiles are cached only briefly so the 24h attempt window keeps moving.
const PROFILE_CACHE_TTL: StdDuration = StdDuration::from_secs(60);
const PROFILE_CACHE_CAPACITY: u64 = 10_000;

/// Classify a user from their violation percentage and recent attempts.
///
/// Levels are checked from most to least severe.
pub fn classify(percentage: u8, recent_attempts: u32, thresholds: &RiskThresholds) -> RiskLevel {
    if percentage >= thresholds.critical_percentage
        || recent_attempts >= thresholds.critical_attempts
    {
        RiskLevel::Critical
    } else if percentage >= thresholds.danger_percentage
        || recent_attempts >= thresholds.danger_attempts
    {
        RiskLevel::Danger
    } else if percentage >= thresholds.warning_percentage
        || recent_attempts >= thresholds.warning_attempts
    {
        RiskLevel::Warning
    } else {
        RiskLevel::Safe
    }
}

/// `round(violations / max(messages, 1) * 100)`, capped at 100.
pub fn violation_percentage(total_violations: u64, total_messages: u64) -> u8 {
    let ratio = total_violations as f64 / total_messages.max(1) as f64;
    (ratio * 100.0).round().min(100.0) as u8
}

/// Derive a profile from the raw log.
pub fn compute_profile(
    user_id: &str,
    records: &[ViolationRecord],
    message_count: Option<u64>,
    thresholds: &RiskThresholds,
    now: DateTime<Utc>,
) -> UserViolationProfile {
    let total_messages = message_count.unwrap_or(1).max(1);
    let total_violations = records.len() as u64;
    let percentage = violation_percentage(total_violations, total_messages);

    let cutoff = now - Duration::hours(ATTEMPT_WINDOW_HOURS);
    let recent_attempts = records
        .iter()
        .filter(|r| r.violation_type.is_contact_attempt() && r.timestamp > cutoff)
        .count() as u32;

    let risk_level = classify(percentage, recent_attempts, thresholds);
    let chat_deactivated = risk_level == RiskLevel::Critical;
    let final_warning =
        risk_level == RiskLevel::Danger && percentage >= thresholds.final_warning_percentage;

    let violation_history: Vec<ViolationRecord> = records
        .iter()
        .rev()
        .take(PROFILE_HISTORY_LEN)
        .cloned()
        .collect();

    UserViolationProfile {
        user_id: user_id.to_string(),
        total_messages,
        total_violations,
        violation_percentage: percentage,
        recent_attempts,
        risk_level,
        final_warning,
        chat_deactivated,
        last_violation_time: records.iter().map(|r| r.timestamp).max(),
        violation_history,
        restrictions: Restrictions {
            chat_disabled: chat_deactivated,
            booking_restricted: risk_level >= RiskLevel::Danger,
            account_flagged: risk_level == RiskLevel::Critical,
        },
    }
}

/// Append-only violation log with cached risk profiles.
pub struct ViolationLedger {
    store: Arc<dyn UserHistoryStore>,
    thresholds: RwLock<RiskThresholds>,
    profiles: Cache<String, UserViolationProfile>,
    events: EventBus,
    locks: UserLocks,
}

impl ViolationLedger {
    pub fn new(
        store: Arc<dyn UserHistoryStore>,
        thresholds: RiskThresholds,
        events: EventBus,
    ) -> Result<Self> {
        thresholds.validate()?;
        Ok(Self {
            store,
            thresholds: RwLock::new(thresholds),
            profiles: Cache::builder()
                .max_capacity(PROFILE_CACHE_CAPACITY)
                .time_to_live(PROFILE_CACHE_TTL)
                .build(),
            events,
            locks: UserLocks::new(),
        })
    }

    /// Count one message for the user.
    pub fn record_message(&self, user_id: &str) -> u64 {
        let count = self.store.increment_message_count(user_id);
        self.profiles.invalidate(user_id);
        count
    }

    /// Replace the user's message count with an authoritative value.
    pub fn set_message_count(&self, user_id: &str, count: u64) {
        self.store.set_message_count(user_id, count);
        self.profiles.invalidate(user_id);
    }

    /// Append a violation and return its id.
    ///
    /// Publishes `ViolationRecorded`, and `ChatDeactivated` when this record
    /// pushes the profile into deactivation.
    pub fn record_violation(&self, event: NewViolation) -> Result<String> {
        if event.user_id.trim().is_empty() {
            return Err(ShieldError::InvalidInput("user_id is empty".to_string()));
        }
        if event.chat_id.trim().is_empty() {
            return Err(ShieldError::InvalidInput("chat_id is empty".to_string()));
        }

        let thresholds = self.thresholds()?;
        let timestamp = event.timestamp.unwrap_or_else(Utc::now);
        let user_id = event.user_id.clone();

        self.locks.with_user(&user_id, || {
            let was_deactivated = self.compute(&user_id, &thresholds, timestamp).chat_deactivated;

            let record = ViolationRecord {
                id: Uuid::new_v4().to_string(),
                user_id: event.user_id,
                chat_id: event.chat_id,
                violation_type: event.violation_type,
                severity: event.severity,
                timestamp,
                details: event.details,
                content_hash: event.content.as_deref().map(content_hash),
                resolved: false,
            };
            let violation_id = record.id.clone();
            let chat_id = record.chat_id.clone();
            let violation_type = record.violation_type;
            let severity = record.severity;

            self.store.push_violation(record);
            self.profiles.invalidate(&user_id);
            let profile = self.compute(&user_id, &thresholds, timestamp);
            self.profiles.insert(user_id.clone(), profile.clone());

            info!(
                user_id = %user_id,
                violation_id = %violation_id,
                violation_type = violation_type.as_str(),
                severity = severity.as_str(),
                "Violation recorded"
            );
            self.events.publish(ModerationEvent::ViolationRecorded {
                violation_id: violation_id.clone(),
                user_id: user_id.clone(),
                chat_id,
                violation_type,
                severity,
                timestamp,
            });

            if profile.chat_deactivated && !was_deactivated {
                warn!(
                    user_id = %user_id,
                    violation_percentage = profile.violation_percentage,
                    recent_attempts = profile.recent_attempts,
                    "Chat deactivated"
                );
                self.events.publish(ModerationEvent::ChatDeactivated {
                    user_id: user_id.clone(),
                    violation_percentage: profile.violation_percentage,
                    recent_attempts: profile.recent_attempts,
                    timestamp,
                });
            }

            Ok(violation_id)
        })
    }

    /// Drop per-user locks that are not held.
    pub fn prune_locks(&self) -> usize {
        self.locks.prune()
    }

    /// Current profile, served from cache when fresh.
    pub fn get_user_violation_profile(&self, user_id: &str) -> Result<UserViolationProfile> {
        if let Some(profile) = self.profiles.get(user_id) {
            return Ok(profile);
        }
        let thresholds = self.thresholds()?;
        let profile = self.compute(user_id, &thresholds, Utc::now());
        self.profiles.insert(user_id.to_string(), profile.clone());
        Ok(profile)
    }

    /// Profile as of `now`, bypassing the cache.
    pub fn get_user_violation_profile_at(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<UserViolationProfile> {
        let thresholds = self.thresholds()?;
        Ok(self.compute(user_id, &thresholds, now))
    }

    /// Apply a partial threshold update.
    ///
    /// Invalid orderings are rejected and the old thresholds stay in force.
    pub fn update_thresholds(&self, update: &ThresholdsUpdate) -> Result<RiskThresholds> {
        let mut thresholds = self
            .thresholds
            .write()
            .map_err(|_| ShieldError::InternalState("thresholds lock poisoned".to_string()))?;

        let merged = thresholds.merged(update);
        merged.validate()?;
        *thresholds = merged;
        self.profiles.invalidate_all();

        info!(
            warning = merged.warning_percentage,
            danger = merged.danger_percentage,
            final_warning = merged.final_warning_percentage,
            critical = merged.critical_percentage,
            "Risk thresholds updated"
        );
        Ok(merged)
    }

    pub fn thresholds(&self) -> Result<RiskThresholds> {
        self.thresholds
            .read()
            .map(|t| *t)
            .map_err(|_| ShieldError::InternalState("thresholds lock poisoned".to_string()))
    }

    fn compute(
        &self,
        user_id: &str,
        thresholds: &RiskThresholds,
        now: DateTime<Utc>,
    ) -> UserViolationProfile {
        let records = self.store.violations(user_id);
        let profile = compute_profile(
            user_id,
            &records,
            self.store.message_count(user_id),
            thresholds,
            now,
        );
        debug!(
            user_id = %user_id,
            percentage = profile.violation_percentage,
            risk_level = profile.risk_level.as_str(),
            "Profile computed"
        );
        profile
    }
}


#[cfg(test)]
mod property_tests {
    use super::*;
    use crate::history::InMemoryHistoryStore;
    use crate::models::{Severity, ViolationType};
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// For a fixed message count the percentage never goes down as
        /// violations are added.
        #[test]
        fn prop_percentage_is_monotonic(messages in 1u64..200, violations in 1usize..40) {
            let ledger = ViolationLedger::new(
                Arc::new(InMemoryHistoryStore::new()),
                RiskThresholds::default(),
                EventBus::default(),
            ).expect("ledger");
            ledger.set_message_count("u", messages);

            let mut last = 0u8;
            for _ in 0..violations {
                ledger.record_violation(NewViolation::new(
                    "u", "c", ViolationType::Profanity, Severity::Medium, "profanity",
                )).expect("record");
                let pct = ledger.get_user_violation_profile("u").expect("profile").violation_percentage;
                prop_assert!(pct >= last);
                prop_assert!(pct <= 100);
                last = pct;
            }
        }

        /// Deactivation always matches the critical predicate.
        #[test]
        fn prop_deactivation_matches_critical(pct in 0u8..=100, attempts in 0u32..20) {
            let t = RiskThresholds::default();
            let level = classify(pct, attempts, &t);
            let critical = pct >= t.critical_percentage || attempts >= t.critical_attempts;
            prop_assert_eq!(level == RiskLevel::Critical, critical);
        }
    }
}
