//! Moderation engine: the full send path.
//!
//! A message is filtered, checked against its chat's split buffer for split
//! contact attempts, and any block or detection lands in the ledger. Only
//! messages that are actually sent join the buffer. The resulting profile
//! decides whether the chat is still open.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::config::{FilterSettings, RiskThresholds, SettingsUpdate, ThresholdsUpdate};
use crate::error::{ErrorContext, Result, ShieldError};
use crate::escalation::{advise_profile, Advisory};
use crate::events::{EventBus, ModerationEvent};
use crate::filter::ContentFilter;
use crate::history::{split_key, StoredMessage, UserHistoryStore, UserLocks};
use crate::ledger::ViolationLedger;
use crate::lexicon::Lexicon;
use crate::metrics::{ModerationMetrics, ModerationStats};
use crate::models::{
    ChatType, CircumventionAlert, CircumventionRiskLevel, ContentFilterResult, Message,
    NewViolation, Severity, SplitPhoneDetection, UserViolationProfile, ViolationType,
};
use crate::split::{self, SplitDetector, DETECTION_WINDOW_HOURS, SPLIT_WINDOW_MINUTES};

/// Per user-chat split buffer capacity.
pub const SPLIT_BUFFER_CAPACITY: usize = 50;

/// Why a message was not sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    ContentFilter,
    SplitAttempt,
    ChatDeactivated,
}

/// Outcome of evaluating one outbound message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub is_allowed: bool,
    pub blocked_by: Option<BlockReason>,
    /// `None` when the chat was already deactivated and nothing was checked.
    pub filter: Option<ContentFilterResult>,
    pub split_detection: Option<SplitPhoneDetection>,
    pub circumvention: Option<CircumventionAlert>,
    pub suggestions: Vec<String>,
    pub violation_ids: Vec<String>,
    pub profile: UserViolationProfile,
    pub advisory: Advisory,
}

impl Verdict {
    /// Whether the caller may offer "send anyway".
    ///
    /// Filter blocks follow the filter's severity rule; a medium circumvention
    /// risk may be overridden; everything else is final.
    pub fn allows_override(&self) -> bool {
        match self.blocked_by {
            Some(BlockReason::ContentFilter) => {
                self.filter.as_ref().is_some_and(|f| f.allows_override())
            }
            Some(BlockReason::SplitAttempt) => self
                .circumvention
                .as_ref()
                .is_some_and(|a| a.risk_level == CircumventionRiskLevel::Medium),
            Some(BlockReason::ChatDeactivated) | None => false,
        }
    }
}

/// Moderation engine wiring every component over one history store.
pub struct ModerationEngine {
    filter: ContentFilter,
    detector: SplitDetector,
    ledger: ViolationLedger,
    store: Arc<dyn UserHistoryStore>,
    events: EventBus,
    metrics: ModerationMetrics,
    locks: UserLocks,
}

impl ModerationEngine {
    pub fn new(
        lexicon: Arc<Lexicon>,
        store: Arc<dyn UserHistoryStore>,
        settings: FilterSettings,
        thresholds: RiskThresholds,
    ) -> Result<Self> {
        Self::with_event_bus(lexicon, store, settings, thresholds, EventBus::default())
    }

    pub fn with_event_bus(
        lexicon: Arc<Lexicon>,
        store: Arc<dyn UserHistoryStore>,
        settings: FilterSettings,
        thresholds: RiskThresholds,
        events: EventBus,
    ) -> Result<Self> {
        Ok(Self {
            filter: ContentFilter::new(lexicon.clone(), store.clone(), settings)?,
            detector: SplitDetector::new(lexicon, store.clone()),
            ledger: ViolationLedger::new(store.clone(), thresholds, events.clone())?,
            store,
            events,
            metrics: ModerationMetrics::new(),
            locks: UserLocks::new(),
        })
    }

    /// Run a message through the full send path.
    ///
    /// Sends from one user are serialized so every check sees the writes of
    /// the send before it.
    pub fn evaluate(&self, message: &Message, chat_type: ChatType) -> Result<Verdict> {
        message.validate()?;
        self.locks
            .with_user(&message.user_id, || self.evaluate_locked(message, chat_type))
    }

    fn evaluate_locked(&self, message: &Message, chat_type: ChatType) -> Result<Verdict> {
        let now = message.timestamp;
        let user_id = message.user_id.as_str();

        let current = self.ledger.get_user_violation_profile_at(user_id, now)?;
        if current.chat_deactivated {
            info!(user_id = %user_id, "Send refused, chat deactivated");
            return Ok(Verdict {
                is_allowed: false,
                blocked_by: Some(BlockReason::ChatDeactivated),
                filter: None,
                split_detection: None,
                circumvention: None,
                suggestions: Vec::new(),
                violation_ids: Vec::new(),
                advisory: advise_profile(&current),
                profile: current,
            });
        }

        self.ledger.record_message(user_id);
        let filter = self.filter.filter_message_at(
            user_id,
            &message.chat_id,
            &message.text,
            chat_type,
            now,
        )?;
        self.metrics.record_filter(&filter);

        let mut violation_ids = Vec::new();
        let mut suggestions = filter.suggestions.clone();
        if let Some(reason) = filter.reason.filter(|_| !filter.is_allowed) {
            let id = self.ledger.record_violation(
                NewViolation::new(
                    user_id,
                    &message.chat_id,
                    ViolationType::from(reason),
                    filter.severity,
                    format!("content filter: {}", reason.as_str()),
                )
                .with_content(&message.text)
                .at(now),
            )?;
            violation_ids.push(id);
        }

        let draft = StoredMessage {
            text: message.text.clone(),
            chat_id: message.chat_id.clone(),
            chat_type,
            timestamp: now,
        };
        let key = split_key(user_id, &message.chat_id);
        let window = split::window_for(&self.store.messages(&key), draft.clone());

        let mut split_detection = None;
        let mut circumvention = None;
        if filter.is_allowed {
            if let Some(detection) = self.detector.analyze_split_attempt(user_id, &window) {
                self.metrics.record_split_detection();
                let alert = self.detector.assess_circumvention_risk(user_id, &detection);

                let severity = if detection.is_high_risk {
                    Severity::High
                } else {
                    Severity::Medium
                };
                let id = self.ledger.record_violation(
                    NewViolation::new(
                        user_id,
                        &message.chat_id,
                        ViolationType::SplitPhoneAttempt,
                        severity,
                        format!(
                            "{} (confidence {:.2})",
                            detection.detection_type.as_str(),
                            detection.confidence
                        ),
                    )
                    .with_content(&detection.reconstructed_number)
                    .at(now),
                )?;
                violation_ids.push(id);

                if alert.blocks_send() {
                    self.events.publish(ModerationEvent::CircumventionEscalated {
                        user_id: user_id.to_string(),
                        attempt_count: alert.attempt_count,
                        risk_level: alert.risk_level,
                        timestamp: now,
                    });
                }
                // The fragments are accounted for; later sends start a fresh window.
                self.store.clear_messages(&key);
                suggestions.extend(split::suggestions(&detection));
                split_detection = Some(detection);
                circumvention = Some(alert);
            }
        }

        let profile = self.ledger.get_user_violation_profile_at(user_id, now)?;
        let split_blocks = circumvention
            .as_ref()
            .is_some_and(|a| a.risk_level >= CircumventionRiskLevel::Medium);

        let blocked_by = if !filter.is_allowed {
            Some(BlockReason::ContentFilter)
        } else if split_blocks {
            Some(BlockReason::SplitAttempt)
        } else if profile.chat_deactivated {
            Some(BlockReason::ChatDeactivated)
        } else {
            None
        };

        if blocked_by.is_none() && split_detection.is_none() {
            self.store.push_message(&key, draft, SPLIT_BUFFER_CAPACITY);
        }

        if let Some(reason) = blocked_by {
            info!(
                user_id = %user_id,
                chat_id = %message.chat_id,
                blocked_by = ?reason,
                risk_level = profile.risk_level.as_str(),
                violation_percentage = profile.violation_percentage,
                "Message blocked"
            );
        }

        Ok(Verdict {
            is_allowed: blocked_by.is_none(),
            blocked_by,
            filter: Some(filter),
            split_detection,
            circumvention,
            suggestions,
            violation_ids,
            advisory: advise_profile(&profile),
            profile,
        })
    }

    /// Check a draft against the split buffer without recording anything.
    pub fn preview_split(
        &self,
        user_id: &str,
        chat_id: &str,
        draft: &str,
        now: DateTime<Utc>,
    ) -> Option<SplitPhoneDetection> {
        let key = split_key(user_id, chat_id);
        let window = split::window_for(
            &self.store.messages(&key),
            StoredMessage {
                text: draft.to_string(),
                chat_id: chat_id.to_string(),
                chat_type: ChatType::default(),
                timestamp: now,
            },
        );
        self.detector.analyze_split_attempt(user_id, &window)
    }

    /// Accept a "send anyway" for a message the filter blocked.
    ///
    /// High severity verdicts are refused. An accepted message counts as sent
    /// and joins both the filter history and the split buffer.
    pub fn accept_override(
        &self,
        message: &Message,
        chat_type: ChatType,
        verdict: &ContentFilterResult,
    ) -> Result<()> {
        message.validate()?;
        if verdict.is_allowed {
            return Err(ShieldError::InvalidInput(
                "message was not blocked".to_string(),
            ));
        }
        if !verdict.allows_override() {
            let err = ShieldError::OverrideNotPermitted {
                severity: verdict.severity,
            };
            err.log_with_context(
                &ErrorContext::new("accept_override")
                    .with_user_id(&message.user_id)
                    .with_chat_id(&message.chat_id),
            );
            return Err(err);
        }

        self.locks.with_user(&message.user_id, || {
            self.filter.record_accepted(
                &message.user_id,
                &message.chat_id,
                &message.text,
                chat_type,
                message.timestamp,
            )?;
            self.store.push_message(
                &split_key(&message.user_id, &message.chat_id),
                StoredMessage {
                    text: message.text.clone(),
                    chat_id: message.chat_id.clone(),
                    chat_type,
                    timestamp: message.timestamp,
                },
                SPLIT_BUFFER_CAPACITY,
            );
            Ok(())
        })?;
        warn!(
            user_id = %message.user_id,
            reason = verdict.reason.map(|r| r.as_str()).unwrap_or("unknown"),
            severity = verdict.severity.as_str(),
            "Filter overridden by user"
        );
        Ok(())
    }

    /// Filter a single message without the split and ledger stages.
    pub fn filter_message(
        &self,
        user_id: &str,
        text: &str,
        chat_type: ChatType,
    ) -> Result<ContentFilterResult> {
        let result = self.filter.filter_message(user_id, text, chat_type)?;
        self.metrics.record_filter(&result);
        Ok(result)
    }

    pub fn record_violation(&self, event: NewViolation) -> Result<String> {
        self.ledger.record_violation(event)
    }

    pub fn record_message(&self, user_id: &str) -> u64 {
        self.ledger.record_message(user_id)
    }

    pub fn set_message_count(&self, user_id: &str, count: u64) {
        self.ledger.set_message_count(user_id, count)
    }

    pub fn get_user_violation_profile(&self, user_id: &str) -> Result<UserViolationProfile> {
        self.ledger.get_user_violation_profile(user_id)
    }

    /// Advisory for the user's current profile.
    pub fn advisory(&self, user_id: &str) -> Result<Advisory> {
        Ok(advise_profile(&self.get_user_violation_profile(user_id)?))
    }

    pub fn update_settings(&self, update: &SettingsUpdate) -> Result<FilterSettings> {
        self.filter.update_settings(update)
    }

    pub fn update_thresholds(&self, update: &ThresholdsUpdate) -> Result<RiskThresholds> {
        self.ledger.update_thresholds(update)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<ModerationEvent>> {
        self.events.subscribe()
    }

    /// Live event subscribers, including the service's own logger.
    pub fn subscriber_count(&self) -> usize {
        self.events.subscriber_count()
    }

    pub fn stats(&self) -> ModerationStats {
        self.metrics.snapshot(self.store.user_count() as u64)
    }

    /// Drop buffers and detections too old to matter. Returns buffers removed.
    pub fn prune(&self, now: DateTime<Utc>) -> Result<usize> {
        let settings = self.filter.settings()?;
        let horizon_secs = (SPLIT_WINDOW_MINUTES * 60)
            .max(settings.similarity_window_secs as i64)
            .max(settings.rate_limit_window_secs as i64);

        let removed = self
            .store
            .prune_messages(now - Duration::seconds(horizon_secs));
        self.store
            .prune_detections(now - Duration::hours(DETECTION_WINDOW_HOURS));
        self.locks.prune();
        self.filter.prune_locks();
        self.ledger.prune_locks();
        Ok(removed)
    }
}

/// Spawn a background task that prunes stale state on an interval.
pub fn spawn_prune_task(engine: Arc<ModerationEngine>, every: std::time::Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);

        loop {
            interval.tick().await;

            match engine.prune(Utc::now()) {
                Ok(removed) if removed > 0 => {
                    tracing::debug!(removed, "Pruned stale buffers");
                }
                Ok(_) => {}
                Err(e) => e.log_with_context(&ErrorContext::new("prune")),
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::InMemoryHistoryStore;
    use crate::models::{DetectionType, FilterReason, RiskLevel};

    fn engine() -> ModerationEngine {
        ModerationEngine::new(
            Arc::new(Lexicon::new().expect("lexicon")),
            Arc::new(InMemoryHistoryStore::new()),
            FilterSettings::default(),
            RiskThresholds::default(),
        )
        .expect("engine")
    }

    fn send(engine: &ModerationEngine, text: &str, at: DateTime<Utc>) -> Verdict {
        engine
            .evaluate(&Message::at("user-1", "chat-1", text, at), ChatType::Booking)
            .expect("evaluate")
    }

    #[test]
    fn clean_message_goes_through() {
        let engine = engine();
        let verdict = send(&engine, "Hello, is 4pm available?", Utc::now());
        assert!(verdict.is_allowed);
        assert!(verdict.violation_ids.is_empty());
        assert_eq!(verdict.profile.total_messages, 1);
        assert_eq!(verdict.profile.risk_level, RiskLevel::Safe);
    }

    #[test]
    fn phone_number_is_blocked_and_recorded() {
        let engine = engine();
        let verdict = send(&engine, "wa me 081234567890", Utc::now());
        assert!(!verdict.is_allowed);
        assert_eq!(verdict.blocked_by, Some(BlockReason::ContentFilter));
        assert_eq!(
            verdict.filter.as_ref().and_then(|f| f.reason),
            Some(FilterReason::PhoneNumber)
        );
        assert_eq!(verdict.violation_ids.len(), 1);
        assert_eq!(verdict.profile.recent_attempts, 1);
        assert!(!verdict.allows_override());

        let stats = engine.stats();
        assert_eq!(stats.phone_numbers_blocked, 1);
        assert_eq!(stats.messages_filtered, 1);
    }

    #[test]
    fn split_number_is_caught_across_messages() {
        let engine = engine();
        let start = Utc::now();
        let parts = ["08", "123", "456", "78"];
        let verdicts: Vec<Verdict> = parts
            .iter()
            .enumerate()
            .map(|(i, p)| send(&engine, p, start + Duration::seconds(i as i64 * 15)))
            .collect();

        assert!(verdicts[0].is_allowed && verdicts[1].is_allowed);
        let caught = &verdicts[2];
        let detection = caught.split_detection.as_ref().expect("detection");
        assert_eq!(detection.detection_type, DetectionType::NumericSplit);
        assert_eq!(detection.reconstructed_number, "08123456");
        assert!(!caught.is_allowed);
        assert_eq!(caught.blocked_by, Some(BlockReason::SplitAttempt));
        assert_eq!(engine.stats().split_attempts_detected, 1);
    }

    #[test]
    fn follow_up_after_split_attempt_is_not_punished_again() {
        let engine = engine();
        let start = Utc::now();
        let texts = [
            "08",
            "123",
            "456",
            "78",
            "sorry",
            "ok I understand",
            "lets just book here",
            "is 4pm fine",
        ];
        let verdicts: Vec<Verdict> = texts
            .iter()
            .enumerate()
            .map(|(i, t)| send(&engine, t, start + Duration::seconds(i as i64 * 15)))
            .collect();

        for verdict in &verdicts[3..] {
            assert!(verdict.is_allowed, "{:?}", verdict.blocked_by);
            assert!(verdict.split_detection.is_none());
            assert!(verdict.violation_ids.is_empty());
        }
        let last = verdicts.last().expect("verdict");
        assert_eq!(last.profile.recent_attempts, 1);
        assert_eq!(last.profile.total_violations, 1);
    }

    #[test]
    fn blocked_messages_do_not_join_the_split_buffer() {
        let engine = engine();
        let start = Utc::now();
        send(&engine, "08", start);
        let blocked = send(&engine, "you goblok", start + Duration::seconds(10));
        assert_eq!(blocked.blocked_by, Some(BlockReason::ContentFilter));

        let buffered = engine.store.messages(&split_key("user-1", "chat-1"));
        assert_eq!(buffered.len(), 1);
        assert_eq!(buffered[0].text, "08");
    }

    #[test]
    fn price_and_time_talk_is_allowed() {
        let engine = engine();
        let start = Utc::now();
        let texts = [
            "How much for a session?",
            "Rp 150.000 for 60 min",
            "Room 1205 please",
            "at 14:30",
        ];
        for (i, text) in texts.iter().enumerate() {
            let verdict = send(&engine, text, start + Duration::minutes(i as i64 * 3));
            assert!(verdict.is_allowed, "{} was blocked", text);
            assert!(verdict.violation_ids.is_empty(), "{} recorded a violation", text);
        }
    }

    #[test]
    fn concurrent_sends_from_one_user_respect_rate_limit() {
        let engine = Arc::new(engine());
        let now = Utc::now();

        let handles: Vec<_> = (0..20)
            .map(|i| {
                let engine = engine.clone();
                std::thread::spawn(move || {
                    let topic = ["alpha", "bravo", "delta", "kilo", "mike"][i % 5];
                    let text = format!("booking question {}", topic);
                    send(&engine, &text, now)
                })
            })
            .collect();
        let allowed = handles
            .into_iter()
            .map(|h| h.join().expect("thread"))
            .filter(|v| v.is_allowed)
            .count();

        assert!(allowed <= 10, "{} sends passed the rate limit", allowed);
    }

    #[test]
    fn metrics_export_reflects_the_send_path() {
        let engine = engine();
        let _rx = engine.subscribe();
        assert_eq!(engine.subscriber_count(), 1);

        send(&engine, "wa me 081234567890", Utc::now());
        let text = engine.stats().to_prometheus();
        assert!(text.contains("chatshield_phone_numbers_blocked 1"));
    }

    #[test]
    fn preview_does_not_mutate() {
        let engine = engine();
        let start = Utc::now();
        send(&engine, "08", start);
        send(&engine, "1234", start + Duration::seconds(10));

        let now = start + Duration::seconds(20);
        let preview = engine.preview_split("user-1", "chat-1", "5678", now);
        assert!(preview.is_some());
        let again = engine.preview_split("user-1", "chat-1", "5678", now);
        assert_eq!(preview, again);
        assert_eq!(
            engine
                .get_user_violation_profile("user-1")
                .expect("profile")
                .total_violations,
            0
        );
    }

    #[test]
    fn deactivated_chat_refuses_everything() {
        let engine = engine();
        engine.set_message_count("user-1", 1);
        for _ in 0..3 {
            engine
                .record_violation(NewViolation::new(
                    "user-1",
                    "chat-1",
                    ViolationType::Profanity,
                    Severity::Medium,
                    "profanity",
                ))
                .expect("record");
        }

        let verdict = send(&engine, "hello again", Utc::now());
        assert!(!verdict.is_allowed);
        assert_eq!(verdict.blocked_by, Some(BlockReason::ChatDeactivated));
        assert!(verdict.filter.is_none());
        assert!(!verdict.advisory.can_dismiss);
    }

    #[test]
    fn medium_severity_override_is_accepted() {
        let engine = engine();
        let message = Message::new("user-1", "chat-1", "this is bullshit");
        let verdict = engine.evaluate(&message, ChatType::General).expect("evaluate");
        let filter = verdict.filter.clone().expect("filter result");
        assert_eq!(filter.severity, Severity::Medium);
        assert!(verdict.allows_override());

        engine
            .accept_override(&message, ChatType::General, &filter)
            .expect("override");
        let buffered = engine.store.messages(&split_key("user-1", "chat-1"));
        assert_eq!(buffered.len(), 1);
        assert_eq!(buffered[0].text, "this is bullshit");
    }

    #[test]
    fn high_severity_override_is_refused() {
        let engine = engine();
        let message = Message::new("user-1", "chat-1", "call 081234567890");
        let verdict = engine.evaluate(&message, ChatType::General).expect("evaluate");
        let filter = verdict.filter.expect("filter result");

        let result = engine.accept_override(&message, ChatType::General, &filter);
        assert!(matches!(
            result,
            Err(ShieldError::OverrideNotPermitted {
                severity: Severity::High
            })
        ));
    }

    #[test]
    fn invalid_message_fails_fast() {
        let engine = engine();
        let result = engine.evaluate(&Message::new("", "chat-1", "hi"), ChatType::General);
        assert!(matches!(result, Err(ShieldError::InvalidInput(_))));
    }

    #[test]
    fn prune_drops_stale_buffers() {
        let engine = engine();
        let long_ago = Utc::now() - Duration::hours(2);
        send(&engine, "hello there", long_ago);
        let removed = engine.prune(Utc::now()).expect("prune");
        assert_eq!(removed, 2);
    }

    #[tokio::test]
    async fn circumvention_escalation_is_published() {
        let engine = engine();
        let mut rx = engine.subscribe();
        let start = Utc::now();
        for (i, part) in ["08", "123", "456", "78"].iter().enumerate() {
            send(&engine, part, start + Duration::seconds(i as i64 * 15));
        }

        let mut escalated = false;
        while let Ok(event) = rx.try_recv() {
            if let ModerationEvent::CircumventionEscalated { user_id, .. } = event.as_ref() {
                assert_eq!(user_id, "user-1");
                escalated = true;
            }
        }
        assert!(escalated);
    }
}
