//! Split-number detection.
//!
//! Looks at a short window of a user's recent messages in one chat and tries
//! to reconstruct a phone number or social handle that was spread across
//! several of them. Each strategy scores its own hypothesis; the most
//! confident one wins and earlier strategies win ties.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use crate::history::{StoredMessage, UserHistoryStore};
use crate::lexicon::Lexicon;
use crate::models::{
    CircumventionAlert, CircumventionRiskLevel, DetectionType, RecommendedAction,
    SplitPhoneDetection,
};

/// Buffered messages considered per analysis, not counting the draft.
pub const SPLIT_WINDOW_MESSAGES: usize = 6;

/// Age limit for buffered messages in the analysis window.
pub const SPLIT_WINDOW_MINUTES: i64 = 10;

/// Detections kept per user for circumvention scoring.
pub const DETECTION_HISTORY_CAPACITY: usize = 50;

pub const DETECTION_WINDOW_HOURS: i64 = 24;

/// Build the analysis window: the last buffered messages within
/// [`SPLIT_WINDOW_MINUTES`] of the draft, followed by the draft.
pub fn window_for(buffer: &[StoredMessage], draft: StoredMessage) -> Vec<StoredMessage> {
    let cutoff = draft.timestamp - Duration::minutes(SPLIT_WINDOW_MINUTES);
    let recent: Vec<&StoredMessage> = buffer.iter().filter(|m| m.timestamp >= cutoff).collect();
    let skip = recent.len().saturating_sub(SPLIT_WINDOW_MESSAGES);

    let mut window: Vec<StoredMessage> = recent.into_iter().skip(skip).cloned().collect();
    window.push(draft);
    window
}

/// Detection strategies in tie-break order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitStrategy {
    Numeric,
    Text,
    Mixed,
    Social,
}

impl SplitStrategy {
    pub const ALL: [SplitStrategy; 4] = [Self::Numeric, Self::Text, Self::Mixed, Self::Social];

    fn detect(&self, lexicon: &Lexicon, window: &Window<'_>) -> Option<SplitPhoneDetection> {
        match self {
            Self::Numeric => detect_numeric(lexicon, window),
            Self::Text => detect_text(lexicon, window),
            Self::Mixed => detect_mixed(lexicon, window),
            Self::Social => detect_social(lexicon, window),
        }
    }
}

/// Precomputed view over the messages under analysis.
struct Window<'a> {
    messages: &'a [StoredMessage],
    joined: String,
    timespan_minutes: f64,
    detected_at: DateTime<Utc>,
}

impl<'a> Window<'a> {
    fn new(messages: &'a [StoredMessage]) -> Option<Self> {
        let first = messages.iter().map(|m| m.timestamp).min()?;
        let last = messages.iter().map(|m| m.timestamp).max()?;
        Some(Self {
            messages,
            joined: messages
                .iter()
                .map(|m| m.text.as_str())
                .collect::<Vec<_>>()
                .join(" "),
            timespan_minutes: (last - first).num_milliseconds() as f64 / 60_000.0,
            detected_at: last,
        })
    }

    /// Three or more messages inside two minutes.
    fn is_burst(&self) -> bool {
        self.messages.len() >= 3 && self.timespan_minutes < 2.0
    }

    fn detection(
        &self,
        detection_type: DetectionType,
        reconstructed: String,
        confidence: f64,
        is_high_risk: bool,
    ) -> SplitPhoneDetection {
        SplitPhoneDetection {
            messages: self.messages.iter().map(|m| m.text.clone()).collect(),
            reconstructed_number: reconstructed,
            confidence,
            detection_type,
            timespan_minutes: self.timespan_minutes,
            is_high_risk,
            detected_at: self.detected_at,
        }
    }
}

/// Digits recovered from number words, numerals and leetspeak.
#[derive(Debug, Default)]
struct TokenScan {
    digits: String,
    number_words: usize,
    numerals: usize,
}

fn scan_tokens(lexicon: &Lexicon, text: &str) -> TokenScan {
    let mut scan = TokenScan::default();
    for token in lexicon.tokens(text) {
        if let Some(digit) = lexicon.number_word(token) {
            scan.digits.push(digit);
            scan.number_words += 1;
        } else if token.chars().all(|c| c.is_ascii_digit()) {
            scan.digits.push_str(token);
            scan.numerals += 1;
        } else if let Some(decoded) = lexicon.leet_digits(token) {
            scan.digits.push_str(&decoded);
            scan.numerals += 1;
        }
    }
    scan
}

/// Clamp to `[0, 1]` and round to two decimals so thresholds compare exactly.
fn finish(confidence: f64) -> f64 {
    (confidence.clamp(0.0, 1.0) * 100.0).round() / 100.0
}

fn detect_numeric(lexicon: &Lexicon, window: &Window<'_>) -> Option<SplitPhoneDetection> {
    let runs = lexicon.digit_runs(&window.joined);
    if runs.len() < 2 {
        return None;
    }
    let number = runs.concat();
    let len = number.len();

    let mut confidence = 0.0;
    if (8..=15).contains(&len) {
        confidence += 0.4;
    } else if len >= 6 {
        confidence += 0.2;
    }
    if lexicon.has_indonesian_prefix(&number) {
        confidence += 0.3;
    } else if lexicon.has_foreign_prefix(&number, &window.joined) {
        confidence += 0.25;
    }
    if lexicon.has_contact_keyword(&window.joined) {
        confidence += 0.2;
    }
    if window.is_burst() {
        confidence += 0.15;
    }
    if lexicon.is_indonesian_local(&number) {
        confidence += 0.2;
    }
    if lexicon.is_indonesian_international(&number) {
        confidence += 0.2;
    }

    let confidence = finish(confidence);
    if confidence < 0.6 {
        return None;
    }
    let high_risk = confidence > 0.8 && window.timespan_minutes < 5.0;
    Some(window.detection(DetectionType::NumericSplit, number, confidence, high_risk))
}

fn detect_text(lexicon: &Lexicon, window: &Window<'_>) -> Option<SplitPhoneDetection> {
    let scan = scan_tokens(lexicon, &window.joined);
    if scan.digits.len() < 4 || scan.number_words == 0 {
        return None;
    }

    let mut confidence = 0.3;
    if lexicon.has_contact_keyword(&window.joined) {
        confidence += 0.3;
    }
    confidence += if scan.number_words >= 3 { 0.2 } else { 0.1 };
    if scan.digits.len() >= 8 {
        confidence += 0.2;
    } else if scan.digits.len() >= 6 {
        confidence += 0.1;
    }
    if lexicon.has_indonesian_prefix(&scan.digits) {
        confidence += 0.15;
    }
    if window.is_burst() {
        confidence += 0.1;
    }

    let confidence = finish(confidence);
    if confidence < 0.5 {
        return None;
    }
    Some(window.detection(
        DetectionType::TextSplit,
        scan.digits,
        confidence,
        confidence > 0.7,
    ))
}

fn detect_mixed(lexicon: &Lexicon, window: &Window<'_>) -> Option<SplitPhoneDetection> {
    let scan = scan_tokens(lexicon, &window.joined);
    if scan.digits.len() < 3 {
        return None;
    }

    let mut confidence = 0.2;
    confidence += 0.2 * lexicon.suspicious_hits(&window.joined) as f64;
    if scan.number_words > 0 && scan.numerals > 0 {
        confidence += 0.2;
    }
    confidence += if scan.digits.len() >= 8 { 0.2 } else { 0.1 };
    if lexicon.has_indonesian_prefix(&scan.digits) {
        confidence += 0.15;
    }

    let confidence = finish(confidence);
    if confidence < 0.5 {
        return None;
    }
    Some(window.detection(
        DetectionType::MixedPattern,
        scan.digits,
        confidence,
        confidence > 0.75,
    ))
}

fn detect_social(lexicon: &Lexicon, window: &Window<'_>) -> Option<SplitPhoneDetection> {
    let mut handles: Vec<String> = Vec::new();
    for handle in lexicon.handle_matches(&window.joined) {
        if !handles.contains(&handle) {
            handles.push(handle);
        }
    }
    let n = handles.len();
    if n < 2 {
        return None;
    }

    let confidence = finish((0.4 + 0.2 * n as f64).min(0.9));
    Some(window.detection(
        DetectionType::SocialMediaSplit,
        handles.join(" "),
        confidence,
        n >= 3,
    ))
}

/// Split-number detector and circumvention scorer.
pub struct SplitDetector {
    lexicon: Arc<Lexicon>,
    store: Arc<dyn UserHistoryStore>,
}

impl SplitDetector {
    pub fn new(lexicon: Arc<Lexicon>, store: Arc<dyn UserHistoryStore>) -> Self {
        Self { lexicon, store }
    }

    /// Run every strategy over a prepared window.
    ///
    /// The caller passes the recent messages with the draft last (see
    /// [`window_for`]). Fewer than two messages never count as a split.
    pub fn analyze_split_attempt(
        &self,
        user_id: &str,
        recent_messages: &[StoredMessage],
    ) -> Option<SplitPhoneDetection> {
        if recent_messages.len() < 2 {
            return None;
        }
        let window = Window::new(recent_messages)?;

        let mut best: Option<SplitPhoneDetection> = None;
        for strategy in SplitStrategy::ALL {
            if let Some(candidate) = strategy.detect(&self.lexicon, &window) {
                let better = best
                    .as_ref()
                    .map_or(true, |b| candidate.confidence > b.confidence);
                if better {
                    best = Some(candidate);
                }
            }
        }

        if let Some(detection) = &best {
            debug!(
                user_id = %user_id,
                detection_type = detection.detection_type.as_str(),
                confidence = detection.confidence,
                high_risk = detection.is_high_risk,
                "Split attempt detected"
            );
        }
        best
    }

    /// Record a detection and score the user's last 24 hours of attempts.
    pub fn assess_circumvention_risk(
        &self,
        user_id: &str,
        detection: &SplitPhoneDetection,
    ) -> CircumventionAlert {
        self.store
            .push_detection(user_id, detection.clone(), DETECTION_HISTORY_CAPACITY);

        let cutoff = detection.detected_at - Duration::hours(DETECTION_WINDOW_HOURS);
        let detection_history: Vec<SplitPhoneDetection> = self
            .store
            .detections(user_id)
            .into_iter()
            .filter(|d| d.detected_at > cutoff)
            .collect();
        let attempt_count = detection_history.len() as u32;

        let risk_level = circumvention_level(attempt_count, detection);
        if risk_level >= CircumventionRiskLevel::High {
            warn!(
                user_id = %user_id,
                attempts = attempt_count,
                risk_level = ?risk_level,
                detection_type = detection.detection_type.as_str(),
                "Repeated contact circumvention"
            );
        }

        CircumventionAlert {
            user_id: user_id.to_string(),
            attempt_count,
            risk_level,
            detection_history,
            recommended_action: RecommendedAction::from(risk_level),
        }
    }
}

fn circumvention_level(attempts: u32, latest: &SplitPhoneDetection) -> CircumventionRiskLevel {
    if attempts >= 5 || (latest.is_high_risk && attempts >= 3) {
        CircumventionRiskLevel::Critical
    } else if attempts >= 3 || latest.is_high_risk {
        CircumventionRiskLevel::High
    } else if attempts >= 2 || latest.confidence >= 0.7 {
        CircumventionRiskLevel::Medium
    } else {
        CircumventionRiskLevel::Low
    }
}

/// User-facing guidance for a detection.
pub fn suggestions(detection: &SplitPhoneDetection) -> Vec<String> {
    let mut out: Vec<&str> = match detection.detection_type {
        DetectionType::NumericSplit => vec![
            "Phone numbers are not allowed, even when sent in parts",
            "Use the booking form to agree on time and place",
        ],
        DetectionType::TextSplit => vec![
            "Spelling out a phone number counts as sharing it",
            "Keep all communication inside the app",
        ],
        DetectionType::MixedPattern => vec![
            "Mixing words and digits to share a number is not allowed",
            "Ask support if you need help with a booking",
        ],
        DetectionType::SocialMediaSplit => vec![
            "Social media handles count as contact details",
            "Chat here until your booking is confirmed",
        ],
    };
    if detection.is_high_risk {
        out.push("Further attempts can restrict your account");
    }
    out.into_iter().map(String::from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::InMemoryHistoryStore;
    use crate::models::ChatType;

    fn detector() -> SplitDetector {
        SplitDetector::new(
            Arc::new(Lexicon::new().expect("lexicon")),
            Arc::new(InMemoryHistoryStore::new()),
        )
    }

    fn burst(texts: &[&str], start: DateTime<Utc>, step_secs: i64) -> Vec<StoredMessage> {
        texts
            .iter()
            .enumerate()
            .map(|(i, text)| StoredMessage {
                text: text.to_string(),
                chat_id: "chat-1".to_string(),
                chat_type: ChatType::Booking,
                timestamp: start + Duration::seconds(i as i64 * step_secs),
            })
            .collect()
    }

    #[test]
    fn numeric_split_is_detected() {
        let messages = burst(&["08", "123", "456", "78"], Utc::now(), 20);
        let detection = detector()
            .analyze_split_attempt("u", &messages)
            .expect("detection");

        assert_eq!(detection.detection_type, DetectionType::NumericSplit);
        assert_eq!(detection.reconstructed_number, "0812345678");
        assert!(detection.confidence >= 0.6);
        assert!(detection.is_high_risk);
        assert_eq!(detection.messages.len(), 4);
    }

    #[test]
    fn prices_and_times_are_not_numbers() {
        let detector = detector();
        let now = Utc::now();
        let conversations: [&[&str]; 3] = [
            &["How much for a session?", "Rp 150.000 for 60 min"],
            &["Room 1205 please", "at 14:30"],
            &["Room 1205 please", "at 14:30", "thanks"],
        ];
        for texts in conversations {
            let messages = burst(texts, now, 20);
            assert_eq!(detector.analyze_split_attempt("u", &messages), None, "{:?}", texts);
        }
    }

    #[test]
    fn dialed_foreign_code_scores() {
        let messages = burst(&["+44", "7700", "900123"], Utc::now(), 20);
        let detection = detector()
            .analyze_split_attempt("u", &messages)
            .expect("detection");
        assert_eq!(detection.detection_type, DetectionType::NumericSplit);
        assert_eq!(detection.reconstructed_number, "447700900123");
        assert_eq!(detection.confidence, 0.8);
    }

    #[test]
    fn text_split_is_detected() {
        let messages = burst(
            &["my", "number", "zero", "eight", "one", "two"],
            Utc::now(),
            10,
        );
        let detection = detector()
            .analyze_split_attempt("u", &messages)
            .expect("detection");

        assert_eq!(detection.detection_type, DetectionType::TextSplit);
        assert_eq!(detection.reconstructed_number, "0812");
    }

    #[test]
    fn indonesian_number_words_are_understood() {
        let messages = burst(
            &["nomor saya", "nol delapan", "satu dua tiga", "empat lima enam"],
            Utc::now(),
            15,
        );
        let detection = detector()
            .analyze_split_attempt("u", &messages)
            .expect("detection");
        assert_eq!(detection.detection_type, DetectionType::TextSplit);
        assert_eq!(detection.reconstructed_number, "08123456");
    }

    #[test]
    fn social_handles_are_detected() {
        let messages = burst(&["find me on", "ig: rina.spa", "or @rina_backup"], Utc::now(), 30);
        let detection = detector()
            .analyze_split_attempt("u", &messages)
            .expect("detection");
        assert_eq!(detection.detection_type, DetectionType::SocialMediaSplit);
        assert!(detection.confidence >= 0.8);
    }

    #[test]
    fn ordinary_conversation_is_not_flagged() {
        let messages = burst(
            &["hi there", "is tomorrow ok?", "I am in room 12", "see you then"],
            Utc::now(),
            30,
        );
        assert!(detector().analyze_split_attempt("u", &messages).is_none());
    }

    #[test]
    fn single_message_is_never_a_split() {
        let messages = burst(&["08 123 456 78"], Utc::now(), 0);
        assert!(detector().analyze_split_attempt("u", &messages).is_none());
    }

    #[test]
    fn window_keeps_recent_messages_and_appends_draft() {
        let now = Utc::now();
        let mut buffer = burst(&["old"], now - Duration::minutes(30), 0);
        buffer.extend(burst(&["a", "b", "c", "d", "e", "f", "g"], now - Duration::minutes(5), 10));
        let draft = burst(&["draft"], now, 0).remove(0);

        let window = window_for(&buffer, draft);
        let texts: Vec<&str> = window.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["b", "c", "d", "e", "f", "g", "draft"]);
    }

    #[test]
    fn circumvention_escalates_with_attempts() {
        let detector = detector();
        let now = Utc::now();
        let detection = |offset: i64| SplitPhoneDetection {
            messages: vec!["08".to_string(), "12".to_string()],
            reconstructed_number: "0812".to_string(),
            confidence: 0.65,
            detection_type: DetectionType::NumericSplit,
            timespan_minutes: 1.0,
            is_high_risk: false,
            detected_at: now + Duration::minutes(offset),
        };

        let levels: Vec<CircumventionRiskLevel> = (0..5)
            .map(|i| detector.assess_circumvention_risk("u", &detection(i)).risk_level)
            .collect();
        assert_eq!(
            levels,
            vec![
                CircumventionRiskLevel::Low,
                CircumventionRiskLevel::Medium,
                CircumventionRiskLevel::High,
                CircumventionRiskLevel::High,
                CircumventionRiskLevel::Critical,
            ]
        );

        let alert = detector.assess_circumvention_risk("u", &detection(6));
        assert_eq!(alert.recommended_action, RecommendedAction::Escalate);
        assert!(alert.blocks_send());
    }

    #[test]
    fn stale_detections_do_not_count() {
        let detector = detector();
        let now = Utc::now();
        let mut old = SplitPhoneDetection {
            messages: vec![],
            reconstructed_number: "0812".to_string(),
            confidence: 0.6,
            detection_type: DetectionType::NumericSplit,
            timespan_minutes: 1.0,
            is_high_risk: false,
            detected_at: now - Duration::hours(30),
        };
        detector.assess_circumvention_risk("u", &old);
        old.detected_at = now;
        let alert = detector.assess_circumvention_risk("u", &old);
        assert_eq!(alert.attempt_count, 1);
        assert_eq!(alert.risk_level, CircumventionRiskLevel::Low);
    }

    #[test]
    fn high_risk_detection_is_at_least_high() {
        let messages = burst(&["08", "123", "456", "78"], Utc::now(), 20);
        let detector = detector();
        let detection = detector
            .analyze_split_attempt("u", &messages)
            .expect("detection");
        let alert = detector.assess_circumvention_risk("u", &detection);
        assert_eq!(alert.risk_level, CircumventionRiskLevel::High);
        assert_eq!(alert.recommended_action, RecommendedAction::Block);
    }

    #[test]
    fn suggestions_depend_on_type_and_risk() {
        let messages = burst(&["08", "123", "456", "78"], Utc::now(), 20);
        let detection = detector()
            .analyze_split_attempt("u", &messages)
            .expect("detection");
        let tips = suggestions(&detection);
        assert!(tips.iter().any(|t| t.contains("in parts")));
        assert!(tips.iter().any(|t| t.contains("restrict")));
    }
}

#[cfg(test)]
mod property_tests {
    use super::*;
    use crate::history::InMemoryHistoryStore;
    use crate::models::ChatType;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// An 08 number cut into 2-4 digit pieces and sent quickly is always
        /// reconstructed by the numeric strategy.
        #[test]
        fn prop_chunked_mobile_number_detected(
            tail in "[0-9]{8,10}",
            chunk in 2usize..=4,
        ) {
            let detector = SplitDetector::new(
                Arc::new(Lexicon::new().expect("lexicon")),
                Arc::new(InMemoryHistoryStore::new()),
            );
            let number = format!("08{}", tail);
            let start = Utc::now();
            let messages: Vec<StoredMessage> = number
                .as_bytes()
                .chunks(chunk)
                .enumerate()
                .map(|(i, piece)| StoredMessage {
                    text: String::from_utf8_lossy(piece).into_owned(),
                    chat_id: "c".to_string(),
                    chat_type: ChatType::General,
                    timestamp: start + Duration::seconds(i as i64 * 5),
                })
                .collect();
            prop_assume!(messages.iter().all(|m| m.text.len() >= 2));

            let detection = detector.analyze_split_attempt("u", &messages);
            prop_assert!(detection.is_some());
            let detection = detection.expect("checked");
            prop_assert_eq!(detection.detection_type, DetectionType::NumericSplit);
            prop_assert_eq!(detection.reconstructed_number, number);
        }

        /// Confidence always stays inside [0, 1].
        #[test]
        fn prop_confidence_bounded(texts in prop::collection::vec("[a-z0-9@: ]{1,12}", 2..7)) {
            let detector = SplitDetector::new(
                Arc::new(Lexicon::new().expect("lexicon")),
                Arc::new(InMemoryHistoryStore::new()),
            );
            let now = Utc::now();
            let messages: Vec<StoredMessage> = texts
                .iter()
                .map(|t| StoredMessage {
                    text: t.clone(),
                    chat_id: "c".to_string(),
                    chat_type: ChatType::General,
                    timestamp: now,
                })
                .collect();
            if let Some(d) = detector.analyze_split_attempt("u", &messages) {
                prop_assert!((0.0..=1.0).contains(&d.confidence));
            }
        }
    }
}
