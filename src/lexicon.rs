//! Lexicon and pattern registry.
//!
//! Every regex and word table used by the filter and the split detector lives
//! here, compiled once and shared by reference.

use std::collections::HashMap;

use regex::{Regex, RegexSet};

use crate::error::Result;

/// Replacement text for redacted contact details.
pub const CONTACT_PLACEHOLDER: &str = "[CONTACT INFO REMOVED]";

/// Phone number patterns, in redaction order.
const PHONE_PATTERNS: &[&str] = &[
    // wa.me / api.whatsapp.com links
    r"(?i)(?:https?://)?(?:wa\.me/|api\.whatsapp\.com/send/?\?phone=)\+?\d{8,15}",
    // Indonesian mobile, local and international
    r"(?:\+62|62|0)[-\s.]?8(?:[-\s.]?\d){7,13}",
    // Other international numbers
    r"\+\d{1,3}[-\s.]?\(?\d{1,4}\)?(?:[-\s.]?\d){6,12}",
    // "call me at 0812 ..." style
    r"(?i)\b(?:call|text|whatsapp|wa|sms|telp|telepon|hubungi|phone)\b\s*(?:me\s+)?(?:at\s+|on\s+|di\s+|ke\s+)?[:\-]?\s*\+?\d(?:[-\s.]?\d){5,}",
    // Dashed or dotted digit groups
    r"\b\d{3,4}[-.]\d{3,4}[-.]\d{3,5}\b",
    // Long bare digit runs
    r"\b\d{10,15}\b",
];

const PROFANITY: &[&str] = &[
    "fuck", "shit", "bitch", "asshole", "bastard", "dickhead", "motherfucker", "cunt",
    "anjing", "bangsat", "kontol", "memek", "goblok", "tolol", "bajingan", "brengsek",
    "keparat", "jancok",
];

const CONTACT_KEYWORDS: &str = r"(?i)\b(?:call|text|whats\s*app|wa|phone|number|nomor|no\s*hp|hp|telp|telepon|hubungi|contact|kontak|sms|reach\s+me|dm)\b";

const SUSPICIOUS_PATTERNS: &[&str] = &[
    r"(?i)\bmy\s+(?:number|phone|no\.?|nomor|hp|wa)\b(?:\s+is)?",
    r"(?i)\bnomor\s*(?:saya|ku|aku)\b",
    r"(?i)\bwhats\s*app\b",
    r"(?i)\b(?:first|second|third|last|next)\s+(?:part|half|digits?|bit)\b",
    r"(?i)\b(?:then|and\s+then|lalu|terus)\s+(?:add|tambah)\b",
    r"[-_.*/|~]{3,}",
    r"\d(?:\s*[-_.*/|~]\s*\d){4,}",
];

const HANDLE_PATTERNS: &[&str] = &[
    r"@[A-Za-z0-9_.]{3,30}",
    r"(?i)\b(?:ig|insta|instagram)\s*[:=]\s*@?[A-Za-z0-9_.]+",
    r"(?i)\b(?:fb|facebook)\s*[:=]\s*@?[A-Za-z0-9_./]+",
    r"(?i)\b(?:tg|telegram)\s*[:=]\s*@?[A-Za-z0-9_.]+",
    r"(?i)\bwa\s*[:=]\s*\+?[A-Za-z0-9_.]+",
    r"(?i)\bline\s*[:=]\s*@?[A-Za-z0-9_.]+",
];

const NUMBER_WORDS: &[(&str, char)] = &[
    ("zero", '0'),
    ("one", '1'),
    ("two", '2'),
    ("three", '3'),
    ("four", '4'),
    ("five", '5'),
    ("six", '6'),
    ("seven", '7'),
    ("eight", '8'),
    ("nine", '9'),
    ("nol", '0'),
    ("kosong", '0'),
    ("satu", '1'),
    ("dua", '2'),
    ("tiga", '3'),
    ("empat", '4'),
    ("lima", '5'),
    ("enam", '6'),
    ("tujuh", '7'),
    ("delapan", '8'),
    ("sembilan", '9'),
];

/// Country calling codes other than Indonesia's that score as a prefix.
///
/// They only count when the text dials them with `+` or `00`, otherwise a
/// price like 150.000 would read as a North American number.
const OTHER_COUNTRY_CODES: &[&str] = &["1", "44", "60", "61", "65", "66", "81", "82", "86", "91"];

/// Compiled pattern registry.
pub struct Lexicon {
    phone_set: RegexSet,
    phone_patterns: Vec<Regex>,
    profanity: Option<Regex>,
    uppercase_run: Regex,
    currency_urgency: RegexSet,
    contact_keywords: Regex,
    digit_run: Regex,
    token: Regex,
    suspicious: Vec<Regex>,
    handles: Vec<Regex>,
    indonesian_local: Regex,
    indonesian_international: Regex,
    international_dialing: Regex,
    number_words: HashMap<&'static str, char>,
}

impl Lexicon {
    /// Compile the built-in tables.
    pub fn new() -> Result<Self> {
        let phone_patterns = PHONE_PATTERNS
            .iter()
            .map(|p| Regex::new(p))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(Self {
            phone_set: RegexSet::new(PHONE_PATTERNS)?,
            phone_patterns,
            profanity: word_list_regex(PROFANITY)?,
            uppercase_run: Regex::new(r"[A-Z]{5,}")?,
            currency_urgency: RegexSet::new([
                r"(?i)(?:\brp\.?|\bidr|\busd|\$|€|£)\s?\d[\d.,]*(?:\s?(?:k|rb|ribu|jt|juta)\b)?.{0,40}?\b(?:now|urgent|hurry|today|asap|cepat|segera|sekarang|buruan)\b",
                r"(?i)\b(?:urgent|hurry|asap|cepat|segera|buruan)\b.{0,40}?(?:\brp\.?|\bidr|\busd|\$|€|£)\s?\d",
            ])?,
            contact_keywords: Regex::new(CONTACT_KEYWORDS)?,
            digit_run: Regex::new(r"\d{2,6}")?,
            token: Regex::new(r"[\p{L}\p{N}]+")?,
            suspicious: SUSPICIOUS_PATTERNS
                .iter()
                .map(|p| Regex::new(p))
                .collect::<std::result::Result<Vec<_>, _>>()?,
            handles: HANDLE_PATTERNS
                .iter()
                .map(|p| Regex::new(p))
                .collect::<std::result::Result<Vec<_>, _>>()?,
            indonesian_local: Regex::new(r"^08\d{8,10}$")?,
            indonesian_international: Regex::new(r"^62\d{9,12}$")?,
            international_dialing: Regex::new(&format!(
                r"(?:\+|\b00)\s?(?:{})",
                OTHER_COUNTRY_CODES.join("|")
            ))?,
            number_words: NUMBER_WORDS.iter().copied().collect(),
        })
    }

    /// True if any phone pattern matches.
    pub fn contains_phone(&self, text: &str) -> bool {
        self.phone_set.is_match(text)
    }

    /// Replace every phone match with [`CONTACT_PLACEHOLDER`].
    pub fn redact_phones(&self, text: &str) -> String {
        self.phone_patterns
            .iter()
            .fold(text.to_string(), |acc, pattern| {
                pattern.replace_all(&acc, CONTACT_PLACEHOLDER).into_owned()
            })
    }

    /// The built-in profanity matcher (case-insensitive substring).
    pub fn profanity(&self) -> Option<&Regex> {
        self.profanity.as_ref()
    }

    /// Five or more consecutive uppercase ASCII letters.
    pub fn has_uppercase_run(&self, text: &str) -> bool {
        self.uppercase_run.is_match(text)
    }

    /// Currency amount paired with an urgency word, in either order.
    pub fn has_currency_urgency(&self, text: &str) -> bool {
        self.currency_urgency.is_match(text)
    }

    pub fn has_contact_keyword(&self, text: &str) -> bool {
        self.contact_keywords.is_match(text)
    }

    /// All 2-6 digit runs in order.
    pub fn digit_runs<'t>(&self, text: &'t str) -> Vec<&'t str> {
        self.digit_run.find_iter(text).map(|m| m.as_str()).collect()
    }

    /// Alphanumeric tokens in order.
    pub fn tokens<'t>(&self, text: &'t str) -> Vec<&'t str> {
        self.token.find_iter(text).map(|m| m.as_str()).collect()
    }

    /// Number of suspicious-phrase regexes that hit the text.
    pub fn suspicious_hits(&self, text: &str) -> usize {
        self.suspicious.iter().filter(|p| p.is_match(text)).count()
    }

    /// Every handle-style match, lowercased, in pattern order.
    pub fn handle_matches(&self, text: &str) -> Vec<String> {
        self.handles
            .iter()
            .flat_map(|p| p.find_iter(text).map(|m| m.as_str().to_lowercase()))
            .collect()
    }

    /// `08` or `62` prefix.
    pub fn has_indonesian_prefix(&self, digits: &str) -> bool {
        digits.starts_with("08") || digits.starts_with("62")
    }

    /// Calling code of another country, dialed explicitly in `text`.
    pub fn has_foreign_prefix(&self, digits: &str, text: &str) -> bool {
        let digits = digits.strip_prefix("00").unwrap_or(digits);
        self.international_dialing.is_match(text)
            && OTHER_COUNTRY_CODES.iter().any(|code| digits.starts_with(code))
    }

    pub fn is_indonesian_local(&self, digits: &str) -> bool {
        self.indonesian_local.is_match(digits)
    }

    pub fn is_indonesian_international(&self, digits: &str) -> bool {
        self.indonesian_international.is_match(digits)
    }

    /// Map a spelled-out number word (English or Indonesian) to its digit.
    pub fn number_word(&self, token: &str) -> Option<char> {
        self.number_words.get(token.to_lowercase().as_str()).copied()
    }

    /// Decode a leetspeak token such as `o8l2` into digits.
    ///
    /// Only tokens that already contain a digit are decoded, so ordinary words
    /// like "is" or "bot" never turn into numbers.
    pub fn leet_digits(&self, token: &str) -> Option<String> {
        if !token.chars().any(|c| c.is_ascii_digit()) {
            return None;
        }
        token
            .chars()
            .map(|c| {
                if c.is_ascii_digit() {
                    Some(c)
                } else {
                    leet_digit(c)
                }
            })
            .collect()
    }
}

/// Build a case-insensitive alternation of literal words.
///
/// Returns `None` for an empty list.
pub fn word_list_regex<S: AsRef<str>>(words: &[S]) -> Result<Option<Regex>> {
    let alternation = words
        .iter()
        .map(|w| w.as_ref().trim())
        .filter(|w| !w.is_empty())
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join("|");

    if alternation.is_empty() {
        return Ok(None);
    }
    Ok(Some(Regex::new(&format!("(?i)(?:{})", alternation))?))
}

fn leet_digit(c: char) -> Option<char> {
    match c.to_ascii_lowercase() {
        'o' => Some('0'),
        'i' | 'l' => Some('1'),
        'z' => Some('2'),
        'e' => Some('3'),
        'a' => Some('4'),
        's' => Some('5'),
        'g' => Some('6'),
        't' => Some('7'),
        'b' => Some('8'),
        'q' => Some('9'),
        _ => None,
    }
}


#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Any well-formed Indonesian mobile number embedded in text is found
        /// and fully redacted.
        #[test]
        fn prop_indonesian_mobile_always_detected(
            prefix in "[a-z ]{0,20}",
            tail in "[0-9]{8,11}",
            suffix in "[a-z ]{0,20}",
        ) {
            let lex = Lexicon::new().expect("compiles");
            let number = format!("08{}", tail);
            let text = format!("{}{}{}", prefix, number, suffix);

            prop_assert!(lex.contains_phone(&text), "'{}' should contain a phone", text);
            let redacted = lex.redact_phones(&text);
            prop_assert!(!redacted.contains(&number));
        }
    }
}
