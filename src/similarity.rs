//! String similarity for near-duplicate detection.
//!
//! Similarity is `1 - levenshtein / max_len` over normalized text, so two
//! messages that differ only in case or spacing score 1.0.

/// Lowercase, collapse whitespace, trim.
pub fn normalize(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut last_was_space = false;
    for ch in s.chars().flat_map(char::to_lowercase) {
        if ch.is_whitespace() {
            if !last_was_space {
                out.push(' ');
                last_was_space = true;
            }
        } else {
            out.push(ch);
            last_was_space = false;
        }
    }
    out.trim().to_string()
}

/// Edit distance over chars (insert, delete, substitute).
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a_chars: Vec<char> = a.chars().collect();
    let b_chars: Vec<char> = b.chars().collect();
    let m = b_chars.len();
    if a_chars.is_empty() {
        return m;
    }
    if m == 0 {
        return a_chars.len();
    }

    let mut prev: Vec<usize> = (0..=m).collect();
    let mut curr: Vec<usize> = vec![0; m + 1];

    for (i, ca) in a_chars.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b_chars.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[m]
}

/// Normalized similarity in `[0, 1]`.
pub fn similarity(a: &str, b: &str) -> f64 {
    let a = normalize(a);
    let b = normalize(b);
    if a == b {
        return 1.0;
    }
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - levenshtein(&a, &b) as f64 / max_len as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levenshtein_basics() {
        assert_eq!(levenshtein("cat", "cat"), 0);
        assert_eq!(levenshtein("cat", "car"), 1);
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("kitten", "sitting"), 3);
    }

    #[test]
    fn levenshtein_counts_chars_not_bytes() {
        assert_eq!(levenshtein("café", "cafe"), 1);
    }

    #[test]
    fn similarity_ignores_case_and_spacing() {
        assert_eq!(similarity("Hello   World", "hello world"), 1.0);
    }

    #[test]
    fn similarity_of_unrelated_messages_is_low() {
        assert!(similarity("are you free tomorrow", "thanks, see you") < 0.5);
    }

    #[test]
    fn similarity_of_near_duplicates_is_high() {
        assert!(similarity("buy cheap massage now!!", "buy cheap massage now!") > 0.8);
    }

    #[test]
    fn empty_strings_are_identical() {
        assert_eq!(similarity("", "   "), 1.0);
    }
}
