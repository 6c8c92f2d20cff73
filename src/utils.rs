//! Text normalization helpers shared by the filter and similarity backends.

use std::collections::HashMap;

/// Collapse runs of whitespace into single spaces and trim.
pub fn normalize_inline_whitespace<T: AsRef<str>>(text: T) -> String {
    let mut normalized = String::new();
    let mut seen_space = false;
    for ch in text.as_ref().chars() {
        if ch.is_whitespace() {
            if !seen_space {
                normalized.push(' ');
                seen_space = true;
            }
        } else {
            normalized.push(ch);
            seen_space = false;
        }
    }
    normalized.trim().to_string()
}

/// Lowercase alphanumeric tokens; everything else separates tokens.
pub fn tokens(text: &str) -> Vec<String> {
    text.split(|ch: char| !ch.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Term frequencies over `tokens(text)`.
pub fn term_counts(text: &str) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    for token in tokens(text) {
        *counts.entry(token).or_insert(0) += 1;
    }
    counts
}

/// True for characters in the CJK ideograph, kana, and hangul blocks.
pub fn is_cjk(ch: char) -> bool {
    matches!(
        ch as u32,
        0x3040..=0x30FF     // hiragana, katakana
            | 0x3400..=0x4DBF
            | 0x4E00..=0x9FFF
            | 0xAC00..=0xD7AF // hangul syllables
            | 0xF900..=0xFAFF
            | 0x20000..=0x2FA1F
    )
}

/// Share of alphabetic characters that are Latin script, or `None` when the
/// text has no alphabetic characters.
pub fn latin_share(text: &str) -> Option<f32> {
    let mut alphabetic = 0usize;
    let mut latin = 0usize;
    for ch in text.chars().filter(|ch| ch.is_alphabetic()) {
        alphabetic += 1;
        if is_latin(ch) {
            latin += 1;
        }
    }
    (alphabetic > 0).then(|| latin as f32 / alphabetic as f32)
}

fn is_latin(ch: char) -> bool {
    ch.is_ascii_alphabetic()
        || matches!(ch as u32, 0x00C0..=0x024F | 0x1E00..=0x1EFF)
}
