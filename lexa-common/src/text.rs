//! Text helpers shared by the parser, the cascade and the stores
//!
//! Canonical keys are case-folded and stripped of diacritics so that
//! "Ação", "acao" and "ACÃO" all land on the same row.

use sha2::{Digest, Sha256};
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Normalize a headword or token into its canonical key
///
/// Decomposes (NFD), drops combining marks, lowercases and trims. Inner
/// whitespace runs collapse to a single space.
pub fn normalize_key(raw: &str) -> String {
    let stripped: String = raw
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_lowercase)
        .collect();

    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Stable hash of a context string, used as part of cache keys
pub fn context_hash(context: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(context.trim().as_bytes());
    let digest = hasher.finalize();
    digest.iter().take(16).map(|b| format!("{:02x}", b)).collect()
}

/// Split a line into word tokens
///
/// A token is a run of alphabetic characters; apostrophes and hyphens are
/// kept only when surrounded by letters ("d'água", "beija-flor").
pub fn tokenize(line: &str) -> Vec<String> {
    let chars: Vec<char> = line.chars().collect();
    let mut tokens = Vec::new();
    let mut current = String::new();

    for (i, &c) in chars.iter().enumerate() {
        if c.is_alphabetic() {
            current.push(c);
        } else if (c == '\'' || c == '-' || c == '’')
            && !current.is_empty()
            && chars.get(i + 1).is_some_and(|n| n.is_alphabetic())
        {
            current.push(c);
        } else if !current.is_empty() {
            tokens.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }

    tokens
}
