use regex::{Regex, RegexBuilder};
use std::collections::BTreeSet;
use tracing::warn;

/// Upper bound on patterns scanned per query.
pub const MAX_PATTERNS: usize = 16;

const STOP_WORDS: &[&str] = &[
    "about", "after", "also", "been", "before", "being", "code", "does", "doing", "done", "each", "file", "files",
    "from", "have", "here", "into", "just", "like", "make", "many", "more", "most", "much", "must", "only", "other",
    "over", "same", "should", "show", "some", "such", "than", "that", "their", "them", "then", "there", "these",
    "they", "this", "those", "used", "uses", "using", "very", "want", "were", "what", "when", "where", "which",
    "while", "with", "work", "works", "would", "your",
];

/// Compiles each pattern case-insensitively. A pattern that is not a valid
/// regex is searched as an escaped literal instead.
pub fn compile_patterns(patterns: &[String]) -> Vec<Regex> {
    let mut seen = BTreeSet::new();
    patterns
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty() && seen.insert(p.to_string()))
        .take(MAX_PATTERNS)
        .filter_map(|p| match RegexBuilder::new(p).case_insensitive(true).build() {
            Ok(re) => Some(re),
            Err(e) => {
                warn!(pattern = p, error = %e, "malformed pattern, searching it literally");
                RegexBuilder::new(&regex::escape(p)).case_insensitive(true).build().ok()
            }
        })
        .collect()
}

/// Literal seeds derived from a question when no keywords were supplied:
/// identifier-like words of at least four characters that are not stop words,
/// with a trailing `ing`/`ed`/`es`/`s` removed so `validated` also finds
/// `validate_jwt`.
pub fn seeds_from_question(question: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    question
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|w| w.chars().count() >= 4)
        .map(str::to_lowercase)
        .filter(|w| !STOP_WORDS.contains(&w.as_str()))
        .map(|w| regex::escape(stem(&w)))
        .filter(|w| seen.insert(w.clone()))
        .take(MAX_PATTERNS)
        .collect()
}

fn stem(word: &str) -> &str {
    for suffix in ["ing", "ed", "es", "s"] {
        if let Some(base) = word.strip_suffix(suffix) {
            if base.chars().count() >= 4 && !word.ends_with("ss") {
                return base;
            }
        }
    }
    word
}
