//! Text utilities shared by the embedder and the lexical re-ranker.
//!
//! Both sides must see the same terms for a query and a chunk, so
//! tokenization, stopword filtering and stemming live in one place.

use std::collections::BTreeSet;

/// English stopwords plus question words that carry no retrieval signal.
const STOPWORDS: &[&str] = &[
    "a", "about", "after", "all", "also", "am", "an", "and", "any", "are", "as", "at", "be",
    "been", "before", "being", "but", "by", "can", "could", "did", "do", "does", "doing", "for",
    "from", "had", "has", "have", "having", "he", "her", "here", "hers", "him", "his", "how", "i",
    "if", "in", "into", "is", "it", "its", "just", "me", "more", "most", "my", "no", "not", "of",
    "on", "once", "only", "or", "other", "our", "out", "over", "please", "she", "should", "so",
    "some", "such", "than", "that", "the", "their", "them", "then", "there", "these", "they",
    "this", "those", "to", "too", "under", "until", "up", "very", "was", "we", "were", "what",
    "when", "where", "which", "while", "who", "whom", "why", "will", "with", "would", "you",
    "your", "yours",
];

/// Lowercase alphanumeric tokens, in order of appearance.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

pub fn is_stopword(word: &str) -> bool {
    STOPWORDS.binary_search(&word).is_ok()
}

/// Stem a lowercase word by stripping common English suffixes.
pub fn simple_stem(word: &str) -> String {
    if word.len() <= 3 || !word.is_ascii() {
        return word.to_string();
    }

    // Longer suffixes first.
    let rules: &[(&str, &str, usize)] = &[
        ("ational", "ate", 4),
        ("ization", "ize", 4),
        ("fulness", "ful", 4),
        ("iveness", "ive", 4),
        ("ements", "", 4),
        ("ement", "", 4),
        ("ments", "", 4),
        ("ment", "", 4),
        ("sses", "ss", 2),
        ("ies", "y", 2),
        ("ing", "", 3),
        ("ed", "", 3),
        ("ly", "", 3),
        ("es", "", 4),
        ("s", "", 3),
    ];

    for &(suffix, replacement, min_stem) in rules {
        if let Some(stem) = word.strip_suffix(suffix) {
            if stem.len() < min_stem {
                continue;
            }
            if suffix == "s" && (stem.ends_with('s') || stem.ends_with('u') || stem.ends_with('i')) {
                continue;
            }
            if suffix == "es" && !(stem.ends_with('x') || stem.ends_with("ch") || stem.ends_with("sh")) {
                // "courses" -> "course", not "cours"
                return format!("{}e", stem);
            }
            return format!("{}{}", stem, replacement);
        }
    }
    word.to_string()
}

/// Stemmed, stopword-free terms of a text, in order.
pub fn content_terms(text: &str) -> Vec<String> {
    tokenize(text)
        .into_iter()
        .filter(|t| !is_stopword(t))
        .map(|t| simple_stem(&t))
        .collect()
}

/// Distinct content terms, ordered for determinism.
pub fn term_set(text: &str) -> BTreeSet<String> {
    content_terms(text).into_iter().collect()
}

/// Fraction of `query` terms present in `candidate`, 0.0..=1.0.
pub fn term_overlap(query: &BTreeSet<String>, candidate: &BTreeSet<String>) -> f32 {
    if query.is_empty() {
        return 0.0;
    }
    let hits = query.iter().filter(|t| candidate.contains(*t)).count();
    hits as f32 / query.len() as f32
}

/// Rough token count (about four characters per token).
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Truncate to at most `max_chars` characters on a char boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
