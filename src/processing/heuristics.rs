//! Rule-based text analysis for the classifier and planner fallbacks
//!
//! Entities come from capitalized-token patterns plus a curated technology
//! keyword list; search terms from stop-word filtering. Extraction never
//! panics and output is bounded.

use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::types::EntitySet;

/// Minimum combined exchange length the fallback classifier will store
pub const MIN_STORE_CHARS: usize = 12;

/// Maximum entities extracted from one exchange
const MAX_ENTITIES: usize = 50;

/// Capitalized words and multi-word names, skipping sentence starts is not
/// attempted; noise is tolerable for keyword search
static CAPITALIZED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[A-Z][A-Za-z0-9+#.]{1,30}(?:\s+[A-Z][A-Za-z0-9]{1,30})*\b")
        .expect("valid regex"));

static WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"[A-Za-z0-9+#.]+").expect("valid regex"));

/// Technologies recognized case-insensitively even when lowercased in text
const TECH_KEYWORDS: &[&str] = &[
    "rust", "go", "golang", "python", "javascript", "typescript", "java", "kotlin", "swift",
    "ruby", "php", "c++", "c#", "scala", "haskell", "elixir", "sql", "postgres", "postgresql",
    "mysql", "sqlite", "redis", "mongodb", "kafka", "rabbitmq", "docker", "kubernetes", "aws",
    "azure", "gcp", "terraform", "react", "vue", "angular", "svelte", "django", "flask",
    "fastapi", "rails", "spring", "tokio", "axum", "pytest", "jest", "graphql", "grpc", "rest",
    "oauth", "jwt", "linux", "git", "github", "gitlab", "ci", "tensorflow", "pytorch", "llm",
    "openai", "anthropic", "ollama",
];

/// Stop words dropped from fallback search terms
const STOP_WORDS: &[&str] = &[
    "a", "an", "the", "and", "or", "but", "if", "then", "else", "when", "while", "of", "at",
    "by", "for", "with", "about", "into", "to", "from", "in", "on", "out", "up", "down", "is",
    "am", "are", "was", "were", "be", "been", "being", "have", "has", "had", "do", "does",
    "did", "will", "would", "should", "could", "can", "may", "might", "must", "shall", "i",
    "me", "my", "we", "our", "you", "your", "he", "she", "it", "its", "they", "them", "their",
    "this", "that", "these", "those", "what", "which", "who", "how", "why", "where", "not",
    "no", "yes", "so", "as", "just", "also", "very", "too", "more", "most", "some", "any",
    "help", "please", "want", "need", "like", "let", "lets", "get", "got", "make", "use",
];

fn is_stop_word(word: &str) -> bool {
    STOP_WORDS.contains(&word)
}

fn is_tech_keyword(word: &str) -> bool {
    TECH_KEYWORDS.contains(&word)
}

/// Extract entity groups from an exchange.
///
/// Capitalized tokens land in `keywords` unless they match the technology
/// list; lowercase technology mentions are picked up separately.
pub fn extract_entities(text: &str) -> EntitySet {
    let mut entities = EntitySet::default();
    let mut seen = 0usize;

    for m in CAPITALIZED.find_iter(text) {
        if seen >= MAX_ENTITIES {
            break;
        }
        let token = m.as_str().trim();
        if token.len() < 2 {
            continue;
        }
        let lowered = token.to_lowercase();
        if is_stop_word(&lowered) {
            continue;
        }
        if is_tech_keyword(&lowered) {
            entities.technologies.insert(token.to_string());
        } else {
            entities.keywords.insert(token.to_string());
        }
        seen += 1;
    }

    for m in WORD.find_iter(text) {
        if seen >= MAX_ENTITIES {
            break;
        }
        let lowered = m.as_str().to_lowercase();
        if is_tech_keyword(&lowered) && !contains_case_insensitive(&entities.technologies, &lowered)
        {
            entities.technologies.insert(m.as_str().to_string());
            seen += 1;
        }
    }

    entities
}

fn contains_case_insensitive(set: &BTreeSet<String>, lowered: &str) -> bool {
    set.iter().any(|v| v.to_lowercase() == lowered)
}

/// Derive search terms from a user message: stop-word filtering plus
/// extracted entity values, deduplicated in first-seen order.
pub fn extract_search_terms(text: &str) -> Vec<String> {
    let mut terms = Vec::new();
    let mut seen = BTreeSet::new();

    for m in WORD.find_iter(text) {
        let lowered = m.as_str().to_lowercase();
        if lowered.len() < 2 || is_stop_word(&lowered) {
            continue;
        }
        if seen.insert(lowered.clone()) {
            terms.push(lowered);
        }
    }

    terms
}

/// Normalize text for the `searchable_content` column: lowercased,
/// punctuation stripped, whitespace collapsed, entity values appended.
pub fn normalize_searchable(text: &str, entities: &EntitySet) -> String {
    let mut out: String = WORD
        .find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .collect::<Vec<_>>()
        .join(" ");

    for (_, value) in entities.iter_typed() {
        let lowered = value.to_lowercase();
        if !out.contains(&lowered) {
            out.push(' ');
            out.push_str(&lowered);
        }
    }

    out
}
