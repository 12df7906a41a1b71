//! Property-based tests
//!
//! Invariants that must hold for all inputs:
//! - score clamping always lands in [0, 1]
//! - parsers and extractors never panic
//! - normalization is idempotent
//! - serialization round-trips
//!
//! Run with: cargo test --test property_tests

use proptest::prelude::*;

mod clamping {
    use super::*;
    use memori::types::{clamp01, truncate_chars};

    proptest! {
        /// clamp01 output always lands in [0, 1], including NaN/inf input
        #[test]
        fn always_in_range(v in proptest::num::f32::ANY) {
            let clamped = clamp01(v);
            prop_assert!((0.0..=1.0).contains(&clamped));
        }

        /// In-range values pass through unchanged
        #[test]
        fn identity_in_range(v in 0.0f32..=1.0f32) {
            prop_assert_eq!(clamp01(v), v);
        }

        /// Truncation respects the cap and never panics on any string
        #[test]
        fn truncation_bounded(s in ".*", max in 0usize..600) {
            let out = truncate_chars(&s, max);
            prop_assert!(out.chars().count() <= max);
        }

        /// Truncation is idempotent
        #[test]
        fn truncation_idempotent(s in ".*", max in 0usize..600) {
            let once = truncate_chars(&s, max);
            let twice = truncate_chars(&once, max);
            prop_assert_eq!(once, twice);
        }
    }
}

mod namespaces {
    use super::*;
    use memori::types::{normalize_namespace, MAX_NAMESPACE_LENGTH};

    proptest! {
        /// Normalization never panics on any input
        #[test]
        fn never_panics(s in ".*") {
            let _ = normalize_namespace(&s);
        }

        /// Successful normalization is idempotent
        #[test]
        fn idempotent_when_valid(s in "[a-zA-Z0-9_-]{1,64}") {
            if let Ok(normalized) = normalize_namespace(&s) {
                prop_assert_eq!(Ok(normalized.clone()), normalize_namespace(&normalized));
            }
        }

        /// Output respects charset and length
        #[test]
        fn output_constraints(s in "\\PC{1,100}") {
            if let Ok(normalized) = normalize_namespace(&s) {
                prop_assert!(normalized.len() <= MAX_NAMESPACE_LENGTH);
                prop_assert!(normalized.chars().all(|c|
                    c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_'
                ));
            }
        }
    }
}

mod categories {
    use super::*;
    use memori::types::MemoryCategory;

    proptest! {
        /// Category parsing is total: anything unknown coerces to context
        #[test]
        fn parse_is_total(s in ".*") {
            let _ = MemoryCategory::parse_or_context(&s);
        }

        /// Round trip through as_str is identity for known categories
        #[test]
        fn as_str_round_trip(idx in 0usize..5) {
            let category = MemoryCategory::all()[idx];
            prop_assert_eq!(MemoryCategory::parse_or_context(category.as_str()), category);
        }
    }
}

mod validation {
    use super::*;
    use memori::types::{CategorySignal, ImportanceSignal, ProcessedMemory, SUMMARY_MAX_CHARS};

    proptest! {
        /// Validation clamps every score and caps the summary for any input
        #[test]
        fn validated_records_are_in_range(
            confidence in proptest::num::f32::ANY,
            importance in proptest::num::f32::ANY,
            novelty in proptest::num::f32::ANY,
            summary in ".{0,700}",
        ) {
            let processed = ProcessedMemory {
                category: CategorySignal { confidence, ..Default::default() },
                importance: ImportanceSignal {
                    importance_score: importance,
                    novelty_score: novelty,
                    ..Default::default()
                },
                summary,
                ..Default::default()
            }
            .validate();

            prop_assert!((0.0..=1.0).contains(&processed.category.confidence));
            prop_assert!((0.0..=1.0).contains(&processed.importance.importance_score));
            prop_assert!((0.0..=1.0).contains(&processed.importance.novelty_score));
            prop_assert!(processed.summary.chars().count() <= SUMMARY_MAX_CHARS);
        }
    }
}

mod serialization {
    use super::*;
    use memori::types::{EntitySet, ProcessedMemory};

    proptest! {
        /// ProcessedMemory JSON round-trips to an equal value
        #[test]
        fn processed_memory_round_trip(
            summary in "\\PC{0,200}",
            technologies in proptest::collection::btree_set("[a-zA-Z0-9 ]{1,20}", 0..6),
            keywords in proptest::collection::btree_set("\\PC{1,20}", 0..6),
            should_store in any::<bool>(),
        ) {
            let original = ProcessedMemory {
                entities: EntitySet { technologies, keywords, ..Default::default() },
                summary,
                should_store,
                ..Default::default()
            };
            let json = serde_json::to_string(&original).unwrap();
            let back: ProcessedMemory = serde_json::from_str(&json).unwrap();
            prop_assert_eq!(original, back);
        }
    }
}

mod text_analysis {
    use super::*;
    use memori::processing::{extract_entities, extract_search_terms, normalize_searchable};
    use memori::search::escape_fts_query;
    use memori::types::EntitySet;

    proptest! {
        /// Entity extraction never panics and output is bounded
        #[test]
        fn extraction_bounded(s in "\\PC{0,500}") {
            let entities = extract_entities(&s);
            prop_assert!(entities.len() <= 50);
        }

        /// Search terms are lowercase and free of whitespace
        #[test]
        fn terms_are_normalized(s in "\\PC{0,300}") {
            for term in extract_search_terms(&s) {
                prop_assert!(!term.contains(char::is_whitespace));
                prop_assert_eq!(term.clone(), term.to_lowercase());
            }
        }

        /// Searchable normalization strips nothing it cannot re-find:
        /// every emitted token is lowercase alphanumeric-ish
        #[test]
        fn searchable_is_lowercase(s in "\\PC{0,300}") {
            let out = normalize_searchable(&s, &EntitySet::default());
            prop_assert_eq!(out.clone(), out.to_lowercase());
        }

        /// FTS escaping never panics and never emits bare operators
        #[test]
        fn fts_escape_neutralizes_operators(s in "\\PC{0,200}") {
            let escaped = escape_fts_query(&s);
            for token in escaped.split_whitespace() {
                prop_assert!(!matches!(token, "AND" | "OR" | "NOT" | "NEAR"));
            }
        }
    }
}
