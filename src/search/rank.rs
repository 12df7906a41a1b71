//! Composite ranking of strategy candidates
//!
//! `final = 0.6 * max(strategy scores) + 0.3 * importance + 0.1 * recency`.
//! Candidates are deduplicated by memory id keeping the maximum, with a
//! secondary order of importance descending then creation time descending.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::types::{MemoryHit, MemoryId, SearchCandidate};

const STRATEGY_WEIGHT: f32 = 0.6;
const IMPORTANCE_WEIGHT: f32 = 0.3;
const RECENCY_WEIGHT: f32 = 0.1;

/// Half-life in days for the recency component
const RECENCY_HALF_LIFE_DAYS: f64 = 30.0;

/// Map a creation time onto [0, 1] with exponential decay.
pub fn recency_norm(created_at: DateTime<Utc>, now: DateTime<Utc>) -> f32 {
    let age_days = (now - created_at).num_seconds().max(0) as f64 / 86_400.0;
    (0.5_f64.powf(age_days / RECENCY_HALF_LIFE_DAYS)) as f32
}

/// Merge per-strategy candidates into ranked, deduplicated hits.
pub fn combine_candidates(candidates: Vec<SearchCandidate>, limit: usize) -> Vec<MemoryHit> {
    let now = Utc::now();
    let mut merged: HashMap<MemoryId, MemoryHit> = HashMap::new();
    let mut best_strategy: HashMap<MemoryId, f32> = HashMap::new();

    for candidate in candidates {
        let strategy_score = candidate.strategy_score.clamp(0.0, 1.0);
        let entry_best = best_strategy
            .entry(candidate.memory_id.clone())
            .or_insert(0.0);
        *entry_best = entry_best.max(strategy_score);

        let final_score = STRATEGY_WEIGHT * *entry_best
            + IMPORTANCE_WEIGHT * candidate.importance_score
            + RECENCY_WEIGHT * recency_norm(candidate.created_at, now);

        match merged.get_mut(&candidate.memory_id) {
            Some(hit) => {
                if !hit.strategies.contains(&candidate.strategy) {
                    hit.strategies.push(candidate.strategy);
                }
                hit.final_score = hit.final_score.max(final_score);
            }
            None => {
                merged.insert(
                    candidate.memory_id.clone(),
                    MemoryHit {
                        memory_id: candidate.memory_id,
                        memory_kind: candidate.memory_kind,
                        summary: candidate.summary,
                        category_primary: candidate.category_primary,
                        importance_score: candidate.importance_score,
                        created_at: candidate.created_at,
                        final_score,
                        strategies: vec![candidate.strategy],
                    },
                );
            }
        }
    }

    let mut hits: Vec<MemoryHit> = merged.into_values().collect();
    hits.sort_by(|a, b| {
        b.final_score
            .partial_cmp(&a.final_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(
                b.importance_score
                    .partial_cmp(&a.importance_score)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
            .then(b.created_at.cmp(&a.created_at))
    });
    hits.truncate(limit);
    hits
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MatchStrategy, MemoryCategory, MemoryKind};

    fn candidate(id: &str, strategy: MatchStrategy, score: f32, importance: f32) -> SearchCandidate {
        SearchCandidate {
            memory_id: id.to_string(),
            memory_kind: MemoryKind::LongTerm,
            summary: format!("summary {}", id),
            category_primary: MemoryCategory::Fact,
            importance_score: importance,
            created_at: Utc::now(),
            strategy,
            strategy_score: score,
        }
    }

    #[test]
    fn dedup_keeps_max_and_merges_strategies() {
        let hits = combine_candidates(
            vec![
                candidate("m1", MatchStrategy::FullText, 0.4, 0.5),
                candidate("m1", MatchStrategy::Entity, 0.9, 0.5),
                candidate("m2", MatchStrategy::FullText, 0.2, 0.5),
            ],
            10,
        );

        assert_eq!(hits.len(), 2);
        let m1 = hits.iter().find(|h| h.memory_id == "m1").unwrap();
        assert_eq!(m1.strategies.len(), 2);
        // max strategy score (0.9) dominates, not the 0.4 seen first
        assert!(m1.final_score > 0.6 * 0.9);
        assert_eq!(hits[0].memory_id, "m1");
    }

    #[test]
    fn respects_limit_and_distinct_ids() {
        let candidates: Vec<_> = (0..20)
            .map(|i| candidate(&format!("m{}", i), MatchStrategy::FullText, 0.5, 0.5))
            .collect();
        let hits = combine_candidates(candidates, 5);
        assert_eq!(hits.len(), 5);
        let mut ids: Vec<_> = hits.iter().map(|h| h.memory_id.clone()).collect();
        ids.dedup();
        assert_eq!(ids.len(), 5);
    }

    #[test]
    fn importance_breaks_ties() {
        let hits = combine_candidates(
            vec![
                candidate("low", MatchStrategy::FullText, 0.5, 0.2),
                candidate("high", MatchStrategy::FullText, 0.5, 0.9),
            ],
            10,
        );
        assert_eq!(hits[0].memory_id, "high");
    }

    #[test]
    fn recency_decays() {
        let now = Utc::now();
        let fresh = recency_norm(now, now);
        let old = recency_norm(now - chrono::Duration::days(120), now);
        assert!(fresh > 0.99);
        assert!(old < 0.1);
    }
}
