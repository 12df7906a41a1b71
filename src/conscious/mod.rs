//! Conscious analyzer: long-term memory promotion into the working set
//!
//! Scans long-term memory for the active namespace, scores candidates with
//! a weighted blend of classifier signals, access frequency, and recency,
//! and copies the winners into short-term memory as non-expiring working-set
//! rows. Selection is pure SQL plus arithmetic, so client-layer outages
//! never block the refresh.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::storage::Store;
use crate::types::{LongTermFilters, MemoryCategory, MemoryRow};

/// Candidate rows scanned per analysis pass
const SCAN_LIMIT: usize = 500;

/// Score boost for rows carrying conscious-info labels
const LABEL_BOOST: f32 = 0.15;

/// Largest share of the working set one category may occupy
const MAX_CATEGORY_SHARE: f32 = 0.4;

/// Half-life in days for the recency component
const RECENCY_HALF_LIFE_DAYS: f64 = 14.0;

/// Access count treated as saturation for the frequency component
const FREQUENCY_SATURATION: f64 = 100.0;

#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    pub namespace: String,
    pub working_set_size: usize,
}

/// Map access counts onto [0, 1] with log scaling.
pub fn freq_norm(access_count: i64) -> f32 {
    let count = access_count.max(0) as f64;
    ((1.0 + count).ln() / (1.0 + FREQUENCY_SATURATION).ln()).min(1.0) as f32
}

/// Map a last-accessed time onto [0, 1] with exponential decay.
pub fn recency_norm(last_accessed: Option<DateTime<Utc>>, fallback: DateTime<Utc>, now: DateTime<Utc>) -> f32 {
    let reference = last_accessed.unwrap_or(fallback);
    let age_days = (now - reference).num_seconds().max(0) as f64 / 86_400.0;
    0.5_f64.powf(age_days / RECENCY_HALF_LIFE_DAYS) as f32
}

/// Weighted promotion score for a long-term candidate.
pub fn promotion_score(row: &MemoryRow, now: DateTime<Utc>) -> f32 {
    let base = 0.4 * row.importance_score
        + 0.2 * row.novelty_score
        + 0.3 * row.relevance_score
        + 0.1 * row.actionability_score
        + 0.25 * freq_norm(row.access_count)
        + 0.15 * recency_norm(row.last_accessed, row.created_at, now);

    if row.processed_data.conscious_labels.is_empty() {
        base
    } else {
        base + LABEL_BOOST
    }
}

/// Pick the working set from scored candidates, capping any single
/// category at [`MAX_CATEGORY_SHARE`] of the set. If the caps leave slots
/// unfilled, a top-up pass ignores them.
pub fn select_working_set(mut scored: Vec<(f32, MemoryRow)>, size: usize) -> Vec<MemoryRow> {
    scored.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.1.created_at.cmp(&a.1.created_at))
            // stable tie-break so re-runs pick the same rows
            .then(a.1.memory_id.cmp(&b.1.memory_id))
    });

    let category_cap = ((size as f32 * MAX_CATEGORY_SHARE).floor() as usize).max(1);
    let mut counts: std::collections::HashMap<MemoryCategory, usize> =
        std::collections::HashMap::new();
    let mut selected: Vec<MemoryRow> = Vec::with_capacity(size);
    let mut overflow: Vec<MemoryRow> = Vec::new();

    for (_, row) in scored {
        if selected.len() >= size {
            break;
        }
        let count = counts.entry(row.category_primary).or_insert(0);
        if *count < category_cap {
            *count += 1;
            selected.push(row);
        } else {
            overflow.push(row);
        }
    }

    for row in overflow {
        if selected.len() >= size {
            break;
        }
        selected.push(row);
    }

    selected
}

/// Background analyzer promoting essential long-term memories.
pub struct ConsciousAnalyzer {
    store: Store,
    config: AnalyzerConfig,
}

impl ConsciousAnalyzer {
    pub fn new(store: Store, config: AnalyzerConfig) -> Self {
        Self { store, config }
    }

    /// Run one analysis pass. Returns the number of promoted rows.
    ///
    /// Idempotent: promotions are reconciled by source memory id, so
    /// re-running on the same state refreshes rather than duplicates.
    pub fn analyze(&self) -> Result<usize> {
        let now = Utc::now();
        let candidates = self.store.list_long_term(
            &self.config.namespace,
            &LongTermFilters::default(),
            SCAN_LIMIT,
        )?;

        if candidates.is_empty() {
            debug!(namespace = %self.config.namespace, "no long-term candidates to promote");
            return Ok(0);
        }

        let scored: Vec<(f32, MemoryRow)> = candidates
            .into_iter()
            .map(|row| (promotion_score(&row, now), row))
            .collect();

        let selected = select_working_set(scored, self.config.working_set_size);
        let promoted = selected.len();

        for source in selected {
            let working_row = promotion_row(&source, now);
            self.store
                .upsert_working_set(&working_row, &source.memory_id)?;
        }

        info!(
            namespace = %self.config.namespace,
            promoted,
            "conscious analysis refreshed working set"
        );
        Ok(promoted)
    }

    /// Spawn the periodic refresh timer. The returned handle is aborted on
    /// `disable`.
    pub fn spawn_periodic(self: Arc<Self>, interval_hours: u64) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let period = std::time::Duration::from_secs(interval_hours * 3600);
            let mut ticker = tokio::time::interval(period);
            // the first tick fires immediately; enable already ran one pass
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let analyzer = self.clone();
                let outcome =
                    tokio::task::spawn_blocking(move || analyzer.analyze()).await;
                match outcome {
                    Ok(Ok(count)) => debug!(count, "periodic conscious analysis complete"),
                    Ok(Err(e)) => warn!(error = %e, "periodic conscious analysis failed"),
                    Err(e) => warn!(error = %e, "conscious analysis task panicked"),
                }
            }
        })
    }
}

/// Build the short-term working-set row for a promoted long-term memory.
fn promotion_row(source: &MemoryRow, now: DateTime<Utc>) -> MemoryRow {
    MemoryRow {
        memory_id: format!("{}-ws-{}", source.memory_id, now.timestamp()),
        chat_id: source.chat_id.clone(),
        processed_data: source.processed_data.clone(),
        importance_score: source.importance_score,
        category_primary: source.category_primary,
        retention_type: crate::types::RetentionType::ShortTerm,
        namespace: source.namespace.clone(),
        created_at: now,
        expires_at: None,
        access_count: 0,
        last_accessed: None,
        searchable_content: source.searchable_content.clone(),
        summary: source.summary.clone(),
        novelty_score: 0.0,
        relevance_score: 0.0,
        actionability_score: 0.0,
        is_permanent_context: true,
    }
}
