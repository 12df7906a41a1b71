//! Hybrid search over the memory tables
//!
//! Strategies, combined: full-text match on the FTS mirror, entity-index
//! match, and the planner's category / importance / temporal filters pushed
//! down into SQL. When FTS is unavailable or returns nothing, a LIKE scan
//! takes its place and the same ranking applies.

mod fts;
mod rank;
mod scan;

pub use fts::{escape_fts_query, fts_candidates};
pub use rank::{combine_candidates, recency_norm};
pub use scan::{entity_candidates, like_candidates};

use tracing::warn;

use crate::storage::Store;
use crate::types::{MemoryHit, SearchQuery};

/// Candidates fetched per strategy before ranking, as a multiple of the
/// requested limit.
pub(crate) const OVERSAMPLE: usize = 4;

/// Run a ranked hybrid search. Failures degrade to an empty result with a
/// warning; the retrieval planner treats that as "no relevant context".
pub fn search(store: &Store, query: &SearchQuery) -> Vec<MemoryHit> {
    match try_search(store, query) {
        Ok(hits) => hits,
        Err(e) => {
            warn!(error = %e, "search failed, returning no context");
            Vec::new()
        }
    }
}

/// Error-surfacing variant used by the coordinator's direct retrieval API.
pub fn try_search(store: &Store, query: &SearchQuery) -> crate::error::Result<Vec<MemoryHit>> {
    let mut candidates = if store.fts_available() {
        store.search_fts(query)?
    } else {
        Vec::new()
    };

    if candidates.is_empty() {
        // FTS unavailable or dry; same ranking over a LIKE scan
        candidates = store.search_like(query)?;
    }

    candidates.extend(store.search_entities(query)?);

    Ok(combine_candidates(candidates, query.limit))
}

/// Append the planner's pushed-down filters for a memory-table alias.
pub(crate) fn push_filters(
    sql: &mut String,
    args: &mut Vec<Box<dyn rusqlite::ToSql>>,
    query: &SearchQuery,
    alias: &str,
) {
    if !query.categories.is_empty() {
        let placeholders = vec!["?"; query.categories.len()].join(", ");
        sql.push_str(&format!(
            " AND {alias}.category_primary IN ({placeholders})"
        ));
        for category in &query.categories {
            args.push(Box::new(category.as_str().to_string()));
        }
    }
    if let Some(min) = query.min_importance {
        sql.push_str(&format!(" AND {alias}.importance_score >= ?"));
        args.push(Box::new(min as f64));
    }
    if let Some(after) = query.created_after {
        sql.push_str(&format!(" AND {alias}.created_at >= ?"));
        args.push(Box::new(after.to_rfc3339()));
    }
    if let Some(before) = query.created_before {
        sql.push_str(&format!(" AND {alias}.created_at <= ?"));
        args.push(Box::new(before.to_rfc3339()));
    }
}
