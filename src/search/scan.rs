//! LIKE-based scan and entity-index candidates
//!
//! The LIKE scan is the fallback when FTS is unavailable or dry. Its score
//! is the fraction of query terms found in `searchable_content`/`summary`.
//! Entity candidates prefer exact value matches and fall back to prefix
//! matches at a discount, weighted by the stored entity relevance.

use rusqlite::Connection;

use crate::error::Result;
use crate::types::{
    MatchStrategy, MemoryCategory, MemoryKind, SearchCandidate, SearchQuery,
};

use super::{push_filters, OVERSAMPLE};

/// Discount applied to prefix (vs exact) entity matches
const PREFIX_DISCOUNT: f32 = 0.7;

/// Escape LIKE wildcards in user input.
fn escape_like(term: &str) -> String {
    term.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

fn query_terms(text: &str) -> Vec<String> {
    text.split_whitespace()
        .map(|t| t.trim_matches(|c: char| !c.is_alphanumeric()))
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

/// Scan both memory tables with LIKE, scoring by term overlap.
pub fn like_candidates(conn: &Connection, query: &SearchQuery) -> Result<Vec<SearchCandidate>> {
    let terms = query_terms(&query.text);
    if terms.is_empty() {
        return Ok(Vec::new());
    }

    let per_kind = (query.limit * OVERSAMPLE).max(1);
    let mut out = Vec::new();

    for kind in [MemoryKind::ShortTerm, MemoryKind::LongTerm] {
        let mut sql = format!(
            "SELECT m.memory_id, m.summary, m.category_primary, m.importance_score,
                    m.created_at, m.searchable_content
             FROM {table} m
             WHERE m.namespace = ?",
            table = kind.table()
        );
        let mut args: Vec<Box<dyn rusqlite::ToSql>> =
            vec![Box::new(query.namespace.clone())];

        // any-term match; overlap scoring happens on the fetched rows
        let clauses: Vec<String> = terms
            .iter()
            .map(|_| {
                "(m.searchable_content LIKE ? ESCAPE '\\' OR m.summary LIKE ? ESCAPE '\\')"
                    .to_string()
            })
            .collect();
        sql.push_str(&format!(" AND ({})", clauses.join(" OR ")));
        for term in &terms {
            let pattern = format!("%{}%", escape_like(term));
            args.push(Box::new(pattern.clone()));
            args.push(Box::new(pattern));
        }

        push_filters(&mut sql, &mut args, query, "m");
        sql.push_str(" ORDER BY m.importance_score DESC LIMIT ?");
        args.push(Box::new(per_kind as i64));

        let mut stmt = conn.prepare(&sql)?;
        let arg_refs: Vec<&dyn rusqlite::ToSql> = args.iter().map(|b| b.as_ref()).collect();
        let rows = stmt.query_map(arg_refs.as_slice(), |row| {
            let category: String = row.get(2)?;
            let created_at: String = row.get(4)?;
            Ok((
                SearchCandidate {
                    memory_id: row.get(0)?,
                    memory_kind: kind,
                    summary: row.get(1)?,
                    category_primary: MemoryCategory::parse_or_context(&category),
                    importance_score: row.get(3)?,
                    created_at: crate::storage::parse_ts(&created_at),
                    strategy: MatchStrategy::Scan,
                    strategy_score: 0.0,
                },
                row.get::<_, String>(5)?,
            ))
        })?;

        for row in rows {
            let (mut candidate, searchable) = row?;
            candidate.strategy_score = term_overlap(&terms, &searchable, &candidate.summary);
            out.push(candidate);
        }
    }

    Ok(out)
}

fn term_overlap(terms: &[String], searchable: &str, summary: &str) -> f32 {
    let haystack = format!("{} {}", searchable.to_lowercase(), summary.to_lowercase());
    let matched = terms.iter().filter(|t| haystack.contains(t.as_str())).count();
    matched as f32 / terms.len() as f32
}

/// Fetch entity-index candidates for each query term.
pub fn entity_candidates(conn: &Connection, query: &SearchQuery) -> Result<Vec<SearchCandidate>> {
    let terms = query_terms(&query.text);
    if terms.is_empty() {
        return Ok(Vec::new());
    }

    let per_kind = (query.limit * OVERSAMPLE).max(1);
    let mut out = Vec::new();

    for kind in [MemoryKind::ShortTerm, MemoryKind::LongTerm] {
        for term in &terms {
            let mut sql = format!(
                "SELECT m.memory_id, m.summary, m.category_primary, m.importance_score,
                        m.created_at, e.relevance_score,
                        (LOWER(e.entity_value) = ?) AS exact
                 FROM memory_entities e
                 JOIN {table} m ON m.memory_id = e.memory_id
                 WHERE e.namespace = ? AND e.memory_type = ?
                   AND (LOWER(e.entity_value) = ? OR LOWER(e.entity_value) LIKE ? ESCAPE '\\')",
                table = kind.table()
            );
            let prefix = format!("{}%", escape_like(term));
            let mut args: Vec<Box<dyn rusqlite::ToSql>> = vec![
                Box::new(term.clone()),
                Box::new(query.namespace.clone()),
                Box::new(kind.as_str().to_string()),
                Box::new(term.clone()),
                Box::new(prefix),
            ];
            push_filters(&mut sql, &mut args, query, "m");
            sql.push_str(" ORDER BY exact DESC, e.relevance_score DESC LIMIT ?");
            args.push(Box::new(per_kind as i64));

            let mut stmt = conn.prepare(&sql)?;
            let arg_refs: Vec<&dyn rusqlite::ToSql> = args.iter().map(|b| b.as_ref()).collect();
            let rows = stmt.query_map(arg_refs.as_slice(), |row| {
                let category: String = row.get(2)?;
                let created_at: String = row.get(4)?;
                let relevance: f32 = row.get(5)?;
                let exact: bool = row.get::<_, i64>(6)? != 0;
                Ok(SearchCandidate {
                    memory_id: row.get(0)?,
                    memory_kind: kind,
                    summary: row.get(1)?,
                    category_primary: MemoryCategory::parse_or_context(&category),
                    importance_score: row.get(3)?,
                    created_at: crate::storage::parse_ts(&created_at),
                    strategy: MatchStrategy::Entity,
                    strategy_score: if exact {
                        relevance
                    } else {
                        relevance * PREFIX_DISCOUNT
                    },
                })
            })?;
            for row in rows {
                out.push(row?);
            }
        }
    }

    Ok(out)
}
