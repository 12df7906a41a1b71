//! Full-text candidates via the FTS5 mirror
//!
//! Uses bm25 ranking; scores are normalized into (0, 1] since FTS5 reports
//! better matches as more-negative values. User input is escaped so FTS5
//! operators in queries are matched literally.

use rusqlite::Connection;

use crate::error::Result;
use crate::types::{
    MatchStrategy, MemoryCategory, MemoryKind, SearchCandidate, SearchQuery,
};

use super::{push_filters, OVERSAMPLE};

/// Fetch full-text candidates from both memory tables.
pub fn fts_candidates(conn: &Connection, query: &SearchQuery) -> Result<Vec<SearchCandidate>> {
    let match_expr = escape_fts_query(&query.text);
    if match_expr.is_empty() {
        return Ok(Vec::new());
    }

    let per_kind = (query.limit * OVERSAMPLE).max(1);
    let mut out = Vec::new();

    for kind in [MemoryKind::ShortTerm, MemoryKind::LongTerm] {
        let mut sql = format!(
            "SELECT m.memory_id, m.summary, m.category_primary, m.importance_score,
                    m.created_at, bm25(memory_search_fts) AS rank
             FROM memory_search_fts fts
             JOIN {table} m ON m.memory_id = fts.memory_id
             WHERE memory_search_fts MATCH ?
               AND fts.memory_type = ?
               AND m.namespace = ?",
            table = kind.table()
        );
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = vec![
            Box::new(match_expr.clone()),
            Box::new(kind.as_str().to_string()),
            Box::new(query.namespace.clone()),
        ];
        push_filters(&mut sql, &mut args, query, "m");
        sql.push_str(" ORDER BY rank LIMIT ?");
        args.push(Box::new(per_kind as i64));

        let mut stmt = conn.prepare(&sql)?;
        let arg_refs: Vec<&dyn rusqlite::ToSql> = args.iter().map(|b| b.as_ref()).collect();
        let rows = stmt.query_map(arg_refs.as_slice(), |row| {
            let category: String = row.get(2)?;
            let created_at: String = row.get(4)?;
            let rank: f64 = row.get(5)?;
            Ok(SearchCandidate {
                memory_id: row.get(0)?,
                memory_kind: kind,
                summary: row.get(1)?,
                category_primary: MemoryCategory::parse_or_context(&category),
                importance_score: row.get(3)?,
                created_at: crate::storage::parse_ts(&created_at),
                strategy: MatchStrategy::FullText,
                strategy_score: normalize_bm25(rank),
            })
        })?;
        for row in rows {
            out.push(row?);
        }
    }

    Ok(out)
}

/// bm25 reports more-negative values for better matches; fold into (0, 1].
fn normalize_bm25(rank: f64) -> f32 {
    (1.0 / (1.0 + rank.abs())) as f32
}

/// Escape user input for an FTS5 MATCH expression. Each whitespace-separated
/// term is quoted when it carries FTS5 syntax characters or is a boolean
/// operator, so queries never inject operators.
pub fn escape_fts_query(text: &str) -> String {
    text.split_whitespace()
        .map(escape_fts_term)
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn escape_fts_term(term: &str) -> String {
    const SYNTAX: &[char] = &[
        '"', '*', '(', ')', '{', '}', '[', ']', '^', '~', ':', '+', '-',
    ];
    let is_operator = matches!(term, "AND" | "OR" | "NOT" | "NEAR");
    let needs_quoting = is_operator || term.chars().any(|c| SYNTAX.contains(&c));

    if !needs_quoting {
        return term.to_string();
    }
    format!("\"{}\"", term.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_terms_pass_through() {
        assert_eq!(escape_fts_query("rust testing"), "rust testing");
    }

    #[test]
    fn operators_are_quoted() {
        assert_eq!(escape_fts_query("go OR rust"), "go \"OR\" rust");
        assert_eq!(escape_fts_query("content:x"), "\"content:x\"");
        assert_eq!(escape_fts_query("c++"), "\"c++\"");
    }

    #[test]
    fn quotes_are_doubled() {
        assert_eq!(escape_fts_query("say \"hi\""), "say \"\"\"hi\"\"\"");
    }

    #[test]
    fn empty_input_is_empty() {
        assert_eq!(escape_fts_query("   "), "");
    }

    #[test]
    fn bm25_normalization_is_bounded() {
        assert!(normalize_bm25(0.0) <= 1.0);
        assert!(normalize_bm25(-5.0) > 0.0);
        assert!(normalize_bm25(-5.0) < normalize_bm25(-0.5));
    }
}
