//! Database queries for the memory tables

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};

use crate::error::Result;
use crate::types::{
    ChatRecord, EntityIndexRow, LongTermFilters, MemoryCategory, MemoryId, MemoryKind, MemoryRow,
    MemoryStats, RetentionType, RuleRow, RuleType,
};

/// Parse an RFC 3339 column value, falling back to now on corruption.
pub(crate) fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_ts_opt(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
    })
}

/// Column list shared by both memory tables. Long-term-only columns are
/// read with per-row fallbacks.
const MEMORY_COLUMNS: &str = "memory_id, chat_id, processed_data, importance_score, \
     category_primary, retention_type, namespace, created_at, expires_at, \
     access_count, last_accessed, searchable_content, summary, is_permanent_context";

const LONG_TERM_EXTRA: &str = ", novelty_score, relevance_score, actionability_score";

fn memory_row_from_row(row: &Row) -> rusqlite::Result<MemoryRow> {
    let processed_raw: String = row.get("processed_data")?;
    let category_raw: String = row.get("category_primary")?;
    let retention_raw: String = row.get("retention_type")?;
    let created_at: String = row.get("created_at")?;
    let expires_at: Option<String> = row.get("expires_at")?;
    let last_accessed: Option<String> = row.get("last_accessed")?;

    Ok(MemoryRow {
        memory_id: row.get("memory_id")?,
        chat_id: row.get("chat_id")?,
        processed_data: serde_json::from_str(&processed_raw).unwrap_or_default(),
        importance_score: row.get("importance_score")?,
        category_primary: MemoryCategory::parse_or_context(&category_raw),
        retention_type: retention_raw.parse().unwrap_or(RetentionType::ShortTerm),
        namespace: row.get("namespace")?,
        created_at: parse_ts(&created_at),
        expires_at: parse_ts_opt(expires_at),
        access_count: row.get("access_count")?,
        last_accessed: parse_ts_opt(last_accessed),
        searchable_content: row.get("searchable_content")?,
        summary: row.get("summary")?,
        novelty_score: row.get("novelty_score").unwrap_or(0.0),
        relevance_score: row.get("relevance_score").unwrap_or(0.0),
        actionability_score: row.get("actionability_score").unwrap_or(0.0),
        is_permanent_context: row.get::<_, i64>("is_permanent_context")? != 0,
    })
}

fn rule_from_row(row: &Row) -> rusqlite::Result<RuleRow> {
    let rule_type_raw: String = row.get("rule_type")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;

    Ok(RuleRow {
        rule_id: row.get("rule_id")?,
        rule_text: row.get("rule_text")?,
        rule_type: rule_type_raw.parse().unwrap_or(RuleType::Preference),
        priority: RuleRow::clamp_priority(row.get("priority")?),
        active: row.get::<_, i64>("active")? != 0,
        context_conditions: row.get("context_conditions")?,
        namespace: row.get("namespace")?,
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
    })
}

pub fn insert_chat(conn: &Connection, record: &ChatRecord) -> Result<()> {
    let metadata = serde_json::to_string(&record.metadata)?;
    conn.prepare_cached(
        "INSERT INTO chat_history
            (chat_id, user_input, ai_output, model, timestamp, session_id,
             namespace, tokens_used, metadata)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )?
    .execute(params![
        record.chat_id,
        record.user_input,
        record.ai_output,
        record.model,
        record.timestamp.to_rfc3339(),
        record.session_id,
        record.namespace,
        record.tokens_used,
        metadata,
    ])?;
    Ok(())
}

/// Insert a memory row into the table selected by its kind. Caller wraps
/// this together with `insert_entities` in one transaction.
pub fn insert_memory(conn: &Connection, row: &MemoryRow) -> Result<()> {
    let processed = serde_json::to_string(&row.processed_data)?;

    match row.kind() {
        MemoryKind::ShortTerm => {
            conn.prepare_cached(
                "INSERT INTO short_term_memory
                    (memory_id, chat_id, processed_data, importance_score,
                     category_primary, retention_type, namespace, created_at,
                     expires_at, access_count, last_accessed,
                     searchable_content, summary, is_permanent_context)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )?
            .execute(params![
                row.memory_id,
                row.chat_id,
                processed,
                row.importance_score,
                row.category_primary.as_str(),
                row.retention_type.as_str(),
                row.namespace,
                row.created_at.to_rfc3339(),
                row.expires_at.map(|dt| dt.to_rfc3339()),
                row.access_count,
                row.last_accessed.map(|dt| dt.to_rfc3339()),
                row.searchable_content,
                row.summary,
                row.is_permanent_context as i64,
            ])?;
        }
        MemoryKind::LongTerm => {
            let labels = serde_json::to_string(&row.processed_data.conscious_labels)?;
            conn.prepare_cached(
                "INSERT INTO long_term_memory
                    (memory_id, chat_id, processed_data, importance_score,
                     category_primary, retention_type, namespace, created_at,
                     expires_at, access_count, last_accessed,
                     searchable_content, summary, novelty_score,
                     relevance_score, actionability_score, conscious_labels,
                     is_permanent_context)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )?
            .execute(params![
                row.memory_id,
                row.chat_id,
                processed,
                row.importance_score,
                row.category_primary.as_str(),
                row.retention_type.as_str(),
                row.namespace,
                row.created_at.to_rfc3339(),
                row.expires_at.map(|dt| dt.to_rfc3339()),
                row.access_count,
                row.last_accessed.map(|dt| dt.to_rfc3339()),
                row.searchable_content,
                row.summary,
                row.novelty_score,
                row.relevance_score,
                row.actionability_score,
                labels,
                row.is_permanent_context as i64,
            ])?;
        }
    }
    Ok(())
}

pub fn insert_entities(conn: &Connection, entities: &[EntityIndexRow]) -> Result<()> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO memory_entities
            (memory_id, memory_type, entity_type, entity_value,
             relevance_score, namespace, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )?;
    for entity in entities {
        stmt.execute(params![
            entity.memory_id,
            entity.memory_kind.as_str(),
            entity.entity_type.as_str(),
            entity.entity_value,
            entity.relevance_score,
            entity.namespace,
            entity.created_at.to_rfc3339(),
        ])?;
    }
    Ok(())
}

pub fn touch_memory(conn: &Connection, kind: MemoryKind, memory_id: &str) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    let sql = format!(
        "UPDATE {} SET access_count = access_count + 1, last_accessed = ? WHERE memory_id = ?",
        kind.table()
    );
    conn.execute(&sql, params![now, memory_id])?;
    Ok(())
}

pub fn expire_short_term(conn: &Connection, now: DateTime<Utc>) -> Result<usize> {
    let deleted = conn.execute(
        "DELETE FROM short_term_memory
         WHERE expires_at IS NOT NULL AND expires_at < ?",
        params![now.to_rfc3339()],
    )?;
    Ok(deleted)
}

pub fn sweep_long_term(conn: &Connection, namespace: &str, cutoff: DateTime<Utc>) -> Result<usize> {
    // permanent rows are never swept
    let deleted = conn.execute(
        "DELETE FROM long_term_memory
         WHERE namespace = ? AND retention_type = 'long_term' AND created_at < ?",
        params![namespace, cutoff.to_rfc3339()],
    )?;
    Ok(deleted)
}

/// Insert or refresh a promoted working-set row, reconciled by its source
/// long-term memory id.
pub fn upsert_working_set(conn: &Connection, row: &MemoryRow, source_id: &str) -> Result<()> {
    let processed = serde_json::to_string(&row.processed_data)?;

    let existing: Option<String> = conn
        .prepare_cached(
            "SELECT memory_id FROM short_term_memory
             WHERE namespace = ? AND source_memory_id = ?",
        )?
        .query_row(params![row.namespace, source_id], |r| r.get(0))
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;

    match existing {
        Some(memory_id) => {
            conn.prepare_cached(
                "UPDATE short_term_memory
                 SET processed_data = ?, importance_score = ?, category_primary = ?,
                     searchable_content = ?, summary = ?, created_at = ?,
                     expires_at = NULL, is_permanent_context = 1
                 WHERE memory_id = ?",
            )?
            .execute(params![
                processed,
                row.importance_score,
                row.category_primary.as_str(),
                row.searchable_content,
                row.summary,
                row.created_at.to_rfc3339(),
                memory_id,
            ])?;
        }
        None => {
            conn.prepare_cached(
                "INSERT INTO short_term_memory
                    (memory_id, chat_id, processed_data, importance_score,
                     category_primary, retention_type, namespace, created_at,
                     expires_at, access_count, last_accessed,
                     searchable_content, summary, is_permanent_context,
                     source_memory_id)
                 VALUES (?, ?, ?, ?, ?, 'short_term', ?, ?, NULL, 0, NULL, ?, ?, 1, ?)",
            )?
            .execute(params![
                row.memory_id,
                row.chat_id,
                processed,
                row.importance_score,
                row.category_primary.as_str(),
                row.namespace,
                row.created_at.to_rfc3339(),
                row.searchable_content,
                row.summary,
                source_id,
            ])?;
        }
    }
    Ok(())
}

pub fn list_short_term(conn: &Connection, namespace: &str, limit: usize) -> Result<Vec<MemoryRow>> {
    let sql = format!(
        "SELECT {MEMORY_COLUMNS} FROM short_term_memory
         WHERE namespace = ?
         ORDER BY created_at DESC LIMIT ?"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt
        .query_map(params![namespace, limit as i64], memory_row_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn list_long_term(
    conn: &Connection,
    namespace: &str,
    filters: &LongTermFilters,
    limit: usize,
) -> Result<Vec<MemoryRow>> {
    let mut sql = format!(
        "SELECT {MEMORY_COLUMNS}{LONG_TERM_EXTRA} FROM long_term_memory WHERE namespace = ?"
    );
    let mut args: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(namespace.to_string())];

    if let Some(category) = filters.category {
        sql.push_str(" AND category_primary = ?");
        args.push(Box::new(category.as_str().to_string()));
    }
    if let Some(min) = filters.min_importance {
        sql.push_str(" AND importance_score >= ?");
        args.push(Box::new(min as f64));
    }
    if let Some(after) = filters.created_after {
        sql.push_str(" AND created_at >= ?");
        args.push(Box::new(after.to_rfc3339()));
    }
    sql.push_str(" ORDER BY importance_score DESC, created_at DESC LIMIT ?");
    args.push(Box::new(limit as i64));

    let mut stmt = conn.prepare(&sql)?;
    let arg_refs: Vec<&dyn rusqlite::ToSql> = args.iter().map(|b| b.as_ref()).collect();
    let rows = stmt
        .query_map(arg_refs.as_slice(), memory_row_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn working_set(conn: &Connection, namespace: &str, limit: usize) -> Result<Vec<MemoryRow>> {
    let sql = format!(
        "SELECT {MEMORY_COLUMNS} FROM short_term_memory
         WHERE namespace = ? AND is_permanent_context = 1
         ORDER BY importance_score DESC, created_at DESC LIMIT ?"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt
        .query_map(params![namespace, limit as i64], memory_row_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn get_rules(conn: &Connection, namespace: &str, active_only: bool) -> Result<Vec<RuleRow>> {
    let sql = if active_only {
        "SELECT rule_id, rule_text, rule_type, priority, active, context_conditions,
                namespace, created_at, updated_at
         FROM rules_memory WHERE namespace = ? AND active = 1
         ORDER BY priority DESC, created_at ASC"
    } else {
        "SELECT rule_id, rule_text, rule_type, priority, active, context_conditions,
                namespace, created_at, updated_at
         FROM rules_memory WHERE namespace = ?
         ORDER BY priority DESC, created_at ASC"
    };
    let mut stmt = conn.prepare_cached(sql)?;
    let rows = stmt
        .query_map(params![namespace], rule_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn put_rule(conn: &Connection, rule: &RuleRow) -> Result<()> {
    conn.prepare_cached(
        "INSERT INTO rules_memory
            (rule_id, rule_text, rule_type, priority, active,
             context_conditions, namespace, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(rule_id) DO UPDATE SET
            rule_text = excluded.rule_text,
            rule_type = excluded.rule_type,
            priority = excluded.priority,
            active = excluded.active,
            context_conditions = excluded.context_conditions,
            updated_at = excluded.updated_at",
    )?
    .execute(params![
        rule.rule_id,
        rule.rule_text,
        rule.rule_type.as_str(),
        rule.priority as i64,
        rule.active as i64,
        rule.context_conditions,
        rule.namespace,
        rule.created_at.to_rfc3339(),
        rule.updated_at.to_rfc3339(),
    ])?;
    Ok(())
}

pub fn link_memories(
    conn: &Connection,
    namespace: &str,
    from_id: &str,
    to_id: &str,
    relationship_type: &str,
    strength: f32,
) -> Result<()> {
    conn.prepare_cached(
        "INSERT INTO memory_relationships
            (from_memory_id, to_memory_id, relationship_type, strength, namespace, created_at)
         VALUES (?, ?, ?, ?, ?, ?)
         ON CONFLICT(from_memory_id, to_memory_id, relationship_type)
         DO UPDATE SET strength = excluded.strength",
    )?
    .execute(params![
        from_id,
        to_id,
        relationship_type,
        strength,
        namespace,
        Utc::now().to_rfc3339(),
    ])?;
    Ok(())
}

pub fn get_related(conn: &Connection, memory_id: &str, limit: usize) -> Result<Vec<MemoryId>> {
    let mut stmt = conn.prepare_cached(
        "SELECT CASE WHEN from_memory_id = ?1 THEN to_memory_id ELSE from_memory_id END
         FROM memory_relationships
         WHERE from_memory_id = ?1 OR to_memory_id = ?1
         ORDER BY strength DESC LIMIT ?2",
    )?;
    let ids = stmt
        .query_map(params![memory_id, limit as i64], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(ids)
}

pub fn stats(conn: &Connection, namespace: &str) -> Result<MemoryStats> {
    let mut out = MemoryStats::default();

    out.chat_count = conn.query_row(
        "SELECT COUNT(*) FROM chat_history WHERE namespace = ?",
        params![namespace],
        |row| row.get(0),
    )?;
    out.short_term_count = conn.query_row(
        "SELECT COUNT(*) FROM short_term_memory WHERE namespace = ?",
        params![namespace],
        |row| row.get(0),
    )?;
    out.long_term_count = conn.query_row(
        "SELECT COUNT(*) FROM long_term_memory WHERE namespace = ?",
        params![namespace],
        |row| row.get(0),
    )?;
    out.rule_count = conn.query_row(
        "SELECT COUNT(*) FROM rules_memory WHERE namespace = ?",
        params![namespace],
        |row| row.get(0),
    )?;
    out.entity_count = conn.query_row(
        "SELECT COUNT(*) FROM memory_entities WHERE namespace = ?",
        params![namespace],
        |row| row.get(0),
    )?;

    let mut stmt = conn.prepare_cached(
        "SELECT category_primary, COUNT(*) FROM (
            SELECT category_primary FROM short_term_memory WHERE namespace = ?1
            UNION ALL
            SELECT category_primary FROM long_term_memory WHERE namespace = ?1
         ) GROUP BY category_primary",
    )?;
    let counts = stmt.query_map(params![namespace], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;
    for entry in counts {
        let (category, count) = entry?;
        out.category_counts.insert(category, count);
    }

    out.avg_importance = conn.query_row(
        "SELECT AVG(importance_score) FROM (
            SELECT importance_score FROM short_term_memory WHERE namespace = ?1
            UNION ALL
            SELECT importance_score FROM long_term_memory WHERE namespace = ?1
         )",
        params![namespace],
        |row| row.get(0),
    )?;

    Ok(out)
}
