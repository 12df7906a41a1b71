//! Client-server back-end over libSQL
//!
//! Implements the same `StoreBackend` trait as the embedded store against a
//! remote sqld/libSQL server. Connections are pooled (bounded, round-robin)
//! and writes are serialized on the first slot. Trait methods are
//! synchronous; async libSQL calls are bridged through the current tokio
//! runtime handle.
//!
//! The connection string is `libsql://host` (or `http(s)://host`) with the
//! auth token carried in an `authToken` query parameter.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use libsql::{params_from_iter, Builder, Connection, Database, Value};
use tracing::debug;

use crate::config::DatabaseConfig;
use crate::error::{MemoriError, Result};
use crate::search::escape_fts_query;
use crate::types::{
    ChatRecord, EntityIndexRow, LongTermFilters, MatchStrategy, MemoryCategory, MemoryId,
    MemoryKind, MemoryRow, MemoryStats, RetentionType, RuleRow, RuleType, SearchCandidate,
    SearchQuery, StoreHealth,
};

use super::backend::StoreBackend;
use super::migrations::{BASE_SCHEMA, FTS_SCHEMA, SCHEMA_VERSION};
use super::parse_ts;

/// Client-server store over libSQL.
pub struct RemoteStore {
    _db: Database,
    conns: Vec<Arc<tokio::sync::Mutex<Connection>>>,
    next_reader: AtomicUsize,
    schema_version: i32,
    fts_available: bool,
}

fn block_on<F: Future>(fut: F) -> Result<F::Output> {
    let handle = tokio::runtime::Handle::try_current().map_err(|_| {
        MemoriError::StorageFatal("remote store requires a tokio runtime".to_string())
    })?;
    Ok(tokio::task::block_in_place(|| handle.block_on(fut)))
}

fn db_err(e: libsql::Error) -> MemoriError {
    let text = e.to_string();
    let lowered = text.to_lowercase();
    if lowered.contains("unique") || lowered.contains("constraint") {
        MemoriError::StorageConflict(text)
    } else if lowered.contains("busy") || lowered.contains("timeout") || lowered.contains("stream")
    {
        MemoriError::StorageTransient(text)
    } else {
        MemoriError::StorageFatal(text)
    }
}

fn text_of(v: Value) -> String {
    match v {
        Value::Text(s) => s,
        Value::Integer(i) => i.to_string(),
        Value::Real(f) => f.to_string(),
        _ => String::new(),
    }
}

fn opt_text_of(v: Value) -> Option<String> {
    match v {
        Value::Null => None,
        other => Some(text_of(other)),
    }
}

fn i64_of(v: Value) -> i64 {
    match v {
        Value::Integer(i) => i,
        Value::Real(f) => f as i64,
        Value::Text(s) => s.parse().unwrap_or(0),
        _ => 0,
    }
}

fn f64_of(v: Value) -> f64 {
    match v {
        Value::Real(f) => f,
        Value::Integer(i) => i as f64,
        Value::Text(s) => s.parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

impl RemoteStore {
    pub fn open(config: &DatabaseConfig) -> Result<Self> {
        block_on(Self::open_async(config))?
    }

    async fn open_async(config: &DatabaseConfig) -> Result<Self> {
        let raw = config.expanded_connection_string();
        let (url, auth_token) = split_auth_token(&raw);

        let db = Builder::new_remote(url.clone(), auth_token.unwrap_or_default())
            .build()
            .await
            .map_err(db_err)?;

        let mut conns = Vec::with_capacity(config.pool_size.max(1));
        for _ in 0..config.pool_size.max(1) {
            let conn = db.connect().map_err(db_err)?;
            conns.push(Arc::new(tokio::sync::Mutex::new(conn)));
        }

        let fts_available = {
            let conn = conns[0].lock().await;
            probe_fts(&conn).await
        };

        let schema_version = {
            let conn = conns[0].lock().await;
            run_remote_migrations(&conn, fts_available, config.migration_auto).await?
        };

        debug!(url = %url, fts = fts_available, "opened remote store");

        Ok(Self {
            _db: db,
            conns,
            next_reader: AtomicUsize::new(0),
            schema_version,
            fts_available,
        })
    }

    /// Writer slot; all writes serialize here.
    fn writer(&self) -> Arc<tokio::sync::Mutex<Connection>> {
        self.conns[0].clone()
    }

    /// Round-robin reader slot.
    fn reader(&self) -> Arc<tokio::sync::Mutex<Connection>> {
        let idx = self.next_reader.fetch_add(1, Ordering::Relaxed) % self.conns.len();
        self.conns[idx].clone()
    }

    fn execute(&self, sql: &str, params: Vec<Value>) -> Result<u64> {
        let slot = self.writer();
        block_on(async move {
            let conn = slot.lock().await;
            conn.execute(sql, params_from_iter(params))
                .await
                .map_err(db_err)
        })?
    }

    fn query_rows(&self, sql: &str, params: Vec<Value>) -> Result<Vec<Vec<Value>>> {
        let slot = self.reader();
        block_on(async move {
            let conn = slot.lock().await;
            let mut rows = conn
                .query(sql, params_from_iter(params))
                .await
                .map_err(db_err)?;
            let mut out = Vec::new();
            while let Some(row) = rows.next().await.map_err(db_err)? {
                let width = rows.column_count();
                let mut values = Vec::with_capacity(width as usize);
                for idx in 0..width {
                    values.push(row.get_value(idx).map_err(db_err)?);
                }
                out.push(values);
            }
            Ok(out)
        })?
    }

    fn memory_row_of(values: Vec<Value>, kind: MemoryKind) -> MemoryRow {
        let mut it = values.into_iter();
        let memory_id = text_of(it.next().unwrap_or(Value::Null));
        let chat_id = opt_text_of(it.next().unwrap_or(Value::Null));
        let processed_raw = text_of(it.next().unwrap_or(Value::Null));
        let importance = f64_of(it.next().unwrap_or(Value::Null)) as f32;
        let category = text_of(it.next().unwrap_or(Value::Null));
        let retention = text_of(it.next().unwrap_or(Value::Null));
        let namespace = text_of(it.next().unwrap_or(Value::Null));
        let created_at = text_of(it.next().unwrap_or(Value::Null));
        let expires_at = opt_text_of(it.next().unwrap_or(Value::Null));
        let access_count = i64_of(it.next().unwrap_or(Value::Null));
        let last_accessed = opt_text_of(it.next().unwrap_or(Value::Null));
        let searchable_content = text_of(it.next().unwrap_or(Value::Null));
        let summary = text_of(it.next().unwrap_or(Value::Null));
        let is_permanent_context = i64_of(it.next().unwrap_or(Value::Null)) != 0;
        let novelty = it.next().map(|v| f64_of(v) as f32).unwrap_or(0.0);
        let relevance = it.next().map(|v| f64_of(v) as f32).unwrap_or(0.0);
        let actionability = it.next().map(|v| f64_of(v) as f32).unwrap_or(0.0);

        let _ = kind;
        MemoryRow {
            memory_id,
            chat_id,
            processed_data: serde_json::from_str(&processed_raw).unwrap_or_default(),
            importance_score: importance,
            category_primary: MemoryCategory::parse_or_context(&category),
            retention_type: retention.parse().unwrap_or(RetentionType::ShortTerm),
            namespace,
            created_at: parse_ts(&created_at),
            expires_at: expires_at.as_deref().map(parse_ts),
            access_count,
            last_accessed: last_accessed.as_deref().map(parse_ts),
            searchable_content,
            summary,
            novelty_score: novelty,
            relevance_score: relevance,
            actionability_score: actionability,
            is_permanent_context,
        }
    }

    fn candidate_of(values: Vec<Value>, kind: MemoryKind, strategy: MatchStrategy) -> SearchCandidate {
        let mut it = values.into_iter();
        let memory_id = text_of(it.next().unwrap_or(Value::Null));
        let summary = text_of(it.next().unwrap_or(Value::Null));
        let category = text_of(it.next().unwrap_or(Value::Null));
        let importance = f64_of(it.next().unwrap_or(Value::Null)) as f32;
        let created_at = text_of(it.next().unwrap_or(Value::Null));
        let score = it.next().map(f64_of).unwrap_or(0.0) as f32;

        SearchCandidate {
            memory_id,
            memory_kind: kind,
            summary,
            category_primary: MemoryCategory::parse_or_context(&category),
            importance_score: importance,
            created_at: parse_ts(&created_at),
            strategy,
            strategy_score: score.clamp(0.0, 1.0),
        }
    }
}

/// Split an `authToken` query parameter off the connection URL.
fn split_auth_token(raw: &str) -> (String, Option<String>) {
    match raw.split_once('?') {
        Some((base, query)) => {
            let token = query
                .split('&')
                .filter_map(|pair| pair.split_once('='))
                .find(|(k, _)| *k == "authToken" || *k == "auth_token")
                .map(|(_, v)| v.to_string());
            (base.to_string(), token)
        }
        None => (raw.to_string(), None),
    }
}

async fn probe_fts(conn: &Connection) -> bool {
    let created = conn
        .execute_batch(
            "CREATE VIRTUAL TABLE IF NOT EXISTS __memori_fts_probe USING fts5(probe);
             DROP TABLE __memori_fts_probe;",
        )
        .await
        .is_ok();
    created
}

async fn run_remote_migrations(conn: &Connection, fts_available: bool, auto: bool) -> Result<i32> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        (),
    )
    .await
    .map_err(db_err)?;

    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _schema_version", ())
        .await
        .map_err(db_err)?;
    let current = match rows.next().await.map_err(db_err)? {
        Some(row) => i64_of(row.get_value(0).map_err(db_err)?) as i32,
        None => 0,
    };

    if current > SCHEMA_VERSION {
        return Err(MemoriError::StorageFatal(format!(
            "database schema version {} is newer than supported version {}",
            current, SCHEMA_VERSION
        )));
    }
    if current < SCHEMA_VERSION && !auto {
        return Err(MemoriError::StorageFatal(format!(
            "database schema version {} requires migration to {} but migration_auto is disabled",
            current, SCHEMA_VERSION
        )));
    }

    if current < 1 {
        conn.execute_batch(BASE_SCHEMA).await.map_err(db_err)?;
        conn.execute("INSERT INTO _schema_version (version) VALUES (1)", ())
            .await
            .map_err(db_err)?;
    }
    if current < 2 {
        if fts_available {
            conn.execute_batch(FTS_SCHEMA).await.map_err(db_err)?;
        }
        conn.execute("INSERT INTO _schema_version (version) VALUES (2)", ())
            .await
            .map_err(db_err)?;
    }

    Ok(SCHEMA_VERSION)
}

impl StoreBackend for RemoteStore {
    fn put_chat(&self, record: &ChatRecord) -> Result<()> {
        let metadata = serde_json::to_string(&record.metadata)?;
        self.execute(
            "INSERT INTO chat_history
                (chat_id, user_input, ai_output, model, timestamp, session_id,
                 namespace, tokens_used, metadata)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            vec![
                Value::Text(record.chat_id.clone()),
                Value::Text(record.user_input.clone()),
                Value::Text(record.ai_output.clone()),
                Value::Text(record.model.clone()),
                Value::Text(record.timestamp.to_rfc3339()),
                Value::Text(record.session_id.clone()),
                Value::Text(record.namespace.clone()),
                Value::Integer(record.tokens_used as i64),
                Value::Text(metadata),
            ],
        )?;
        Ok(())
    }

    fn put_memory(&self, row: &MemoryRow, entities: &[EntityIndexRow]) -> Result<()> {
        let processed = serde_json::to_string(&row.processed_data)?;
        let slot = self.writer();
        let row = row.clone();
        let entities = entities.to_vec();

        block_on(async move {
            let conn = slot.lock().await;
            let tx = conn
                .transaction()
                .await
                .map_err(db_err)?;

            match row.kind() {
                MemoryKind::ShortTerm => {
                    tx.execute(
                        "INSERT INTO short_term_memory
                            (memory_id, chat_id, processed_data, importance_score,
                             category_primary, retention_type, namespace, created_at,
                             expires_at, access_count, last_accessed,
                             searchable_content, summary, is_permanent_context)
                         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0, NULL, ?, ?, ?)",
                        params_from_iter(vec![
                            Value::Text(row.memory_id.clone()),
                            row.chat_id.clone().map(Value::Text).unwrap_or(Value::Null),
                            Value::Text(processed),
                            Value::Real(row.importance_score as f64),
                            Value::Text(row.category_primary.as_str().to_string()),
                            Value::Text(row.retention_type.as_str().to_string()),
                            Value::Text(row.namespace.clone()),
                            Value::Text(row.created_at.to_rfc3339()),
                            row.expires_at
                                .map(|dt| Value::Text(dt.to_rfc3339()))
                                .unwrap_or(Value::Null),
                            Value::Text(row.searchable_content.clone()),
                            Value::Text(row.summary.clone()),
                            Value::Integer(row.is_permanent_context as i64),
                        ]),
                    )
                    .await
                    .map_err(db_err)?;
                }
                MemoryKind::LongTerm => {
                    let labels =
                        serde_json::to_string(&row.processed_data.conscious_labels)?;
                    tx.execute(
                        "INSERT INTO long_term_memory
                            (memory_id, chat_id, processed_data, importance_score,
                             category_primary, retention_type, namespace, created_at,
                             expires_at, access_count, last_accessed,
                             searchable_content, summary, novelty_score,
                             relevance_score, actionability_score, conscious_labels,
                             is_permanent_context)
                         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0, NULL, ?, ?, ?, ?, ?, ?, ?)",
                        params_from_iter(vec![
                            Value::Text(row.memory_id.clone()),
                            row.chat_id.clone().map(Value::Text).unwrap_or(Value::Null),
                            Value::Text(processed),
                            Value::Real(row.importance_score as f64),
                            Value::Text(row.category_primary.as_str().to_string()),
                            Value::Text(row.retention_type.as_str().to_string()),
                            Value::Text(row.namespace.clone()),
                            Value::Text(row.created_at.to_rfc3339()),
                            row.expires_at
                                .map(|dt| Value::Text(dt.to_rfc3339()))
                                .unwrap_or(Value::Null),
                            Value::Text(row.searchable_content.clone()),
                            Value::Text(row.summary.clone()),
                            Value::Real(row.novelty_score as f64),
                            Value::Real(row.relevance_score as f64),
                            Value::Real(row.actionability_score as f64),
                            Value::Text(labels),
                            Value::Integer(row.is_permanent_context as i64),
                        ]),
                    )
                    .await
                    .map_err(db_err)?;
                }
            }

            for entity in &entities {
                tx.execute(
                    "INSERT INTO memory_entities
                        (memory_id, memory_type, entity_type, entity_value,
                         relevance_score, namespace, created_at)
                     VALUES (?, ?, ?, ?, ?, ?, ?)",
                    params_from_iter(vec![
                        Value::Text(entity.memory_id.clone()),
                        Value::Text(entity.memory_kind.as_str().to_string()),
                        Value::Text(entity.entity_type.as_str().to_string()),
                        Value::Text(entity.entity_value.clone()),
                        Value::Real(entity.relevance_score as f64),
                        Value::Text(entity.namespace.clone()),
                        Value::Text(entity.created_at.to_rfc3339()),
                    ]),
                )
                .await
                .map_err(db_err)?;
            }

            tx.commit().await.map_err(db_err)?;
            Ok(())
        })?
    }

    fn put_entities(&self, entities: &[EntityIndexRow]) -> Result<()> {
        for entity in entities {
            self.execute(
                "INSERT INTO memory_entities
                    (memory_id, memory_type, entity_type, entity_value,
                     relevance_score, namespace, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
                vec![
                    Value::Text(entity.memory_id.clone()),
                    Value::Text(entity.memory_kind.as_str().to_string()),
                    Value::Text(entity.entity_type.as_str().to_string()),
                    Value::Text(entity.entity_value.clone()),
                    Value::Real(entity.relevance_score as f64),
                    Value::Text(entity.namespace.clone()),
                    Value::Text(entity.created_at.to_rfc3339()),
                ],
            )?;
        }
        Ok(())
    }

    fn touch_memory(&self, kind: MemoryKind, memory_id: &str) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET access_count = access_count + 1, last_accessed = ? WHERE memory_id = ?",
            kind.table()
        );
        self.execute(
            &sql,
            vec![
                Value::Text(Utc::now().to_rfc3339()),
                Value::Text(memory_id.to_string()),
            ],
        )?;
        Ok(())
    }

    fn expire_short_term(&self, now: DateTime<Utc>) -> Result<usize> {
        let deleted = self.execute(
            "DELETE FROM short_term_memory
             WHERE expires_at IS NOT NULL AND expires_at < ?",
            vec![Value::Text(now.to_rfc3339())],
        )?;
        Ok(deleted as usize)
    }

    fn sweep_long_term(&self, namespace: &str, cutoff: DateTime<Utc>) -> Result<usize> {
        let deleted = self.execute(
            "DELETE FROM long_term_memory
             WHERE namespace = ? AND retention_type = 'long_term' AND created_at < ?",
            vec![
                Value::Text(namespace.to_string()),
                Value::Text(cutoff.to_rfc3339()),
            ],
        )?;
        Ok(deleted as usize)
    }

    fn upsert_working_set(&self, row: &MemoryRow, source_id: &str) -> Result<()> {
        let processed = serde_json::to_string(&row.processed_data)?;
        let existing = self.query_rows(
            "SELECT memory_id FROM short_term_memory
             WHERE namespace = ? AND source_memory_id = ?",
            vec![
                Value::Text(row.namespace.clone()),
                Value::Text(source_id.to_string()),
            ],
        )?;

        match existing.into_iter().next() {
            Some(mut values) => {
                let memory_id = text_of(values.remove(0));
                self.execute(
                    "UPDATE short_term_memory
                     SET processed_data = ?, importance_score = ?, category_primary = ?,
                         searchable_content = ?, summary = ?, created_at = ?,
                         expires_at = NULL, is_permanent_context = 1
                     WHERE memory_id = ?",
                    vec![
                        Value::Text(processed),
                        Value::Real(row.importance_score as f64),
                        Value::Text(row.category_primary.as_str().to_string()),
                        Value::Text(row.searchable_content.clone()),
                        Value::Text(row.summary.clone()),
                        Value::Text(row.created_at.to_rfc3339()),
                        Value::Text(memory_id),
                    ],
                )?;
            }
            None => {
                self.execute(
                    "INSERT INTO short_term_memory
                        (memory_id, chat_id, processed_data, importance_score,
                         category_primary, retention_type, namespace, created_at,
                         expires_at, access_count, last_accessed,
                         searchable_content, summary, is_permanent_context,
                         source_memory_id)
                     VALUES (?, ?, ?, ?, ?, 'short_term', ?, ?, NULL, 0, NULL, ?, ?, 1, ?)",
                    vec![
                        Value::Text(row.memory_id.clone()),
                        row.chat_id.clone().map(Value::Text).unwrap_or(Value::Null),
                        Value::Text(processed),
                        Value::Real(row.importance_score as f64),
                        Value::Text(row.category_primary.as_str().to_string()),
                        Value::Text(row.namespace.clone()),
                        Value::Text(row.created_at.to_rfc3339()),
                        Value::Text(row.searchable_content.clone()),
                        Value::Text(row.summary.clone()),
                        Value::Text(source_id.to_string()),
                    ],
                )?;
            }
        }
        Ok(())
    }

    fn search_fts(&self, query: &SearchQuery) -> Result<Vec<SearchCandidate>> {
        if !self.fts_available {
            return Ok(Vec::new());
        }
        let match_expr = escape_fts_query(&query.text);
        if match_expr.is_empty() {
            return Ok(Vec::new());
        }

        let mut out = Vec::new();
        for kind in [MemoryKind::ShortTerm, MemoryKind::LongTerm] {
            let sql = format!(
                "SELECT m.memory_id, m.summary, m.category_primary, m.importance_score,
                        m.created_at, 1.0 / (1.0 + ABS(bm25(memory_search_fts)))
                 FROM memory_search_fts fts
                 JOIN {table} m ON m.memory_id = fts.memory_id
                 WHERE memory_search_fts MATCH ? AND fts.memory_type = ? AND m.namespace = ?
                 ORDER BY bm25(memory_search_fts) LIMIT ?",
                table = kind.table()
            );
            let rows = self.query_rows(
                &sql,
                vec![
                    Value::Text(match_expr.clone()),
                    Value::Text(kind.as_str().to_string()),
                    Value::Text(query.namespace.clone()),
                    Value::Integer((query.limit * 4).max(1) as i64),
                ],
            )?;
            out.extend(
                rows.into_iter()
                    .map(|values| Self::candidate_of(values, kind, MatchStrategy::FullText)),
            );
        }
        Ok(apply_filters(out, query))
    }

    fn search_like(&self, query: &SearchQuery) -> Result<Vec<SearchCandidate>> {
        let term = query
            .text
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_lowercase();
        if term.is_empty() {
            return Ok(Vec::new());
        }
        let pattern = format!("%{}%", term);

        let mut out = Vec::new();
        for kind in [MemoryKind::ShortTerm, MemoryKind::LongTerm] {
            let sql = format!(
                "SELECT m.memory_id, m.summary, m.category_primary, m.importance_score,
                        m.created_at, 0.5
                 FROM {table} m
                 WHERE m.namespace = ?
                   AND (m.searchable_content LIKE ? OR m.summary LIKE ?)
                 ORDER BY m.importance_score DESC LIMIT ?",
                table = kind.table()
            );
            let rows = self.query_rows(
                &sql,
                vec![
                    Value::Text(query.namespace.clone()),
                    Value::Text(pattern.clone()),
                    Value::Text(pattern.clone()),
                    Value::Integer((query.limit * 4).max(1) as i64),
                ],
            )?;
            out.extend(
                rows.into_iter()
                    .map(|values| Self::candidate_of(values, kind, MatchStrategy::Scan)),
            );
        }
        Ok(apply_filters(out, query))
    }

    fn search_entities(&self, query: &SearchQuery) -> Result<Vec<SearchCandidate>> {
        let mut out = Vec::new();
        for kind in [MemoryKind::ShortTerm, MemoryKind::LongTerm] {
            for term in query.text.split_whitespace() {
                let lowered = term.to_lowercase();
                let sql = format!(
                    "SELECT m.memory_id, m.summary, m.category_primary, m.importance_score,
                            m.created_at, e.relevance_score
                     FROM memory_entities e
                     JOIN {table} m ON m.memory_id = e.memory_id
                     WHERE e.namespace = ? AND e.memory_type = ?
                       AND (LOWER(e.entity_value) = ? OR LOWER(e.entity_value) LIKE ?)
                     ORDER BY e.relevance_score DESC LIMIT ?",
                    table = kind.table()
                );
                let rows = self.query_rows(
                    &sql,
                    vec![
                        Value::Text(query.namespace.clone()),
                        Value::Text(kind.as_str().to_string()),
                        Value::Text(lowered.clone()),
                        Value::Text(format!("{}%", lowered)),
                        Value::Integer((query.limit * 4).max(1) as i64),
                    ],
                )?;
                out.extend(
                    rows.into_iter()
                        .map(|values| Self::candidate_of(values, kind, MatchStrategy::Entity)),
                );
            }
        }
        Ok(apply_filters(out, query))
    }

    fn list_short_term(&self, namespace: &str, limit: usize) -> Result<Vec<MemoryRow>> {
        let rows = self.query_rows(
            "SELECT memory_id, chat_id, processed_data, importance_score,
                    category_primary, retention_type, namespace, created_at,
                    expires_at, access_count, last_accessed, searchable_content,
                    summary, is_permanent_context
             FROM short_term_memory WHERE namespace = ?
             ORDER BY created_at DESC LIMIT ?",
            vec![
                Value::Text(namespace.to_string()),
                Value::Integer(limit as i64),
            ],
        )?;
        Ok(rows
            .into_iter()
            .map(|values| Self::memory_row_of(values, MemoryKind::ShortTerm))
            .collect())
    }

    fn list_long_term(
        &self,
        namespace: &str,
        filters: &LongTermFilters,
        limit: usize,
    ) -> Result<Vec<MemoryRow>> {
        let mut sql = "SELECT memory_id, chat_id, processed_data, importance_score,
                    category_primary, retention_type, namespace, created_at,
                    expires_at, access_count, last_accessed, searchable_content,
                    summary, is_permanent_context, novelty_score, relevance_score,
                    actionability_score
             FROM long_term_memory WHERE namespace = ?"
            .to_string();
        let mut params = vec![Value::Text(namespace.to_string())];

        if let Some(category) = filters.category {
            sql.push_str(" AND category_primary = ?");
            params.push(Value::Text(category.as_str().to_string()));
        }
        if let Some(min) = filters.min_importance {
            sql.push_str(" AND importance_score >= ?");
            params.push(Value::Real(min as f64));
        }
        if let Some(after) = filters.created_after {
            sql.push_str(" AND created_at >= ?");
            params.push(Value::Text(after.to_rfc3339()));
        }
        sql.push_str(" ORDER BY importance_score DESC, created_at DESC LIMIT ?");
        params.push(Value::Integer(limit as i64));

        let rows = self.query_rows(&sql, params)?;
        Ok(rows
            .into_iter()
            .map(|values| Self::memory_row_of(values, MemoryKind::LongTerm))
            .collect())
    }

    fn working_set(&self, namespace: &str, limit: usize) -> Result<Vec<MemoryRow>> {
        let rows = self.query_rows(
            "SELECT memory_id, chat_id, processed_data, importance_score,
                    category_primary, retention_type, namespace, created_at,
                    expires_at, access_count, last_accessed, searchable_content,
                    summary, is_permanent_context
             FROM short_term_memory
             WHERE namespace = ? AND is_permanent_context = 1
             ORDER BY importance_score DESC, created_at DESC LIMIT ?",
            vec![
                Value::Text(namespace.to_string()),
                Value::Integer(limit as i64),
            ],
        )?;
        Ok(rows
            .into_iter()
            .map(|values| Self::memory_row_of(values, MemoryKind::ShortTerm))
            .collect())
    }

    fn get_rules(&self, namespace: &str, active_only: bool) -> Result<Vec<RuleRow>> {
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
        let rows = self.query_rows(sql, vec![Value::Text(namespace.to_string())])?;
        Ok(rows
            .into_iter()
            .map(|values| {
                let mut it = values.into_iter();
                RuleRow {
                    rule_id: text_of(it.next().unwrap_or(Value::Null)),
                    rule_text: text_of(it.next().unwrap_or(Value::Null)),
                    rule_type: text_of(it.next().unwrap_or(Value::Null))
                        .parse()
                        .unwrap_or(RuleType::Preference),
                    priority: RuleRow::clamp_priority(i64_of(it.next().unwrap_or(Value::Null))),
                    active: i64_of(it.next().unwrap_or(Value::Null)) != 0,
                    context_conditions: opt_text_of(it.next().unwrap_or(Value::Null)),
                    namespace: text_of(it.next().unwrap_or(Value::Null)),
                    created_at: parse_ts(&text_of(it.next().unwrap_or(Value::Null))),
                    updated_at: parse_ts(&text_of(it.next().unwrap_or(Value::Null))),
                }
            })
            .collect())
    }

    fn put_rule(&self, rule: &RuleRow) -> Result<()> {
        self.execute(
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
            vec![
                Value::Text(rule.rule_id.clone()),
                Value::Text(rule.rule_text.clone()),
                Value::Text(rule.rule_type.as_str().to_string()),
                Value::Integer(rule.priority as i64),
                Value::Integer(rule.active as i64),
                rule.context_conditions
                    .clone()
                    .map(Value::Text)
                    .unwrap_or(Value::Null),
                Value::Text(rule.namespace.clone()),
                Value::Text(rule.created_at.to_rfc3339()),
                Value::Text(rule.updated_at.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    fn link_memories(
        &self,
        namespace: &str,
        from_id: &str,
        to_id: &str,
        relationship_type: &str,
        strength: f32,
    ) -> Result<()> {
        self.execute(
            "INSERT INTO memory_relationships
                (from_memory_id, to_memory_id, relationship_type, strength, namespace, created_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(from_memory_id, to_memory_id, relationship_type)
             DO UPDATE SET strength = excluded.strength",
            vec![
                Value::Text(from_id.to_string()),
                Value::Text(to_id.to_string()),
                Value::Text(relationship_type.to_string()),
                Value::Real(strength as f64),
                Value::Text(namespace.to_string()),
                Value::Text(Utc::now().to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    fn get_related(&self, memory_id: &str, limit: usize) -> Result<Vec<MemoryId>> {
        let rows = self.query_rows(
            "SELECT CASE WHEN from_memory_id = ?1 THEN to_memory_id ELSE from_memory_id END
             FROM memory_relationships
             WHERE from_memory_id = ?1 OR to_memory_id = ?1
             ORDER BY strength DESC LIMIT ?2",
            vec![
                Value::Text(memory_id.to_string()),
                Value::Integer(limit as i64),
            ],
        )?;
        Ok(rows
            .into_iter()
            .filter_map(|mut values| {
                if values.is_empty() {
                    None
                } else {
                    Some(text_of(values.remove(0)))
                }
            })
            .collect())
    }

    fn stats(&self, namespace: &str) -> Result<MemoryStats> {
        let mut out = MemoryStats {
            schema_version: self.schema_version,
            fts_available: self.fts_available,
            ..Default::default()
        };

        let count_of = |rows: Vec<Vec<Value>>| -> i64 {
            rows.into_iter()
                .next()
                .and_then(|mut v| if v.is_empty() { None } else { Some(i64_of(v.remove(0))) })
                .unwrap_or(0)
        };

        let ns = Value::Text(namespace.to_string());
        out.chat_count = count_of(self.query_rows(
            "SELECT COUNT(*) FROM chat_history WHERE namespace = ?",
            vec![ns.clone()],
        )?);
        out.short_term_count = count_of(self.query_rows(
            "SELECT COUNT(*) FROM short_term_memory WHERE namespace = ?",
            vec![ns.clone()],
        )?);
        out.long_term_count = count_of(self.query_rows(
            "SELECT COUNT(*) FROM long_term_memory WHERE namespace = ?",
            vec![ns.clone()],
        )?);
        out.rule_count = count_of(self.query_rows(
            "SELECT COUNT(*) FROM rules_memory WHERE namespace = ?",
            vec![ns.clone()],
        )?);
        out.entity_count = count_of(self.query_rows(
            "SELECT COUNT(*) FROM memory_entities WHERE namespace = ?",
            vec![ns.clone()],
        )?);

        let category_rows = self.query_rows(
            "SELECT category_primary, COUNT(*) FROM (
                SELECT category_primary FROM short_term_memory WHERE namespace = ?1
                UNION ALL
                SELECT category_primary FROM long_term_memory WHERE namespace = ?1
             ) GROUP BY category_primary",
            vec![ns.clone()],
        )?;
        for mut values in category_rows {
            if values.len() == 2 {
                let count = i64_of(values.remove(1));
                let category = text_of(values.remove(0));
                out.category_counts.insert(category, count);
            }
        }

        let avg_rows = self.query_rows(
            "SELECT AVG(importance_score) FROM (
                SELECT importance_score FROM short_term_memory WHERE namespace = ?1
                UNION ALL
                SELECT importance_score FROM long_term_memory WHERE namespace = ?1
             )",
            vec![ns],
        )?;
        out.avg_importance = avg_rows.into_iter().next().and_then(|mut v| {
            if v.is_empty() {
                None
            } else {
                match v.remove(0) {
                    Value::Null => None,
                    other => Some(f64_of(other)),
                }
            }
        });

        Ok(out)
    }

    fn health(&self) -> StoreHealth {
        let connected = self
            .query_rows("SELECT 1", Vec::new())
            .map(|rows| !rows.is_empty())
            .unwrap_or(false);
        StoreHealth {
            connected,
            schema_version: self.schema_version,
            fts_available: self.fts_available,
        }
    }

    fn backend_name(&self) -> &'static str {
        "libsql"
    }
}

/// Post-filter candidates the remote SQL did not constrain.
fn apply_filters(candidates: Vec<SearchCandidate>, query: &SearchQuery) -> Vec<SearchCandidate> {
    candidates
        .into_iter()
        .filter(|c| {
            (query.categories.is_empty() || query.categories.contains(&c.category_primary))
                && query.min_importance.map_or(true, |m| c.importance_score >= m)
                && query.created_after.map_or(true, |t| c.created_at >= t)
                && query.created_before.map_or(true, |t| c.created_at <= t)
        })
        .collect()
}
