//! Embedded SQLite back-end

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::config::DatabaseConfig;
use crate::error::Result;
use crate::search;
use crate::types::{
    ChatRecord, EntityIndexRow, LongTermFilters, MemoryId, MemoryKind, MemoryRow, MemoryStats,
    RuleRow, SearchCandidate, SearchQuery, StoreHealth,
};

use super::backend::StoreBackend;
use super::connection::ConnectionPool;
use super::migrations::run_migrations;
use super::queries;

/// Embedded single-file store. Writers are serialized on one connection;
/// reads go through a small round-robin pool.
pub struct SqliteStore {
    pool: ConnectionPool,
    schema_version: i32,
}

impl SqliteStore {
    pub fn open(config: &DatabaseConfig) -> Result<Self> {
        let path = config.expanded_connection_string();
        let pool = ConnectionPool::open(&path, config.pool_size)?;

        let schema_version = {
            let conn = pool.writer();
            run_migrations(&conn, pool.fts_available(), config.migration_auto)?
        };

        if config.echo_sql {
            pool.set_trace(true);
        }

        debug!(
            path = %path,
            fts = pool.fts_available(),
            schema = schema_version,
            "opened embedded store"
        );

        Ok(Self {
            pool,
            schema_version,
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::open(&DatabaseConfig {
            connection_string: ":memory:".to_string(),
            ..Default::default()
        })
    }
}

impl StoreBackend for SqliteStore {
    fn put_chat(&self, record: &ChatRecord) -> Result<()> {
        self.pool
            .with_transaction(|conn| queries::insert_chat(conn, record))
    }

    fn put_memory(&self, row: &MemoryRow, entities: &[EntityIndexRow]) -> Result<()> {
        self.pool.with_transaction(|conn| {
            queries::insert_memory(conn, row)?;
            queries::insert_entities(conn, entities)
        })
    }

    fn put_entities(&self, entities: &[EntityIndexRow]) -> Result<()> {
        self.pool
            .with_transaction(|conn| queries::insert_entities(conn, entities))
    }

    fn touch_memory(&self, kind: MemoryKind, memory_id: &str) -> Result<()> {
        let conn = self.pool.writer();
        queries::touch_memory(&conn, kind, memory_id)
    }

    fn expire_short_term(&self, now: DateTime<Utc>) -> Result<usize> {
        self.pool
            .with_transaction(|conn| queries::expire_short_term(conn, now))
    }

    fn sweep_long_term(&self, namespace: &str, cutoff: DateTime<Utc>) -> Result<usize> {
        self.pool
            .with_transaction(|conn| queries::sweep_long_term(conn, namespace, cutoff))
    }

    fn upsert_working_set(&self, row: &MemoryRow, source_id: &str) -> Result<()> {
        self.pool
            .with_transaction(|conn| queries::upsert_working_set(conn, row, source_id))
    }

    fn search_fts(&self, query: &SearchQuery) -> Result<Vec<SearchCandidate>> {
        if !self.pool.fts_available() {
            return Ok(Vec::new());
        }
        let conn = self.pool.reader();
        search::fts_candidates(&conn, query)
    }

    fn search_like(&self, query: &SearchQuery) -> Result<Vec<SearchCandidate>> {
        let conn = self.pool.reader();
        search::like_candidates(&conn, query)
    }

    fn search_entities(&self, query: &SearchQuery) -> Result<Vec<SearchCandidate>> {
        let conn = self.pool.reader();
        search::entity_candidates(&conn, query)
    }

    fn list_short_term(&self, namespace: &str, limit: usize) -> Result<Vec<MemoryRow>> {
        let conn = self.pool.reader();
        queries::list_short_term(&conn, namespace, limit)
    }

    fn list_long_term(
        &self,
        namespace: &str,
        filters: &LongTermFilters,
        limit: usize,
    ) -> Result<Vec<MemoryRow>> {
        let conn = self.pool.reader();
        queries::list_long_term(&conn, namespace, filters, limit)
    }

    fn working_set(&self, namespace: &str, limit: usize) -> Result<Vec<MemoryRow>> {
        let conn = self.pool.reader();
        queries::working_set(&conn, namespace, limit)
    }

    fn get_rules(&self, namespace: &str, active_only: bool) -> Result<Vec<RuleRow>> {
        let conn = self.pool.reader();
        queries::get_rules(&conn, namespace, active_only)
    }

    fn put_rule(&self, rule: &RuleRow) -> Result<()> {
        self.pool
            .with_transaction(|conn| queries::put_rule(conn, rule))
    }

    fn link_memories(
        &self,
        namespace: &str,
        from_id: &str,
        to_id: &str,
        relationship_type: &str,
        strength: f32,
    ) -> Result<()> {
        self.pool.with_transaction(|conn| {
            queries::link_memories(conn, namespace, from_id, to_id, relationship_type, strength)
        })
    }

    fn get_related(&self, memory_id: &str, limit: usize) -> Result<Vec<MemoryId>> {
        let conn = self.pool.reader();
        queries::get_related(&conn, memory_id, limit)
    }

    fn stats(&self, namespace: &str) -> Result<MemoryStats> {
        let conn = self.pool.reader();
        let mut stats = queries::stats(&conn, namespace)?;
        stats.schema_version = self.schema_version;
        stats.fts_available = self.pool.fts_available();
        Ok(stats)
    }

    fn health(&self) -> StoreHealth {
        let connected = self
            .pool
            .reader()
            .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .is_ok();
        StoreHealth {
            connected,
            schema_version: self.schema_version,
            fts_available: self.pool.fts_available(),
        }
    }

    fn backend_name(&self) -> &'static str {
        "sqlite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crate::types::{
        EntityType, MemoryCategory, MemoryRow, ProcessedMemory, RetentionType, RuleRow, RuleType,
        SearchQuery,
    };

    fn long_term_row(id: &str, summary: &str) -> MemoryRow {
        let mut processed = ProcessedMemory::default();
        processed.summary = summary.to_string();
        processed.searchable_content = summary.to_lowercase();
        processed.should_store = true;
        processed.importance.retention_type = RetentionType::LongTerm;
        processed.importance.importance_score = 0.7;

        let mut row = MemoryRow::from_processed(
            id.to_string(),
            None,
            processed,
            "default",
            Utc::now(),
        );
        row.category_primary = MemoryCategory::Fact;
        row
    }

    fn entity(memory_id: &str, value: &str) -> EntityIndexRow {
        EntityIndexRow {
            memory_id: memory_id.to_string(),
            memory_kind: MemoryKind::LongTerm,
            entity_type: EntityType::Technology,
            entity_value: value.to_string(),
            relevance_score: 0.8,
            namespace: "default".to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn memory_round_trip_with_entities() {
        let store = SqliteStore::open_in_memory().unwrap();
        let row = long_term_row("m1", "Service is written in Rust with SQLite storage");

        store.put_memory(&row, &[entity("m1", "Rust"), entity("m1", "SQLite")]).unwrap();

        let listed = store
            .list_long_term("default", &LongTermFilters::default(), 10)
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].memory_id, "m1");
        assert_eq!(listed[0].summary, row.summary);
        assert_eq!(listed[0].processed_data, row.processed_data);

        let hits = store
            .search_entities(&SearchQuery::new("rust", "default"))
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].memory_id, "m1");
    }

    #[test]
    fn duplicate_memory_id_is_a_conflict() {
        let store = SqliteStore::open_in_memory().unwrap();
        let row = long_term_row("dup", "first");
        store.put_memory(&row, &[]).unwrap();

        let err = store.put_memory(&row, &[]).unwrap_err();
        assert!(matches!(err, crate::error::MemoriError::StorageConflict(_)));
    }

    #[test]
    fn touch_bumps_access_tracking() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .put_memory(&long_term_row("m1", "touchable"), &[])
            .unwrap();

        store.touch_memory(MemoryKind::LongTerm, "m1").unwrap();
        store.touch_memory(MemoryKind::LongTerm, "m1").unwrap();

        let listed = store
            .list_long_term("default", &LongTermFilters::default(), 1)
            .unwrap();
        assert_eq!(listed[0].access_count, 2);
        assert!(listed[0].last_accessed.is_some());
    }

    #[test]
    fn standalone_entity_indexing() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .put_memory(&long_term_row("m1", "entity host"), &[])
            .unwrap();
        store.put_entities(&[entity("m1", "Kafka")]).unwrap();

        let hits = store
            .search_entities(&SearchQuery::new("kafka", "default"))
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn deleting_memory_cascades_entities() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut row = long_term_row("gone", "short lived");
        row.retention_type = RetentionType::ShortTerm;
        row.processed_data.importance.retention_type = RetentionType::ShortTerm;
        row.expires_at = Some(Utc::now() - chrono::Duration::seconds(5));
        let mut short_entity = entity("gone", "Redis");
        short_entity.memory_kind = MemoryKind::ShortTerm;
        store.put_memory(&row, &[short_entity]).unwrap();

        assert_eq!(store.expire_short_term(Utc::now()).unwrap(), 1);
        let hits = store
            .search_entities(&SearchQuery::new("redis", "default"))
            .unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn rules_round_trip_and_ordering() {
        let store = SqliteStore::open_in_memory().unwrap();
        let now = Utc::now();
        for (id, text, priority, active) in [
            ("r1", "Always answer in English", 3i64, true),
            ("r2", "Never suggest deprecated APIs", 9, true),
            ("r3", "Inactive rule", 10, false),
        ] {
            store
                .put_rule(&RuleRow {
                    rule_id: id.to_string(),
                    rule_text: text.to_string(),
                    rule_type: RuleType::Instruction,
                    priority: RuleRow::clamp_priority(priority),
                    active,
                    context_conditions: None,
                    namespace: "default".to_string(),
                    created_at: now,
                    updated_at: now,
                })
                .unwrap();
        }

        let active = store.get_rules("default", true).unwrap();
        assert_eq!(active.len(), 2);
        // priority descending
        assert_eq!(active[0].rule_id, "r2");

        let all = store.get_rules("default", false).unwrap();
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn relationships_link_and_list() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.put_memory(&long_term_row("a", "one"), &[]).unwrap();
        store.put_memory(&long_term_row("b", "two"), &[]).unwrap();
        store.put_memory(&long_term_row("c", "three"), &[]).unwrap();

        store.link_memories("default", "a", "b", "related_to", 0.9).unwrap();
        store.link_memories("default", "c", "a", "related_to", 0.4).unwrap();
        // re-linking updates strength instead of duplicating
        store.link_memories("default", "a", "b", "related_to", 0.7).unwrap();

        let related = store.get_related("a", 10).unwrap();
        assert_eq!(related, vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn working_set_upsert_reconciles_by_source() {
        let store = SqliteStore::open_in_memory().unwrap();
        let source = long_term_row("src", "essential context");
        store.put_memory(&source, &[]).unwrap();

        let mut promoted = long_term_row("src-ws-1", "essential context");
        promoted.retention_type = RetentionType::ShortTerm;
        promoted.processed_data.importance.retention_type = RetentionType::ShortTerm;
        promoted.expires_at = None;
        promoted.is_permanent_context = true;

        store.upsert_working_set(&promoted, "src").unwrap();
        store.upsert_working_set(&promoted, "src").unwrap();

        let working = store.working_set("default", 10).unwrap();
        assert_eq!(working.len(), 1);
        assert!(working[0].is_permanent_context);
        assert!(working[0].expires_at.is_none());
    }

    #[test]
    fn health_reports_schema_and_fts() {
        let store = SqliteStore::open_in_memory().unwrap();
        let health = store.health();
        assert!(health.connected);
        assert!(health.fts_available);
        assert_eq!(health.schema_version, crate::storage::SCHEMA_VERSION);
    }
}
