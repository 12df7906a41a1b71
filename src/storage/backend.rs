//! Storage backend trait
//!
//! Narrow query verbs the rest of the core is allowed to use. Two
//! implementations: the embedded SQLite store (default) and the libSQL
//! client-server store behind the `remote` feature. All methods are
//! synchronous and take `&self`; backends handle pooling and interior
//! mutability themselves. Async callers bridge with `spawn_blocking` or a
//! runtime handle at a higher level.

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::{
    ChatRecord, EntityIndexRow, LongTermFilters, MemoryId, MemoryKind, MemoryRow, MemoryStats,
    RuleRow, SearchCandidate, SearchQuery, StoreHealth,
};

/// Transactional persistence for all memory tables.
///
/// Every write verb runs in a single transaction; multi-row writes
/// (memory + entities + FTS maintenance) are atomic. Reads are
/// consistent-snapshot within a single verb but not across verbs.
pub trait StoreBackend: Send + Sync {
    /// Append one exchange to `chat_history`.
    fn put_chat(&self, record: &ChatRecord) -> Result<()>;

    /// Insert a memory row into the table selected by its retention type,
    /// together with its entity index rows, atomically.
    fn put_memory(&self, row: &MemoryRow, entities: &[EntityIndexRow]) -> Result<()>;

    /// Index entities for an already-stored memory.
    fn put_entities(&self, entities: &[EntityIndexRow]) -> Result<()>;

    /// Atomic `access_count += 1; last_accessed = now`.
    fn touch_memory(&self, kind: MemoryKind, memory_id: &str) -> Result<()>;

    /// Delete short-term rows with `expires_at < now`. Returns the number
    /// of rows removed. FTS and entity rows cascade.
    fn expire_short_term(&self, now: DateTime<Utc>) -> Result<usize>;

    /// Delete non-permanent long-term rows older than `cutoff`.
    fn sweep_long_term(&self, namespace: &str, cutoff: DateTime<Utc>) -> Result<usize>;

    /// Insert or refresh a working-set row promoted from long-term memory.
    /// Rows are reconciled by `source_id`: re-promotion updates in place.
    fn upsert_working_set(&self, row: &MemoryRow, source_id: &str) -> Result<()>;

    /// Full-text candidates for a query. Empty when FTS is unavailable.
    fn search_fts(&self, query: &SearchQuery) -> Result<Vec<SearchCandidate>>;

    /// LIKE-based scan over `searchable_content`/`summary`.
    fn search_like(&self, query: &SearchQuery) -> Result<Vec<SearchCandidate>>;

    /// Entity-index candidates (exact match preferred, prefix fallback).
    fn search_entities(&self, query: &SearchQuery) -> Result<Vec<SearchCandidate>>;

    fn list_short_term(&self, namespace: &str, limit: usize) -> Result<Vec<MemoryRow>>;

    fn list_long_term(
        &self,
        namespace: &str,
        filters: &LongTermFilters,
        limit: usize,
    ) -> Result<Vec<MemoryRow>>;

    /// Short-term rows flagged `is_permanent_context`, importance-descending.
    fn working_set(&self, namespace: &str, limit: usize) -> Result<Vec<MemoryRow>>;

    fn get_rules(&self, namespace: &str, active_only: bool) -> Result<Vec<RuleRow>>;

    fn put_rule(&self, rule: &RuleRow) -> Result<()>;

    /// Record a relationship edge between two memories.
    fn link_memories(
        &self,
        namespace: &str,
        from_id: &str,
        to_id: &str,
        relationship_type: &str,
        strength: f32,
    ) -> Result<()>;

    /// Memory ids related to `memory_id`, strongest first.
    fn get_related(&self, memory_id: &str, limit: usize) -> Result<Vec<MemoryId>>;

    /// Row counts, category distribution, average importance.
    fn stats(&self, namespace: &str) -> Result<MemoryStats>;

    fn health(&self) -> StoreHealth;

    fn backend_name(&self) -> &'static str;
}
