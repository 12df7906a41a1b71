//! Transactional persistence for all memory tables
//!
//! The `Store` facade owns a back-end (embedded SQLite by default, libSQL
//! client-server behind the `remote` feature), retries transient failures
//! with exponential backoff, and is the only component that touches SQL.

mod backend;
mod connection;
mod migrations;
mod queries;
#[cfg(feature = "remote")]
mod remote;
mod sqlite;

pub use backend::StoreBackend;
pub use connection::ConnectionPool;
pub use migrations::{run_migrations, SCHEMA_VERSION};
#[cfg(feature = "remote")]
pub use remote::RemoteStore;
pub use sqlite::SqliteStore;

pub(crate) use queries::parse_ts;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::config::DatabaseConfig;
use crate::error::{MemoriError, Result};
use crate::types::{
    ChatRecord, EntityIndexRow, LongTermFilters, MemoryId, MemoryKind, MemoryRow, MemoryStats,
    RuleRow, SearchCandidate, SearchQuery, StoreHealth,
};

/// Retry attempts for transient storage errors
const WRITE_RETRIES: u32 = 3;

/// Base backoff between retries; doubles per attempt
const RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// Retry `f` on transient errors with exponential backoff.
fn with_retry<T>(max_retries: u32, mut f: impl FnMut() -> Result<T>) -> Result<T> {
    let mut attempt = 0;
    loop {
        match f() {
            Err(e) if e.is_retryable() && attempt < max_retries => {
                let backoff = RETRY_BACKOFF * 2u32.saturating_pow(attempt);
                warn!(error = %e, attempt, "transient storage error, retrying");
                std::thread::sleep(backoff);
                attempt += 1;
            }
            other => return other,
        }
    }
}

#[cfg(feature = "remote")]
fn open_remote(config: &DatabaseConfig) -> Result<Arc<dyn StoreBackend>> {
    Ok(Arc::new(remote::RemoteStore::open(config)?))
}

#[cfg(not(feature = "remote"))]
fn open_remote(config: &DatabaseConfig) -> Result<Arc<dyn StoreBackend>> {
    Err(MemoriError::Config(format!(
        "connection string '{}' requires the `remote` feature",
        config.connection_string
    )))
}

/// Shared handle over the configured back-end.
#[derive(Clone)]
pub struct Store {
    backend: Arc<dyn StoreBackend>,
    fts_available: bool,
}

impl Store {
    /// Open the back-end selected by the connection string: `libsql://`
    /// (or `http(s)://`) URLs get the client-server store, everything else
    /// is an embedded database path.
    pub fn open(config: &DatabaseConfig) -> Result<Self> {
        let connection_string = config.expanded_connection_string();
        let is_remote = connection_string.starts_with("libsql://")
            || connection_string.starts_with("http://")
            || connection_string.starts_with("https://");

        let backend: Arc<dyn StoreBackend> = if is_remote {
            open_remote(config)?
        } else {
            Arc::new(SqliteStore::open(config)?)
        };

        let fts_available = backend.health().fts_available;
        Ok(Self {
            backend,
            fts_available,
        })
    }

    /// In-memory embedded store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let backend = Arc::new(SqliteStore::open_in_memory()?);
        let fts_available = backend.health().fts_available;
        Ok(Self {
            backend,
            fts_available,
        })
    }

    pub fn fts_available(&self) -> bool {
        self.fts_available
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.backend_name()
    }

    pub fn put_chat(&self, record: &ChatRecord) -> Result<()> {
        with_retry(WRITE_RETRIES, || self.backend.put_chat(record))
    }

    pub fn put_memory(&self, row: &MemoryRow, entities: &[EntityIndexRow]) -> Result<()> {
        with_retry(WRITE_RETRIES, || self.backend.put_memory(row, entities))
    }

    pub fn put_entities(&self, entities: &[EntityIndexRow]) -> Result<()> {
        with_retry(WRITE_RETRIES, || self.backend.put_entities(entities))
    }

    pub fn touch_memory(&self, kind: MemoryKind, memory_id: &str) -> Result<()> {
        with_retry(WRITE_RETRIES, || self.backend.touch_memory(kind, memory_id))
    }

    pub fn expire_short_term(&self, now: DateTime<Utc>) -> Result<usize> {
        with_retry(WRITE_RETRIES, || self.backend.expire_short_term(now))
    }

    pub fn sweep_long_term(&self, namespace: &str, cutoff: DateTime<Utc>) -> Result<usize> {
        with_retry(WRITE_RETRIES, || {
            self.backend.sweep_long_term(namespace, cutoff)
        })
    }

    pub fn upsert_working_set(&self, row: &MemoryRow, source_id: &str) -> Result<()> {
        with_retry(WRITE_RETRIES, || {
            self.backend.upsert_working_set(row, source_id)
        })
    }

    pub fn search_fts(&self, query: &SearchQuery) -> Result<Vec<SearchCandidate>> {
        self.backend.search_fts(query)
    }

    pub fn search_like(&self, query: &SearchQuery) -> Result<Vec<SearchCandidate>> {
        self.backend.search_like(query)
    }

    pub fn search_entities(&self, query: &SearchQuery) -> Result<Vec<SearchCandidate>> {
        self.backend.search_entities(query)
    }

    pub fn list_short_term(&self, namespace: &str, limit: usize) -> Result<Vec<MemoryRow>> {
        self.backend.list_short_term(namespace, limit)
    }

    pub fn list_long_term(
        &self,
        namespace: &str,
        filters: &LongTermFilters,
        limit: usize,
    ) -> Result<Vec<MemoryRow>> {
        self.backend.list_long_term(namespace, filters, limit)
    }

    pub fn working_set(&self, namespace: &str, limit: usize) -> Result<Vec<MemoryRow>> {
        self.backend.working_set(namespace, limit)
    }

    pub fn get_rules(&self, namespace: &str, active_only: bool) -> Result<Vec<RuleRow>> {
        self.backend.get_rules(namespace, active_only)
    }

    pub fn put_rule(&self, rule: &RuleRow) -> Result<()> {
        with_retry(WRITE_RETRIES, || self.backend.put_rule(rule))
    }

    pub fn link_memories(
        &self,
        namespace: &str,
        from_id: &str,
        to_id: &str,
        relationship_type: &str,
        strength: f32,
    ) -> Result<()> {
        with_retry(WRITE_RETRIES, || {
            self.backend
                .link_memories(namespace, from_id, to_id, relationship_type, strength)
        })
    }

    pub fn get_related(&self, memory_id: &str, limit: usize) -> Result<Vec<MemoryId>> {
        self.backend.get_related(memory_id, limit)
    }

    pub fn stats(&self, namespace: &str) -> Result<MemoryStats> {
        self.backend.stats(namespace)
    }

    pub fn health(&self) -> StoreHealth {
        self.backend.health()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn retry_gives_up_after_limit() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(2, || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(MemoriError::StorageTransient("busy".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn retry_does_not_touch_conflicts() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(3, || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(MemoriError::StorageConflict("duplicate".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn retry_succeeds_midway() {
        let calls = AtomicU32::new(0);
        let result = with_retry(3, || {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(MemoriError::StorageTransient("busy".to_string()))
            } else {
                Ok(42)
            }
        });
        assert_eq!(result.unwrap(), 42);
    }
}
