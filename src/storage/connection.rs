//! Embedded database connection management
//!
//! SQLite with WAL mode for the on-disk case, a single serialized writer
//! connection, and a small round-robin reader pool. In-memory databases
//! share the writer connection, since separate `:memory:` connections see
//! separate databases.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use rusqlite::{Connection, OpenFlags};

use crate::error::Result;

/// Shared connection handle
pub type SharedConnection = Arc<Mutex<Connection>>;

/// Connection set for the embedded back-end: one writer, N readers.
pub struct ConnectionPool {
    path: String,
    writer: SharedConnection,
    readers: Vec<SharedConnection>,
    next_reader: AtomicUsize,
    fts_available: bool,
}

impl ConnectionPool {
    /// Open or create the database at `path` with `reader_count` pooled
    /// read connections. Probes FTS5 availability on the writer.
    pub fn open(path: &str, reader_count: usize) -> Result<Self> {
        let writer = Self::create_connection(path)?;
        let fts_available = probe_fts(&writer);

        let mut readers = Vec::new();
        if path == ":memory:" {
            // readers share the writer; a fresh :memory: connection would
            // open an unrelated empty database
        } else {
            for _ in 0..reader_count.max(1) {
                readers.push(Arc::new(Mutex::new(Self::create_connection(path)?)));
            }
        }

        Ok(Self {
            path: path.to_string(),
            writer: Arc::new(Mutex::new(writer)),
            readers,
            next_reader: AtomicUsize::new(0),
            fts_available,
        })
    }

    fn create_connection(path: &str) -> Result<Connection> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            if let Some(parent) = Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX;
            Connection::open_with_flags(path, flags)?
        };

        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA busy_timeout=30000;
            PRAGMA cache_size=-32000;
            PRAGMA temp_store=MEMORY;
            PRAGMA foreign_keys=ON;
            "#,
        )?;

        Ok(conn)
    }

    /// Lock the writer connection.
    pub fn writer(&self) -> MutexGuard<'_, Connection> {
        self.writer.lock()
    }

    /// Lock a reader connection (round-robin). Falls back to the writer
    /// for in-memory databases.
    pub fn reader(&self) -> MutexGuard<'_, Connection> {
        if self.readers.is_empty() {
            return self.writer.lock();
        }
        let idx = self.next_reader.fetch_add(1, Ordering::Relaxed) % self.readers.len();
        self.readers[idx].lock()
    }

    /// Run `f` inside a transaction on the writer connection.
    pub fn with_transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let mut conn = self.writer.lock();
        let tx = conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    /// Echo executed SQL at debug level on every connection.
    pub fn set_trace(&self, enabled: bool) {
        fn log_sql(sql: &str) {
            tracing::debug!(target: "memori_sql", "{}", sql);
        }
        let tracer: Option<fn(&str)> = if enabled { Some(log_sql) } else { None };
        self.writer.lock().trace(tracer);
        for reader in &self.readers {
            reader.lock().trace(tracer);
        }
    }

    pub fn fts_available(&self) -> bool {
        self.fts_available
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

/// Probe whether the linked SQLite carries the FTS5 module.
fn probe_fts(conn: &Connection) -> bool {
    let created = conn
        .execute_batch("CREATE VIRTUAL TABLE temp.__fts_probe USING fts5(probe);")
        .is_ok();
    if created {
        let _ = conn.execute_batch("DROP TABLE temp.__fts_probe;");
    }
    created
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_in_memory_shares_writer() {
        let pool = ConnectionPool::open(":memory:", 4).unwrap();
        assert_eq!(pool.path(), ":memory:");
        // bundled SQLite carries FTS5
        assert!(pool.fts_available());

        pool.writer()
            .execute_batch("CREATE TABLE t (x INTEGER);")
            .unwrap();
        // reader sees the writer's schema because they are the same handle
        let count: i64 = pool
            .reader()
            .query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn on_disk_readers_see_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.db");
        let pool = ConnectionPool::open(path.to_str().unwrap(), 2).unwrap();

        pool.with_transaction(|conn| {
            conn.execute_batch("CREATE TABLE t (x INTEGER); INSERT INTO t VALUES (7);")?;
            Ok(())
        })
        .unwrap();

        let x: i64 = pool
            .reader()
            .query_row("SELECT x FROM t", [], |row| row.get(0))
            .unwrap();
        assert_eq!(x, 7);
    }
}
