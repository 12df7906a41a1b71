//! Database migrations
//!
//! v1 creates the base tables from the persisted-state layout; v2 adds the
//! FTS5 mirror and its maintenance triggers. On engines without FTS5, v2 is
//! recorded as applied with no virtual table; search degrades to LIKE scans.

use rusqlite::Connection;

use crate::error::{MemoriError, Result};

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// Run pending migrations and return the resulting schema version.
///
/// A database stamped with a *newer* version than this build understands is
/// a schema mismatch and fails fatally. When `auto` is false, a database
/// behind the current version fails instead of migrating.
pub fn run_migrations(conn: &Connection, fts_available: bool, auto: bool) -> Result<i32> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM _schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

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
        migrate_v1(conn)?;
        stamp(conn, 1)?;
    }

    if current < 2 {
        migrate_v2(conn, fts_available)?;
        stamp(conn, 2)?;
    }

    Ok(SCHEMA_VERSION)
}

fn stamp(conn: &Connection, version: i32) -> Result<()> {
    conn.execute(
        "INSERT INTO _schema_version (version) VALUES (?)",
        [version],
    )?;
    Ok(())
}

/// Base tables (v1)
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(BASE_SCHEMA)?;
    Ok(())
}

/// FTS5 mirror and maintenance triggers (v2)
fn migrate_v2(conn: &Connection, fts_available: bool) -> Result<()> {
    if !fts_available {
        tracing::warn!("FTS5 unavailable; search will use LIKE scans");
        return Ok(());
    }
    conn.execute_batch(FTS_SCHEMA)?;
    Ok(())
}

/// v1 DDL, shared with the remote back-end
pub(crate) const BASE_SCHEMA: &str = r#"
        -- One row per recorded exchange, append-only
        CREATE TABLE IF NOT EXISTS chat_history (
            chat_id TEXT PRIMARY KEY,
            user_input TEXT NOT NULL,
            ai_output TEXT NOT NULL,
            model TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            session_id TEXT NOT NULL,
            namespace TEXT NOT NULL DEFAULT 'default',
            tokens_used INTEGER NOT NULL DEFAULT 0,
            metadata TEXT NOT NULL DEFAULT '{}'
        );

        CREATE INDEX IF NOT EXISTS idx_chat_namespace_ts
            ON chat_history(namespace, timestamp);
        CREATE INDEX IF NOT EXISTS idx_chat_session
            ON chat_history(session_id, timestamp);

        -- Expiring working memory; also hosts promoted working-set rows
        CREATE TABLE IF NOT EXISTS short_term_memory (
            memory_id TEXT PRIMARY KEY,
            chat_id TEXT,
            processed_data TEXT NOT NULL,
            importance_score REAL NOT NULL DEFAULT 0.5,
            category_primary TEXT NOT NULL DEFAULT 'context',
            retention_type TEXT NOT NULL DEFAULT 'short_term',
            namespace TEXT NOT NULL DEFAULT 'default',
            created_at TEXT NOT NULL,
            expires_at TEXT,
            access_count INTEGER NOT NULL DEFAULT 0,
            last_accessed TEXT,
            searchable_content TEXT NOT NULL DEFAULT '',
            summary TEXT NOT NULL DEFAULT '',
            is_permanent_context INTEGER NOT NULL DEFAULT 0,
            source_memory_id TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_short_namespace
            ON short_term_memory(namespace, created_at);
        CREATE INDEX IF NOT EXISTS idx_short_expiry
            ON short_term_memory(expires_at) WHERE expires_at IS NOT NULL;
        CREATE UNIQUE INDEX IF NOT EXISTS idx_short_source
            ON short_term_memory(namespace, source_memory_id)
            WHERE source_memory_id IS NOT NULL;

        CREATE TABLE IF NOT EXISTS long_term_memory (
            memory_id TEXT PRIMARY KEY,
            chat_id TEXT,
            processed_data TEXT NOT NULL,
            importance_score REAL NOT NULL DEFAULT 0.5,
            category_primary TEXT NOT NULL DEFAULT 'context',
            retention_type TEXT NOT NULL DEFAULT 'long_term',
            namespace TEXT NOT NULL DEFAULT 'default',
            created_at TEXT NOT NULL,
            expires_at TEXT,
            access_count INTEGER NOT NULL DEFAULT 0,
            last_accessed TEXT,
            searchable_content TEXT NOT NULL DEFAULT '',
            summary TEXT NOT NULL DEFAULT '',
            novelty_score REAL NOT NULL DEFAULT 0,
            relevance_score REAL NOT NULL DEFAULT 0,
            actionability_score REAL NOT NULL DEFAULT 0,
            conscious_labels TEXT NOT NULL DEFAULT '[]',
            is_permanent_context INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_long_namespace
            ON long_term_memory(namespace, created_at);
        CREATE INDEX IF NOT EXISTS idx_long_importance
            ON long_term_memory(namespace, importance_score);
        CREATE INDEX IF NOT EXISTS idx_long_category
            ON long_term_memory(namespace, category_primary);

        CREATE TABLE IF NOT EXISTS rules_memory (
            rule_id TEXT PRIMARY KEY,
            rule_text TEXT NOT NULL,
            rule_type TEXT NOT NULL DEFAULT 'preference',
            priority INTEGER NOT NULL DEFAULT 5,
            active INTEGER NOT NULL DEFAULT 1,
            context_conditions TEXT,
            namespace TEXT NOT NULL DEFAULT 'default',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_rules_namespace
            ON rules_memory(namespace, active, priority);

        CREATE TABLE IF NOT EXISTS memory_entities (
            entity_id INTEGER PRIMARY KEY AUTOINCREMENT,
            memory_id TEXT NOT NULL,
            memory_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_value TEXT NOT NULL,
            relevance_score REAL NOT NULL DEFAULT 0.5,
            namespace TEXT NOT NULL DEFAULT 'default',
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_entities_value
            ON memory_entities(namespace, entity_value);
        CREATE INDEX IF NOT EXISTS idx_entities_memory
            ON memory_entities(memory_id, memory_type);

        CREATE TABLE IF NOT EXISTS memory_relationships (
            relationship_id INTEGER PRIMARY KEY AUTOINCREMENT,
            from_memory_id TEXT NOT NULL,
            to_memory_id TEXT NOT NULL,
            relationship_type TEXT NOT NULL DEFAULT 'related_to',
            strength REAL NOT NULL DEFAULT 0.5,
            namespace TEXT NOT NULL DEFAULT 'default',
            created_at TEXT NOT NULL,
            UNIQUE(from_memory_id, to_memory_id, relationship_type)
        );

        -- Entity rows cascade with their parent memory row
        CREATE TRIGGER IF NOT EXISTS trg_short_entities_cascade
        AFTER DELETE ON short_term_memory BEGIN
            DELETE FROM memory_entities
            WHERE memory_id = old.memory_id AND memory_type = 'short_term';
        END;

        CREATE TRIGGER IF NOT EXISTS trg_long_entities_cascade
        AFTER DELETE ON long_term_memory BEGIN
            DELETE FROM memory_entities
            WHERE memory_id = old.memory_id AND memory_type = 'long_term';
        END;
        "#;

/// v2 DDL, shared with the remote back-end
pub(crate) const FTS_SCHEMA: &str = r#"
        CREATE VIRTUAL TABLE IF NOT EXISTS memory_search_fts USING fts5(
            searchable_content,
            summary,
            memory_id UNINDEXED,
            memory_type UNINDEXED,
            namespace UNINDEXED,
            category_primary UNINDEXED
        );

        CREATE TRIGGER IF NOT EXISTS trg_short_fts_insert
        AFTER INSERT ON short_term_memory BEGIN
            INSERT INTO memory_search_fts
                (searchable_content, summary, memory_id, memory_type, namespace, category_primary)
            VALUES
                (new.searchable_content, new.summary, new.memory_id, 'short_term',
                 new.namespace, new.category_primary);
        END;

        CREATE TRIGGER IF NOT EXISTS trg_short_fts_delete
        AFTER DELETE ON short_term_memory BEGIN
            DELETE FROM memory_search_fts
            WHERE memory_id = old.memory_id AND memory_type = 'short_term';
        END;

        CREATE TRIGGER IF NOT EXISTS trg_short_fts_update
        AFTER UPDATE OF searchable_content, summary ON short_term_memory BEGIN
            DELETE FROM memory_search_fts
            WHERE memory_id = old.memory_id AND memory_type = 'short_term';
            INSERT INTO memory_search_fts
                (searchable_content, summary, memory_id, memory_type, namespace, category_primary)
            VALUES
                (new.searchable_content, new.summary, new.memory_id, 'short_term',
                 new.namespace, new.category_primary);
        END;

        CREATE TRIGGER IF NOT EXISTS trg_long_fts_insert
        AFTER INSERT ON long_term_memory BEGIN
            INSERT INTO memory_search_fts
                (searchable_content, summary, memory_id, memory_type, namespace, category_primary)
            VALUES
                (new.searchable_content, new.summary, new.memory_id, 'long_term',
                 new.namespace, new.category_primary);
        END;

        CREATE TRIGGER IF NOT EXISTS trg_long_fts_delete
        AFTER DELETE ON long_term_memory BEGIN
            DELETE FROM memory_search_fts
            WHERE memory_id = old.memory_id AND memory_type = 'long_term';
        END;

        CREATE TRIGGER IF NOT EXISTS trg_long_fts_update
        AFTER UPDATE OF searchable_content, summary ON long_term_memory BEGIN
            DELETE FROM memory_search_fts
            WHERE memory_id = old.memory_id AND memory_type = 'long_term';
            INSERT INTO memory_search_fts
                (searchable_content, summary, memory_id, memory_type, namespace, category_primary)
            VALUES
                (new.searchable_content, new.summary, new.memory_id, 'long_term',
                 new.namespace, new.category_primary);
        END;
        "#;

#[cfg(test)]
mod tests {
    use super::*;

    fn open() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys=ON;").unwrap();
        conn
    }

    #[test]
    fn migrations_are_idempotent() {
        let conn = open();
        assert_eq!(run_migrations(&conn, true, true).unwrap(), SCHEMA_VERSION);
        assert_eq!(run_migrations(&conn, true, true).unwrap(), SCHEMA_VERSION);

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN
                 ('chat_history','short_term_memory','long_term_memory',
                  'rules_memory','memory_entities','memory_relationships')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 6);
    }

    #[test]
    fn newer_schema_is_fatal() {
        let conn = open();
        run_migrations(&conn, true, true).unwrap();
        conn.execute("INSERT INTO _schema_version (version) VALUES (99)", [])
            .unwrap();
        let err = run_migrations(&conn, true, true).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn disabled_auto_migration_fails_behind() {
        let conn = open();
        let err = run_migrations(&conn, true, false).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn fts_triggers_mirror_inserts_and_deletes() {
        let conn = open();
        run_migrations(&conn, true, true).unwrap();

        conn.execute(
            "INSERT INTO long_term_memory
                (memory_id, processed_data, created_at, searchable_content, summary)
             VALUES ('m1', '{}', '2026-01-01T00:00:00Z', 'rust sqlite fts', 'about rust')",
            [],
        )
        .unwrap();

        let fts_count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM memory_search_fts WHERE memory_id = 'm1'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(fts_count, 1);

        conn.execute("DELETE FROM long_term_memory WHERE memory_id = 'm1'", [])
            .unwrap();
        let fts_count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM memory_search_fts WHERE memory_id = 'm1'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(fts_count, 0);
    }

    #[test]
    fn without_fts_base_tables_still_migrate() {
        let conn = open();
        assert_eq!(run_migrations(&conn, false, true).unwrap(), SCHEMA_VERSION);
        let fts_exists: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE name = 'memory_search_fts'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(fts_exists, 0);
    }
}
