//! Database schema and migrations
//!
//! Uses SQLite with embedded migrations managed via PRAGMA user_version.
//! Table ordering matters: full-text indexes and their sync triggers are
//! created immediately after the tables they shadow.

use crate::error::{Error, Result};
use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// SQL migrations, indexed by version number
const MIGRATIONS: &[&str] = &[
    // Version 1: Initial schema
    r#"
    -- ============================================
    -- Sessions
    -- ============================================

    CREATE TABLE IF NOT EXISTS sessions (
        id             TEXT PRIMARY KEY,
        project_path   TEXT NOT NULL,       -- encoded directory name
        decoded_path   TEXT NOT NULL,       -- authoritative path
        project_name   TEXT,
        started_at     DATETIME NOT NULL,
        ended_at       DATETIME,
        message_count  INTEGER NOT NULL DEFAULT 0,
        summary        TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_sessions_decoded_path ON sessions(decoded_path);
    CREATE INDEX IF NOT EXISTS idx_sessions_started ON sessions(started_at DESC);

    -- ============================================
    -- Messages + external-content full-text index
    -- ============================================

    CREATE TABLE IF NOT EXISTS messages (
        id            TEXT PRIMARY KEY,
        session_id    TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
        role          TEXT NOT NULL CHECK (role IN ('user', 'assistant')),
        content       TEXT NOT NULL,
        ts            DATETIME NOT NULL,
        tool_use_ids  JSON                  -- ordered ids referenced by assistant turns
    );

    CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id);
    CREATE INDEX IF NOT EXISTS idx_messages_ts ON messages(ts);

    CREATE VIRTUAL TABLE IF NOT EXISTS messages_fts USING fts5(
        content,
        content='messages',
        content_rowid='rowid',
        tokenize='porter unicode61'
    );

    CREATE TRIGGER IF NOT EXISTS messages_ai AFTER INSERT ON messages BEGIN
        INSERT INTO messages_fts(rowid, content) VALUES (new.rowid, new.content);
    END;

    CREATE TRIGGER IF NOT EXISTS messages_ad AFTER DELETE ON messages BEGIN
        INSERT INTO messages_fts(messages_fts, rowid, content)
        VALUES ('delete', old.rowid, old.content);
    END;

    CREATE TRIGGER IF NOT EXISTS messages_au AFTER UPDATE ON messages BEGIN
        INSERT INTO messages_fts(messages_fts, rowid, content)
        VALUES ('delete', old.rowid, old.content);
        INSERT INTO messages_fts(rowid, content) VALUES (new.rowid, new.content);
    END;

    -- ============================================
    -- Tool uses
    -- ============================================

    CREATE TABLE IF NOT EXISTS tool_uses (
        id          TEXT PRIMARY KEY,
        session_id  TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
        tool_name   TEXT NOT NULL,
        input       JSON,
        ts          DATETIME NOT NULL,
        status      TEXT NOT NULL CHECK (status IN ('pending', 'success', 'error')),
        result      TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_tool_uses_session ON tool_uses(session_id);
    CREATE INDEX IF NOT EXISTS idx_tool_uses_ts ON tool_uses(ts);

    -- ============================================
    -- Heterogeneous links (session | message | topic)
    -- ============================================

    CREATE TABLE IF NOT EXISTS links (
        id           INTEGER PRIMARY KEY AUTOINCREMENT,
        source_type  TEXT NOT NULL CHECK (source_type IN ('session', 'message', 'topic')),
        source_id    TEXT NOT NULL,
        target_type  TEXT NOT NULL CHECK (target_type IN ('session', 'message', 'topic')),
        target_id    TEXT NOT NULL,
        relationship TEXT NOT NULL CHECK (relationship IN ('mentions', 'related_to', 'continues')),
        weight       REAL NOT NULL DEFAULT 1.0,
        created_at   DATETIME NOT NULL,

        UNIQUE(source_type, source_id, target_type, target_id, relationship)
    );

    CREATE INDEX IF NOT EXISTS idx_links_source ON links(source_type, source_id);
    CREATE INDEX IF NOT EXISTS idx_links_target ON links(target_type, target_id);

    -- Session ids in links are not FK-enforceable (polymorphic source/target),
    -- so cascade by trigger.
    CREATE TRIGGER IF NOT EXISTS links_session_delete AFTER DELETE ON sessions BEGIN
        DELETE FROM links
        WHERE (source_type = 'session' AND source_id = old.id)
           OR (target_type = 'session' AND target_id = old.id);
    END;

    -- ============================================
    -- Topics
    -- ============================================

    CREATE TABLE IF NOT EXISTS topics (
        id          TEXT PRIMARY KEY,
        name        TEXT NOT NULL UNIQUE,
        created_at  DATETIME NOT NULL
    );

    -- ============================================
    -- Extraction state
    -- ============================================

    CREATE TABLE IF NOT EXISTS extraction_state (
        id                  TEXT PRIMARY KEY,
        session_path        TEXT NOT NULL UNIQUE,
        started_at          DATETIME NOT NULL,
        status              TEXT NOT NULL CHECK (status IN ('pending', 'in_progress', 'complete', 'error')),
        completed_at        DATETIME,
        messages_extracted  INTEGER NOT NULL DEFAULT 0,
        error               TEXT,
        file_mtime          DATETIME,
        file_size           INTEGER
    );

    CREATE INDEX IF NOT EXISTS idx_extraction_state_status ON extraction_state(status);

    -- ============================================
    -- Entity graph
    -- ============================================

    CREATE TABLE IF NOT EXISTS entities (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        type             TEXT NOT NULL CHECK (type IN ('concept', 'file', 'decision', 'term')),
        name             TEXT NOT NULL,
        normalized_name  TEXT NOT NULL,
        metadata         JSON,
        confidence       REAL NOT NULL DEFAULT 1.0,
        created_at       DATETIME NOT NULL,

        UNIQUE(type, normalized_name)
    );

    CREATE INDEX IF NOT EXISTS idx_entities_type ON entities(type);
    CREATE INDEX IF NOT EXISTS idx_entities_created ON entities(created_at DESC);

    CREATE TABLE IF NOT EXISTS session_entities (
        session_id  TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
        entity_id   INTEGER NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
        frequency   INTEGER NOT NULL DEFAULT 1,

        PRIMARY KEY (session_id, entity_id)
    );

    CREATE TABLE IF NOT EXISTS entity_links (
        source_id    INTEGER NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
        target_id    INTEGER NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
        relationship TEXT NOT NULL CHECK (relationship IN ('related', 'implies', 'contradicts')),
        weight       REAL NOT NULL DEFAULT 0.5,
        created_at   DATETIME NOT NULL,

        PRIMARY KEY (source_id, target_id, relationship)
    );

    -- ============================================
    -- Session summary full-text index
    --
    -- Standalone (not external-content): summaries arrive long after the
    -- session row is inserted. There is deliberately no INSERT trigger;
    -- the summary is indexed only via UPDATE OF summary.
    -- ============================================

    CREATE VIRTUAL TABLE IF NOT EXISTS sessions_fts USING fts5(
        session_id UNINDEXED,
        summary,
        tokenize='porter unicode61'
    );

    CREATE TRIGGER IF NOT EXISTS sessions_summary_au AFTER UPDATE OF summary ON sessions BEGIN
        DELETE FROM sessions_fts WHERE session_id = old.id;
        INSERT INTO sessions_fts(session_id, summary)
        SELECT new.id, new.summary WHERE new.summary IS NOT NULL;
    END;

    CREATE TRIGGER IF NOT EXISTS sessions_fts_ad AFTER DELETE ON sessions BEGIN
        DELETE FROM sessions_fts WHERE session_id = old.id;
    END;
    "#,
];

/// Probe for the FTS5 extension; absence is fatal for this store.
pub fn verify_fts5(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE VIRTUAL TABLE temp.fts5_probe USING fts5(probe);
         DROP TABLE temp.fts5_probe;",
    )
    .map_err(|e| Error::Fts5Unavailable(e.to_string()))
}

/// Run all pending migrations
pub fn run_migrations(conn: &Connection) -> Result<()> {
    let current_version: i32 = conn
        .query_row("PRAGMA user_version", [], |r| r.get(0))
        .unwrap_or(0);

    tracing::debug!(
        current_version,
        target_version = SCHEMA_VERSION,
        "Checking database migrations"
    );

    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let version = (i + 1) as i32;
        if version > current_version {
            tracing::info!(version, "Running migration");
            conn.execute_batch(migration)?;
            conn.execute(&format!("PRAGMA user_version = {}", version), [])?;
        }
    }

    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> Result<i32> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_idempotent() {
        let conn = Connection::open_in_memory().unwrap();

        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        let version = get_schema_version(&conn).unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_tables_created() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let tables = [
            "sessions",
            "messages",
            "messages_fts",
            "tool_uses",
            "links",
            "topics",
            "extraction_state",
            "entities",
            "session_entities",
            "entity_links",
            "sessions_fts",
        ];

        for table in tables {
            let exists: i32 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE name = ?",
                    [table],
                    |r| r.get(0),
                )
                .unwrap();
            assert_eq!(exists, 1, "Table {} should exist", table);
        }
    }

    #[test]
    fn test_fts5_probe() {
        let conn = Connection::open_in_memory().unwrap();
        verify_fts5(&conn).unwrap();
    }

    #[test]
    fn test_message_fts_triggers_stay_in_sync() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        conn.execute(
            "INSERT INTO sessions (id, project_path, decoded_path, started_at) VALUES ('s1', '-tmp-a', '/tmp/a', '2026-01-01T00:00:00Z')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO messages (id, session_id, role, content, ts) VALUES ('m1', 's1', 'user', 'searching for needles', '2026-01-01T00:00:01Z')",
            [],
        )
        .unwrap();

        let hits: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM messages_fts WHERE messages_fts MATCH 'needle'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(hits, 1, "porter stemming should match needle/needles");

        conn.execute("DELETE FROM messages WHERE id = 'm1'", []).unwrap();
        let hits: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM messages_fts WHERE messages_fts MATCH 'needle'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(hits, 0);
    }

    #[test]
    fn test_summary_indexed_only_on_update() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        conn.execute(
            "INSERT INTO sessions (id, project_path, decoded_path, started_at, summary) VALUES ('s1', '-tmp-a', '/tmp/a', '2026-01-01T00:00:00Z', 'early summary')",
            [],
        )
        .unwrap();

        // No INSERT trigger: a summary present at insert time is not indexed.
        let hits: i64 = conn
            .query_row("SELECT COUNT(*) FROM sessions_fts", [], |r| r.get(0))
            .unwrap();
        assert_eq!(hits, 0);

        conn.execute(
            "UPDATE sessions SET summary = 'debugging the parser' WHERE id = 's1'",
            [],
        )
        .unwrap();
        let hits: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sessions_fts WHERE summary MATCH 'parser'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(hits, 1);

        conn.execute("DELETE FROM sessions WHERE id = 's1'", []).unwrap();
        let hits: i64 = conn
            .query_row("SELECT COUNT(*) FROM sessions_fts", [], |r| r.get(0))
            .unwrap();
        assert_eq!(hits, 0);
    }
}
