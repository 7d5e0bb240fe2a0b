//! Database repository layer
//!
//! Provides query and insert operations for all entity kinds. Write policies
//! differ per table: sessions, messages, and tool uses ignore duplicate ids;
//! entities upsert on (type, case-folded name) keeping the oldest id and the
//! highest confidence; extraction state replaces; session-entity links sum
//! their frequency on conflict; entity-entity links are first-write-wins.

use crate::error::{Error, Result};
use crate::types::*;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Mutex;

/// Maximum rows written inside one batch transaction.
const BATCH_SIZE: usize = 100;

/// Outcome of a bulk write.
#[derive(Debug, Default, Clone)]
pub struct BatchOutcome {
    /// Rows actually inserted
    pub inserted: usize,
    /// Rows skipped by the duplicate policy
    pub skipped: usize,
    /// Per-row failures (id and error text)
    pub errors: Vec<String>,
}

impl BatchOutcome {
    fn absorb(&mut self, other: BatchOutcome) {
        self.inserted += other.inserted;
        self.skipped += other.skipped;
        self.errors.extend(other.errors);
    }
}

/// Filter for typed entity reads.
#[derive(Debug, Default, Clone)]
pub struct EntityFilter {
    pub entity_type: Option<EntityType>,
    pub min_confidence: Option<f64>,
    pub limit: Option<usize>,
}

/// An entity reached by multi-hop traversal, with provenance.
#[derive(Debug, Clone)]
pub struct RelatedEntity {
    pub entity: Entity,
    /// Number of edges from the seed
    pub hops: i64,
    /// Product of edge weights along the discovered path
    pub weight: f64,
}

/// Row counts across every data table.
#[derive(Debug, Default, Clone)]
pub struct StoreStats {
    pub sessions: i64,
    pub messages: i64,
    pub tool_uses: i64,
    pub entities: i64,
    pub links: i64,
    pub session_entities: i64,
    pub entity_links: i64,
    pub extraction_states: i64,
    pub topics: i64,
}

/// Result of the per-session transactional persist driven by the sync engine.
#[derive(Debug, Default, Clone)]
pub struct ExtractionPersistOutcome {
    pub messages_inserted: usize,
    pub tool_uses_inserted: usize,
    pub entities_linked: usize,
}

/// Database handle (single connection behind a mutex)
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create a store at the given path.
    ///
    /// Enables foreign keys and WAL mode, verifies the FTS5 extension is
    /// available (fatal if not), and applies the schema.
    pub fn open(path: &PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path).map_err(|e| Error::DbConnectionFailed(e.to_string()))?;

        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            ",
        )?;

        super::schema::verify_fts5(&conn)?;
        super::schema::run_migrations(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory store (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        super::schema::verify_fts5(&conn)?;
        super::schema::run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Get the underlying connection (for advanced use)
    pub fn connection(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }

    // ============================================
    // Session operations
    // ============================================

    /// Insert a session; duplicate ids are ignored.
    pub fn save_session(&self, session: &Session) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        Self::insert_session_row(&conn, session)
    }

    /// Get a session by ID
    pub fn get_session(&self, id: &str) -> Result<Option<Session>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT * FROM sessions WHERE id = ?", [id], |row| {
            Self::row_to_session(row)
        })
        .optional()
        .map_err(Error::from)
    }

    /// Sessions belonging to a project, newest first.
    pub fn sessions_for_project(&self, decoded_path: &str) -> Result<Vec<Session>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT * FROM sessions WHERE decoded_path = ? ORDER BY started_at DESC",
        )?;
        let sessions = stmt
            .query_map([decoded_path], Self::row_to_session)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(sessions)
    }

    /// Most recently started sessions across all projects.
    pub fn recent_sessions(&self, limit: usize) -> Result<Vec<Session>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare_cached("SELECT * FROM sessions ORDER BY started_at DESC LIMIT ?")?;
        let sessions = stmt
            .query_map([limit as i64], Self::row_to_session)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(sessions)
    }

    /// Set the session summary.
    ///
    /// The summary full-text index is maintained by an `UPDATE OF summary`
    /// trigger, so this write is also the indexing point.
    pub fn update_summary(&self, session_id: &str, summary: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE sessions SET summary = ?1 WHERE id = ?2",
            params![summary, session_id],
        )?;
        Ok(n > 0)
    }

    /// Update the derived project name for a session.
    pub fn update_project_name(&self, session_id: &str, name: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE sessions SET project_name = ?1 WHERE id = ?2",
            params![name, session_id],
        )?;
        Ok(n > 0)
    }

    /// Full-text search over session summaries, best match first.
    pub fn search_sessions(&self, query: &str, limit: usize) -> Result<Vec<Session>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            r#"
            SELECT s.*
            FROM sessions_fts
            JOIN sessions s ON s.id = sessions_fts.session_id
            WHERE sessions_fts MATCH ?1
            ORDER BY rank
            LIMIT ?2
            "#,
        )?;
        let sessions = stmt
            .query_map(params![query, limit as i64], Self::row_to_session)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(sessions)
    }

    fn insert_session_row(conn: &Connection, session: &Session) -> Result<bool> {
        let mut stmt = conn.prepare_cached(
            r#"
            INSERT OR IGNORE INTO sessions
                (id, project_path, decoded_path, project_name, started_at, ended_at,
                 message_count, summary)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )?;
        let n = stmt.execute(params![
            session.id,
            session.project.encoded(),
            session.project.decoded(),
            session.project.project_name(),
            session.started_at.to_rfc3339(),
            session.ended_at.map(|t| t.to_rfc3339()),
            session.message_count,
            session.summary,
        ])?;
        Ok(n > 0)
    }

    /// Insert-or-advance for re-extraction: the end instant and message count
    /// may grow, everything else (summary included) is preserved.
    fn upsert_session_row(conn: &Connection, session: &Session) -> Result<()> {
        let mut stmt = conn.prepare_cached(
            r#"
            INSERT INTO sessions
                (id, project_path, decoded_path, project_name, started_at, ended_at,
                 message_count, summary)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(id) DO UPDATE SET
                ended_at = COALESCE(excluded.ended_at, sessions.ended_at),
                message_count = MAX(sessions.message_count, excluded.message_count)
            "#,
        )?;
        stmt.execute(params![
            session.id,
            session.project.encoded(),
            session.project.decoded(),
            session.project.project_name(),
            session.started_at.to_rfc3339(),
            session.ended_at.map(|t| t.to_rfc3339()),
            session.message_count,
            session.summary,
        ])?;
        Ok(())
    }

    fn row_to_session(row: &Row) -> rusqlite::Result<Session> {
        let encoded: String = row.get("project_path")?;
        let decoded: String = row.get("decoded_path")?;
        let started_at_str: String = row.get("started_at")?;
        let ended_at_str: Option<String> = row.get("ended_at")?;

        Ok(Session {
            id: row.get("id")?,
            project: ProjectPath::from_parts(&encoded, &decoded),
            started_at: parse_ts(&started_at_str),
            ended_at: ended_at_str.as_deref().map(parse_ts),
            message_count: row.get("message_count")?,
            summary: row.get("summary")?,
        })
    }

    // ============================================
    // Message operations
    // ============================================

    /// Insert a message; a second insertion with the same id is a no-op.
    pub fn save_message(&self, message: &Message) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        Self::insert_message_row(&conn, message)
    }

    /// Insert messages in batches of up to 100 per immediate transaction.
    pub fn save_messages(&self, messages: &[Message]) -> Result<BatchOutcome> {
        let mut conn = self.conn.lock().unwrap();
        let mut outcome = BatchOutcome::default();

        for chunk in messages.chunks(BATCH_SIZE) {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut chunk_outcome = BatchOutcome::default();
            for message in chunk {
                match Self::insert_message_row(&tx, message) {
                    Ok(true) => chunk_outcome.inserted += 1,
                    Ok(false) => chunk_outcome.skipped += 1,
                    Err(e) => chunk_outcome.errors.push(format!("{}: {}", message.id, e)),
                }
            }
            tx.commit()?;
            outcome.absorb(chunk_outcome);
        }

        Ok(outcome)
    }

    /// Get messages for a session in event order.
    pub fn get_session_messages(&self, session_id: &str) -> Result<Vec<Message>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare_cached("SELECT * FROM messages WHERE session_id = ? ORDER BY ts ASC")?;
        let messages = stmt
            .query_map([session_id], Self::row_to_message)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(messages)
    }

    /// Count messages for a session
    pub fn count_session_messages(&self, session_id: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE session_id = ?",
            [session_id],
            |r| r.get(0),
        )?;
        Ok(count)
    }

    /// Full-text search over message bodies, best match first.
    pub fn search_messages(&self, query: &str, limit: usize) -> Result<Vec<Message>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            r#"
            SELECT m.*
            FROM messages_fts
            JOIN messages m ON m.rowid = messages_fts.rowid
            WHERE messages_fts MATCH ?1
            ORDER BY rank
            LIMIT ?2
            "#,
        )?;
        let messages = stmt
            .query_map(params![query, limit as i64], Self::row_to_message)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(messages)
    }

    fn insert_message_row(conn: &Connection, message: &Message) -> Result<bool> {
        let tool_use_ids = if message.tool_use_ids.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&message.tool_use_ids)?)
        };

        let mut stmt = conn.prepare_cached(
            r#"
            INSERT OR IGNORE INTO messages (id, session_id, role, content, ts, tool_use_ids)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )?;
        let n = stmt.execute(params![
            message.id,
            message.session_id,
            message.role.as_str(),
            message.content,
            message.emitted_at.to_rfc3339(),
            tool_use_ids,
        ])?;
        Ok(n > 0)
    }

    fn row_to_message(row: &Row) -> rusqlite::Result<Message> {
        let role_str: String = row.get("role")?;
        let ts_str: String = row.get("ts")?;
        let tool_use_ids_str: Option<String> = row.get("tool_use_ids")?;

        Ok(Message {
            id: row.get("id")?,
            session_id: row.get("session_id")?,
            role: role_str.parse().unwrap_or(MessageRole::User),
            content: row.get("content")?,
            emitted_at: parse_ts(&ts_str),
            tool_use_ids: tool_use_ids_str
                .and_then(|s| serde_json::from_str(&s).ok())
                .unwrap_or_default(),
        })
    }

    // ============================================
    // Tool use operations
    // ============================================

    /// Insert a tool use; duplicate ids are ignored.
    pub fn save_tool_use(&self, tool_use: &ToolUse) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        Self::insert_tool_use_row(&conn, tool_use)
    }

    /// Insert tool uses in batches of up to 100 per immediate transaction.
    pub fn save_tool_uses(&self, tool_uses: &[ToolUse]) -> Result<BatchOutcome> {
        let mut conn = self.conn.lock().unwrap();
        let mut outcome = BatchOutcome::default();

        for chunk in tool_uses.chunks(BATCH_SIZE) {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut chunk_outcome = BatchOutcome::default();
            for tool_use in chunk {
                match Self::insert_tool_use_row(&tx, tool_use) {
                    Ok(true) => chunk_outcome.inserted += 1,
                    Ok(false) => chunk_outcome.skipped += 1,
                    Err(e) => chunk_outcome
                        .errors
                        .push(format!("{}: {}", tool_use.id, e)),
                }
            }
            tx.commit()?;
            outcome.absorb(chunk_outcome);
        }

        Ok(outcome)
    }

    /// Get tool uses for a session in event order.
    pub fn get_session_tool_uses(&self, session_id: &str) -> Result<Vec<ToolUse>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare_cached("SELECT * FROM tool_uses WHERE session_id = ? ORDER BY ts ASC")?;
        let tool_uses = stmt
            .query_map([session_id], Self::row_to_tool_use)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(tool_uses)
    }

    fn insert_tool_use_row(conn: &Connection, tool_use: &ToolUse) -> Result<bool> {
        let mut stmt = conn.prepare_cached(
            r#"
            INSERT OR IGNORE INTO tool_uses (id, session_id, tool_name, input, ts, status, result)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )?;
        let n = stmt.execute(params![
            tool_use.id,
            tool_use.session_id,
            tool_use.name,
            tool_use.input.to_string(),
            tool_use.emitted_at.to_rfc3339(),
            tool_use.status.as_str(),
            tool_use.result,
        ])?;
        Ok(n > 0)
    }

    fn row_to_tool_use(row: &Row) -> rusqlite::Result<ToolUse> {
        let input_str: Option<String> = row.get("input")?;
        let status_str: String = row.get("status")?;
        let ts_str: String = row.get("ts")?;

        Ok(ToolUse {
            id: row.get("id")?,
            session_id: row.get("session_id")?,
            name: row.get("tool_name")?,
            input: input_str
                .and_then(|s| serde_json::from_str(&s).ok())
                .unwrap_or(serde_json::Value::Null),
            emitted_at: parse_ts(&ts_str),
            status: status_str.parse().unwrap_or(ToolStatus::Pending),
            result: row.get("result")?,
        })
    }

    // ============================================
    // Entity operations
    // ============================================

    /// Upsert an entity by (type, case-folded name).
    ///
    /// The oldest record keeps its integer id; confidence is raised to the
    /// max of old and new; metadata takes the latest non-null value. Returns
    /// the stored id.
    pub fn save_entity(&self, entity: &Entity) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        Self::upsert_entity_row(&conn, entity)
    }

    /// Get an entity by id
    pub fn get_entity(&self, id: i64) -> Result<Option<Entity>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT * FROM entities WHERE id = ?", [id], |row| {
            Self::row_to_entity(row)
        })
        .optional()
        .map_err(Error::from)
    }

    /// Look up an entity by its logical identity.
    pub fn find_entity(&self, entity_type: EntityType, name: &str) -> Result<Option<Entity>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM entities WHERE type = ?1 AND normalized_name = ?2",
            params![entity_type.as_str(), name.to_lowercase()],
            Self::row_to_entity,
        )
        .optional()
        .map_err(Error::from)
    }

    /// Typed, filtered entity listing ordered by confidence descending.
    pub fn list_entities(&self, filter: &EntityFilter) -> Result<Vec<Entity>> {
        let conn = self.conn.lock().unwrap();

        let mut sql = String::from("SELECT * FROM entities WHERE 1=1");
        let mut sql_params: Vec<Box<dyn rusqlite::ToSql>> = vec![];

        if let Some(entity_type) = filter.entity_type {
            sql.push_str(" AND type = ?");
            sql_params.push(Box::new(entity_type.as_str().to_string()));
        }
        if let Some(min_confidence) = filter.min_confidence {
            sql.push_str(" AND confidence >= ?");
            sql_params.push(Box::new(min_confidence));
        }

        sql.push_str(" ORDER BY confidence DESC, created_at DESC");

        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let params_refs: Vec<&dyn rusqlite::ToSql> =
            sql_params.iter().map(|p| p.as_ref()).collect();

        let mut stmt = conn.prepare(&sql)?;
        let entities = stmt
            .query_map(params_refs.as_slice(), Self::row_to_entity)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(entities)
    }

    /// Most recently created entities.
    pub fn recent_entities(&self, limit: usize) -> Result<Vec<Entity>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare_cached("SELECT * FROM entities ORDER BY created_at DESC LIMIT ?")?;
        let entities = stmt
            .query_map([limit as i64], Self::row_to_entity)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entities)
    }

    fn upsert_entity_row(conn: &Connection, entity: &Entity) -> Result<i64> {
        let metadata = if entity.metadata.is_null() {
            None
        } else {
            Some(entity.metadata.to_string())
        };

        let mut stmt = conn.prepare_cached(
            r#"
            INSERT INTO entities (type, name, normalized_name, metadata, confidence, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(type, normalized_name) DO UPDATE SET
                confidence = MAX(entities.confidence, excluded.confidence),
                metadata = COALESCE(excluded.metadata, entities.metadata)
            "#,
        )?;
        stmt.execute(params![
            entity.entity_type.as_str(),
            entity.name,
            entity.normalized_name(),
            metadata,
            entity.confidence,
            entity.created_at.to_rfc3339(),
        ])?;

        let mut lookup = conn.prepare_cached(
            "SELECT id FROM entities WHERE type = ?1 AND normalized_name = ?2",
        )?;
        let id: i64 = lookup.query_row(
            params![entity.entity_type.as_str(), entity.normalized_name()],
            |r| r.get(0),
        )?;
        Ok(id)
    }

    fn row_to_entity(row: &Row) -> rusqlite::Result<Entity> {
        let type_str: String = row.get("type")?;
        let metadata_str: Option<String> = row.get("metadata")?;
        let created_at_str: String = row.get("created_at")?;

        Ok(Entity {
            id: Some(row.get("id")?),
            entity_type: type_str.parse().unwrap_or(EntityType::Concept),
            name: row.get("name")?,
            metadata: metadata_str
                .and_then(|s| serde_json::from_str(&s).ok())
                .unwrap_or(serde_json::Value::Null),
            confidence: row.get("confidence")?,
            created_at: parse_ts(&created_at_str),
        })
    }

    // ============================================
    // Session-entity links
    // ============================================

    /// Link an entity to a session; the frequency sums on duplicate insert.
    pub fn link_entity_to_session(
        &self,
        entity_id: i64,
        session_id: &str,
        frequency: i64,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        Self::link_entity_row(&conn, entity_id, session_id, frequency)
    }

    /// Entities linked to a session with their frequencies, most frequent first.
    pub fn entities_for_session(&self, session_id: &str) -> Result<Vec<(Entity, i64)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            r#"
            SELECT e.*, se.frequency
            FROM session_entities se
            JOIN entities e ON e.id = se.entity_id
            WHERE se.session_id = ?
            ORDER BY se.frequency DESC, e.confidence DESC
            "#,
        )?;
        let rows = stmt
            .query_map([session_id], |row| {
                let frequency: i64 = row.get("frequency")?;
                Ok((Self::row_to_entity(row)?, frequency))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Sessions an entity was extracted from, with frequencies.
    pub fn sessions_for_entity(&self, entity_id: i64) -> Result<Vec<(String, i64)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT session_id, frequency FROM session_entities WHERE entity_id = ? ORDER BY frequency DESC",
        )?;
        let rows = stmt
            .query_map([entity_id], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn link_entity_row(
        conn: &Connection,
        entity_id: i64,
        session_id: &str,
        frequency: i64,
    ) -> Result<()> {
        let mut stmt = conn.prepare_cached(
            r#"
            INSERT INTO session_entities (session_id, entity_id, frequency)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(session_id, entity_id) DO UPDATE SET
                frequency = frequency + excluded.frequency
            "#,
        )?;
        stmt.execute(params![session_id, entity_id, frequency])?;
        Ok(())
    }

    // ============================================
    // Entity-entity links
    // ============================================

    /// Insert an entity-to-entity edge; the first insertion wins the weight.
    pub fn save_entity_link(&self, link: &EntityLink) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            r#"
            INSERT OR IGNORE INTO entity_links (source_id, target_id, relationship, weight, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )?;
        let n = stmt.execute(params![
            link.source_id,
            link.target_id,
            link.relation.as_str(),
            link.weight.clamp(0.0, 1.0),
            link.created_at.to_rfc3339(),
        ])?;
        Ok(n > 0)
    }

    /// Direct outgoing edges from an entity.
    pub fn entity_links_from(&self, source_id: i64) -> Result<Vec<EntityLink>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT * FROM entity_links WHERE source_id = ? ORDER BY weight DESC",
        )?;
        let links = stmt
            .query_map([source_id], Self::row_to_entity_link)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(links)
    }

    /// Multi-hop traversal from a seed entity.
    ///
    /// Walks outgoing edges up to `max_hops` deep, attenuating weight by
    /// multiplication along the path. Cycles are broken by carrying the
    /// visited path as a delimited string and rejecting edges whose target
    /// already appears in it. Each entity appears at most once, ordered by
    /// hop count ascending then weight descending.
    pub fn related_entities_with_hops(
        &self,
        seed_id: i64,
        max_hops: i64,
    ) -> Result<Vec<RelatedEntity>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            r#"
            WITH RECURSIVE walk(target_id, hops, weight, path) AS (
                SELECT el.target_id, 1, el.weight,
                       '/' || ?1 || '/' || el.target_id || '/'
                FROM entity_links el
                WHERE el.source_id = ?1
                UNION ALL
                SELECT el.target_id, w.hops + 1, w.weight * el.weight,
                       w.path || el.target_id || '/'
                FROM entity_links el
                JOIN walk w ON el.source_id = w.target_id
                WHERE w.hops < ?2
                  AND instr(w.path, '/' || el.target_id || '/') = 0
            )
            SELECT e.id, e.type, e.name, e.metadata, e.confidence, e.created_at,
                   w.hops, w.weight
            FROM walk w
            JOIN entities e ON e.id = w.target_id
            ORDER BY w.hops ASC, w.weight DESC
            "#,
        )?;

        let rows = stmt
            .query_map(params![seed_id, max_hops], |row| {
                let type_str: String = row.get(1)?;
                let metadata_str: Option<String> = row.get(3)?;
                let created_at_str: String = row.get(5)?;
                Ok(RelatedEntity {
                    entity: Entity {
                        id: Some(row.get(0)?),
                        entity_type: type_str.parse().unwrap_or(EntityType::Concept),
                        name: row.get(2)?,
                        metadata: metadata_str
                            .and_then(|s| serde_json::from_str(&s).ok())
                            .unwrap_or(serde_json::Value::Null),
                        confidence: row.get(4)?,
                        created_at: parse_ts(&created_at_str),
                    },
                    hops: row.get(6)?,
                    weight: row.get(7)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        // A node may be reachable along several paths; keep its best (first)
        // ranking only.
        let mut seen: HashSet<i64> = HashSet::new();
        let mut related = Vec::new();
        for row in rows {
            if let Some(id) = row.entity.id {
                if seen.insert(id) {
                    related.push(row);
                }
            }
        }
        Ok(related)
    }

    /// Multi-hop traversal without hop provenance.
    pub fn related_entities(&self, seed_id: i64, max_hops: i64) -> Result<Vec<Entity>> {
        Ok(self
            .related_entities_with_hops(seed_id, max_hops)?
            .into_iter()
            .map(|r| r.entity)
            .collect())
    }

    fn row_to_entity_link(row: &Row) -> rusqlite::Result<EntityLink> {
        let relation_str: String = row.get("relationship")?;
        let created_at_str: String = row.get("created_at")?;
        Ok(EntityLink {
            source_id: row.get("source_id")?,
            target_id: row.get("target_id")?,
            relation: relation_str.parse().unwrap_or(EntityRelation::Related),
            weight: row.get("weight")?,
            created_at: parse_ts(&created_at_str),
        })
    }

    // ============================================
    // Heterogeneous links and topics
    // ============================================

    /// Insert or replace a heterogeneous link on its unique key.
    pub fn save_link(&self, link: &Link) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        Self::insert_link_row(&conn, link)
    }

    /// Outgoing links from a node.
    pub fn links_from(&self, kind: NodeKind, id: &str) -> Result<Vec<Link>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT * FROM links WHERE source_type = ?1 AND source_id = ?2 ORDER BY weight DESC",
        )?;
        let links = stmt
            .query_map(params![kind.as_str(), id], Self::row_to_link)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(links)
    }

    /// Ensure a topic row exists; the id is the case-folded name.
    pub fn save_topic(&self, name: &str) -> Result<String> {
        let conn = self.conn.lock().unwrap();
        Self::insert_topic_row(&conn, name)
    }

    fn insert_link_row(conn: &Connection, link: &Link) -> Result<()> {
        let mut stmt = conn.prepare_cached(
            r#"
            INSERT OR REPLACE INTO links
                (source_type, source_id, target_type, target_id, relationship, weight, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )?;
        stmt.execute(params![
            link.source_kind.as_str(),
            link.source_id,
            link.target_kind.as_str(),
            link.target_id,
            link.relation.as_str(),
            link.weight.clamp(0.0, 1.0),
            link.created_at.to_rfc3339(),
        ])?;
        Ok(())
    }

    fn insert_topic_row(conn: &Connection, name: &str) -> Result<String> {
        let id = name.to_lowercase();
        let mut stmt = conn.prepare_cached(
            "INSERT OR IGNORE INTO topics (id, name, created_at) VALUES (?1, ?2, ?3)",
        )?;
        stmt.execute(params![id, name, Utc::now().to_rfc3339()])?;
        Ok(id)
    }

    fn row_to_link(row: &Row) -> rusqlite::Result<Link> {
        let source_type: String = row.get("source_type")?;
        let target_type: String = row.get("target_type")?;
        let relation_str: String = row.get("relationship")?;
        let created_at_str: String = row.get("created_at")?;

        Ok(Link {
            source_kind: source_type.parse().unwrap_or(NodeKind::Session),
            source_id: row.get("source_id")?,
            target_kind: target_type.parse().unwrap_or(NodeKind::Topic),
            target_id: row.get("target_id")?,
            relation: relation_str.parse().unwrap_or(LinkRelation::Mentions),
            weight: row.get("weight")?,
            created_at: parse_ts(&created_at_str),
        })
    }

    // ============================================
    // Extraction state
    // ============================================

    /// Save an extraction state, replacing any prior record with the same id
    /// or session path.
    pub fn save_extraction_state(&self, state: &ExtractionState) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        Self::save_state_row(&conn, state)
    }

    /// Look up the extraction state for a session file path.
    pub fn extraction_state_by_path(&self, session_path: &str) -> Result<Option<ExtractionState>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM extraction_state WHERE session_path = ?",
            [session_path],
            Self::row_to_state,
        )
        .optional()
        .map_err(Error::from)
    }

    /// Get an extraction state by id
    pub fn get_extraction_state(&self, id: &str) -> Result<Option<ExtractionState>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM extraction_state WHERE id = ?",
            [id],
            Self::row_to_state,
        )
        .optional()
        .map_err(Error::from)
    }

    fn save_state_row(conn: &Connection, state: &ExtractionState) -> Result<()> {
        let mut stmt = conn.prepare_cached(
            r#"
            INSERT OR REPLACE INTO extraction_state
                (id, session_path, started_at, status, completed_at, messages_extracted,
                 error, file_mtime, file_size)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )?;
        stmt.execute(params![
            state.id,
            state.session_path,
            state.started_at.to_rfc3339(),
            state.status.as_str(),
            state.completed_at.map(|t| t.to_rfc3339()),
            state.messages_extracted,
            state.error,
            state.file_mtime.map(|t| t.to_rfc3339()),
            state.file_size,
        ])?;
        Ok(())
    }

    fn row_to_state(row: &Row) -> rusqlite::Result<ExtractionState> {
        let status_str: String = row.get("status")?;
        let started_at_str: String = row.get("started_at")?;
        let completed_at_str: Option<String> = row.get("completed_at")?;
        let file_mtime_str: Option<String> = row.get("file_mtime")?;

        Ok(ExtractionState {
            id: row.get("id")?,
            session_path: row.get("session_path")?,
            started_at: parse_ts(&started_at_str),
            status: status_str.parse().unwrap_or(ExtractionStatus::Pending),
            completed_at: completed_at_str.as_deref().map(parse_ts),
            messages_extracted: row.get("messages_extracted")?,
            error: row.get("error")?,
            file_mtime: file_mtime_str.as_deref().map(parse_ts),
            file_size: row.get("file_size")?,
        })
    }

    // ============================================
    // Per-session transactional persist
    // ============================================

    /// Persist everything extracted from one session inside a single
    /// immediate transaction: the session row, its messages and tool uses,
    /// derived entities with their session links, and the extraction state
    /// driven pending → in_progress → complete.
    ///
    /// On failure nothing is committed; the caller records the error state
    /// outside the transaction.
    pub fn persist_extraction(
        &self,
        session: &Session,
        messages: &[Message],
        tool_uses: &[ToolUse],
        entities: &[(Entity, i64)],
        state: ExtractionState,
    ) -> Result<ExtractionPersistOutcome> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut outcome = ExtractionPersistOutcome::default();

        Self::upsert_session_row(&tx, session)?;

        for message in messages {
            if Self::insert_message_row(&tx, message)? {
                outcome.messages_inserted += 1;
            }
        }
        for tool_use in tool_uses {
            if Self::insert_tool_use_row(&tx, tool_use)? {
                outcome.tool_uses_inserted += 1;
            }
        }
        for (entity, frequency) in entities {
            let entity_id = Self::upsert_entity_row(&tx, entity)?;
            Self::link_entity_row(&tx, entity_id, &session.id, *frequency)?;
            outcome.entities_linked += 1;
        }

        let state = state
            .in_progress()
            .increment_messages(messages.len() as i64)
            .complete(Utc::now());
        Self::save_state_row(&tx, &state)?;

        tx.commit()?;
        Ok(outcome)
    }

    // ============================================
    // Statistics and bulk reads
    // ============================================

    /// Row counts for every data table.
    pub fn store_stats(&self) -> Result<StoreStats> {
        let conn = self.conn.lock().unwrap();
        let count = |table: &str| -> Result<i64> {
            conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| r.get(0))
                .map_err(Error::from)
        };
        Ok(StoreStats {
            sessions: count("sessions")?,
            messages: count("messages")?,
            tool_uses: count("tool_uses")?,
            entities: count("entities")?,
            links: count("links")?,
            session_entities: count("session_entities")?,
            entity_links: count("entity_links")?,
            extraction_states: count("extraction_state")?,
            topics: count("topics")?,
        })
    }

    /// All sessions, insertion order. Used by export.
    pub fn all_sessions(&self) -> Result<Vec<Session>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT * FROM sessions ORDER BY started_at ASC")?;
        let rows = stmt
            .query_map([], Self::row_to_session)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// All messages. Used by export.
    pub fn all_messages(&self) -> Result<Vec<Message>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT * FROM messages ORDER BY ts ASC")?;
        let rows = stmt
            .query_map([], Self::row_to_message)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// All tool uses. Used by export.
    pub fn all_tool_uses(&self) -> Result<Vec<ToolUse>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT * FROM tool_uses ORDER BY ts ASC")?;
        let rows = stmt
            .query_map([], Self::row_to_tool_use)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// All entities in id order. Used by export.
    pub fn all_entities(&self) -> Result<Vec<Entity>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT * FROM entities ORDER BY id ASC")?;
        let rows = stmt
            .query_map([], Self::row_to_entity)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// All heterogeneous links. Used by export.
    pub fn all_links(&self) -> Result<Vec<Link>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT * FROM links ORDER BY id ASC")?;
        let rows = stmt
            .query_map([], Self::row_to_link)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// All session-entity link rows. Used by export.
    pub fn all_session_entity_links(&self) -> Result<Vec<(String, i64, i64)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT session_id, entity_id, frequency FROM session_entities")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// All entity-entity links. Used by export.
    pub fn all_entity_links(&self) -> Result<Vec<EntityLink>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT * FROM entity_links")?;
        let rows = stmt
            .query_map([], Self::row_to_entity_link)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// All extraction states. Used by export.
    pub fn all_extraction_states(&self) -> Result<Vec<ExtractionState>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT * FROM extraction_state ORDER BY started_at ASC")?;
        let rows = stmt
            .query_map([], Self::row_to_state)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ============================================
    // Project aggregates (context queries)
    // ============================================

    /// Distinct projects with their session counts, most active first.
    pub fn project_session_counts(&self) -> Result<Vec<(String, String, i64)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            r#"
            SELECT COALESCE(project_name, ''), decoded_path, COUNT(*) as n
            FROM sessions
            GROUP BY decoded_path
            ORDER BY n DESC
            "#,
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Message role counts for a project, optionally windowed by session
    /// start instant.
    pub fn project_message_counts(
        &self,
        decoded_path: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<(i64, i64, i64)> {
        let conn = self.conn.lock().unwrap();
        let since = since.map(|t| t.to_rfc3339());
        let mut stmt = conn.prepare_cached(
            r#"
            SELECT
                COUNT(m.id),
                SUM(CASE WHEN m.role = 'user' THEN 1 ELSE 0 END),
                SUM(CASE WHEN m.role = 'assistant' THEN 1 ELSE 0 END)
            FROM messages m
            JOIN sessions s ON s.id = m.session_id
            WHERE s.decoded_path = ?1
              AND (?2 IS NULL OR s.started_at >= ?2)
            "#,
        )?;
        let (total, user, assistant): (i64, Option<i64>, Option<i64>) = stmt.query_row(
            params![decoded_path, since],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        Ok((total, user.unwrap_or(0), assistant.unwrap_or(0)))
    }

    /// Tool usage counts for a project, optionally windowed by the tool's
    /// own instant, most used first.
    pub fn project_tool_counts(
        &self,
        decoded_path: &str,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<(String, i64)>> {
        let conn = self.conn.lock().unwrap();
        let since = since.map(|t| t.to_rfc3339());
        let mut stmt = conn.prepare_cached(
            r#"
            SELECT t.tool_name, COUNT(*) as n
            FROM tool_uses t
            JOIN sessions s ON s.id = t.session_id
            WHERE s.decoded_path = ?1
              AND (?2 IS NULL OR t.ts >= ?2)
            GROUP BY t.tool_name
            ORDER BY n DESC
            LIMIT ?3
            "#,
        )?;
        let rows = stmt
            .query_map(params![decoded_path, since, limit as i64], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Topic ids linked from a project's sessions, strongest first.
    ///
    /// A topic linked from several of the project's sessions collapses to
    /// one row ranked by its strongest link.
    pub fn project_recent_topics(
        &self,
        decoded_path: &str,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let since = since.map(|t| t.to_rfc3339());
        let mut stmt = conn.prepare_cached(
            r#"
            SELECT l.target_id, MAX(l.weight) AS w
            FROM links l
            JOIN sessions s ON s.id = l.source_id
            WHERE l.source_type = 'session'
              AND l.target_type = 'topic'
              AND s.decoded_path = ?1
              AND (?2 IS NULL OR l.created_at >= ?2)
            GROUP BY l.target_id
            ORDER BY w DESC
            LIMIT ?3
            "#,
        )?;
        let rows = stmt
            .query_map(params![decoded_path, since, limit as i64], |row| {
                row.get::<_, String>(0)
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Latest activity instant across a project's sessions.
    pub fn project_last_activity(&self, decoded_path: &str) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn.lock().unwrap();
        let result: Option<String> = conn
            .query_row(
                "SELECT MAX(COALESCE(ended_at, started_at)) FROM sessions WHERE decoded_path = ?",
                [decoded_path],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        Ok(result.as_deref().map(parse_ts))
    }
}

/// Parse an RFC3339 timestamp from a text column, tolerating garbage the way
/// the rest of the read path does.
fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_session(id: &str) -> Session {
        Session::new(id, ProjectPath::from_decoded("/home/u/dev/app"), Utc::now()).unwrap()
    }

    #[test]
    fn test_session_duplicate_insert_is_noop() {
        let db = Database::open_in_memory().unwrap();
        let session = test_session("s1");

        assert!(db.save_session(&session).unwrap());
        assert!(!db.save_session(&session).unwrap());
        assert_eq!(db.store_stats().unwrap().sessions, 1);
    }

    #[test]
    fn test_message_batch_reports_inserted_and_skipped() {
        let db = Database::open_in_memory().unwrap();
        db.save_session(&test_session("s1")).unwrap();

        let m1 = Message::new("m1", "s1", MessageRole::User, "hello", Utc::now()).unwrap();
        let m2 = Message::new("m2", "s1", MessageRole::Assistant, "hi", Utc::now()).unwrap();

        let first = db.save_messages(&[m1.clone(), m2.clone()]).unwrap();
        assert_eq!(first.inserted, 2);
        assert_eq!(first.skipped, 0);

        let second = db.save_messages(&[m1, m2]).unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.skipped, 2);
        assert_eq!(db.count_session_messages("s1").unwrap(), 2);
    }

    #[test]
    fn test_entity_upsert_keeps_oldest_id_and_max_confidence() {
        let db = Database::open_in_memory().unwrap();

        let low = Entity::new(EntityType::Concept, "Rust", json!({}), 0.4).unwrap();
        let high = Entity::new(EntityType::Concept, "rust", json!({"k": "v"}), 0.9).unwrap();
        let mid = Entity::new(EntityType::Concept, "RUST", json!({}), 0.6).unwrap();

        let id1 = db.save_entity(&low).unwrap();
        let id2 = db.save_entity(&high).unwrap();
        let id3 = db.save_entity(&mid).unwrap();

        assert_eq!(id1, id2);
        assert_eq!(id1, id3);

        let stored = db.get_entity(id1).unwrap().unwrap();
        assert_eq!(stored.confidence, 0.9);
        assert_eq!(stored.metadata, json!({"k": "v"}));
        assert_eq!(db.store_stats().unwrap().entities, 1);
    }

    #[test]
    fn test_session_entity_frequency_sums() {
        let db = Database::open_in_memory().unwrap();
        db.save_session(&test_session("s1")).unwrap();

        let entity = Entity::new(EntityType::File, "src/main.rs", json!({}), 1.0).unwrap();
        let id = db.save_entity(&entity).unwrap();

        db.link_entity_to_session(id, "s1", 1).unwrap();
        db.link_entity_to_session(id, "s1", 1).unwrap();
        db.link_entity_to_session(id, "s1", 3).unwrap();

        let linked = db.entities_for_session("s1").unwrap();
        assert_eq!(linked.len(), 1);
        assert_eq!(linked[0].1, 5);
    }

    #[test]
    fn test_entity_link_first_write_wins() {
        let db = Database::open_in_memory().unwrap();
        let a = db
            .save_entity(&Entity::new(EntityType::Concept, "a", json!({}), 1.0).unwrap())
            .unwrap();
        let b = db
            .save_entity(&Entity::new(EntityType::Concept, "b", json!({}), 1.0).unwrap())
            .unwrap();

        assert!(db
            .save_entity_link(&EntityLink::new(a, b, EntityRelation::Related, 0.8))
            .unwrap());
        assert!(!db
            .save_entity_link(&EntityLink::new(a, b, EntityRelation::Related, 0.2))
            .unwrap());

        let links = db.entity_links_from(a).unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].weight, 0.8);
    }

    #[test]
    fn test_multi_hop_traversal_handles_cycles() {
        let db = Database::open_in_memory().unwrap();
        let ids: Vec<i64> = ["a", "b", "c"]
            .iter()
            .map(|name| {
                db.save_entity(&Entity::new(EntityType::Concept, *name, json!({}), 1.0).unwrap())
                    .unwrap()
            })
            .collect();

        // a -> b -> c -> a (cycle)
        db.save_entity_link(&EntityLink::new(ids[0], ids[1], EntityRelation::Related, 0.9))
            .unwrap();
        db.save_entity_link(&EntityLink::new(ids[1], ids[2], EntityRelation::Implies, 0.8))
            .unwrap();
        db.save_entity_link(&EntityLink::new(ids[2], ids[0], EntityRelation::Related, 0.7))
            .unwrap();

        let related = db.related_entities_with_hops(ids[0], 10).unwrap();

        // b at hop 1, c at hop 2; the cycle back to a is excluded
        assert_eq!(related.len(), 2);
        assert_eq!(related[0].entity.name, "b");
        assert_eq!(related[0].hops, 1);
        assert_eq!(related[1].entity.name, "c");
        assert_eq!(related[1].hops, 2);
        assert!((related[1].weight - 0.72).abs() < 1e-9);
    }

    #[test]
    fn test_extraction_state_replaces_on_path_conflict() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();

        let first = ExtractionState::pending("/root/s1.jsonl", now, 10);
        db.save_extraction_state(&first).unwrap();

        let second = ExtractionState::pending("/root/s1.jsonl", now, 20);
        db.save_extraction_state(&second).unwrap();

        assert_eq!(db.store_stats().unwrap().extraction_states, 1);
        let stored = db.extraction_state_by_path("/root/s1.jsonl").unwrap().unwrap();
        assert_eq!(stored.id, second.id);
        assert_eq!(stored.file_size, Some(20));
    }

    #[test]
    fn test_search_messages_matches_stems() {
        let db = Database::open_in_memory().unwrap();
        db.save_session(&test_session("s1")).unwrap();
        db.save_message(
            &Message::new(
                "m1",
                "s1",
                MessageRole::User,
                "debugging the tokenizers",
                Utc::now(),
            )
            .unwrap(),
        )
        .unwrap();

        let hits = db.search_messages("tokenizer", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "m1");
    }

    #[test]
    fn test_summary_search_after_update() {
        let db = Database::open_in_memory().unwrap();
        db.save_session(&test_session("s1")).unwrap();

        assert!(db.search_sessions("cache", 10).unwrap().is_empty());
        assert!(db.update_summary("s1", "Implemented the cache layer").unwrap());

        let hits = db.search_sessions("cache", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "s1");
        assert_eq!(hits[0].summary.as_deref(), Some("Implemented the cache layer"));
    }

    #[test]
    fn test_session_cascade_removes_children_and_links() {
        let db = Database::open_in_memory().unwrap();
        db.save_session(&test_session("s1")).unwrap();
        db.save_message(
            &Message::new("m1", "s1", MessageRole::User, "hello", Utc::now()).unwrap(),
        )
        .unwrap();
        db.save_tool_use(
            &ToolUse::pending("t1", "s1", "Bash", json!({"command": "ls"}), Utc::now()).unwrap(),
        )
        .unwrap();
        db.save_topic("rust").unwrap();
        db.save_link(&Link::new(
            NodeKind::Session,
            "s1",
            NodeKind::Topic,
            "rust",
            LinkRelation::Mentions,
            0.9,
        ))
        .unwrap();

        db.connection()
            .execute("DELETE FROM sessions WHERE id = 's1'", [])
            .unwrap();

        let stats = db.store_stats().unwrap();
        assert_eq!(stats.messages, 0);
        assert_eq!(stats.tool_uses, 0);
        assert_eq!(stats.links, 0);
    }

    #[test]
    fn test_persist_extraction_is_atomic_and_completes_state() {
        let db = Database::open_in_memory().unwrap();
        let session = test_session("s1");
        let messages = vec![
            Message::new("m1", "s1", MessageRole::User, "run ls", Utc::now()).unwrap(),
            Message::new("m2", "s1", MessageRole::Assistant, "Running", Utc::now()).unwrap(),
        ];
        let tool_uses = vec![ToolUse::pending(
            "t1",
            "s1",
            "Bash",
            json!({"command": "ls"}),
            Utc::now(),
        )
        .unwrap()
        .completed("a\nb", false)];
        let entity = Entity::new(EntityType::File, "src/lib.rs", json!({}), 1.0).unwrap();

        let state = ExtractionState::pending("/root/s1.jsonl", Utc::now(), 64);
        let outcome = db
            .persist_extraction(&session, &messages, &tool_uses, &[(entity, 2)], state)
            .unwrap();

        assert_eq!(outcome.messages_inserted, 2);
        assert_eq!(outcome.tool_uses_inserted, 1);
        assert_eq!(outcome.entities_linked, 1);

        let stored = db.extraction_state_by_path("/root/s1.jsonl").unwrap().unwrap();
        assert_eq!(stored.status, ExtractionStatus::Complete);
        assert_eq!(stored.messages_extracted, 2);
        assert!(stored.completed_at.is_some());
        assert!(stored.completed_at.unwrap() >= stored.started_at);

        let linked = db.entities_for_session("s1").unwrap();
        assert_eq!(linked.len(), 1);
        assert_eq!(linked[0].1, 2);
    }
}
