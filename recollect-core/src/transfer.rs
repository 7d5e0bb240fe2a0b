//! Export and import of the full store as a versioned JSON document
//!
//! Export is a snapshot: every data table serialised into one document with
//! per-array counts in `stats`. Import validates the whole document before
//! touching the store, then inserts with ignore-on-conflict in dependency
//! order inside a single transaction. Readers tolerate additional fields
//! within array items for forward compatibility.

use crate::db::Database;
use crate::error::{Error, Result};
use crate::types::{
    EntityType, ExtractionStatus, LinkRelation, MessageRole, NodeKind, ToolStatus,
};
use chrono::Utc;
use rusqlite::{params, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Export document format version.
pub const EXPORT_VERSION: &str = "1.0";

/// Options recognised by [`import_from_json`].
#[derive(Debug, Default, Clone)]
pub struct ImportOptions {
    /// Truncate all data tables before importing
    pub clear_existing: bool,
}

/// Per-array counts carried in the export document.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExportStats {
    pub sessions: usize,
    pub messages: usize,
    pub tool_uses: usize,
    pub entities: usize,
    pub links: usize,
    pub session_entities: usize,
    pub entity_links: usize,
    pub extraction_states: usize,
}

/// Rows inserted by an import, per table.
#[derive(Debug, Default, Clone)]
pub struct ImportStats {
    pub sessions: usize,
    pub messages: usize,
    pub tool_uses: usize,
    pub entities: usize,
    pub links: usize,
    pub session_entities: usize,
    pub entity_links: usize,
    pub extraction_states: usize,
}

// ============================================
// Wire records (flat mirrors of store rows)
// ============================================

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionRecord {
    id: String,
    project_path: String,
    decoded_path: String,
    project_name: Option<String>,
    started_at: String,
    ended_at: Option<String>,
    message_count: i64,
    summary: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageRecord {
    id: String,
    session_id: String,
    role: String,
    content: String,
    ts: String,
    tool_use_ids: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolUseRecord {
    id: String,
    session_id: String,
    tool_name: String,
    /// Serialised input, round-tripped verbatim
    input: String,
    ts: String,
    status: String,
    result: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EntityRecord {
    id: i64,
    #[serde(rename = "type")]
    entity_type: String,
    name: String,
    /// Serialised metadata blob, round-tripped verbatim
    metadata: Option<String>,
    confidence: f64,
    created_at: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LinkRecord {
    source_type: String,
    source_id: String,
    target_type: String,
    target_id: String,
    relationship: String,
    weight: f64,
    created_at: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionEntityRecord {
    session_id: String,
    entity_id: i64,
    frequency: i64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EntityLinkRecord {
    source_id: i64,
    target_id: i64,
    relationship: String,
    weight: f64,
    created_at: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExtractionStateRecord {
    id: String,
    session_path: String,
    started_at: String,
    status: String,
    completed_at: Option<String>,
    messages_extracted: i64,
    error: Option<String>,
    file_mtime: Option<String>,
    file_size: Option<i64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ExportDocument {
    version: String,
    exported_at: String,
    stats: ExportStats,
    sessions: Vec<SessionRecord>,
    messages: Vec<MessageRecord>,
    tool_uses: Vec<ToolUseRecord>,
    entities: Vec<EntityRecord>,
    links: Vec<LinkRecord>,
    session_entities: Vec<SessionEntityRecord>,
    entity_links: Vec<EntityLinkRecord>,
    extraction_states: Vec<ExtractionStateRecord>,
}

// ============================================
// Export
// ============================================

/// Serialise the full store into a JSON document at `output_path`.
pub fn export_to_json(db: &Database, output_path: &Path) -> Result<ExportStats> {
    let sessions: Vec<SessionRecord> = db
        .all_sessions()?
        .into_iter()
        .map(|s| SessionRecord {
            id: s.id,
            project_path: s.project.encoded().to_string(),
            decoded_path: s.project.decoded().to_string(),
            project_name: Some(s.project.project_name().to_string()),
            started_at: s.started_at.to_rfc3339(),
            ended_at: s.ended_at.map(|t| t.to_rfc3339()),
            message_count: s.message_count,
            summary: s.summary,
        })
        .collect();

    let messages: Vec<MessageRecord> = db
        .all_messages()?
        .into_iter()
        .map(|m| MessageRecord {
            id: m.id,
            session_id: m.session_id,
            role: m.role.as_str().to_string(),
            content: m.content,
            ts: m.emitted_at.to_rfc3339(),
            tool_use_ids: m.tool_use_ids,
        })
        .collect();

    let tool_uses: Vec<ToolUseRecord> = db
        .all_tool_uses()?
        .into_iter()
        .map(|t| ToolUseRecord {
            id: t.id,
            session_id: t.session_id,
            tool_name: t.name,
            input: t.input.to_string(),
            ts: t.emitted_at.to_rfc3339(),
            status: t.status.as_str().to_string(),
            result: t.result,
        })
        .collect();

    let entities: Vec<EntityRecord> = db
        .all_entities()?
        .into_iter()
        .map(|e| EntityRecord {
            id: e.id.unwrap_or_default(),
            entity_type: e.entity_type.as_str().to_string(),
            name: e.name,
            metadata: if e.metadata.is_null() {
                None
            } else {
                Some(e.metadata.to_string())
            },
            confidence: e.confidence,
            created_at: e.created_at.to_rfc3339(),
        })
        .collect();

    let links: Vec<LinkRecord> = db
        .all_links()?
        .into_iter()
        .map(|l| LinkRecord {
            source_type: l.source_kind.as_str().to_string(),
            source_id: l.source_id,
            target_type: l.target_kind.as_str().to_string(),
            target_id: l.target_id,
            relationship: l.relation.as_str().to_string(),
            weight: l.weight,
            created_at: l.created_at.to_rfc3339(),
        })
        .collect();

    let session_entities: Vec<SessionEntityRecord> = db
        .all_session_entity_links()?
        .into_iter()
        .map(|(session_id, entity_id, frequency)| SessionEntityRecord {
            session_id,
            entity_id,
            frequency,
        })
        .collect();

    let entity_links: Vec<EntityLinkRecord> = db
        .all_entity_links()?
        .into_iter()
        .map(|l| EntityLinkRecord {
            source_id: l.source_id,
            target_id: l.target_id,
            relationship: l.relation.as_str().to_string(),
            weight: l.weight,
            created_at: l.created_at.to_rfc3339(),
        })
        .collect();

    let extraction_states: Vec<ExtractionStateRecord> = db
        .all_extraction_states()?
        .into_iter()
        .map(|s| ExtractionStateRecord {
            id: s.id,
            session_path: s.session_path,
            started_at: s.started_at.to_rfc3339(),
            status: s.status.as_str().to_string(),
            completed_at: s.completed_at.map(|t| t.to_rfc3339()),
            messages_extracted: s.messages_extracted,
            error: s.error,
            file_mtime: s.file_mtime.map(|t| t.to_rfc3339()),
            file_size: s.file_size,
        })
        .collect();

    let stats = ExportStats {
        sessions: sessions.len(),
        messages: messages.len(),
        tool_uses: tool_uses.len(),
        entities: entities.len(),
        links: links.len(),
        session_entities: session_entities.len(),
        entity_links: entity_links.len(),
        extraction_states: extraction_states.len(),
    };

    let document = ExportDocument {
        version: EXPORT_VERSION.to_string(),
        exported_at: Utc::now().to_rfc3339(),
        stats: stats.clone(),
        sessions,
        messages,
        tool_uses,
        entities,
        links,
        session_entities,
        entity_links,
        extraction_states,
    };

    if let Some(parent) = output_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(output_path, serde_json::to_string_pretty(&document)?)?;

    tracing::info!(
        path = %output_path.display(),
        sessions = stats.sessions,
        messages = stats.messages,
        "Store exported"
    );
    Ok(stats)
}

// ============================================
// Import
// ============================================

/// Restore a store from a JSON export document.
///
/// The whole document is validated before any mutation; the first failing
/// check raises [`Error::InvalidExportFile`].
pub fn import_from_json(
    db: &Database,
    input_path: &Path,
    options: &ImportOptions,
) -> Result<ImportStats> {
    let document = read_and_validate(input_path)?;

    if options.clear_existing {
        clear_all_tables(db)?;
    }

    let mut conn = db.connection();
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let mut stats = ImportStats::default();

    for record in &document.sessions {
        let n = tx.execute(
            r#"
            INSERT OR IGNORE INTO sessions
                (id, project_path, decoded_path, project_name, started_at, ended_at,
                 message_count, summary)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                record.id,
                record.project_path,
                record.decoded_path,
                record.project_name,
                record.started_at,
                record.ended_at,
                record.message_count,
                record.summary,
            ],
        )?;
        stats.sessions += n;
    }

    for record in &document.messages {
        let tool_use_ids = if record.tool_use_ids.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&record.tool_use_ids)?)
        };
        let n = tx.execute(
            r#"
            INSERT OR IGNORE INTO messages (id, session_id, role, content, ts, tool_use_ids)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                record.id,
                record.session_id,
                valid_or(&record.role, is_role, "user"),
                record.content,
                record.ts,
                tool_use_ids,
            ],
        )?;
        stats.messages += n;
    }

    for record in &document.tool_uses {
        let n = tx.execute(
            r#"
            INSERT OR IGNORE INTO tool_uses (id, session_id, tool_name, input, ts, status, result)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                record.id,
                record.session_id,
                record.tool_name,
                record.input,
                record.ts,
                valid_or(&record.status, is_tool_status, "pending"),
                record.result,
            ],
        )?;
        stats.tool_uses += n;
    }

    for record in &document.entities {
        let n = tx.execute(
            r#"
            INSERT OR IGNORE INTO entities
                (id, type, name, normalized_name, metadata, confidence, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                record.id,
                valid_or(&record.entity_type, is_entity_type, "concept"),
                record.name,
                record.name.to_lowercase(),
                record.metadata,
                record.confidence.clamp(0.0, 1.0),
                record.created_at,
            ],
        )?;
        stats.entities += n;
    }

    for record in &document.links {
        let n = tx.execute(
            r#"
            INSERT OR IGNORE INTO links
                (source_type, source_id, target_type, target_id, relationship, weight, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                valid_or(&record.source_type, is_node_kind, "session"),
                record.source_id,
                valid_or(&record.target_type, is_node_kind, "topic"),
                record.target_id,
                valid_or(&record.relationship, is_link_relation, "mentions"),
                record.weight.clamp(0.0, 1.0),
                record.created_at,
            ],
        )?;
        stats.links += n;
    }

    for record in &document.session_entities {
        let n = tx.execute(
            r#"
            INSERT OR IGNORE INTO session_entities (session_id, entity_id, frequency)
            VALUES (?1, ?2, ?3)
            "#,
            params![record.session_id, record.entity_id, record.frequency],
        )?;
        stats.session_entities += n;
    }

    for record in &document.entity_links {
        let n = tx.execute(
            r#"
            INSERT OR IGNORE INTO entity_links (source_id, target_id, relationship, weight, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                record.source_id,
                record.target_id,
                valid_or(&record.relationship, is_entity_relation, "related"),
                record.weight.clamp(0.0, 1.0),
                record.created_at,
            ],
        )?;
        stats.entity_links += n;
    }

    for record in &document.extraction_states {
        let n = tx.execute(
            r#"
            INSERT OR IGNORE INTO extraction_state
                (id, session_path, started_at, status, completed_at, messages_extracted,
                 error, file_mtime, file_size)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                record.id,
                record.session_path,
                record.started_at,
                valid_or(&record.status, is_extraction_status, "pending"),
                record.completed_at,
                record.messages_extracted,
                record.error,
                record.file_mtime,
                record.file_size,
            ],
        )?;
        stats.extraction_states += n;
    }

    tx.commit()?;

    tracing::info!(
        path = %input_path.display(),
        sessions = stats.sessions,
        messages = stats.messages,
        "Store imported"
    );
    Ok(stats)
}

/// Validate the document shape before any mutation; the first failing check
/// wins.
fn read_and_validate(input_path: &Path) -> Result<ExportDocument> {
    if !input_path.exists() {
        return Err(Error::InvalidExportFile(format!(
            "file not found: {}",
            input_path.display()
        )));
    }

    let content = std::fs::read_to_string(input_path)
        .map_err(|e| Error::InvalidExportFile(format!("unreadable file: {}", e)))?;

    let value: serde_json::Value = serde_json::from_str(&content)
        .map_err(|e| Error::InvalidExportFile(format!("invalid JSON: {}", e)))?;

    if !value.get("version").map(|v| v.is_string()).unwrap_or(false) {
        return Err(Error::InvalidExportFile(
            "missing or non-string version field".to_string(),
        ));
    }
    for field in ["sessions", "messages", "toolUses", "entities", "links"] {
        if !value.get(field).map(|v| v.is_array()).unwrap_or(false) {
            return Err(Error::InvalidExportFile(format!(
                "missing or non-array field: {}",
                field
            )));
        }
    }
    if !value.get("stats").map(|v| v.is_object()).unwrap_or(false) {
        return Err(Error::InvalidExportFile(
            "missing or non-object stats field".to_string(),
        ));
    }

    serde_json::from_value(value)
        .map_err(|e| Error::InvalidExportFile(format!("malformed document: {}", e)))
}

/// Truncate every data table, with foreign keys off for the duration.
fn clear_all_tables(db: &Database) -> Result<()> {
    let conn = db.connection();
    conn.execute_batch(
        r#"
        PRAGMA foreign_keys = OFF;
        DELETE FROM session_entities;
        DELETE FROM entity_links;
        DELETE FROM links;
        DELETE FROM messages;
        DELETE FROM sessions_fts;
        DELETE FROM tool_uses;
        DELETE FROM sessions;
        DELETE FROM entities;
        DELETE FROM extraction_state;
        DELETE FROM topics;
        PRAGMA foreign_keys = ON;
        "#,
    )?;
    Ok(())
}

fn valid_or<'a>(value: &'a str, check: fn(&str) -> bool, fallback: &'a str) -> &'a str {
    if check(value) {
        value
    } else {
        fallback
    }
}

fn is_role(s: &str) -> bool {
    s.parse::<MessageRole>().is_ok()
}

fn is_tool_status(s: &str) -> bool {
    s.parse::<ToolStatus>().is_ok()
}

fn is_entity_type(s: &str) -> bool {
    s.parse::<EntityType>().is_ok()
}

fn is_node_kind(s: &str) -> bool {
    s.parse::<NodeKind>().is_ok()
}

fn is_link_relation(s: &str) -> bool {
    s.parse::<LinkRelation>().is_ok()
}

fn is_entity_relation(s: &str) -> bool {
    s.parse::<crate::types::EntityRelation>().is_ok()
}

fn is_extraction_status(s: &str) -> bool {
    s.parse::<ExtractionStatus>().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::*;
    use chrono::Utc;
    use serde_json::json;
    use tempfile::TempDir;

    fn seeded_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        let session = Session::new("s1", ProjectPath::from_decoded("/h/u/app"), Utc::now())
            .unwrap()
            .with_message_count(2);
        db.save_session(&session).unwrap();
        db.save_message(&Message::new("m1", "s1", MessageRole::User, "run ls", Utc::now()).unwrap())
            .unwrap();
        db.save_message(
            &Message::new("m2", "s1", MessageRole::Assistant, "Running", Utc::now())
                .unwrap()
                .with_tool_use_ids(vec!["t1".to_string()]),
        )
        .unwrap();
        db.save_tool_use(
            &ToolUse::pending("t1", "s1", "Bash", json!({"command": "ls"}), Utc::now())
                .unwrap()
                .completed("a\nb", false),
        )
        .unwrap();
        let entity_id = db
            .save_entity(&Entity::new(EntityType::Concept, "caching", json!({}), 0.9).unwrap())
            .unwrap();
        db.link_entity_to_session(entity_id, "s1", 2).unwrap();
        db.save_topic("caching").unwrap();
        db.save_link(&Link::new(
            NodeKind::Session,
            "s1",
            NodeKind::Topic,
            "caching",
            LinkRelation::Mentions,
            0.9,
        ))
        .unwrap();
        db.save_extraction_state(&ExtractionState::pending("/root/s1.jsonl", Utc::now(), 12))
            .unwrap();
        db
    }

    #[test]
    fn test_export_import_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("export.json");

        let source = seeded_db();
        let stats = export_to_json(&source, &path).unwrap();
        assert_eq!(stats.sessions, 1);
        assert_eq!(stats.messages, 2);
        assert_eq!(stats.tool_uses, 1);
        assert_eq!(stats.entities, 1);
        assert_eq!(stats.links, 1);
        assert_eq!(stats.session_entities, 1);
        assert_eq!(stats.extraction_states, 1);

        let target = Database::open_in_memory().unwrap();
        let imported = import_from_json(&target, &path, &ImportOptions::default()).unwrap();
        assert_eq!(imported.sessions, 1);
        assert_eq!(imported.messages, 2);
        assert_eq!(imported.tool_uses, 1);
        assert_eq!(imported.entities, 1);

        // Bodies and inputs round-trip.
        let messages = target.get_session_messages("s1").unwrap();
        assert_eq!(messages.len(), 2);
        assert!(messages.iter().any(|m| m.content == "run ls"));
        assert!(messages
            .iter()
            .any(|m| m.tool_use_ids == vec!["t1".to_string()]));

        let tool_uses = target.get_session_tool_uses("s1").unwrap();
        assert_eq!(tool_uses[0].input, json!({"command": "ls"}));
        assert_eq!(tool_uses[0].result.as_deref(), Some("a\nb"));

        let linked = target.entities_for_session("s1").unwrap();
        assert_eq!(linked.len(), 1);
        assert_eq!(linked[0].1, 2);
    }

    #[test]
    fn test_import_rejects_invalid_documents() {
        let dir = TempDir::new().unwrap();
        let db = Database::open_in_memory().unwrap();

        // Missing file
        let err = import_from_json(&db, &dir.path().join("absent.json"), &ImportOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidExportFile(_)));

        // Not JSON
        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, "nope").unwrap();
        let err = import_from_json(&db, &bad, &ImportOptions::default()).unwrap_err();
        assert!(matches!(err, Error::InvalidExportFile(_)));

        // Missing required array
        let partial = dir.path().join("partial.json");
        std::fs::write(
            &partial,
            r#"{"version": "1.0", "stats": {}, "sessions": [], "messages": [], "toolUses": [], "entities": []}"#,
        )
        .unwrap();
        let err = import_from_json(&db, &partial, &ImportOptions::default()).unwrap_err();
        match err {
            Error::InvalidExportFile(reason) => assert!(reason.contains("links")),
            other => panic!("expected InvalidExportFile, got {:?}", other),
        }

        // Nothing was written
        assert_eq!(db.store_stats().unwrap().sessions, 0);
    }

    #[test]
    fn test_import_clear_existing_replaces_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("export.json");

        let source = seeded_db();
        export_to_json(&source, &path).unwrap();

        let target = seeded_db();
        target
            .save_session(
                &Session::new("doomed", ProjectPath::from_decoded("/h/u/other"), Utc::now())
                    .unwrap(),
            )
            .unwrap();

        import_from_json(&target, &path, &ImportOptions { clear_existing: true }).unwrap();

        assert!(target.get_session("doomed").unwrap().is_none());
        assert_eq!(target.store_stats().unwrap().sessions, 1);
        assert!(target.get_session("s1").unwrap().is_some());
    }

    #[test]
    fn test_import_tolerates_extra_fields_in_items() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("forward.json");
        std::fs::write(
            &path,
            r#"
            {
                "version": "1.1",
                "exportedAt": "2026-01-01T00:00:00Z",
                "stats": {"sessions": 1},
                "sessions": [{
                    "id": "s9", "projectPath": "-h-u-app", "decodedPath": "/h/u/app",
                    "projectName": "app", "startedAt": "2026-01-01T00:00:00Z",
                    "endedAt": null, "messageCount": 0, "summary": null,
                    "futureField": {"nested": true}
                }],
                "messages": [],
                "toolUses": [],
                "entities": [],
                "links": [],
                "sessionEntities": [],
                "entityLinks": [],
                "extractionStates": []
            }
            "#,
        )
        .unwrap();

        let db = Database::open_in_memory().unwrap();
        let stats = import_from_json(&db, &path, &ImportOptions::default()).unwrap();
        assert_eq!(stats.sessions, 1);
        assert!(db.get_session("s9").unwrap().is_some());
    }
}
