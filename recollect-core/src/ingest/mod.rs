//! Sync engine: transcript ingestion into the store
//!
//! Orchestrates discovery → filter → parse → entity derivation →
//! transactional persist, one session at a time:
//!
//! ```text
//! ┌─────────────────┐     ┌──────────────┐     ┌─────────────────┐
//! │  Session files  │ ──► │  SyncEngine  │ ──► │     Database    │
//! │ (<root>/... )   │     │              │     │ (sessions, ...) │
//! └─────────────────┘     └──────────────┘     └─────────────────┘
//!                               │
//!                               ▼
//!                    ┌──────────────────────┐
//!                    │  TranscriptParser    │
//!                    │  + pattern extractor │
//!                    └──────────────────────┘
//! ```
//!
//! Sessions are processed sequentially in discovered order; each session
//! commits in its own immediate transaction, which is also the granularity
//! of graceful abort and checkpoint resume. Incremental sync skips files
//! whose (mtime, size) match the last completed extraction.

pub mod parser;
pub mod patterns;

pub use parser::{ContentBlock, SessionEvent, TranscriptParser};

use crate::db::{Database, ExtractionPersistOutcome};
use crate::error::{Error, ErrorCategory, Result};
use crate::runtime;
use crate::source::{DiscoveredSession, SessionSource};
use crate::types::{Entity, ExtractionState, ExtractionStatus, Message, MessageRole, Session, ToolUse};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Instant;

/// Progress phase reported to the `on_progress` callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Discovering,
    Extracting,
    Complete,
}

impl SyncPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPhase::Discovering => "discovering",
            SyncPhase::Extracting => "extracting",
            SyncPhase::Complete => "complete",
        }
    }
}

/// Progress callback: (phase, current, total, session id).
pub type ProgressCallback = Box<dyn FnMut(SyncPhase, usize, usize, Option<&str>) + Send>;

/// Per-session completion callback.
pub type SessionCompleteCallback = Box<dyn FnMut(&str) + Send>;

/// Options recognised by [`SyncEngine::sync`].
#[derive(Default)]
pub struct SyncOptions {
    /// Bypass change detection; process every discovered session
    pub force: bool,
    /// Case-sensitive substring match against the decoded project path
    pub project_filter: Option<String>,
    /// Exact-match session id
    pub session_filter: Option<String>,
    /// Load/update/clear the on-disk checkpoint
    pub checkpoint_enabled: bool,
    /// Invoked for phases discovering, extracting (1-based), complete
    pub on_progress: Option<ProgressCallback>,
    /// Invoked after each session's commit
    pub on_session_complete: Option<SessionCompleteCallback>,
}

/// A per-session failure recorded on the sync outcome.
#[derive(Debug)]
pub struct SyncError {
    pub session_id: String,
    pub category: ErrorCategory,
    pub message: String,
}

/// Result of a sync run.
#[derive(Debug, Default)]
pub struct SyncOutcome {
    /// No error records and not aborted
    pub success: bool,
    pub sessions_discovered: usize,
    pub sessions_processed: usize,
    pub sessions_skipped: usize,
    pub messages_inserted: usize,
    pub tool_uses_inserted: usize,
    pub errors: Vec<SyncError>,
    pub duration_ms: u64,
    /// A graceful abort stopped the run before completion
    pub aborted: bool,
    /// Session ids dropped because a prior interrupted run completed them
    pub recovered_from_checkpoint: Vec<String>,
}

/// Drives extraction of discovered sessions into the store.
pub struct SyncEngine {
    db: Database,
    source: Box<dyn SessionSource>,
}

impl SyncEngine {
    pub fn new(db: Database, source: Box<dyn SessionSource>) -> Self {
        Self { db, source }
    }

    /// The underlying store, for collaborators issuing reads and summary
    /// writes.
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Enumerate session files without syncing them. Used by the recovery
    /// pass to find unfinished work.
    pub fn discover_sessions(&self) -> Result<Vec<DiscoveredSession>> {
        self.source.discover()
    }

    /// Run one sync pass.
    ///
    /// Per-session failures are recorded on the outcome and the run
    /// continues; only discovery failure is fatal.
    pub fn sync(&self, mut options: SyncOptions) -> Result<SyncOutcome> {
        let started = Instant::now();
        let mut outcome = SyncOutcome::default();

        emit_progress(&mut options, SyncPhase::Discovering, 0, 0, None);

        let discovered = self.source.discover().map_err(|e| match e {
            e @ Error::SourceInaccessible(_) => e,
            other => Error::SourceInaccessible(other.to_string()),
        })?;
        outcome.sessions_discovered = discovered.len();

        // Filters: removed sessions count as skipped.
        let mut candidates: Vec<DiscoveredSession> = Vec::new();
        for session in discovered {
            if let Some(filter) = &options.project_filter {
                if !session.project.decoded().contains(filter.as_str()) {
                    outcome.sessions_skipped += 1;
                    continue;
                }
            }
            if let Some(filter) = &options.session_filter {
                if session.session_id != *filter {
                    outcome.sessions_skipped += 1;
                    continue;
                }
            }
            candidates.push(session);
        }

        // Resume: drop sessions a prior interrupted run already committed.
        let loaded_checkpoint = if options.checkpoint_enabled {
            runtime::load_checkpoint()?
        } else {
            None
        };
        if let Some(cp) = &loaded_checkpoint {
            candidates.retain(|session| {
                if cp.is_completed(&session.session_id) {
                    outcome
                        .recovered_from_checkpoint
                        .push(session.session_id.clone());
                    false
                } else {
                    true
                }
            });
        }

        // Change detection.
        let mut to_process: Vec<DiscoveredSession> = Vec::new();
        for session in candidates {
            if options.force || self.needs_extraction(&session)? {
                to_process.push(session);
            } else {
                outcome.sessions_skipped += 1;
            }
        }

        let total = to_process.len();
        let mut checkpoint =
            loaded_checkpoint.unwrap_or_else(|| runtime::SyncCheckpoint::start(total));

        for (index, session_file) in to_process.iter().enumerate() {
            if runtime::is_shutting_down() {
                tracing::info!(
                    processed = outcome.sessions_processed,
                    remaining = total - index,
                    "Shutdown requested, aborting sync"
                );
                outcome.aborted = true;
                if options.checkpoint_enabled {
                    runtime::save_checkpoint(&checkpoint)?;
                }
                break;
            }

            let session_id = session_file.session_id.clone();
            let path_str = session_file.path.to_string_lossy().to_string();

            let pending = ExtractionState::pending(
                &path_str,
                session_file.modified_at,
                session_file.size_bytes as i64,
            );
            self.db.save_extraction_state(&pending)?;

            match self.extract_session(session_file, pending.clone()) {
                Ok(persisted) => {
                    outcome.sessions_processed += 1;
                    outcome.messages_inserted += persisted.messages_inserted;
                    outcome.tool_uses_inserted += persisted.tool_uses_inserted;

                    emit_progress(
                        &mut options,
                        SyncPhase::Extracting,
                        index + 1,
                        total,
                        Some(&session_id),
                    );
                    if let Some(cb) = options.on_session_complete.as_mut() {
                        cb(&session_id);
                    }
                    if options.checkpoint_enabled {
                        checkpoint.record(&session_id);
                        runtime::save_checkpoint(&checkpoint)?;
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        session_id = %session_id,
                        error = %e,
                        "Session extraction failed"
                    );
                    // Outside any transaction: record the failure on the state
                    // row and move on.
                    let failed = pending.failed(e.to_string());
                    if let Err(save_err) = self.db.save_extraction_state(&failed) {
                        tracing::warn!(
                            session_id = %session_id,
                            error = %save_err,
                            "Failed to record error state"
                        );
                    }
                    outcome.errors.push(SyncError {
                        session_id,
                        category: e.category(),
                        message: e.to_string(),
                    });
                }
            }
        }

        emit_progress(&mut options, SyncPhase::Complete, total, total, None);

        if options.checkpoint_enabled && !outcome.aborted && outcome.errors.is_empty() {
            runtime::clear_checkpoint()?;
        }

        outcome.success = outcome.errors.is_empty() && !outcome.aborted;
        outcome.duration_ms = started.elapsed().as_millis() as u64;

        tracing::info!(
            discovered = outcome.sessions_discovered,
            processed = outcome.sessions_processed,
            skipped = outcome.sessions_skipped,
            errors = outcome.errors.len(),
            aborted = outcome.aborted,
            duration_ms = outcome.duration_ms,
            "Sync finished"
        );
        Ok(outcome)
    }

    /// A session needs extraction if it has no completed state or the file's
    /// (mtime, size) moved since the last completed extraction.
    fn needs_extraction(&self, session: &DiscoveredSession) -> Result<bool> {
        let path_str = session.path.to_string_lossy().to_string();
        let Some(state) = self.db.extraction_state_by_path(&path_str)? else {
            return Ok(true);
        };
        if state.status != ExtractionStatus::Complete {
            return Ok(true);
        }
        let (Some(stored_mtime), Some(stored_size)) = (state.file_mtime, state.file_size) else {
            return Ok(true);
        };
        Ok(stored_mtime.timestamp_millis() != session.modified_at.timestamp_millis()
            || stored_size != session.size_bytes as i64)
    }

    /// Parse one session file, derive its rows, and commit them in a single
    /// immediate transaction.
    fn extract_session(
        &self,
        file: &DiscoveredSession,
        pending: ExtractionState,
    ) -> Result<ExtractionPersistOutcome> {
        let events: Vec<SessionEvent> = TranscriptParser::open(&file.path)?.collect();
        let transcript = derive_transcript(&file.session_id, &events)?;

        let started_at = transcript.first_timestamp.unwrap_or(file.modified_at);
        let mut session = Session::new(file.session_id.as_str(), file.project.clone(), started_at)?
            .with_message_count(transcript.messages.len() as i64);
        if let Some(last) = transcript.last_timestamp {
            session = session.with_ended_at(last);
        }

        let entities = derive_pattern_entities(&transcript.tool_uses)?;

        self.db.persist_extraction(
            &session,
            &transcript.messages,
            &transcript.tool_uses,
            &entities,
            pending,
        )
    }
}

fn emit_progress(
    options: &mut SyncOptions,
    phase: SyncPhase,
    current: usize,
    total: usize,
    session_id: Option<&str>,
) {
    if let Some(cb) = options.on_progress.as_mut() {
        cb(phase, current, total, session_id);
    }
}

// ============================================
// Entity derivation from events
// ============================================

/// Messages and tool uses derived from one pass over an event sequence.
#[derive(Debug, Default)]
pub struct DerivedTranscript {
    pub messages: Vec<Message>,
    pub tool_uses: Vec<ToolUse>,
    pub first_timestamp: Option<DateTime<Utc>>,
    pub last_timestamp: Option<DateTime<Utc>>,
}

/// Walk an event sequence once, building messages and tool uses.
///
/// Assistant text blocks concatenate into the message body; embedded
/// tool_use blocks materialise as pending tool uses that a later
/// tool_result completes. Events without a uuid get a deterministic
/// position-derived id so re-extraction stays idempotent.
pub fn derive_transcript(session_id: &str, events: &[SessionEvent]) -> Result<DerivedTranscript> {
    let mut transcript = DerivedTranscript::default();
    let mut tool_use_index: HashMap<String, usize> = HashMap::new();
    // Fallback instant for events without timestamps: the last seen one.
    let mut current_ts = Utc::now();

    for (position, event) in events.iter().enumerate() {
        if let Some(ts) = event.timestamp() {
            transcript.first_timestamp = Some(match transcript.first_timestamp {
                Some(first) => first.min(ts),
                None => ts,
            });
            transcript.last_timestamp = Some(match transcript.last_timestamp {
                Some(last) => last.max(ts),
                None => ts,
            });
            current_ts = ts;
        }

        match event {
            SessionEvent::User {
                uuid,
                timestamp,
                content,
            } => {
                let id = uuid
                    .clone()
                    .unwrap_or_else(|| format!("{}:{}", session_id, position));
                transcript.messages.push(Message::new(
                    id,
                    session_id,
                    MessageRole::User,
                    content.clone(),
                    timestamp.unwrap_or(current_ts),
                )?);
            }
            SessionEvent::Assistant {
                uuid,
                timestamp,
                blocks,
            } => {
                let ts = timestamp.unwrap_or(current_ts);
                let mut texts: Vec<&str> = Vec::new();
                let mut tool_use_ids: Vec<String> = Vec::new();

                for block in blocks {
                    match block {
                        ContentBlock::Text { text } => texts.push(text),
                        ContentBlock::ToolUse { id, name, input } => {
                            tool_use_ids.push(id.clone());
                            record_tool_use(
                                &mut transcript.tool_uses,
                                &mut tool_use_index,
                                ToolUse::pending(
                                    id.as_str(),
                                    session_id,
                                    name.as_str(),
                                    input.clone(),
                                    ts,
                                )?,
                            );
                        }
                    }
                }

                let id = uuid
                    .clone()
                    .unwrap_or_else(|| format!("{}:{}", session_id, position));
                transcript.messages.push(
                    Message::new(
                        id,
                        session_id,
                        MessageRole::Assistant,
                        texts.join("\n"),
                        ts,
                    )?
                    .with_tool_use_ids(tool_use_ids),
                );
            }
            SessionEvent::ToolUse {
                id,
                name,
                input,
                timestamp,
            } => {
                record_tool_use(
                    &mut transcript.tool_uses,
                    &mut tool_use_index,
                    ToolUse::pending(
                        id.as_str(),
                        session_id,
                        name.as_str(),
                        input.clone(),
                        timestamp.unwrap_or(current_ts),
                    )?,
                );
            }
            SessionEvent::ToolResult {
                tool_use_id,
                content,
                is_error,
                ..
            } => {
                if let Some(&index) = tool_use_index.get(tool_use_id) {
                    let completed = transcript.tool_uses[index]
                        .clone()
                        .completed(content.as_str(), *is_error);
                    transcript.tool_uses[index] = completed;
                }
                // A result without a prior tool_use has nothing to complete.
            }
            SessionEvent::Summary { .. } | SessionEvent::System | SessionEvent::Skipped { .. } => {}
        }
    }

    Ok(transcript)
}

fn record_tool_use(
    tool_uses: &mut Vec<ToolUse>,
    index: &mut HashMap<String, usize>,
    tool_use: ToolUse,
) {
    if index.contains_key(&tool_use.id) {
        return;
    }
    index.insert(tool_use.id.clone(), tool_uses.len());
    tool_uses.push(tool_use);
}

/// File entities derived from the session's tool uses, each paired with a
/// link frequency of one occurrence.
fn derive_pattern_entities(tool_uses: &[ToolUse]) -> Result<Vec<(Entity, i64)>> {
    let paths = patterns::file_paths(tool_uses);
    let modifications = patterns::file_modifications(tool_uses);

    let mut entities = Vec::new();
    for entity in patterns::path_entities(&paths)? {
        entities.push((entity, 1));
    }
    for entity in patterns::modification_entities(&modifications)? {
        entities.push((entity, 1));
    }
    Ok(entities)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ToolStatus;
    use serde_json::json;

    fn scenario_events() -> Vec<SessionEvent> {
        vec![
            parser::parse_line(
                r#"{"type":"user","uuid":"u1","timestamp":"2026-01-02T10:00:00Z","message":{"content":"Run ls"}}"#,
            ),
            parser::parse_line(
                r#"{"type":"assistant","uuid":"a1","timestamp":"2026-01-02T10:00:05Z","message":{"content":[{"type":"text","text":"Running"},{"type":"tool_use","id":"T1","name":"Bash","input":{"command":"ls"}}]}}"#,
            ),
            parser::parse_line(
                r#"{"type":"tool_result","toolUseId":"T1","content":"a\nb","isError":false,"timestamp":"2026-01-02T10:00:06Z"}"#,
            ),
        ]
    }

    #[test]
    fn test_derive_transcript_basic_flow() {
        let transcript = derive_transcript("s1", &scenario_events()).unwrap();

        assert_eq!(transcript.messages.len(), 2);
        assert_eq!(transcript.messages[0].role, MessageRole::User);
        assert_eq!(transcript.messages[0].content, "Run ls");
        assert_eq!(transcript.messages[1].role, MessageRole::Assistant);
        assert_eq!(transcript.messages[1].content, "Running");
        assert_eq!(transcript.messages[1].tool_use_ids, vec!["T1"]);

        assert_eq!(transcript.tool_uses.len(), 1);
        let tool_use = &transcript.tool_uses[0];
        assert_eq!(tool_use.name, "Bash");
        assert_eq!(tool_use.status, ToolStatus::Success);
        assert_eq!(tool_use.result.as_deref(), Some("a\nb"));

        assert!(transcript.first_timestamp.unwrap() < transcript.last_timestamp.unwrap());
    }

    #[test]
    fn test_derive_transcript_error_result() {
        let events = vec![
            parser::parse_line(
                r#"{"type":"tool_use","id":"T9","name":"Bash","input":{"command":"boom"},"timestamp":"2026-01-02T10:00:00Z"}"#,
            ),
            parser::parse_line(
                r#"{"type":"tool_result","toolUseId":"T9","content":"exploded","isError":true}"#,
            ),
        ];
        let transcript = derive_transcript("s1", &events).unwrap();
        assert!(transcript.messages.is_empty());
        assert_eq!(transcript.tool_uses.len(), 1);
        assert_eq!(transcript.tool_uses[0].status, ToolStatus::Error);
    }

    #[test]
    fn test_derive_transcript_only_skipped_events() {
        let events = vec![
            parser::parse_line(""),
            parser::parse_line("not json"),
            parser::parse_line(r#"{"type":"mystery"}"#),
        ];
        let transcript = derive_transcript("s1", &events).unwrap();
        assert!(transcript.messages.is_empty());
        assert!(transcript.tool_uses.is_empty());
        assert!(transcript.first_timestamp.is_none());
    }

    #[test]
    fn test_derive_transcript_generates_stable_ids_without_uuid() {
        let events = vec![parser::parse_line(
            r#"{"type":"user","message":{"content":"hello"}}"#,
        )];
        let a = derive_transcript("s1", &events).unwrap();
        let b = derive_transcript("s1", &events).unwrap();
        assert_eq!(a.messages[0].id, b.messages[0].id);
        assert_eq!(a.messages[0].id, "s1:0");
    }

    #[test]
    fn test_pattern_entities_carry_operations() {
        let tool_uses = vec![
            ToolUse::pending("t1", "s1", "Edit", json!({"file_path": "/a/x.rs"}), Utc::now())
                .unwrap()
                .completed("ok", false),
        ];
        let entities = derive_pattern_entities(&tool_uses).unwrap();
        // One from the path union, one from the modification record.
        assert_eq!(entities.len(), 2);
        assert_eq!(entities[0].0.name, "/a/x.rs");
        assert_eq!(entities[1].0.metadata, json!({"operation": "edit"}));
    }
}
