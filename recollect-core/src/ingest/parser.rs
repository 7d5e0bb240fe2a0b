//! Streaming JSONL transcript parser
//!
//! Reads a session file line by line and yields a typed event sequence. The
//! parser never fails on a bad line: empty or undecodable lines become
//! [`SessionEvent::Skipped`] carrying the reason, and parsing continues.
//! The stream is single-pass and not restartable.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::Path;

/// A typed content block within an assistant turn.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
}

/// One event from a session transcript.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    User {
        uuid: Option<String>,
        timestamp: Option<DateTime<Utc>>,
        content: String,
    },
    Assistant {
        uuid: Option<String>,
        timestamp: Option<DateTime<Utc>>,
        blocks: Vec<ContentBlock>,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
        timestamp: Option<DateTime<Utc>>,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
        timestamp: Option<DateTime<Utc>>,
    },
    Summary {
        text: String,
    },
    System,
    Skipped {
        reason: String,
    },
}

impl SessionEvent {
    /// Event instant, when the line carried one.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            SessionEvent::User { timestamp, .. }
            | SessionEvent::Assistant { timestamp, .. }
            | SessionEvent::ToolUse { timestamp, .. }
            | SessionEvent::ToolResult { timestamp, .. } => *timestamp,
            _ => None,
        }
    }
}

// ============================================
// Raw JSONL record types (serde deserialization)
// ============================================

/// One line of a transcript. Uses `#[serde(default)]` liberally so a line
/// missing fields still decodes; semantic checks happen afterwards.
#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct RawLine {
    #[serde(rename = "type")]
    line_type: Option<String>,
    uuid: Option<String>,
    timestamp: Option<String>,

    // user / assistant
    message: Option<RawMessage>,

    // standalone tool_use
    id: Option<String>,
    name: Option<String>,
    input: Option<serde_json::Value>,

    // tool_result
    tool_use_id: Option<String>,
    content: Option<serde_json::Value>,
    is_error: Option<bool>,

    // summary
    summary: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct RawMessage {
    #[allow(dead_code)]
    role: Option<String>,
    content: Option<RawContent>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawContent {
    Text(String),
    Blocks(Vec<RawBlock>),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum RawBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    // Catch-all for unknown block types
    #[serde(other)]
    Unknown,
}

/// Streaming parser over one transcript file.
pub struct TranscriptParser {
    lines: Lines<BufReader<File>>,
}

impl TranscriptParser {
    /// Open a transcript for a single streaming pass.
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            lines: BufReader::new(file).lines(),
        })
    }
}

impl Iterator for TranscriptParser {
    type Item = SessionEvent;

    fn next(&mut self) -> Option<SessionEvent> {
        let line = match self.lines.next()? {
            Ok(line) => line,
            Err(e) => {
                return Some(SessionEvent::Skipped {
                    reason: format!("read error: {}", e),
                })
            }
        };
        Some(parse_line(&line))
    }
}

/// Parse one transcript line into an event.
pub fn parse_line(line: &str) -> SessionEvent {
    if line.trim().is_empty() {
        return SessionEvent::Skipped {
            reason: "empty line".to_string(),
        };
    }

    let raw: RawLine = match serde_json::from_str(line) {
        Ok(raw) => raw,
        Err(e) => {
            return SessionEvent::Skipped {
                reason: format!("JSON parse error: {}", e),
            }
        }
    };

    let timestamp = raw
        .timestamp
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc));

    match raw.line_type.as_deref() {
        Some("user") => SessionEvent::User {
            uuid: raw.uuid,
            timestamp,
            content: raw
                .message
                .and_then(|m| m.content)
                .map(content_to_text)
                .unwrap_or_default(),
        },
        Some("assistant") => SessionEvent::Assistant {
            uuid: raw.uuid,
            timestamp,
            blocks: raw
                .message
                .and_then(|m| m.content)
                .map(content_to_blocks)
                .unwrap_or_default(),
        },
        Some("tool_use") => match (raw.id, raw.name) {
            (Some(id), Some(name)) => SessionEvent::ToolUse {
                id,
                name,
                input: raw.input.unwrap_or(serde_json::Value::Null),
                timestamp,
            },
            _ => SessionEvent::Skipped {
                reason: "tool_use line missing id or name".to_string(),
            },
        },
        Some("tool_result") => match raw.tool_use_id {
            Some(tool_use_id) => SessionEvent::ToolResult {
                tool_use_id,
                content: raw.content.map(value_to_text).unwrap_or_default(),
                is_error: raw.is_error.unwrap_or(false),
                timestamp,
            },
            None => SessionEvent::Skipped {
                reason: "tool_result line missing toolUseId".to_string(),
            },
        },
        Some("summary") => SessionEvent::Summary {
            text: raw.summary.unwrap_or_default(),
        },
        Some("system") => SessionEvent::System,
        Some(other) => SessionEvent::Skipped {
            reason: format!("unknown record type: {}", other),
        },
        None => SessionEvent::Skipped {
            reason: "line missing type field".to_string(),
        },
    }
}

/// Flatten message content into body text: strings verbatim, block lists
/// joined from their text blocks.
fn content_to_text(content: RawContent) -> String {
    match content {
        RawContent::Text(text) => text,
        RawContent::Blocks(blocks) => blocks
            .into_iter()
            .filter_map(|b| match b {
                RawBlock::Text { text } => Some(text),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

/// Typed blocks for assistant turns; unknown block kinds are dropped.
fn content_to_blocks(content: RawContent) -> Vec<ContentBlock> {
    match content {
        RawContent::Text(text) => vec![ContentBlock::Text { text }],
        RawContent::Blocks(blocks) => blocks
            .into_iter()
            .filter_map(|b| match b {
                RawBlock::Text { text } => Some(ContentBlock::Text { text }),
                RawBlock::ToolUse { id, name, input } => {
                    Some(ContentBlock::ToolUse { id, name, input })
                }
                RawBlock::Unknown => None,
            })
            .collect(),
    }
}

/// Tool result bodies may be plain strings or lists of text blocks.
fn value_to_text(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s,
        serde_json::Value::Array(items) => items
            .into_iter()
            .filter_map(|item| match item {
                serde_json::Value::String(s) => Some(s),
                serde_json::Value::Object(mut obj) => match obj.remove("text") {
                    Some(serde_json::Value::String(s)) => Some(s),
                    _ => None,
                },
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_line() {
        let event = parse_line(
            r#"{"type":"user","uuid":"u1","timestamp":"2026-01-02T03:04:05Z","message":{"role":"user","content":"Run ls"}}"#,
        );
        match event {
            SessionEvent::User {
                uuid,
                timestamp,
                content,
            } => {
                assert_eq!(uuid.as_deref(), Some("u1"));
                assert!(timestamp.is_some());
                assert_eq!(content, "Run ls");
            }
            other => panic!("expected user event, got {:?}", other),
        }
    }

    #[test]
    fn test_assistant_line_with_blocks() {
        let event = parse_line(
            r#"{"type":"assistant","uuid":"a1","timestamp":"2026-01-02T03:04:06Z","message":{"role":"assistant","content":[{"type":"text","text":"Running"},{"type":"tool_use","id":"T1","name":"Bash","input":{"command":"ls"}},{"type":"thinking","thinking":"hmm"}]}}"#,
        );
        match event {
            SessionEvent::Assistant { blocks, .. } => {
                assert_eq!(blocks.len(), 2, "unknown block kinds are dropped");
                assert_eq!(blocks[0], ContentBlock::Text { text: "Running".into() });
                match &blocks[1] {
                    ContentBlock::ToolUse { id, name, input } => {
                        assert_eq!(id, "T1");
                        assert_eq!(name, "Bash");
                        assert_eq!(input["command"], "ls");
                    }
                    other => panic!("expected tool_use block, got {:?}", other),
                }
            }
            other => panic!("expected assistant event, got {:?}", other),
        }
    }

    #[test]
    fn test_tool_result_line() {
        let event = parse_line(
            r#"{"type":"tool_result","toolUseId":"T1","content":"a\nb","isError":false,"timestamp":"2026-01-02T03:04:07Z"}"#,
        );
        match event {
            SessionEvent::ToolResult {
                tool_use_id,
                content,
                is_error,
                ..
            } => {
                assert_eq!(tool_use_id, "T1");
                assert_eq!(content, "a\nb");
                assert!(!is_error);
            }
            other => panic!("expected tool_result event, got {:?}", other),
        }
    }

    #[test]
    fn test_tool_result_block_list_content() {
        let event = parse_line(
            r#"{"type":"tool_result","toolUseId":"T1","content":[{"type":"text","text":"first"},{"type":"text","text":"second"}]}"#,
        );
        match event {
            SessionEvent::ToolResult { content, .. } => assert_eq!(content, "first\nsecond"),
            other => panic!("expected tool_result event, got {:?}", other),
        }
    }

    #[test]
    fn test_malformed_and_empty_lines_become_skipped() {
        assert!(matches!(
            parse_line(""),
            SessionEvent::Skipped { .. }
        ));
        assert!(matches!(
            parse_line("   "),
            SessionEvent::Skipped { .. }
        ));
        assert!(matches!(
            parse_line("{not json"),
            SessionEvent::Skipped { .. }
        ));
        assert!(matches!(
            parse_line(r#"{"uuid":"x"}"#),
            SessionEvent::Skipped { .. }
        ));
        assert!(matches!(
            parse_line(r#"{"type":"file-history-snapshot"}"#),
            SessionEvent::Skipped { .. }
        ));
    }

    #[test]
    fn test_summary_and_system_lines() {
        assert!(matches!(
            parse_line(r#"{"type":"summary","summary":"Fixed the parser"}"#),
            SessionEvent::Summary { .. }
        ));
        assert!(matches!(
            parse_line(r#"{"type":"system","subtype":"init"}"#),
            SessionEvent::System
        ));
    }

    #[test]
    fn test_stream_over_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("s.jsonl");
        std::fs::write(
            &path,
            concat!(
                r#"{"type":"user","uuid":"u1","message":{"content":"hi"}}"#,
                "\n\n",
                "garbage\n",
                r#"{"type":"assistant","uuid":"a1","message":{"content":[{"type":"text","text":"hello"}]}}"#,
                "\n",
            ),
        )
        .unwrap();

        let events: Vec<_> = TranscriptParser::open(&path).unwrap().collect();
        assert_eq!(events.len(), 4);
        assert!(matches!(events[0], SessionEvent::User { .. }));
        assert!(matches!(events[1], SessionEvent::Skipped { .. }));
        assert!(matches!(events[2], SessionEvent::Skipped { .. }));
        assert!(matches!(events[3], SessionEvent::Assistant { .. }));
    }
}
