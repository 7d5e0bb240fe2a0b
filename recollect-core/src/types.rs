//! Core domain types for recollect
//!
//! These types are the canonical data model persisted by the store layer.
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Session** | A single conversation transcript, one JSONL file on disk |
//! | **Message** | A user or assistant turn within a Session |
//! | **ToolUse** | An assistant-invoked tool with structured input and eventual result |
//! | **Entity** | An extracted fact (concept, file, decision, term) linkable to sessions |
//! | **Link** | A typed weighted directed edge between two identified items |
//! | **ExtractionState** | Per-file record of how completely a session has been ingested |
//! | **ProjectPath** | Encoded (directory-name) and decoded (real) form of a project path |
//!
//! Values are constructed through validating constructors and evolved with
//! `with_*` / transition methods that return new values; nothing mutates in
//! place across a persistence boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================
// ProjectPath
// ============================================

/// A project path in both its on-disk encoded form and its lossless
/// decoded form.
///
/// The transcript root stores one directory per project, named with the
/// filesystem-safe encoding ("/home/user/dev/app" → "-home-user-dev-app").
/// The decoded form is authoritative; the encoded form is only a lookup key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectPath {
    encoded: String,
    decoded: String,
}

impl ProjectPath {
    /// Build from an encoded directory name, reversing the dash encoding.
    ///
    /// Directory names that do not carry the leading-dash encoding are kept
    /// verbatim as the decoded form.
    pub fn from_encoded(encoded: &str) -> Self {
        let decoded = if encoded.starts_with('-') {
            encoded.replacen('-', "/", 1).replace('-', "/")
        } else {
            encoded.to_string()
        };
        Self {
            encoded: encoded.to_string(),
            decoded,
        }
    }

    /// Build from a decoded filesystem path.
    pub fn from_decoded(decoded: &str) -> Self {
        Self {
            encoded: decoded.replace('/', "-"),
            decoded: decoded.to_string(),
        }
    }

    /// Build from both forms when they are already known (e.g. read back
    /// from the store). The decoded form wins any disagreement.
    pub fn from_parts(encoded: &str, decoded: &str) -> Self {
        Self {
            encoded: encoded.to_string(),
            decoded: decoded.to_string(),
        }
    }

    /// The filesystem-safe directory name.
    pub fn encoded(&self) -> &str {
        &self.encoded
    }

    /// The lossless path.
    pub fn decoded(&self) -> &str {
        &self.decoded
    }

    /// Last path component of the decoded form.
    pub fn project_name(&self) -> &str {
        self.decoded
            .rsplit('/')
            .find(|s| !s.is_empty())
            .unwrap_or(&self.decoded)
    }
}

// ============================================
// Session
// ============================================

/// A session represents one conversation transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Opaque identifier (file stem of the transcript)
    pub id: String,
    /// Project this session belongs to
    pub project: ProjectPath,
    /// First observed event instant
    pub started_at: DateTime<Utc>,
    /// Last observed event instant (may advance on re-extraction)
    pub ended_at: Option<DateTime<Utc>>,
    /// Cached message count (may increase on re-extraction)
    pub message_count: i64,
    /// Short summary, set once by an external extractor
    pub summary: Option<String>,
}

impl Session {
    /// Validating constructor; rejects empty ids.
    pub fn new(
        id: impl Into<String>,
        project: ProjectPath,
        started_at: DateTime<Utc>,
    ) -> crate::error::Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(crate::error::Error::InvariantViolation(
                "session id must not be empty".to_string(),
            ));
        }
        Ok(Self {
            id,
            project,
            started_at,
            ended_at: None,
            message_count: 0,
            summary: None,
        })
    }

    pub fn with_ended_at(mut self, ended_at: DateTime<Utc>) -> Self {
        self.ended_at = Some(ended_at);
        self
    }

    pub fn with_message_count(mut self, count: i64) -> Self {
        self.message_count = count;
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }
}

// ============================================
// Message
// ============================================

/// Role of a message author
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }
}

impl std::str::FromStr for MessageRole {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "user" => Ok(MessageRole::User),
            "assistant" => Ok(MessageRole::Assistant),
            _ => Err(format!("unknown message role: {}", s)),
        }
    }
}

/// A user or assistant turn within a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Opaque identifier, unique across the store
    pub id: String,
    /// Owning session
    pub session_id: String,
    /// Author role
    pub role: MessageRole,
    /// Body text
    pub content: String,
    /// Event instant from the transcript
    pub emitted_at: DateTime<Utc>,
    /// Ordered ids of tool_use blocks referenced from an assistant message
    pub tool_use_ids: Vec<String>,
}

impl Message {
    /// Validating constructor; rejects empty ids.
    pub fn new(
        id: impl Into<String>,
        session_id: impl Into<String>,
        role: MessageRole,
        content: impl Into<String>,
        emitted_at: DateTime<Utc>,
    ) -> crate::error::Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(crate::error::Error::InvariantViolation(
                "message id must not be empty".to_string(),
            ));
        }
        Ok(Self {
            id,
            session_id: session_id.into(),
            role,
            content: content.into(),
            emitted_at,
            tool_use_ids: Vec::new(),
        })
    }

    pub fn with_tool_use_ids(mut self, ids: Vec<String>) -> Self {
        self.tool_use_ids = ids;
        self
    }
}

// ============================================
// ToolUse
// ============================================

/// Lifecycle status of a tool invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    /// Seen in an assistant content block, no result yet
    Pending,
    Success,
    Error,
}

impl ToolStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolStatus::Pending => "pending",
            ToolStatus::Success => "success",
            ToolStatus::Error => "error",
        }
    }
}

impl std::str::FromStr for ToolStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ToolStatus::Pending),
            "success" => Ok(ToolStatus::Success),
            "error" => Ok(ToolStatus::Error),
            _ => Err(format!("unknown tool status: {}", s)),
        }
    }
}

/// An assistant-invoked tool call with structured input and eventual result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolUse {
    /// Opaque identifier (content-block id from the transcript)
    pub id: String,
    /// Owning session
    pub session_id: String,
    /// Tool name (Read, Bash, Edit, ...)
    pub name: String,
    /// Structured input tree
    pub input: serde_json::Value,
    /// Event instant
    pub emitted_at: DateTime<Utc>,
    /// Lifecycle status
    pub status: ToolStatus,
    /// Result body, present once completed
    pub result: Option<String>,
}

impl ToolUse {
    /// Validating constructor; the tool use starts out pending.
    pub fn pending(
        id: impl Into<String>,
        session_id: impl Into<String>,
        name: impl Into<String>,
        input: serde_json::Value,
        emitted_at: DateTime<Utc>,
    ) -> crate::error::Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(crate::error::Error::InvariantViolation(
                "tool use id must not be empty".to_string(),
            ));
        }
        Ok(Self {
            id,
            session_id: session_id.into(),
            name: name.into(),
            input,
            emitted_at,
            status: ToolStatus::Pending,
            result: None,
        })
    }

    /// Transition to success or error with the result body.
    pub fn completed(mut self, result: impl Into<String>, is_error: bool) -> Self {
        self.status = if is_error {
            ToolStatus::Error
        } else {
            ToolStatus::Success
        };
        self.result = Some(result.into());
        self
    }
}

// ============================================
// Entity
// ============================================

/// Kind of extracted entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Concept,
    File,
    Decision,
    Term,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Concept => "concept",
            EntityType::File => "file",
            EntityType::Decision => "decision",
            EntityType::Term => "term",
        }
    }
}

impl std::str::FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "concept" => Ok(EntityType::Concept),
            "file" => Ok(EntityType::File),
            "decision" => Ok(EntityType::Decision),
            "term" => Ok(EntityType::Term),
            _ => Err(format!("unknown entity type: {}", s)),
        }
    }
}

/// An extracted fact, deduplicated globally by (type, case-folded name).
///
/// The integer id is assigned by the store at persist time; a freshly
/// constructed entity carries `id: None`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    /// Store-assigned id, `None` before first persist
    pub id: Option<i64>,
    /// Entity kind
    pub entity_type: EntityType,
    /// Display name
    pub name: String,
    /// Type-specific metadata object
    pub metadata: serde_json::Value,
    /// Extraction confidence in [0, 1]
    pub confidence: f64,
    /// Creation instant
    pub created_at: DateTime<Utc>,
}

impl Entity {
    /// Validating constructor.
    ///
    /// Rejects empty names, out-of-range confidences, and decision entities
    /// lacking non-empty `subject` and `decision` metadata fields.
    pub fn new(
        entity_type: EntityType,
        name: impl Into<String>,
        metadata: serde_json::Value,
        confidence: f64,
    ) -> crate::error::Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(crate::error::Error::InvariantViolation(
                "entity name must not be empty".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&confidence) {
            return Err(crate::error::Error::InvariantViolation(format!(
                "entity confidence {} out of range [0, 1]",
                confidence
            )));
        }
        if entity_type == EntityType::Decision {
            let has = |key: &str| {
                metadata
                    .get(key)
                    .and_then(|v| v.as_str())
                    .map(|s| !s.trim().is_empty())
                    .unwrap_or(false)
            };
            if !has("subject") || !has("decision") {
                return Err(crate::error::Error::InvariantViolation(
                    "decision entity requires non-empty subject and decision metadata".to_string(),
                ));
            }
        }
        Ok(Self {
            id: None,
            entity_type,
            name,
            metadata,
            confidence,
            created_at: Utc::now(),
        })
    }

    /// Case-folded logical identity used for global deduplication.
    pub fn normalized_name(&self) -> String {
        self.name.to_lowercase()
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.id = Some(id);
        self
    }
}

// ============================================
// Links
// ============================================

/// Kind of node a heterogeneous link may connect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Session,
    Message,
    Topic,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Session => "session",
            NodeKind::Message => "message",
            NodeKind::Topic => "topic",
        }
    }
}

impl std::str::FromStr for NodeKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "session" => Ok(NodeKind::Session),
            "message" => Ok(NodeKind::Message),
            "topic" => Ok(NodeKind::Topic),
            _ => Err(format!("unknown node kind: {}", s)),
        }
    }
}

/// Relationship carried by a heterogeneous link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkRelation {
    Mentions,
    RelatedTo,
    Continues,
}

impl LinkRelation {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkRelation::Mentions => "mentions",
            LinkRelation::RelatedTo => "related_to",
            LinkRelation::Continues => "continues",
        }
    }
}

impl std::str::FromStr for LinkRelation {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "mentions" => Ok(LinkRelation::Mentions),
            "related_to" => Ok(LinkRelation::RelatedTo),
            "continues" => Ok(LinkRelation::Continues),
            _ => Err(format!("unknown link relation: {}", s)),
        }
    }
}

/// A typed weighted edge between sessions, messages, and topics.
///
/// Unique by (source kind, source id, target kind, target id, relation);
/// a duplicate insert replaces the stored weight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Link {
    pub source_kind: NodeKind,
    pub source_id: String,
    pub target_kind: NodeKind,
    pub target_id: String,
    pub relation: LinkRelation,
    /// Weight in [0, 1], clamped at persist time
    pub weight: f64,
    pub created_at: DateTime<Utc>,
}

impl Link {
    pub fn new(
        source_kind: NodeKind,
        source_id: impl Into<String>,
        target_kind: NodeKind,
        target_id: impl Into<String>,
        relation: LinkRelation,
        weight: f64,
    ) -> Self {
        Self {
            source_kind,
            source_id: source_id.into(),
            target_kind,
            target_id: target_id.into(),
            relation,
            weight: weight.clamp(0.0, 1.0),
            created_at: Utc::now(),
        }
    }
}

/// Relationship carried by an entity-to-entity link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityRelation {
    Related,
    Implies,
    Contradicts,
}

impl EntityRelation {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityRelation::Related => "related",
            EntityRelation::Implies => "implies",
            EntityRelation::Contradicts => "contradicts",
        }
    }
}

impl std::str::FromStr for EntityRelation {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "related" => Ok(EntityRelation::Related),
            "implies" => Ok(EntityRelation::Implies),
            "contradicts" => Ok(EntityRelation::Contradicts),
            _ => Err(format!("unknown entity relation: {}", s)),
        }
    }
}

/// A typed weighted edge between two stored entities.
///
/// Unique by (source, target, relation); the first insertion wins the weight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityLink {
    pub source_id: i64,
    pub target_id: i64,
    pub relation: EntityRelation,
    pub weight: f64,
    pub created_at: DateTime<Utc>,
}

impl EntityLink {
    pub fn new(source_id: i64, target_id: i64, relation: EntityRelation, weight: f64) -> Self {
        Self {
            source_id,
            target_id,
            relation,
            weight: weight.clamp(0.0, 1.0),
            created_at: Utc::now(),
        }
    }
}

// ============================================
// ExtractionState
// ============================================

/// Status of a per-file extraction record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStatus {
    Pending,
    InProgress,
    Complete,
    Error,
}

impl ExtractionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionStatus::Pending => "pending",
            ExtractionStatus::InProgress => "in_progress",
            ExtractionStatus::Complete => "complete",
            ExtractionStatus::Error => "error",
        }
    }
}

impl std::str::FromStr for ExtractionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ExtractionStatus::Pending),
            "in_progress" => Ok(ExtractionStatus::InProgress),
            "complete" => Ok(ExtractionStatus::Complete),
            "error" => Ok(ExtractionStatus::Error),
            _ => Err(format!("unknown extraction status: {}", s)),
        }
    }
}

/// Per-file record of whether and how completely a session has been ingested.
///
/// Uniquely keyed by session file path in addition to its own id; the stored
/// (mtime, size) pair is the change-detection key for incremental sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionState {
    /// Opaque record id
    pub id: String,
    /// Session file path (unique)
    pub session_path: String,
    pub started_at: DateTime<Utc>,
    pub status: ExtractionStatus,
    pub completed_at: Option<DateTime<Utc>>,
    pub messages_extracted: i64,
    pub error: Option<String>,
    /// File mtime observed at sync start
    pub file_mtime: Option<DateTime<Utc>>,
    /// File size observed at sync start
    pub file_size: Option<i64>,
}

impl ExtractionState {
    /// Create a fresh `pending` record carrying the observed file metadata.
    pub fn pending(
        session_path: impl Into<String>,
        file_mtime: DateTime<Utc>,
        file_size: i64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_path: session_path.into(),
            started_at: Utc::now(),
            status: ExtractionStatus::Pending,
            completed_at: None,
            messages_extracted: 0,
            error: None,
            file_mtime: Some(file_mtime),
            file_size: Some(file_size),
        }
    }

    pub fn in_progress(mut self) -> Self {
        self.status = ExtractionStatus::InProgress;
        self
    }

    pub fn increment_messages(mut self, n: i64) -> Self {
        self.messages_extracted += n;
        self
    }

    pub fn complete(mut self, now: DateTime<Utc>) -> Self {
        self.status = ExtractionStatus::Complete;
        self.completed_at = Some(now);
        self
    }

    pub fn failed(mut self, message: impl Into<String>) -> Self {
        self.status = ExtractionStatus::Error;
        self.error = Some(message.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_project_path_round_trip() {
        let p = ProjectPath::from_encoded("-home-user-dev-myproject");
        assert_eq!(p.decoded(), "/home/user/dev/myproject");
        assert_eq!(p.project_name(), "myproject");

        let q = ProjectPath::from_decoded("/home/user/dev/myproject");
        assert_eq!(q.encoded(), "-home-user-dev-myproject");
    }

    #[test]
    fn test_project_path_without_encoding() {
        let p = ProjectPath::from_encoded("plain");
        assert_eq!(p.decoded(), "plain");
        assert_eq!(p.project_name(), "plain");
    }

    #[test]
    fn test_entity_rejects_bad_confidence() {
        assert!(Entity::new(EntityType::Concept, "rust", json!({}), 1.5).is_err());
        assert!(Entity::new(EntityType::Concept, "rust", json!({}), -0.1).is_err());
        assert!(Entity::new(EntityType::Concept, "rust", json!({}), 1.0).is_ok());
    }

    #[test]
    fn test_decision_requires_subject_and_decision() {
        let err = Entity::new(EntityType::Decision, "storage", json!({"subject": "storage"}), 0.9);
        assert!(err.is_err());

        let ok = Entity::new(
            EntityType::Decision,
            "storage",
            json!({"subject": "storage", "decision": "use sqlite"}),
            0.9,
        );
        assert!(ok.is_ok());
    }

    #[test]
    fn test_entity_normalized_name_is_case_folded() {
        let e = Entity::new(EntityType::Concept, "Rust Async", json!({}), 0.8).unwrap();
        assert_eq!(e.normalized_name(), "rust async");
    }

    #[test]
    fn test_tool_use_completion() {
        let t = ToolUse::pending("t1", "s1", "Bash", json!({"command": "ls"}), Utc::now()).unwrap();
        assert_eq!(t.status, ToolStatus::Pending);

        let ok = t.clone().completed("a\nb", false);
        assert_eq!(ok.status, ToolStatus::Success);
        assert_eq!(ok.result.as_deref(), Some("a\nb"));

        let err = t.completed("boom", true);
        assert_eq!(err.status, ToolStatus::Error);
    }

    #[test]
    fn test_extraction_state_lifecycle() {
        let state = ExtractionState::pending("/root/s.jsonl", Utc::now(), 42)
            .in_progress()
            .increment_messages(3);
        let now = Utc::now();
        let state = state.complete(now);

        assert_eq!(state.status, ExtractionStatus::Complete);
        assert_eq!(state.messages_extracted, 3);
        assert_eq!(state.completed_at, Some(now));
        assert!(state.completed_at.unwrap() >= state.started_at);
    }

    #[test]
    fn test_link_weight_clamped() {
        let l = Link::new(
            NodeKind::Session,
            "s1",
            NodeKind::Topic,
            "rust",
            LinkRelation::Mentions,
            1.7,
        );
        assert_eq!(l.weight, 1.0);
    }
}
