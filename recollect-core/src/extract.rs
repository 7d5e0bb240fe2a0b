//! Second-tier extraction contract
//!
//! Builds the structured prompt sent to an LLM and parses its JSON response
//! into entities and a session summary. Invoking the model is a collaborator
//! concern behind [`SummaryExtractor`]; the engine itself never calls it.
//!
//! The response contract is forgiving: a response that fails to decode
//! yields an empty outcome, entries are trimmed and null-filtered, and
//! confidences are clamped into [0, 1] with 0.5 as the default.

use crate::db::Database;
use crate::error::Result;
use crate::types::{Entity, EntityType, Link, LinkRelation, Message, MessageRole, NodeKind};
use serde::Deserialize;
use sha2::{Digest, Sha256};

/// Maximum number of topics the prompt asks for.
const MAX_TOPICS: usize = 5;
/// Maximum number of terms and decisions the prompt asks for.
const MAX_TERMS: usize = 3;
const MAX_DECISIONS: usize = 3;

/// Seam for the external LLM flow. Implementations receive the assembled
/// prompt and return the raw model response for [`parse_extraction_response`].
pub trait SummaryExtractor: Send + Sync {
    fn extract(&self, prompt: &str) -> Result<String>;
}

/// An assembled extraction prompt with its content hash.
///
/// The hash identifies the prompt for response caching, the same way
/// assessment prompts are fingerprinted elsewhere in this stack.
#[derive(Debug, Clone)]
pub struct ExtractionPrompt {
    pub text: String,
    pub hash: String,
}

/// Build the extraction prompt over a session's messages.
///
/// Each message is labelled `[USER]` or `[ASSISTANT]`; the instruction fixes
/// the item limits and the JSON schema of the expected response.
pub fn build_extraction_prompt(messages: &[Message]) -> ExtractionPrompt {
    let mut text = String::from(
        "Analyze this AI assistant session transcript and extract structured facts.\n\n",
    );

    for message in messages {
        let label = match message.role {
            MessageRole::User => "[USER]",
            MessageRole::Assistant => "[ASSISTANT]",
        };
        text.push_str(label);
        text.push(' ');
        text.push_str(&message.content);
        text.push('\n');
    }

    text.push_str(&format!(
        r#"
Extract from the transcript:
- 1-{MAX_TOPICS} topics: the main subjects discussed
- 0-{MAX_TERMS} terms: domain vocabulary worth remembering, with a definition when stated
- 0-{MAX_DECISIONS} decisions: choices that were made, with subject, the decision, rejected alternatives, and rationale
- a 1-2 sentence summary of the session

Give every item a confidence between 0 and 1.

Respond with JSON only, no prose, matching exactly:
{{
  "topics": [{{"name": "...", "confidence": 0.9}}],
  "terms": [{{"name": "...", "definition": "...", "confidence": 0.8}}],
  "decisions": [{{"subject": "...", "decision": "...", "rejected": ["..."], "rationale": "...", "confidence": 0.8}}],
  "summary": "..."
}}
"#
    ));

    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = hex::encode(hasher.finalize());

    ExtractionPrompt { text, hash }
}

/// Entities and summary parsed from one extraction response.
#[derive(Debug, Default)]
pub struct ExtractionOutcome {
    /// Topics as `concept` entities
    pub topics: Vec<Entity>,
    /// Terms as `term` entities, with `{definition}` metadata when present
    pub terms: Vec<Entity>,
    /// Decisions as `decision` entities named by their subject
    pub decisions: Vec<Entity>,
    /// Session summary, empty when the response carried none
    pub summary: String,
}

impl ExtractionOutcome {
    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
            && self.terms.is_empty()
            && self.decisions.is_empty()
            && self.summary.is_empty()
    }

    /// All extracted entities in topics → terms → decisions order.
    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.topics
            .iter()
            .chain(self.terms.iter())
            .chain(self.decisions.iter())
    }

    /// Write the outcome through the store: entities are upserted and linked
    /// to the session, topics additionally become topic nodes with weighted
    /// session links, and a non-empty summary is written through
    /// `update_summary` (which also indexes it).
    pub fn persist(&self, db: &Database, session_id: &str) -> Result<()> {
        for entity in self.entities() {
            let entity_id = db.save_entity(entity)?;
            db.link_entity_to_session(entity_id, session_id, 1)?;
        }
        for topic in &self.topics {
            let topic_id = db.save_topic(&topic.name)?;
            db.save_link(&Link::new(
                NodeKind::Session,
                session_id,
                NodeKind::Topic,
                topic_id,
                LinkRelation::Mentions,
                topic.confidence,
            ))?;
        }
        if !self.summary.is_empty() {
            db.update_summary(session_id, &self.summary)?;
        }
        Ok(())
    }
}

// Raw response shapes; individual entries are decoded leniently so one bad
// item does not discard the rest.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct RawResponse {
    topics: Vec<serde_json::Value>,
    terms: Vec<serde_json::Value>,
    decisions: Vec<serde_json::Value>,
    summary: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawTopic {
    name: String,
    confidence: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawTerm {
    name: String,
    definition: Option<String>,
    confidence: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct RawDecision {
    subject: String,
    decision: String,
    rejected: Vec<String>,
    rationale: Option<String>,
    confidence: Option<f64>,
}

/// Parse an LLM response into an [`ExtractionOutcome`].
///
/// A surrounding code fence is stripped; a response that still fails to
/// decode yields an empty outcome rather than an error.
pub fn parse_extraction_response(raw: &str) -> ExtractionOutcome {
    let body = strip_code_fence(raw);
    let response: RawResponse = match serde_json::from_str(body) {
        Ok(response) => response,
        Err(e) => {
            tracing::debug!(error = %e, "Extraction response failed to decode");
            return ExtractionOutcome::default();
        }
    };

    let mut outcome = ExtractionOutcome {
        summary: response.summary.unwrap_or_default(),
        ..Default::default()
    };

    for value in response.topics.into_iter().take(MAX_TOPICS) {
        let Ok(topic) = serde_json::from_value::<RawTopic>(value) else {
            continue;
        };
        let name = topic.name.trim();
        if name.is_empty() {
            continue;
        }
        if let Ok(entity) = Entity::new(
            EntityType::Concept,
            name,
            serde_json::Value::Null,
            clamp_confidence(topic.confidence),
        ) {
            outcome.topics.push(entity);
        }
    }

    for value in response.terms.into_iter().take(MAX_TERMS) {
        let Ok(term) = serde_json::from_value::<RawTerm>(value) else {
            continue;
        };
        let name = term.name.trim();
        if name.is_empty() {
            continue;
        }
        let metadata = match term.definition.as_deref().map(str::trim) {
            Some(definition) if !definition.is_empty() => {
                serde_json::json!({ "definition": definition })
            }
            _ => serde_json::Value::Null,
        };
        if let Ok(entity) = Entity::new(
            EntityType::Term,
            name,
            metadata,
            clamp_confidence(term.confidence),
        ) {
            outcome.terms.push(entity);
        }
    }

    for value in response.decisions.into_iter().take(MAX_DECISIONS) {
        let Ok(decision) = serde_json::from_value::<RawDecision>(value) else {
            continue;
        };
        let subject = decision.subject.trim().to_string();
        let body = decision.decision.trim().to_string();
        if subject.is_empty() || body.is_empty() {
            continue;
        }
        let metadata = serde_json::json!({
            "subject": subject,
            "decision": body,
            "rejected": decision.rejected,
            "rationale": decision.rationale.unwrap_or_default(),
        });
        if let Ok(entity) = Entity::new(
            EntityType::Decision,
            subject.as_str(),
            metadata,
            clamp_confidence(decision.confidence),
        ) {
            outcome.decisions.push(entity);
        }
    }

    outcome
}

fn clamp_confidence(confidence: Option<f64>) -> f64 {
    confidence.unwrap_or(0.5).clamp(0.0, 1.0)
}

/// Strip a surrounding markdown code fence, with or without a language tag.
fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = match rest.find('\n') {
        Some(index) => &rest[index + 1..],
        None => rest,
    };
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn messages() -> Vec<Message> {
        vec![
            Message::new("m1", "s1", MessageRole::User, "How do I stream a file?", Utc::now())
                .unwrap(),
            Message::new("m2", "s1", MessageRole::Assistant, "Use BufReader.", Utc::now())
                .unwrap(),
        ]
    }

    #[test]
    fn test_prompt_labels_and_hash() {
        let prompt = build_extraction_prompt(&messages());
        assert!(prompt.text.contains("[USER] How do I stream a file?"));
        assert!(prompt.text.contains("[ASSISTANT] Use BufReader."));
        assert!(prompt.text.contains("\"topics\""));
        assert_eq!(prompt.hash.len(), 64);

        // Same transcript, same fingerprint.
        let again = build_extraction_prompt(&messages());
        assert_eq!(prompt.hash, again.hash);
    }

    #[test]
    fn test_parse_full_response() {
        let raw = r#"
        {
            "topics": [{"name": " Streaming IO ", "confidence": 0.9}, {"name": "", "confidence": 0.4}],
            "terms": [{"name": "BufReader", "definition": "buffered file reader", "confidence": 0.8}],
            "decisions": [{"subject": "io", "decision": "use buffered reads", "rejected": ["mmap"], "rationale": "simpler", "confidence": 0.7}],
            "summary": "Discussed streaming file IO."
        }
        "#;
        let outcome = parse_extraction_response(raw);

        assert_eq!(outcome.topics.len(), 1);
        assert_eq!(outcome.topics[0].name, "Streaming IO");
        assert_eq!(outcome.topics[0].entity_type, EntityType::Concept);

        assert_eq!(outcome.terms.len(), 1);
        assert_eq!(
            outcome.terms[0].metadata["definition"],
            "buffered file reader"
        );

        assert_eq!(outcome.decisions.len(), 1);
        assert_eq!(outcome.decisions[0].name, "io");
        assert_eq!(outcome.decisions[0].metadata["decision"], "use buffered reads");
        assert_eq!(outcome.decisions[0].metadata["rejected"][0], "mmap");

        assert_eq!(outcome.summary, "Discussed streaming file IO.");
    }

    #[test]
    fn test_parse_strips_code_fence() {
        let raw = "```json\n{\"topics\": [{\"name\": \"rust\"}], \"summary\": \"s\"}\n```";
        let outcome = parse_extraction_response(raw);
        assert_eq!(outcome.topics.len(), 1);
        assert_eq!(outcome.topics[0].confidence, 0.5, "missing confidence defaults");
        assert_eq!(outcome.summary, "s");
    }

    #[test]
    fn test_parse_garbage_yields_empty_outcome() {
        assert!(parse_extraction_response("not json at all").is_empty());
        assert!(parse_extraction_response("").is_empty());
    }

    #[test]
    fn test_parse_clamps_confidence_and_drops_bad_decisions() {
        let raw = r#"
        {
            "topics": [{"name": "a", "confidence": 3.0}],
            "decisions": [
                {"subject": "kept", "decision": "yes", "confidence": -2},
                {"subject": "", "decision": "orphan"},
                {"subject": "no decision"}
            ]
        }
        "#;
        let outcome = parse_extraction_response(raw);
        assert_eq!(outcome.topics[0].confidence, 1.0);
        assert_eq!(outcome.decisions.len(), 1);
        assert_eq!(outcome.decisions[0].name, "kept");
        assert_eq!(outcome.decisions[0].confidence, 0.0);
        assert_eq!(outcome.summary, "");
    }

    #[test]
    fn test_persist_links_entities_and_topics() {
        let db = Database::open_in_memory().unwrap();
        db.save_session(
            &crate::types::Session::new(
                "s1",
                crate::types::ProjectPath::from_decoded("/h/u/app"),
                Utc::now(),
            )
            .unwrap(),
        )
        .unwrap();

        let raw = r#"{"topics": [{"name": "caching", "confidence": 0.9}], "summary": "Built a cache."}"#;
        let outcome = parse_extraction_response(raw);
        outcome.persist(&db, "s1").unwrap();

        let linked = db.entities_for_session("s1").unwrap();
        assert_eq!(linked.len(), 1);
        assert_eq!(linked[0].0.name, "caching");

        let links = db.links_from(NodeKind::Session, "s1").unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].target_id, "caching");

        let session = db.get_session("s1").unwrap().unwrap();
        assert_eq!(session.summary.as_deref(), Some("Built a cache."));
    }
}
