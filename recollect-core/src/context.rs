//! Project-scoped context queries
//!
//! Aggregate reads collaborators use to brief a new session on a project:
//! message counts, recent topics, recent tool usage, last activity. All
//! aggregates accept a day window over session start instants; tool uses and
//! topics are additionally windowed by their own instants.

use crate::db::Database;
use crate::error::Result;
use chrono::{DateTime, Duration, Utc};

/// How many topics and tool names a context carries.
const RECENT_LIMIT: usize = 10;

/// Tool usage entry for a project context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolUsage {
    pub name: String,
    pub count: i64,
}

/// Aggregate view of one project.
#[derive(Debug, Clone)]
pub struct ProjectContext {
    pub project_name: String,
    pub decoded_path: String,
    pub session_count: i64,
    pub total_messages: i64,
    pub user_messages: i64,
    pub assistant_messages: i64,
    /// Topic ids linked from the project's sessions, strongest first
    pub recent_topics: Vec<String>,
    pub recent_tool_uses: Vec<ToolUsage>,
    pub last_activity: Option<DateTime<Utc>>,
}

/// Build the context for the project best matching `query`.
///
/// An exact case-insensitive project-name match wins; otherwise the project
/// with the most sessions whose name contains the substring is picked.
/// Returns `None` when no project matches or every matching session falls
/// outside the `days` window.
pub fn project_context(
    db: &Database,
    query: &str,
    days: Option<u32>,
) -> Result<Option<ProjectContext>> {
    let candidates = db.project_session_counts()?;

    let query_lower = query.to_lowercase();
    let chosen = candidates
        .iter()
        .find(|(name, _, _)| name.to_lowercase() == query_lower)
        .or_else(|| {
            // candidates are ordered by session count descending, so the
            // first substring hit is the busiest one
            candidates.iter().find(|(name, _, _)| name.contains(query))
        });

    let Some((project_name, decoded_path, _)) = chosen else {
        return Ok(None);
    };

    let since = days.map(|d| Utc::now() - Duration::days(i64::from(d)));

    let sessions = db.sessions_for_project(decoded_path)?;
    let windowed_count = sessions
        .iter()
        .filter(|s| since.map(|t| s.started_at >= t).unwrap_or(true))
        .count() as i64;
    if windowed_count == 0 {
        return Ok(None);
    }

    let (total_messages, user_messages, assistant_messages) =
        db.project_message_counts(decoded_path, since)?;
    let recent_topics = db.project_recent_topics(decoded_path, since, RECENT_LIMIT)?;
    let recent_tool_uses = db
        .project_tool_counts(decoded_path, since, RECENT_LIMIT)?
        .into_iter()
        .map(|(name, count)| ToolUsage { name, count })
        .collect();
    let last_activity = db.project_last_activity(decoded_path)?;

    Ok(Some(ProjectContext {
        project_name: project_name.clone(),
        decoded_path: decoded_path.clone(),
        session_count: windowed_count,
        total_messages,
        user_messages,
        assistant_messages,
        recent_topics,
        recent_tool_uses,
        last_activity,
    }))
}
