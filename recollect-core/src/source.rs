//! Session file discovery
//!
//! Transcripts live under a root directory with one sub-directory per
//! project (the directory name is the encoded project path):
//!
//! ```text
//! <root>/<encoded-project>/<session-id>.jsonl
//! <root>/<encoded-project>/<session-id>/subagents/<sub-id>.jsonl
//! ```
//!
//! Discovery returns an unordered list; filtering and ordering belong to the
//! sync engine.

use crate::error::{Error, Result};
use crate::types::ProjectPath;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};

/// A session file found under the transcript root.
#[derive(Debug, Clone)]
pub struct DiscoveredSession {
    /// Session id (file stem)
    pub session_id: String,
    /// Full path to the transcript file
    pub path: PathBuf,
    /// Project the session belongs to
    pub project: ProjectPath,
    /// File modification instant at discovery time
    pub modified_at: DateTime<Utc>,
    /// File size in bytes at discovery time
    pub size_bytes: u64,
}

/// Capability seam over session discovery so the sync engine can be driven
/// with in-memory fakes in tests.
pub trait SessionSource: Send + Sync {
    fn discover(&self) -> Result<Vec<DiscoveredSession>>;
}

/// Discovers session files on disk under a transcript root.
pub struct FileSessionSource {
    root: PathBuf,
}

impl FileSessionSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn discover_pattern(&self, pattern: &str, out: &mut Vec<DiscoveredSession>) -> Result<()> {
        let full_pattern = self.root.join(pattern);
        let pattern_str = full_pattern.to_string_lossy();

        let entries = glob::glob(&pattern_str)
            .map_err(|e| Error::SourceInaccessible(format!("invalid glob pattern: {}", e)))?;

        for entry in entries.flatten() {
            let Some(session) = describe(&self.root, &entry) else {
                continue;
            };
            out.push(session);
        }
        Ok(())
    }
}

impl SessionSource for FileSessionSource {
    fn discover(&self) -> Result<Vec<DiscoveredSession>> {
        if !self.root.exists() {
            return Err(Error::SourceInaccessible(format!(
                "transcript root {} does not exist",
                self.root.display()
            )));
        }

        let mut sessions = Vec::new();
        self.discover_pattern("*/*.jsonl", &mut sessions)?;
        self.discover_pattern("*/*/subagents/*.jsonl", &mut sessions)?;

        tracing::debug!(
            root = %self.root.display(),
            count = sessions.len(),
            "Discovered session files"
        );
        Ok(sessions)
    }
}

/// Build a [`DiscoveredSession`] for a transcript path, reading file
/// metadata. Returns `None` for paths that vanished between glob and stat.
fn describe(root: &Path, path: &Path) -> Option<DiscoveredSession> {
    let session_id = path.file_stem()?.to_str()?.to_string();

    // The project directory is the first component under the root.
    let relative = path.strip_prefix(root).ok()?;
    let encoded = relative.components().next()?.as_os_str().to_str()?;
    let project = ProjectPath::from_encoded(encoded);

    let metadata = std::fs::metadata(path).ok()?;
    let modified_at = metadata
        .modified()
        .ok()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(Utc::now);

    Some(DiscoveredSession {
        session_id,
        path: path.to_path_buf(),
        project,
        modified_at,
        size_bytes: metadata.len(),
    })
}

/// Extract the session id from a transcript path string, handling both
/// separator styles.
pub fn session_id_from_path(path: &str) -> Option<String> {
    let file_name = path.rsplit(['/', '\\']).next()?;
    let stem = file_name.strip_suffix(".jsonl").unwrap_or(file_name);
    if stem.is_empty() {
        None
    } else {
        Some(stem.to_string())
    }
}
