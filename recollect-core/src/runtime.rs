//! Checkpoint and shutdown signalling
//!
//! The only process-wide mutable state in the engine: a shutdown flag the
//! sync engine polls between sessions, and the checkpoint file that makes an
//! interrupted sync resumable. The checkpoint path can be redirected for
//! test isolation; everything else is fixed.

use crate::config::Config;
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

static SHUTTING_DOWN: AtomicBool = AtomicBool::new(false);
static CHECKPOINT_OVERRIDE: Mutex<Option<PathBuf>> = Mutex::new(None);

/// Request a graceful abort: in-flight work finishes its current session's
/// transaction and then halts.
pub fn set_shutting_down(value: bool) {
    SHUTTING_DOWN.store(value, Ordering::SeqCst);
}

/// Whether a graceful abort has been requested.
pub fn is_shutting_down() -> bool {
    SHUTTING_DOWN.load(Ordering::SeqCst)
}

/// Redirect the checkpoint file for test isolation. `None` restores the
/// default location.
pub fn set_test_checkpoint_path(path: Option<PathBuf>) {
    *CHECKPOINT_OVERRIDE.lock().unwrap() = path;
}

/// Current checkpoint file path.
pub fn checkpoint_path() -> PathBuf {
    CHECKPOINT_OVERRIDE
        .lock()
        .unwrap()
        .clone()
        .unwrap_or_else(Config::checkpoint_path)
}

/// On-disk record of sync progress used to resume after interruption.
///
/// Absence of the file means "no run in progress".
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCheckpoint {
    pub started_at: DateTime<Utc>,
    pub total_sessions: usize,
    pub completed_sessions: usize,
    pub completed_session_ids: Vec<String>,
    pub last_completed_at: Option<DateTime<Utc>>,
}

impl SyncCheckpoint {
    /// Start a checkpoint for a run over `total_sessions` sessions.
    pub fn start(total_sessions: usize) -> Self {
        Self {
            started_at: Utc::now(),
            total_sessions,
            completed_sessions: 0,
            completed_session_ids: Vec::new(),
            last_completed_at: None,
        }
    }

    /// Record one completed session.
    pub fn record(&mut self, session_id: &str) {
        if !self.completed_session_ids.iter().any(|s| s == session_id) {
            self.completed_session_ids.push(session_id.to_string());
        }
        self.completed_sessions = self.completed_session_ids.len();
        self.last_completed_at = Some(Utc::now());
    }

    /// Whether a session was already completed by a prior interrupted run.
    pub fn is_completed(&self, session_id: &str) -> bool {
        self.completed_session_ids.iter().any(|s| s == session_id)
    }
}

/// Persist the checkpoint atomically (write to a sibling temp file, then
/// rename over the target).
pub fn save_checkpoint(checkpoint: &SyncCheckpoint) -> Result<()> {
    let path = checkpoint_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let tmp = path.with_extension("json.tmp");
    let body = serde_json::to_string_pretty(checkpoint)?;
    std::fs::write(&tmp, body)?;
    std::fs::rename(&tmp, &path)?;

    tracing::debug!(
        path = %path.display(),
        completed = checkpoint.completed_sessions,
        total = checkpoint.total_sessions,
        "Checkpoint saved"
    );
    Ok(())
}

/// Load the checkpoint if one exists.
pub fn load_checkpoint() -> Result<Option<SyncCheckpoint>> {
    let path = checkpoint_path();
    if !path.exists() {
        return Ok(None);
    }

    let content = std::fs::read_to_string(&path)?;
    let checkpoint = serde_json::from_str(&content)?;
    Ok(Some(checkpoint))
}

/// Remove the checkpoint file; missing file is not an error.
pub fn clear_checkpoint() -> Result<()> {
    let path = checkpoint_path();
    match std::fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_shutdown_flag_round_trip() {
        set_shutting_down(true);
        assert!(is_shutting_down());
        set_shutting_down(false);
        assert!(!is_shutting_down());
    }

    #[test]
    fn test_checkpoint_save_load_clear() {
        let dir = TempDir::new().unwrap();
        set_test_checkpoint_path(Some(dir.path().join("checkpoint.json")));

        assert!(load_checkpoint().unwrap().is_none());

        let mut cp = SyncCheckpoint::start(3);
        cp.record("session-a");
        cp.record("session-b");
        cp.record("session-a"); // duplicate is a no-op
        save_checkpoint(&cp).unwrap();

        let loaded = load_checkpoint().unwrap().unwrap();
        assert_eq!(loaded.total_sessions, 3);
        assert_eq!(loaded.completed_sessions, 2);
        assert!(loaded.is_completed("session-a"));
        assert!(!loaded.is_completed("session-c"));
        assert!(loaded.last_completed_at.is_some());

        clear_checkpoint().unwrap();
        assert!(load_checkpoint().unwrap().is_none());
        // Clearing twice is fine
        clear_checkpoint().unwrap();

        set_test_checkpoint_path(None);
    }
}
