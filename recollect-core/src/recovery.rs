//! Crash recovery
//!
//! After an unclean shutdown, some session files have no extraction state or
//! a state stuck short of `complete`. The recovery pass finds them and
//! drives the sync engine over each one, tolerating per-session failures.

use crate::config::Config;
use crate::error::Result;
use crate::ingest::{SyncEngine, SyncOptions};
use crate::source::session_id_from_path;
use crate::types::ExtractionStatus;

/// Options recognised by [`SyncEngine::recover`].
#[derive(Debug, Default, Clone)]
pub struct RecoveryOptions {
    /// Only report pending sessions, change nothing
    pub dry_run: bool,
    /// Cap on sessions recovered in one pass (unbounded if absent)
    pub max_sessions: Option<usize>,
}

/// A per-session recovery failure.
#[derive(Debug)]
pub struct RecoveryError {
    pub session_path: String,
    pub error: String,
}

/// Result of a recovery pass.
#[derive(Debug, Default)]
pub struct RecoveryOutcome {
    /// The pass was skipped because startup recovery is disabled
    pub skipped: bool,
    /// Paths of sessions without a completed extraction
    pub pending_sessions: Vec<String>,
    /// Sessions successfully re-synced
    pub recovered: usize,
    pub errors: Vec<RecoveryError>,
}

impl SyncEngine {
    /// Number of sessions whose extraction never completed.
    pub fn pending_count(&self) -> Result<usize> {
        Ok(self.pending_session_paths()?.len())
    }

    /// Recover unfinished sessions by re-syncing each one.
    ///
    /// Honors `recoveryOnStartup` from the configuration unless this is a
    /// dry run; a dry run only lists the pending paths.
    pub fn recover(&self, config: &Config, options: RecoveryOptions) -> Result<RecoveryOutcome> {
        if !config.recovery_on_startup && !options.dry_run {
            tracing::debug!("Startup recovery disabled by configuration");
            return Ok(RecoveryOutcome {
                skipped: true,
                ..Default::default()
            });
        }

        let pending = self.pending_session_paths()?;
        let mut outcome = RecoveryOutcome {
            pending_sessions: pending.clone(),
            ..Default::default()
        };

        if options.dry_run {
            return Ok(outcome);
        }

        let limit = options.max_sessions.unwrap_or(usize::MAX);
        for path in pending.iter().take(limit) {
            let Some(session_id) = session_id_from_path(path) else {
                outcome.errors.push(RecoveryError {
                    session_path: path.clone(),
                    error: "could not derive session id from path".to_string(),
                });
                continue;
            };

            tracing::info!(session_id = %session_id, "Recovering unfinished session");
            let sync_options = SyncOptions {
                session_filter: Some(session_id),
                ..Default::default()
            };
            match self.sync(sync_options) {
                Ok(sync_outcome) if sync_outcome.errors.is_empty() => outcome.recovered += 1,
                Ok(sync_outcome) => {
                    let message = sync_outcome
                        .errors
                        .first()
                        .map(|e| e.message.clone())
                        .unwrap_or_else(|| "unknown error".to_string());
                    outcome.errors.push(RecoveryError {
                        session_path: path.clone(),
                        error: message,
                    });
                }
                Err(e) => outcome.errors.push(RecoveryError {
                    session_path: path.clone(),
                    error: e.to_string(),
                }),
            }
        }

        Ok(outcome)
    }

    /// Paths of discovered sessions whose extraction state is missing or not
    /// `complete`.
    fn pending_session_paths(&self) -> Result<Vec<String>> {
        let mut pending = Vec::new();
        for session in self.discover_sessions()? {
            let path = session.path.to_string_lossy().to_string();
            let complete = self
                .database()
                .extraction_state_by_path(&path)?
                .map(|state| state.status == ExtractionStatus::Complete)
                .unwrap_or(false);
            if !complete {
                pending.push(path);
            }
        }
        Ok(pending)
    }
}
