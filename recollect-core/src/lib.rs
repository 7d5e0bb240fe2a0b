//! # recollect-core
//!
//! Core library for recollect - an extraction and storage engine for
//! AI-assistant session transcripts.
//!
//! This library provides:
//! - Discovery of append-only JSONL session files under a transcript root
//! - Streaming transcript parsing into a typed event sequence
//! - Transactional persistence into a SQLite store with FTS5 search over
//!   message bodies and session summaries
//! - An entity/link graph derived from tool-use patterns and second-tier
//!   LLM extraction
//! - Resumable incremental sync with checkpoints, graceful abort, and crash
//!   recovery
//! - Export/import of the full store as a versioned JSON document
//!
//! ## Example
//!
//! ```rust,no_run
//! use recollect_core::{Config, Database, FileSessionSource, SyncEngine, SyncOptions};
//!
//! let config = Config::load().expect("failed to load config");
//! let db = Database::open(&config.database_path()).expect("failed to open store");
//! let source = FileSessionSource::new(config.transcript_root());
//! let engine = SyncEngine::new(db, Box::new(source));
//!
//! let outcome = engine.sync(SyncOptions::default()).expect("sync failed");
//! println!(
//!     "processed {} sessions ({} messages)",
//!     outcome.sessions_processed, outcome.messages_inserted
//! );
//! ```

// Re-export commonly used items at the crate root
pub use config::Config;
pub use context::{project_context, ProjectContext};
pub use db::{Database, EntityFilter};
pub use error::{Error, ErrorCategory, Result};
pub use ingest::{SyncEngine, SyncOptions, SyncOutcome, SyncPhase};
pub use recovery::{RecoveryOptions, RecoveryOutcome};
pub use source::{FileSessionSource, SessionSource};
pub use transfer::{export_to_json, import_from_json, ImportOptions};
pub use types::*;

// Public modules
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod extract;
pub mod ingest;
pub mod logging;
pub mod recovery;
pub mod runtime;
pub mod source;
pub mod transfer;
pub mod types;
