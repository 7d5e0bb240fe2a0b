//! Storage layer: SQLite store, schema, and repositories
//!
//! The store is a single SQLite file with FTS5 indexes over message bodies
//! and session summaries, plus the entity/link graph. All access goes
//! through [`Database`].

pub mod repo;
pub mod schema;

pub use repo::{
    BatchOutcome, Database, EntityFilter, ExtractionPersistOutcome, RelatedEntity, StoreStats,
};
