//! Durable knowledge storage.
//!
//! SQLite in WAL mode: one writer, pooled readers, per-source write locks.

mod connection;
pub mod error;
mod locks;
mod schema;
mod sqlite;

pub use connection::SqlitePool;
pub use error::{StoreError, StoreResult};
pub use locks::SourceLocks;
pub use sqlite::{BlockFilter, KnowledgeStore, ReplaceOutcome, StoreStats};
