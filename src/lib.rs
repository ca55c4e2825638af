//! Distillery: watch document folders and distill them into a knowledge store.
//!
//! Changed files flow through a fixed pipeline:
//! [`watcher`] (notify events, debouncing, rescans) → [`documents`] (loading,
//! front-matter, titles) → [`distill`] (extraction, summary, relations,
//! arbitration) → [`semantic`] (embeddings) → [`storage`] (SQLite).
//! [`pipeline`] owns the moving parts and their concurrency.

pub mod cli;
pub mod clock;
pub mod config;
pub mod distill;
pub mod documents;
pub mod logging;
pub mod pipeline;
pub mod semantic;
pub mod storage;
pub mod types;
pub mod watcher;

pub use config::Settings;
pub use distill::{DistillOutcome, Distiller, Roles};
pub use pipeline::{Components, Pipeline, PipelineError};
pub use storage::{BlockFilter, KnowledgeStore};
pub use types::{BlockId, InsightType, KnowledgeBlock, KnowledgeType, ProjectIdentity};
