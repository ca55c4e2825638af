//! Command implementations for the CLI.
//!
//! Each command is implemented in its own module.

pub mod config;
pub mod query;
pub mod run;
pub mod stats;

use anyhow::Context;

use crate::config::Settings;
use crate::storage::KnowledgeStore;

/// Open the configured store for read-only commands.
pub(crate) fn open_store(settings: &Settings) -> anyhow::Result<KnowledgeStore> {
    let location = settings
        .storage
        .location()
        .context("Invalid storage.database_url")?;
    KnowledgeStore::open(&location).context("Failed to open knowledge store")
}
