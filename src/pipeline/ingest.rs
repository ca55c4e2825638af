//! One path's run through load → distill → store.
//!
//! Vectors are attached by the distiller; blocks it could not embed are stored
//! as pending and picked up by the re-embed task.

use std::sync::Arc;

use thiserror::Error;

use crate::distill::{DistillError, DistillOutcome, Distiller};
use crate::documents::{ContentLoader, LoadError, SourceDocument};
use crate::storage::{KnowledgeStore, StoreError};
use crate::types::{ProjectIdentity, source_key};
use crate::watcher::{ChangeKind, StableEvent};

use super::generations::Generations;
use super::retry::RetryPolicy;

/// Failure of a single path run. The path is retried on its next stable event.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Distill(#[from] DistillError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Ingest task failed: {0}")]
    Task(String),
}

/// What a run did to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Content unchanged, nothing written
    Unchanged,
    Replaced { blocks: usize },
    Deleted { removed: usize },
    /// A newer event for the path arrived; the result was dropped
    Superseded,
}

pub struct Ingestor {
    identity: ProjectIdentity,
    loader: ContentLoader,
    distiller: Distiller,
    store: KnowledgeStore,
    generations: Arc<Generations>,
    policy: RetryPolicy,
}

impl Ingestor {
    pub fn new(
        identity: ProjectIdentity,
        loader: ContentLoader,
        distiller: Distiller,
        store: KnowledgeStore,
        generations: Arc<Generations>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            identity,
            loader,
            distiller,
            store,
            generations,
            policy,
        }
    }

    pub fn identity(&self) -> &ProjectIdentity {
        &self.identity
    }

    pub fn store(&self) -> &KnowledgeStore {
        &self.store
    }

    pub fn generations(&self) -> &Arc<Generations> {
        &self.generations
    }

    pub async fn ingest(&self, event: &StableEvent) -> Result<IngestOutcome, IngestError> {
        let source_path = source_key(&event.path);

        if event.kind == ChangeKind::Deleted {
            return self.remove(event, &source_path).await;
        }

        let loader = self.loader;
        let path = event.path.clone();
        let loaded = tokio::task::spawn_blocking(move || loader.load(&path))
            .await
            .map_err(|e| IngestError::Task(e.to_string()))?;

        let doc = match loaded {
            Ok(doc) => doc,
            Err(e) if e.means_absent() => {
                crate::debug_event!("ingest", "absent", "{e}");
                return self.remove(event, &source_path).await;
            }
            Err(e) => return Err(e.into()),
        };

        self.distill_and_store(event, doc).await
    }

    async fn distill_and_store(
        &self,
        event: &StableEvent,
        doc: SourceDocument,
    ) -> Result<IngestOutcome, IngestError> {
        let project = self.identity.project_id.clone();
        let source_path = doc.source_path.clone();

        let existing = self
            .policy
            .run("read blocks", || {
                let (project, source_path) = (project.clone(), source_path.clone());
                self.store
                    .run_blocking(move |s| s.blocks_for_source(&project, &source_path))
            })
            .await?;

        let blocks = match self.distiller.distill(&self.identity, &doc, &existing).await? {
            DistillOutcome::Unchanged => return Ok(IngestOutcome::Unchanged),
            DistillOutcome::Candidates(blocks) => blocks,
        };

        if self.generations.is_superseded(&event.path, event.generation) {
            crate::debug_event!("ingest", "superseded", "{source_path}#{}", event.generation);
            return Ok(IngestOutcome::Superseded);
        }

        let blocks = Arc::new(blocks);
        let outcome = self
            .policy
            .run("replace blocks", || {
                let (project, source_path, blocks) = (project.clone(), source_path.clone(), blocks.clone());
                self.store
                    .run_blocking(move |s| s.replace_for_source(&project, &source_path, &blocks))
            })
            .await
            .inspect_err(|e| tracing::error!("[ingest] giving up on {source_path}: {e}"))?;

        crate::log_event!("ingest", "stored", "{source_path}: {} blocks", outcome.written);
        Ok(IngestOutcome::Replaced {
            blocks: outcome.written,
        })
    }

    async fn remove(&self, event: &StableEvent, source_path: &str) -> Result<IngestOutcome, IngestError> {
        if self.generations.is_superseded(&event.path, event.generation) {
            return Ok(IngestOutcome::Superseded);
        }

        let project = self.identity.project_id.clone();
        let removed = self
            .policy
            .run("delete blocks", || {
                let (project, source_path) = (project.clone(), source_path.to_string());
                self.store
                    .run_blocking(move |s| s.delete_for_source(&project, &source_path))
            })
            .await
            .inspect_err(|e| tracing::error!("[ingest] giving up on delete of {source_path}: {e}"))?;

        if removed > 0 {
            crate::log_event!("ingest", "deleted", "{source_path}: {removed} blocks");
        }
        Ok(IngestOutcome::Deleted { removed })
    }
}
