//! Capability interfaces for the model-backed distillation roles.
//!
//! Each role has a single method. Remote implementations live in
//! [`super::llm`], deterministic offline ones in [`super::heuristic`].

use std::sync::Arc;

use async_trait::async_trait;

use crate::documents::{SourceDocument, TitleSource};
use crate::storage::{KnowledgeStore, StoreError};
use crate::types::{InsightType, KnowledgeBlock, KnowledgeType, Neighbor, RelatedRef, Tags};

use super::error::RoleError;

/// One candidate block before ids and provenance are attached.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockDraft {
    pub knowledge_type: KnowledgeType,
    pub insight_type: Option<InsightType>,
    pub title: String,
    pub title_source: TitleSource,
    pub body: String,
    pub tags: Tags,
}

impl BlockDraft {
    /// The whole document as a single draft, using its metadata verbatim.
    pub fn whole_document(doc: &SourceDocument, knowledge_type: KnowledgeType) -> Self {
        Self {
            knowledge_type,
            insight_type: doc.insight_type,
            title: doc.title.clone(),
            title_source: doc.title_source,
            body: doc.body.clone(),
            tags: doc.tags.clone(),
        }
    }
}

/// Condensed form of a long body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Summary {
    pub title: Option<String>,
    pub body: String,
}

/// Resolution of an overlap between a candidate and the block in its slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArbitrationDecision {
    /// Candidate supersedes the existing block
    Replace,
    /// Keep the existing content, union the tags
    MergeTags,
    /// Both survive; the existing block moves to a new slot
    KeepBoth,
}

impl ArbitrationDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArbitrationDecision::Replace => "replace",
            ArbitrationDecision::MergeTags => "merge_tags",
            ArbitrationDecision::KeepBoth => "keep_both",
        }
    }
}

#[async_trait]
pub trait Extractor: Send + Sync {
    /// Split an unstructured document into candidate drafts.
    async fn extract(&self, doc: &SourceDocument) -> Result<Vec<BlockDraft>, RoleError>;
}

#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, title: &str, body: &str) -> Result<Summary, RoleError>;
}

#[async_trait]
pub trait RelationLinker: Send + Sync {
    /// Choose which neighbours are related to `draft`, and how.
    async fn link(&self, draft: &BlockDraft, neighbors: &[Neighbor]) -> Result<Vec<RelatedRef>, RoleError>;
}

#[async_trait]
pub trait Arbiter: Send + Sync {
    async fn arbitrate(
        &self,
        existing: &KnowledgeBlock,
        candidate: &KnowledgeBlock,
    ) -> Result<ArbitrationDecision, RoleError>;
}

/// Similarity lookup over already-persisted blocks.
#[async_trait]
pub trait NeighborIndex: Send + Sync {
    async fn nearest(
        &self,
        project_id: &str,
        vector: &[f32],
        exclude_source: &str,
        limit: usize,
        threshold: f32,
    ) -> Result<Vec<Neighbor>, StoreError>;
}

#[async_trait]
impl NeighborIndex for KnowledgeStore {
    async fn nearest(
        &self,
        project_id: &str,
        vector: &[f32],
        exclude_source: &str,
        limit: usize,
        threshold: f32,
    ) -> Result<Vec<Neighbor>, StoreError> {
        let project_id = project_id.to_string();
        let vector = vector.to_vec();
        let exclude_source = exclude_source.to_string();
        self.run_blocking(move |store| {
            store.nearest(&project_id, &vector, &exclude_source, limit, threshold)
        })
        .await
    }
}

/// The four roles a distiller is wired with.
#[derive(Clone)]
pub struct Roles {
    pub extractor: Arc<dyn Extractor>,
    pub summarizer: Arc<dyn Summarizer>,
    pub linker: Arc<dyn RelationLinker>,
    pub arbiter: Arc<dyn Arbiter>,
}
