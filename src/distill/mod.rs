//! Distillation of source documents into knowledge blocks.
//!
//! ```text
//! SourceDocument ──► extract ──► summarize ──► link ──► arbitrate ──► blocks
//!                   (or whole     (long        (nearest   (per slot, against
//!                    document)     bodies)      blocks)    existing blocks)
//! ```
//!
//! Only extraction is essential: its failure fails the document. Summary,
//! relation and arbitration failures degrade to the unenriched candidate.

pub mod arbitration;
mod error;
pub mod heuristic;
pub mod llm;
mod roles;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;

use crate::config::{LlmMode, Settings};
use crate::documents::{SourceDocument, classify, derive_title, relative_to};
use crate::pipeline::RetryPolicy;
use crate::semantic::{Embedder, embed_all};
use crate::types::{BlockId, DecayRule, KnowledgeBlock, KnowledgeType, ProjectIdentity, searchable_text};

pub use error::{DistillError, RoleError};
pub use roles::{
    ArbitrationDecision, Arbiter, BlockDraft, Extractor, NeighborIndex, RelationLinker, Roles,
    Summary, Summarizer,
};

use heuristic::{FirstLinesSummarizer, OverlapArbiter, PassThroughLinker, PathRuleExtractor};
use llm::{ChatClient, LlmArbiter, LlmExtractor, LlmRelationLinker, LlmSummarizer};

impl Roles {
    /// Deterministic roles that never leave the process.
    pub fn offline() -> Self {
        Self {
            extractor: Arc::new(PathRuleExtractor),
            summarizer: Arc::new(FirstLinesSummarizer),
            linker: Arc::new(PassThroughLinker),
            arbiter: Arc::new(OverlapArbiter),
        }
    }

    /// Remote roles sharing one chat client, one model per role.
    pub fn remote(settings: &Settings) -> Result<Self, RoleError> {
        let llm = &settings.llm;
        let client = Arc::new(ChatClient::from_config(llm, settings.pipeline.call_timeout())?);
        Ok(Self {
            extractor: Arc::new(LlmExtractor::new(client.clone(), &llm.model_distill)),
            summarizer: Arc::new(LlmSummarizer::new(client.clone(), &llm.model_summary)),
            linker: Arc::new(LlmRelationLinker::new(client.clone(), &llm.model_relation)),
            arbiter: Arc::new(LlmArbiter::new(client, &llm.model_arbitrate)),
        })
    }

    pub fn from_settings(settings: &Settings) -> Result<Self, RoleError> {
        match settings.llm.mode {
            LlmMode::Offline => Ok(Self::offline()),
            LlmMode::Remote => Self::remote(settings),
        }
    }
}

/// Tunables of one distiller.
#[derive(Debug, Clone, PartialEq)]
pub struct DistillSettings {
    /// Bodies longer than this (in characters) are summarized
    pub summary_threshold_chars: usize,
    pub similarity_threshold: f32,
    pub max_neighbors: usize,
    pub dimension: usize,
    pub batch_size: usize,
}

impl DistillSettings {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            summary_threshold_chars: settings.llm.summary_threshold_chars,
            similarity_threshold: settings.relations.similarity_threshold,
            max_neighbors: settings.relations.max_neighbors,
            dimension: settings.embedding.dimension,
            batch_size: settings.embedding.batch_size,
        }
    }
}

/// Result of distilling one document.
#[derive(Debug, Clone, PartialEq)]
pub enum DistillOutcome {
    /// Fingerprint matches every existing block; nothing to do
    Unchanged,
    /// Final block set for the source
    Candidates(Vec<KnowledgeBlock>),
}

pub struct Distiller {
    roles: Roles,
    embedder: Arc<dyn Embedder>,
    neighbors: Arc<dyn NeighborIndex>,
    policy: RetryPolicy,
    settings: DistillSettings,
}

impl Distiller {
    pub fn new(
        roles: Roles,
        embedder: Arc<dyn Embedder>,
        neighbors: Arc<dyn NeighborIndex>,
        policy: RetryPolicy,
        settings: DistillSettings,
    ) -> Self {
        Self {
            roles,
            embedder,
            neighbors,
            policy,
            settings,
        }
    }

    /// Turn `doc` into the block set that should replace `existing`.
    pub async fn distill(
        &self,
        identity: &ProjectIdentity,
        doc: &SourceDocument,
        existing: &[KnowledgeBlock],
    ) -> Result<DistillOutcome, DistillError> {
        if !existing.is_empty()
            && existing
                .iter()
                .all(|b| b.content_fingerprint == doc.content_fingerprint)
        {
            crate::debug_event!("distill", "unchanged", "{}", doc.source_path);
            return Ok(DistillOutcome::Unchanged);
        }

        let mut drafts = self.extract(doc).await?;
        for draft in &mut drafts {
            self.summarize(draft, doc).await;
        }

        let class = classify(&relative_to(&identity.roots, &doc.path));
        let doc_type = doc.doc_type.or(class.doc_type);
        let decay_rule = DecayRule::for_doc_type(doc_type);

        let now = Utc::now();
        let mut candidates: Vec<KnowledgeBlock> = drafts
            .into_iter()
            .enumerate()
            .map(|(seq, EnrichedDraft { draft, summary })| KnowledgeBlock {
                id: BlockId::derive(&identity.project_id, &doc.source_path, seq),
                project_id: identity.project_id.clone(),
                source_path: doc.source_path.clone(),
                seq,
                // Dialogue exports stay dialogue whatever the extractor says
                knowledge_type: if class.dialogue {
                    KnowledgeType::DialogueExtract
                } else {
                    draft.knowledge_type
                },
                insight_type: draft.insight_type,
                title: draft.title,
                body: draft.body,
                summary,
                tags: draft.tags,
                related: Vec::new(),
                content_fingerprint: doc.content_fingerprint.clone(),
                categories: class.categories.clone(),
                doc_type,
                decay_rule,
                expires_at: decay_rule.expires_at(now),
                embedding: None,
                host_id: identity.host_id.clone(),
                created_at: now,
                updated_at: now,
            })
            .collect();

        self.link(identity, &mut candidates).await;

        let decisions = self.decide(existing, &candidates).await;
        let blocks = arbitration::arbitrate(existing, candidates, &decisions, &doc.content_fingerprint);

        crate::debug_event!(
            "distill",
            "distilled",
            "{} -> {} blocks",
            doc.source_path,
            blocks.len()
        );
        Ok(DistillOutcome::Candidates(blocks))
    }

    async fn extract(&self, doc: &SourceDocument) -> Result<Vec<EnrichedDraft>, DistillError> {
        let drafts = match doc.knowledge_type {
            Some(kind) => vec![BlockDraft::whole_document(doc, kind)],
            None => self
                .policy
                .run("extract", || self.roles.extractor.extract(doc))
                .await
                .map_err(|source| DistillError::Extraction {
                    path: doc.path.clone(),
                    source,
                })?,
        };

        if drafts.is_empty() {
            return Err(DistillError::NoCandidates {
                path: doc.path.clone(),
            });
        }

        let stem = file_stem(&doc.path);
        Ok(drafts
            .into_iter()
            .map(|mut draft| {
                draft.tags.extend(doc.tags.iter().cloned());
                if draft.title.trim().is_empty() {
                    let (title, source) = derive_title(None, &draft.body, &stem);
                    draft.title = title;
                    draft.title_source = source;
                }
                EnrichedDraft { draft, summary: None }
            })
            .collect())
    }

    async fn summarize(&self, enriched: &mut EnrichedDraft, doc: &SourceDocument) {
        let draft = &mut enriched.draft;
        if draft.body.chars().count() <= self.settings.summary_threshold_chars {
            return;
        }

        let summarizer = &self.roles.summarizer;
        let (title, body) = (draft.title.as_str(), draft.body.as_str());
        match self
            .policy
            .run("summarize", || summarizer.summarize(title, body))
            .await
        {
            Ok(summary) => {
                if let Some(title) = summary.title.filter(|t| !t.trim().is_empty()) {
                    if !draft.title_source.is_explicit() {
                        draft.title = title;
                    }
                }
                if !summary.body.trim().is_empty() {
                    enriched.summary = Some(summary.body);
                }
            }
            Err(e) => tracing::warn!(
                "[distill] summary failed for {}, keeping derived title: {e}",
                doc.source_path
            ),
        }
    }

    /// Attach vectors and related references.
    ///
    /// The only place fresh blocks are embedded. A block whose embedding fails
    /// keeps `embedding = None` and is stored as pending.
    async fn link(&self, identity: &ProjectIdentity, candidates: &mut [KnowledgeBlock]) {
        let texts: Vec<String> = candidates
            .iter()
            .map(|b| searchable_text(&b.title, &b.body))
            .collect();
        let vectors = embed_all(
            self.embedder.as_ref(),
            &texts,
            self.settings.batch_size,
            self.settings.dimension,
            &self.policy,
        )
        .await;

        for (block, vector) in candidates.iter_mut().zip(vectors) {
            let vector = match vector {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(
                        "[distill] {}#{} stored without embedding: {e}",
                        block.source_path,
                        block.seq
                    );
                    continue;
                }
            };

            if self.settings.max_neighbors > 0 {
                match self
                    .neighbors
                    .nearest(
                        &identity.project_id,
                        &vector,
                        &block.source_path,
                        self.settings.max_neighbors,
                        self.settings.similarity_threshold,
                    )
                    .await
                {
                    Ok(neighbors) if !neighbors.is_empty() => {
                        let draft = BlockDraft {
                            knowledge_type: block.knowledge_type,
                            insight_type: block.insight_type,
                            title: block.title.clone(),
                            title_source: crate::documents::TitleSource::Generated,
                            body: block.body.clone(),
                            tags: block.tags.clone(),
                        };
                        let linker = &self.roles.linker;
                        match self
                            .policy
                            .run("relate", || linker.link(&draft, &neighbors))
                            .await
                        {
                            Ok(related) => block.related = related,
                            Err(e) => tracing::warn!(
                                "[distill] relation linking failed for {}: {e}",
                                block.source_path
                            ),
                        }
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!("[distill] neighbour lookup failed: {e}"),
                }
            }

            block.embedding = Some(vector);
        }
    }

    /// Ask the arbiter about every occupied slot whose content changed.
    async fn decide(
        &self,
        existing: &[KnowledgeBlock],
        candidates: &[KnowledgeBlock],
    ) -> HashMap<BlockId, ArbitrationDecision> {
        let by_id: HashMap<&BlockId, &KnowledgeBlock> = existing.iter().map(|b| (&b.id, b)).collect();
        let mut decisions = HashMap::new();

        for candidate in candidates {
            let Some(old) = by_id.get(&candidate.id).copied() else {
                continue;
            };
            if old.title == candidate.title && old.body == candidate.body {
                continue;
            }

            let arbiter = &self.roles.arbiter;
            let decision = match self
                .policy
                .run("arbitrate", || arbiter.arbitrate(old, candidate))
                .await
            {
                Ok(decision) => decision,
                Err(e) => {
                    tracing::warn!(
                        "[distill] arbitration failed for {}, replacing: {e}",
                        candidate.source_path
                    );
                    ArbitrationDecision::Replace
                }
            };
            crate::debug_event!(
                "distill",
                "arbitrated",
                "{}#{} {}",
                candidate.source_path,
                candidate.seq,
                decision.as_str()
            );
            decisions.insert(candidate.id.clone(), decision);
        }

        decisions
    }
}

/// A draft plus the summary produced for it.
struct EnrichedDraft {
    draft: BlockDraft,
    summary: Option<String>,
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}
