//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::hash_map::DefaultHasher;
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use distillery::config::LlmMode;
use distillery::distill::heuristic::{FirstLinesSummarizer, PathRuleExtractor};
use distillery::distill::{BlockDraft, Extractor, RoleError, Summarizer, Summary};
use distillery::documents::SourceDocument;
use distillery::semantic::{EmbedError, Embedder};
use distillery::{Components, KnowledgeStore, Pipeline, ProjectIdentity, Roles, Settings};
use tempfile::TempDir;
use tokio::sync::{Notify, Semaphore};

pub const PROJECT: &str = "test-project";
pub const DIMENSION: usize = 16;

/// Bag-of-words embedder: same text, same vector.
///
/// While `failing` is set, any batch containing `fail_marker` is refused.
#[derive(Default)]
pub struct FakeEmbedder {
    pub calls: AtomicUsize,
    pub fail_marker: Option<String>,
    pub failing: AtomicBool,
}

impl FakeEmbedder {
    pub fn vector(text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; DIMENSION];
        for word in text.split_whitespace() {
            let mut hasher = DefaultHasher::new();
            word.to_lowercase().hash(&mut hasher);
            v[(hasher.finish() % DIMENSION as u64) as usize] += 1.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        v
    }
}

#[async_trait]
impl Embedder for FakeEmbedder {
    fn model_name(&self) -> &str {
        "fake"
    }

    fn dimension(&self) -> usize {
        DIMENSION
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(marker) = &self.fail_marker {
            if self.failing.load(Ordering::SeqCst) && texts.iter().any(|t| t.contains(marker.as_str())) {
                return Err(EmbedError::Request("scripted failure".to_string()));
            }
        }
        Ok(texts.iter().map(|t| Self::vector(t)).collect())
    }
}

/// Path-rule extraction that counts calls and fails for paths containing `fail_on`.
///
/// With a gate, every call signals `entered` and then waits for a permit.
#[derive(Default)]
pub struct ScriptedExtractor {
    pub calls: AtomicUsize,
    pub fail_on: Option<String>,
    pub gate: Option<Arc<Semaphore>>,
    pub entered: Arc<Notify>,
}

#[async_trait]
impl Extractor for ScriptedExtractor {
    async fn extract(&self, doc: &SourceDocument) -> Result<Vec<BlockDraft>, RoleError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            self.entered.notify_one();
            let _permit = gate.acquire().await.unwrap();
        }
        if let Some(marker) = &self.fail_on {
            if doc.source_path.contains(marker.as_str()) {
                return Err(RoleError::Request {
                    role: "extract",
                    reason: "scripted failure".to_string(),
                });
            }
        }
        PathRuleExtractor.extract(doc).await
    }
}

/// Summarizer that counts calls and optionally always fails.
#[derive(Default)]
pub struct ScriptedSummarizer {
    pub calls: AtomicUsize,
    pub fail: bool,
}

#[async_trait]
impl Summarizer for ScriptedSummarizer {
    async fn summarize(&self, title: &str, body: &str) -> Result<Summary, RoleError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(RoleError::Request {
                role: "summarize",
                reason: "scripted failure".to_string(),
            });
        }
        FirstLinesSummarizer.summarize(title, body).await
    }
}

/// A pipeline over a temporary knowledge root and an in-memory store.
pub struct Harness {
    pub root: TempDir,
    pub pipeline: Pipeline,
    pub store: KnowledgeStore,
    pub embedder: Arc<FakeEmbedder>,
    pub extractor: Arc<ScriptedExtractor>,
    pub summarizer: Arc<ScriptedSummarizer>,
}

pub struct HarnessBuilder {
    extractor: ScriptedExtractor,
    summarizer: ScriptedSummarizer,
    embedder: FakeEmbedder,
    summary_threshold_chars: usize,
}

impl HarnessBuilder {
    pub fn new() -> Self {
        Self {
            extractor: ScriptedExtractor::default(),
            summarizer: ScriptedSummarizer::default(),
            embedder: FakeEmbedder::default(),
            summary_threshold_chars: 800,
        }
    }

    /// Hold every extraction until the returned semaphore gets permits.
    pub fn gated_extraction(mut self) -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        self.extractor.gate = Some(gate.clone());
        (self, gate)
    }

    /// Refuse to embed text containing `marker` until told otherwise.
    pub fn failing_embeddings_for(mut self, marker: &str) -> Self {
        self.embedder.fail_marker = Some(marker.to_string());
        self.embedder.failing = AtomicBool::new(true);
        self
    }

    pub fn failing_extraction_for(mut self, marker: &str) -> Self {
        self.extractor.fail_on = Some(marker.to_string());
        self
    }

    pub fn failing_summaries(mut self) -> Self {
        self.summarizer.fail = true;
        self
    }

    pub fn summary_threshold(mut self, chars: usize) -> Self {
        self.summary_threshold_chars = chars;
        self
    }

    pub fn build(self) -> Harness {
        let root = TempDir::new().unwrap();
        let settings = settings_for(root.path(), self.summary_threshold_chars);

        let store = KnowledgeStore::memory().unwrap();
        let embedder = Arc::new(self.embedder);
        let extractor = Arc::new(self.extractor);
        let summarizer = Arc::new(self.summarizer);

        let mut roles = Roles::offline();
        roles.extractor = extractor.clone();
        roles.summarizer = summarizer.clone();

        let identity = ProjectIdentity::new(PROJECT, vec![root.path().to_path_buf()], "test-host");
        let pipeline = Pipeline::new(
            settings,
            identity,
            Components {
                store: store.clone(),
                embedder: embedder.clone(),
                roles,
            },
        );

        Harness {
            root,
            pipeline,
            store,
            embedder,
            extractor,
            summarizer,
        }
    }
}

pub fn settings_for(root: &Path, summary_threshold_chars: usize) -> Settings {
    let mut settings = Settings::default();
    settings.project.default_project_id = PROJECT.to_string();
    settings.watcher.roots = vec![root.to_path_buf()];
    settings.watcher.watch_dirs = vec![
        "docs".to_string(),
        "insights".to_string(),
        "lessons".to_string(),
    ];
    settings.watcher.debounce_seconds = 0;
    settings.watcher.rescan_interval_seconds = 0;
    settings.llm.mode = LlmMode::Offline;
    settings.llm.summary_threshold_chars = summary_threshold_chars;
    settings.embedding.dimension = DIMENSION;
    settings.embedding.batch_size = 4;
    settings.embedding.reembed_interval_seconds = 0;
    settings.pipeline.workers = 2;
    settings.pipeline.retry.max_attempts = 1;
    settings.pipeline.retry.initial_backoff_ms = 1;
    settings.pipeline.retry.max_backoff_ms = 1;
    settings.pipeline.shutdown_grace_seconds = 5;
    settings
}

impl Harness {
    pub fn write(&self, relative: &str, content: &str) -> PathBuf {
        let path = self.root.path().join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
        path
    }

    pub fn extract_calls(&self) -> usize {
        self.extractor.calls.load(Ordering::SeqCst)
    }

    pub fn summarize_calls(&self) -> usize {
        self.summarizer.calls.load(Ordering::SeqCst)
    }

    pub fn embed_calls(&self) -> usize {
        self.embedder.calls.load(Ordering::SeqCst)
    }

    pub fn heal_embeddings(&self) {
        self.embedder.failing.store(false, Ordering::SeqCst);
    }
}
