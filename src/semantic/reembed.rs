//! Deferred embedding of blocks persisted without a vector.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::pipeline::RetryPolicy;
use crate::storage::{KnowledgeStore, StoreError};

use super::{Embedder, embed_all};

/// Blocks fetched per pass.
const PASS_LIMIT: usize = 256;

/// What one pass achieved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReembedReport {
    pub attempted: usize,
    pub embedded: usize,
    /// Re-distilled while the vector was computed
    pub stale: usize,
    pub failed: usize,
}

/// Embed up to one page of pending blocks.
///
/// A vector is only written if its block still carries the fingerprint it had
/// when fetched. Failures are counted on the block, which moves it behind
/// blocks that have not failed yet on the next pass.
pub async fn reembed_once(
    store: &KnowledgeStore,
    embedder: &dyn Embedder,
    project_id: &str,
    batch_size: usize,
    dimension: usize,
    policy: &RetryPolicy,
) -> Result<ReembedReport, StoreError> {
    reembed_page(store, embedder, project_id, PASS_LIMIT, batch_size, dimension, policy).await
}

async fn reembed_page(
    store: &KnowledgeStore,
    embedder: &dyn Embedder,
    project_id: &str,
    limit: usize,
    batch_size: usize,
    dimension: usize,
    policy: &RetryPolicy,
) -> Result<ReembedReport, StoreError> {
    let project = project_id.to_string();
    let pending = store
        .run_blocking(move |s| s.pending_embeddings(&project, limit))
        .await?;

    let mut report = ReembedReport {
        attempted: pending.len(),
        ..Default::default()
    };
    if pending.is_empty() {
        return Ok(report);
    }

    let texts: Vec<String> = pending.iter().map(|b| b.searchable_text()).collect();
    let vectors = embed_all(embedder, &texts, batch_size, dimension, policy).await;

    let mut writes = Vec::new();
    let mut failures = Vec::new();
    for (block, vector) in pending.into_iter().zip(vectors) {
        match vector {
            Ok(vector) => writes.push((block, vector)),
            Err(e) => {
                crate::debug_event!("reembed", "failed", "{}: {e}", block.id);
                failures.push(block);
            }
        }
    }
    report.failed = failures.len();

    let (embedded, stale) = store
        .run_blocking(move |s| {
            for block in &failures {
                s.record_embedding_failure(block)?;
            }
            let mut embedded = 0;
            let mut stale = 0;
            for (block, vector) in &writes {
                if s.set_embedding(block, vector)? {
                    embedded += 1;
                } else {
                    stale += 1;
                }
            }
            Ok((embedded, stale))
        })
        .await?;
    report.embedded = embedded;
    report.stale = stale;

    if report.embedded > 0 || report.failed > 0 {
        crate::log_event!(
            "reembed",
            "pass",
            "{} embedded, {} failed, {} stale",
            report.embedded,
            report.failed,
            report.stale
        );
    }
    Ok(report)
}

/// Run [`reembed_once`] every `interval` until cancelled.
pub async fn run(
    store: KnowledgeStore,
    embedder: Arc<dyn Embedder>,
    project_id: String,
    batch_size: usize,
    policy: RetryPolicy,
    interval: Duration,
    cancel: CancellationToken,
) {
    let dimension = embedder.dimension();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately; fresh blocks were just embedded inline
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = reembed_once(&store, embedder.as_ref(), &project_id, batch_size, dimension, &policy).await {
                    tracing::warn!("[reembed] pass failed: {e}");
                }
            }
        }
    }

    crate::debug_event!("reembed", "stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semantic::EmbedError;
    use crate::types::{BlockId, Categories, DecayRule, KnowledgeBlock, KnowledgeType};
    use async_trait::async_trait;
    use chrono::Utc;

    struct ConstEmbedder;

    #[async_trait]
    impl Embedder for ConstEmbedder {
        fn model_name(&self) -> &str {
            "const"
        }

        fn dimension(&self) -> usize {
            2
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
            Ok(texts.iter().map(|_| vec![0.6, 0.8]).collect())
        }
    }

    /// Refuses any batch containing "broken".
    struct PickyEmbedder;

    #[async_trait]
    impl Embedder for PickyEmbedder {
        fn model_name(&self) -> &str {
            "picky"
        }

        fn dimension(&self) -> usize {
            2
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
            if texts.iter().any(|t| t.contains("broken")) {
                return Err(EmbedError::Embedding("unsupported input".to_string()));
            }
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    fn pending_block(seq: usize) -> KnowledgeBlock {
        block_at("/kb/a.md", seq, "b")
    }

    fn block_at(source: &str, seq: usize, body: &str) -> KnowledgeBlock {
        let now = Utc::now();
        KnowledgeBlock {
            id: BlockId::derive("p", source, seq),
            project_id: "p".to_string(),
            source_path: source.to_string(),
            seq,
            knowledge_type: KnowledgeType::Doc,
            insight_type: None,
            title: "t".to_string(),
            body: body.to_string(),
            summary: None,
            tags: Default::default(),
            related: Vec::new(),
            content_fingerprint: "f".to_string(),
            categories: Categories::default(),
            doc_type: None,
            decay_rule: DecayRule::None,
            expires_at: None,
            embedding: None,
            host_id: "h".to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_reembed_fills_pending_blocks() {
        let store = KnowledgeStore::memory().unwrap();
        store
            .replace_for_source("p", "/kb/a.md", &[pending_block(0), pending_block(1)])
            .unwrap();

        let report = reembed_once(&store, &ConstEmbedder, "p", 8, 2, &RetryPolicy::once())
            .await
            .unwrap();

        assert_eq!(report.attempted, 2);
        assert_eq!(report.embedded, 2);
        assert!(store.pending_embeddings("p", 10).unwrap().is_empty());
        let blocks = store.blocks_for_source("p", "/kb/a.md").unwrap();
        assert_eq!(blocks[0].embedding.as_deref(), Some(&[0.6f32, 0.8][..]));
    }

    #[tokio::test]
    async fn test_failing_blocks_do_not_starve_the_rest() {
        let store = KnowledgeStore::memory().unwrap();
        store
            .replace_for_source(
                "p",
                "/kb/bad.md",
                &[block_at("/kb/bad.md", 0, "broken"), block_at("/kb/bad.md", 1, "broken too")],
            )
            .unwrap();
        store
            .replace_for_source("p", "/kb/good.md", &[block_at("/kb/good.md", 0, "fine")])
            .unwrap();

        // A page only fits the two oldest, both of which fail
        let first = reembed_page(&store, &PickyEmbedder, "p", 2, 1, 2, &RetryPolicy::once())
            .await
            .unwrap();
        assert_eq!(first.failed, 2);
        assert_eq!(first.embedded, 0);
        assert_eq!(
            store.embedding_attempts(&BlockId::derive("p", "/kb/bad.md", 0)).unwrap(),
            1
        );

        let second = reembed_page(&store, &PickyEmbedder, "p", 2, 1, 2, &RetryPolicy::once())
            .await
            .unwrap();
        assert_eq!(second.embedded, 1);
        let good = store.blocks_for_source("p", "/kb/good.md").unwrap();
        assert!(good[0].embedding.is_some());
    }

    #[tokio::test]
    async fn test_reembed_with_nothing_pending() {
        let store = KnowledgeStore::memory().unwrap();
        let report = reembed_once(&store, &ConstEmbedder, "p", 8, 2, &RetryPolicy::once())
            .await
            .unwrap();
        assert_eq!(report, ReembedReport::default());
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let store = KnowledgeStore::memory().unwrap();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(
            store,
            Arc::new(ConstEmbedder),
            "p".to_string(),
            8,
            RetryPolicy::once(),
            Duration::from_millis(10),
            cancel.clone(),
        ));
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
