//! Embedding generation for knowledge blocks.
//!
//! Two providers implement [`Embedder`]: a local fastembed model and a remote
//! OpenAI-compatible endpoint. Embedding failures are never fatal; a block
//! without a vector is persisted and picked up later by [`reembed`].

mod error;
mod fastembed;
mod http;
pub mod reembed;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{EmbeddingConfig, EmbeddingProvider, PipelineConfig};
use crate::pipeline::RetryPolicy;

pub use self::error::EmbedError;
pub use self::fastembed::{FastEmbedder, models_dir, parse_model};
pub use self::http::HttpEmbedder;

/// Similarity threshold recommendations
pub mod thresholds {
    /// Same concept, different wording
    pub const VERY_SIMILAR: f32 = 0.85;

    /// Related concepts
    pub const SIMILAR: f32 = 0.70;

    pub const RELATED: f32 = 0.50;
}

/// Computes fixed-dimension vectors for text.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn model_name(&self) -> &str;

    /// Length of every vector this embedder returns.
    fn dimension(&self) -> usize;

    /// One vector per input, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError>;
}

/// Build the configured embedder.
pub fn from_config(
    config: &EmbeddingConfig,
    pipeline: &PipelineConfig,
) -> Result<Arc<dyn Embedder>, EmbedError> {
    let embedder: Arc<dyn Embedder> = match config.provider {
        EmbeddingProvider::FastEmbed => Arc::new(FastEmbedder::new(&config.model, true)?),
        EmbeddingProvider::OpenAi => Arc::new(HttpEmbedder::from_config(config, pipeline.call_timeout())?),
    };

    if embedder.dimension() != config.dimension {
        tracing::warn!(
            "[embedder] model {} produces {} dimensions but embedding.dimension is {}; vectors will be rejected",
            embedder.model_name(),
            embedder.dimension(),
            config.dimension
        );
    }
    Ok(embedder)
}

/// Embed `texts` in batches, isolating failures per text.
///
/// A failed batch is retried one text at a time so a single bad input cannot
/// take its siblings down. Vectors whose length differs from `dimension` are
/// rejected.
pub async fn embed_all(
    embedder: &dyn Embedder,
    texts: &[String],
    batch_size: usize,
    dimension: usize,
    policy: &RetryPolicy,
) -> Vec<Result<Vec<f32>, EmbedError>> {
    let mut results = Vec::with_capacity(texts.len());

    for chunk in texts.chunks(batch_size.max(1)) {
        match policy.run("embed", || embedder.embed(chunk)).await {
            Ok(vectors) if vectors.len() == chunk.len() => {
                results.extend(vectors.into_iter().map(|v| check_dimension(v, dimension)));
            }
            Ok(vectors) if chunk.len() == 1 => {
                results.push(Err(EmbedError::CountMismatch {
                    expected: 1,
                    actual: vectors.len(),
                }));
            }
            Err(e) if chunk.len() == 1 => results.push(Err(e)),
            outcome => {
                if let Err(e) = &outcome {
                    tracing::warn!("[embedder] batch of {} failed, retrying singly: {e}", chunk.len());
                }
                for text in chunk {
                    let single = std::slice::from_ref(text);
                    let result = match policy.run("embed", || embedder.embed(single)).await {
                        Ok(mut vectors) if vectors.len() == 1 => {
                            check_dimension(vectors.remove(0), dimension)
                        }
                        Ok(vectors) => Err(EmbedError::CountMismatch {
                            expected: 1,
                            actual: vectors.len(),
                        }),
                        Err(e) => Err(e),
                    };
                    results.push(result);
                }
            }
        }
    }

    results
}

fn check_dimension(vector: Vec<f32>, dimension: usize) -> Result<Vec<f32>, EmbedError> {
    if vector.len() == dimension {
        Ok(vector)
    } else {
        Err(EmbedError::DimensionMismatch {
            expected: dimension,
            actual: vector.len(),
        })
    }
}

/// Cosine similarity between two vectors; 0.0 for mismatched or zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let magnitude_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let magnitude_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if magnitude_a == 0.0 || magnitude_b == 0.0 {
        return 0.0;
    }

    dot_product / (magnitude_a * magnitude_b)
}
