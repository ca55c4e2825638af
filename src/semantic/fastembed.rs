//! Local embeddings through fastembed (ONNX).

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use parking_lot::Mutex;

use super::{EmbedError, Embedder};

/// Default location for downloaded model files.
pub fn models_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("distillery")
        .join("models")
}

/// Resolve a configured model name.
///
/// Accepts the fastembed variant name (`AllMiniLML6V2`) or the Hugging Face
/// style name (`all-MiniLM-L6-v2`, `BAAI/bge-small-en-v1.5`), case-insensitively.
pub fn parse_model(name: &str) -> Result<EmbeddingModel, EmbedError> {
    let key: String = name
        .rsplit('/')
        .next()
        .unwrap_or(name)
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_lowercase();

    let model = match key.as_str() {
        "allminilml6v2" => EmbeddingModel::AllMiniLML6V2,
        "allminilml12v2" => EmbeddingModel::AllMiniLML12V2,
        "bgesmallenv15" => EmbeddingModel::BGESmallENV15,
        "bgebaseenv15" => EmbeddingModel::BGEBaseENV15,
        "bgelargeenv15" => EmbeddingModel::BGELargeENV15,
        "multilinguale5small" => EmbeddingModel::MultilingualE5Small,
        "multilinguale5base" => EmbeddingModel::MultilingualE5Base,
        "multilinguale5large" => EmbeddingModel::MultilingualE5Large,
        "nomicembedtextv15" => EmbeddingModel::NomicEmbedTextV15,
        "paraphrasemlminilml12v2" | "paraphrasemultilingualminilml12v2" => {
            EmbeddingModel::ParaphraseMLMiniLML12V2
        }
        _ => return Err(EmbedError::UnknownModel(name.to_string())),
    };
    Ok(model)
}

/// Embedder backed by a single local model instance.
///
/// The model needs `&mut` access, so calls are serialized through a mutex and
/// run on the blocking pool.
pub struct FastEmbedder {
    model: Arc<Mutex<TextEmbedding>>,
    model_name: String,
    dimension: usize,
}

impl FastEmbedder {
    pub fn new(model_name: &str, show_download_progress: bool) -> Result<Self, EmbedError> {
        Self::with_cache_dir(model_name, models_dir(), show_download_progress)
    }

    pub fn with_cache_dir(
        model_name: &str,
        cache_dir: PathBuf,
        show_download_progress: bool,
    ) -> Result<Self, EmbedError> {
        let model = parse_model(model_name)?;

        let mut text_model = TextEmbedding::try_new(
            InitOptions::new(model)
                .with_cache_dir(cache_dir)
                .with_show_download_progress(show_download_progress),
        )
        .map_err(|e| EmbedError::ModelInit(e.to_string()))?;

        // Measure the dimension with a test embedding
        let sample = text_model
            .embed(vec!["test"], None)
            .map_err(|e| EmbedError::Embedding(e.to_string()))?;
        let dimension = sample
            .into_iter()
            .next()
            .map(|v| v.len())
            .ok_or_else(|| EmbedError::ModelInit("model returned no sample vector".to_string()))?;

        crate::log_event!("embedder", "ready", "{model_name} ({dimension} dimensions)");

        Ok(Self {
            model: Arc::new(Mutex::new(text_model)),
            model_name: model_name.to_string(),
            dimension,
        })
    }
}

#[async_trait]
impl Embedder for FastEmbedder {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let model = self.model.clone();
        let texts = texts.to_vec();

        tokio::task::spawn_blocking(move || {
            model
                .lock()
                .embed(texts, None)
                .map_err(|e| EmbedError::Embedding(e.to_string()))
        })
        .await
        .map_err(|e| EmbedError::Embedding(format!("embedding task failed: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_model_names() {
        assert!(matches!(
            parse_model("AllMiniLML6V2"),
            Ok(EmbeddingModel::AllMiniLML6V2)
        ));
        assert!(matches!(
            parse_model("sentence-transformers/all-MiniLM-L6-v2"),
            Ok(EmbeddingModel::AllMiniLML6V2)
        ));
        assert!(matches!(
            parse_model("BAAI/bge-small-en-v1.5"),
            Ok(EmbeddingModel::BGESmallENV15)
        ));
        assert!(matches!(
            parse_model("word2vec"),
            Err(EmbedError::UnknownModel(_))
        ));
    }

    #[tokio::test]
    #[ignore = "Downloads model files"]
    async fn test_fastembed_vectors_have_model_dimension() {
        let embedder = FastEmbedder::new("AllMiniLML6V2", false).unwrap();
        let vectors = embedder
            .embed(&["Parse JSON data".to_string(), "Retry with backoff".to_string()])
            .await
            .unwrap();

        assert_eq!(vectors.len(), 2);
        assert!(vectors.iter().all(|v| v.len() == embedder.dimension()));
    }
}
