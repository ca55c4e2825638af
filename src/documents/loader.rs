//! Reading source files into [`SourceDocument`]s.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::config::WatcherConfig;
use crate::types::{DocType, InsightType, KnowledgeType, Tags, source_key};

use super::frontmatter;
use super::title::{TitleSource, derive_title};

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("{path} vanished before it could be read")]
    Vanished { path: PathBuf },

    #[error("{path} has no content")]
    Empty { path: PathBuf },

    #[error("{path} is {size} bytes, over the {limit} byte limit")]
    TooLarge { path: PathBuf, size: u64, limit: u64 },

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl LoadError {
    /// The file yields no knowledge; its existing blocks must go.
    pub fn means_absent(&self) -> bool {
        matches!(
            self,
            LoadError::Vanished { .. } | LoadError::Empty { .. } | LoadError::TooLarge { .. }
        )
    }

    fn from_io(path: &Path, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::NotFound {
            LoadError::Vanished {
                path: path.to_path_buf(),
            }
        } else {
            LoadError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    }
}

/// A file's current content, ready for distillation. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceDocument {
    pub path: PathBuf,
    /// Canonical key used by the store
    pub source_path: String,
    pub content: String,
    pub content_fingerprint: String,
    pub knowledge_type: Option<KnowledgeType>,
    pub insight_type: Option<InsightType>,
    /// Declared in front matter; overrides path rules
    pub doc_type: Option<DocType>,
    pub tags: Tags,
    pub body: String,
    pub title: String,
    pub title_source: TitleSource,
    pub last_modified: DateTime<Utc>,
}

impl SourceDocument {
    /// Build a document from in-memory content.
    pub fn from_content(path: impl Into<PathBuf>, content: &str, last_modified: DateTime<Utc>) -> Self {
        let path = path.into();
        let (front_matter, body) = frontmatter::parse_lenient(content);
        let front_matter = front_matter.unwrap_or_default();

        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let (title, title_source) = derive_title(front_matter.title.as_deref(), body, &stem);

        Self {
            source_path: source_key(&path),
            content_fingerprint: fingerprint(content.as_bytes()),
            knowledge_type: front_matter.knowledge_type,
            insight_type: front_matter.insight_type,
            doc_type: front_matter.doc_type,
            tags: front_matter.tags,
            body: body.trim().to_string(),
            title,
            title_source,
            last_modified,
            content: content.to_string(),
            path,
        }
    }
}

/// SHA-256 over raw bytes, lowercase hex.
pub fn fingerprint(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Reads files named by stable events.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContentLoader {
    max_bytes: Option<u64>,
}

impl ContentLoader {
    pub fn new(max_bytes: Option<u64>) -> Self {
        Self { max_bytes }
    }

    pub fn from_config(config: &WatcherConfig) -> Self {
        Self::new(config.max_file_size_bytes())
    }

    pub fn load(&self, path: &Path) -> Result<SourceDocument, LoadError> {
        let metadata = std::fs::metadata(path).map_err(|e| LoadError::from_io(path, e))?;

        if let Some(limit) = self.max_bytes {
            if metadata.len() > limit {
                return Err(LoadError::TooLarge {
                    path: path.to_path_buf(),
                    size: metadata.len(),
                    limit,
                });
            }
        }

        let bytes = std::fs::read(path).map_err(|e| LoadError::from_io(path, e))?;
        let content = String::from_utf8_lossy(&bytes);

        let last_modified = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        let mut document = SourceDocument::from_content(path, &content, last_modified);
        // Fingerprint the bytes as stored, not the lossy decode
        document.content_fingerprint = fingerprint(&bytes);

        if document.body.is_empty() {
            return Err(LoadError::Empty {
                path: path.to_path_buf(),
            });
        }

        crate::debug_event!(
            "loader",
            "loaded",
            "{} ({} bytes)",
            path.display(),
            bytes.len()
        );
        Ok(document)
    }
}
