//! Core data model shared by every pipeline stage.

use chrono::{DateTime, Utc};
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::config::{Settings, host_identifier};

/// Ordered, de-duplicated tag set.
pub type Tags = IndexSet<String>;

/// Stable logical key of a knowledge block.
///
/// Derived from project, source path and the block's sequence index within that
/// source, so re-distilling an unchanged layout yields the same ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockId(String);

impl BlockId {
    pub fn derive(project_id: &str, source_path: &str, index: usize) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(project_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(source_path.as_bytes());
        hasher.update([0u8]);
        hasher.update(index.to_string().as_bytes());
        let digest = format!("{:x}", hasher.finalize());
        Self(digest[..32].to_string())
    }

    /// Wrap an id read back from storage.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown {kind} '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KnowledgeType {
    Doc,
    Insight,
    DialogueExtract,
}

impl KnowledgeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            KnowledgeType::Doc => "doc",
            KnowledgeType::Insight => "insight",
            KnowledgeType::DialogueExtract => "dialogue_extract",
        }
    }
}

impl FromStr for KnowledgeType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "doc" | "document" => Ok(KnowledgeType::Doc),
            "insight" => Ok(KnowledgeType::Insight),
            "dialogue_extract" | "dialogue" => Ok(KnowledgeType::DialogueExtract),
            _ => Err(UnknownVariant {
                kind: "knowledge type",
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for KnowledgeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightType {
    Solution,
    Lesson,
    Pattern,
    Decision,
}

impl InsightType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InsightType::Solution => "solution",
            InsightType::Lesson => "lesson",
            InsightType::Pattern => "pattern",
            InsightType::Decision => "decision",
        }
    }
}

impl FromStr for InsightType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "solution" => Ok(InsightType::Solution),
            "lesson" => Ok(InsightType::Lesson),
            "pattern" => Ok(InsightType::Pattern),
            "decision" => Ok(InsightType::Decision),
            _ => Err(UnknownVariant {
                kind: "insight type",
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for InsightType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What part of a project's documentation a file belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocType {
    Background,
    Requirements,
    Architecture,
    Design,
    Implementation,
    Progress,
    Testing,
    Deployment,
    Delivery,
}

impl DocType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocType::Background => "background",
            DocType::Requirements => "requirements",
            DocType::Architecture => "architecture",
            DocType::Design => "design",
            DocType::Implementation => "implementation",
            DocType::Progress => "progress",
            DocType::Testing => "testing",
            DocType::Deployment => "deployment",
            DocType::Delivery => "delivery",
        }
    }
}

impl FromStr for DocType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "background" => Ok(DocType::Background),
            "requirement" | "requirements" => Ok(DocType::Requirements),
            "arch" | "architecture" => Ok(DocType::Architecture),
            "design" => Ok(DocType::Design),
            "implementation" => Ok(DocType::Implementation),
            "progress" => Ok(DocType::Progress),
            "testing" => Ok(DocType::Testing),
            "deploy" | "deployment" => Ok(DocType::Deployment),
            "delivery" => Ok(DocType::Delivery),
            _ => Err(UnknownVariant {
                kind: "doc type",
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for DocType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a block ages out of relevance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DecayRule {
    #[default]
    #[serde(rename = "none")]
    None,
    /// Expires thirty days after it was written
    #[serde(rename = "time_30d")]
    Time30Days,
    /// Stays until the next version of its source replaces it
    #[serde(rename = "version_only")]
    VersionOnly,
}

impl DecayRule {
    const THIRTY_DAYS: i64 = 30;

    pub fn for_doc_type(doc_type: Option<DocType>) -> Self {
        match doc_type {
            Some(DocType::Progress) => DecayRule::Time30Days,
            Some(DocType::Deployment | DocType::Delivery) => DecayRule::VersionOnly,
            _ => DecayRule::None,
        }
    }

    /// Expiry of a block written at `now`.
    pub fn expires_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            DecayRule::Time30Days => Some(now + chrono::Duration::days(Self::THIRTY_DAYS)),
            DecayRule::None | DecayRule::VersionOnly => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DecayRule::None => "none",
            DecayRule::Time30Days => "time_30d",
            DecayRule::VersionOnly => "version_only",
        }
    }
}

impl FromStr for DecayRule {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" | "none" => Ok(DecayRule::None),
            "time_30d" => Ok(DecayRule::Time30Days),
            "version_only" => Ok(DecayRule::VersionOnly),
            _ => Err(UnknownVariant {
                kind: "decay rule",
                value: s.to_string(),
            }),
        }
    }
}

/// Up to three directory levels of a source below its root, skipping
/// `docs`, `doc` and `specs`. The file stem fills the last used level.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Categories {
    pub l1: Option<String>,
    pub l2: Option<String>,
    pub l3: Option<String>,
}

impl Categories {
    const SKIPPED: [&'static str; 3] = ["docs", "doc", "specs"];

    /// Categories of a `/`-separated path relative to its root.
    pub fn from_relative(relative: &str) -> Self {
        let parts: Vec<&str> = relative.split('/').filter(|p| !p.is_empty()).collect();
        let last = parts.len().saturating_sub(1);
        let mut levels = parts
            .iter()
            .enumerate()
            .filter(|(_, part)| !Self::SKIPPED.contains(*part))
            .map(|(i, part)| {
                if i == last {
                    Path::new(part)
                        .file_stem()
                        .map(|s| s.to_string_lossy().into_owned())
                        .unwrap_or_else(|| part.to_string())
                } else {
                    part.to_string()
                }
            })
            .filter(|part| !part.is_empty());

        Self {
            l1: levels.next(),
            l2: levels.next(),
            l3: levels.next(),
        }
    }
}

/// Trim, drop empties and de-duplicate while keeping first-seen order.
pub fn normalize_tags<I, S>(tags: I) -> Tags
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    tags.into_iter()
        .map(|t| t.as_ref().trim().to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Canonical string form of a source path: absolute with `/` separators.
pub fn source_key(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// Who is producing knowledge. Fixed at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectIdentity {
    pub project_id: String,
    pub name: String,
    pub roots: Vec<PathBuf>,
    pub host_id: String,
}

impl ProjectIdentity {
    pub fn new(project_id: impl Into<String>, roots: Vec<PathBuf>, host_id: impl Into<String>) -> Self {
        let project_id = project_id.into();
        Self {
            name: project_id.clone(),
            project_id,
            roots,
            host_id: host_id.into(),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        let project_id = settings.project.default_project_id.trim().to_string();
        let name = settings
            .project
            .name
            .clone()
            .unwrap_or_else(|| project_id.clone());
        Self {
            project_id,
            name,
            roots: settings.watcher.roots.clone(),
            host_id: host_identifier(),
        }
    }
}

/// Reference from one block to a related block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelatedRef {
    pub id: BlockId,
    pub relation: String,
    pub score: f32,
}

/// An existing block close to some query vector.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub id: BlockId,
    pub source_path: String,
    pub title: String,
    pub knowledge_type: KnowledgeType,
    pub score: f32,
}

/// A structured knowledge record derived from one source document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeBlock {
    pub id: BlockId,
    pub project_id: String,
    pub source_path: String,
    /// Position within the source's block list
    pub seq: usize,
    pub knowledge_type: KnowledgeType,
    pub insight_type: Option<InsightType>,
    pub title: String,
    pub body: String,
    pub summary: Option<String>,
    pub tags: Tags,
    #[serde(default)]
    pub related: Vec<RelatedRef>,
    pub content_fingerprint: String,
    #[serde(default)]
    pub categories: Categories,
    pub doc_type: Option<DocType>,
    #[serde(default)]
    pub decay_rule: DecayRule,
    /// Set for time-decaying blocks; expired blocks are hidden from queries
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub host_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl KnowledgeBlock {
    /// Text embedded for semantic retrieval.
    pub fn searchable_text(&self) -> String {
        searchable_text(&self.title, &self.body)
    }
}

pub fn searchable_text(title: &str, body: &str) -> String {
    format!("{title}\n\n{body}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_id_is_stable_and_distinct() {
        let a = BlockId::derive("global", "/kb/docs/a.md", 0);
        let b = BlockId::derive("global", "/kb/docs/a.md", 0);
        let c = BlockId::derive("global", "/kb/docs/a.md", 1);
        let d = BlockId::derive("other", "/kb/docs/a.md", 0);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(a.as_str().len(), 32);
    }

    #[test]
    fn test_knowledge_type_parsing() {
        assert_eq!("Insight".parse::<KnowledgeType>().unwrap(), KnowledgeType::Insight);
        assert_eq!(
            "dialogue-extract".parse::<KnowledgeType>().unwrap(),
            KnowledgeType::DialogueExtract
        );
        assert!("recipe".parse::<KnowledgeType>().is_err());
        assert_eq!(" lesson ".parse::<InsightType>().unwrap(), InsightType::Lesson);
    }

    #[test]
    fn test_normalize_tags_keeps_order() {
        let tags = normalize_tags(["golang", " migration", "", "golang", "db "]);
        let tags: Vec<_> = tags.into_iter().collect();
        assert_eq!(tags, vec!["golang", "migration", "db"]);
    }

    #[test]
    fn test_categories_skip_doc_roots_and_strip_extension() {
        let c = Categories::from_relative("docs/arch/storage/wal.md");
        assert_eq!(c.l1.as_deref(), Some("arch"));
        assert_eq!(c.l2.as_deref(), Some("storage"));
        assert_eq!(c.l3.as_deref(), Some("wal"));

        let c = Categories::from_relative("insights/caching.md");
        assert_eq!(c.l1.as_deref(), Some("insights"));
        assert_eq!(c.l2.as_deref(), Some("caching"));
        assert_eq!(c.l3, None);

        assert_eq!(Categories::from_relative(""), Categories::default());
    }

    #[test]
    fn test_decay_follows_doc_type() {
        let now = Utc::now();
        let progress = DecayRule::for_doc_type(Some(DocType::Progress));
        assert_eq!(progress, DecayRule::Time30Days);
        assert_eq!(progress.expires_at(now), Some(now + chrono::Duration::days(30)));

        assert_eq!(DecayRule::for_doc_type(Some(DocType::Delivery)), DecayRule::VersionOnly);
        assert_eq!(DecayRule::VersionOnly.expires_at(now), None);
        assert_eq!(DecayRule::for_doc_type(None), DecayRule::None);
        assert_eq!("time_30d".parse::<DecayRule>().unwrap(), DecayRule::Time30Days);
        assert_eq!("deploy".parse::<DocType>().unwrap(), DocType::Deployment);
    }

    #[test]
    fn test_serde_names_are_snake_case() {
        let json = serde_json::to_string(&KnowledgeType::DialogueExtract).unwrap();
        assert_eq!(json, "\"dialogue_extract\"");
    }
}
