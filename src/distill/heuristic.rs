//! Deterministic offline roles.
//!
//! Used when `llm.mode = "offline"`: no network, same inputs give same outputs.

use std::collections::HashSet;

use async_trait::async_trait;

use crate::documents::SourceDocument;
use crate::documents::classify::DIALOGUE_DIRS;
use crate::types::{InsightType, KnowledgeBlock, KnowledgeType, Neighbor, RelatedRef};

use super::error::RoleError;
use super::roles::{ArbitrationDecision, Arbiter, BlockDraft, Extractor, RelationLinker, Summary, Summarizer};

/// Lines kept by [`FirstLinesSummarizer`].
const SUMMARY_LINES: usize = 3;

/// Word overlap above which a candidate is treated as an update of the old block.
const REPLACE_OVERLAP: f64 = 0.5;

/// Classifies a whole document by the directories on its path.
///
/// Dialogue exports come first, then insight directories, then plain docs.
#[derive(Debug, Default, Clone, Copy)]
pub struct PathRuleExtractor;

impl PathRuleExtractor {
    pub fn classify(source_path: &str) -> (KnowledgeType, Option<InsightType>) {
        let lowered = source_path.to_lowercase();
        let has_dir = |name: &str| lowered.contains(&format!("/{name}/"));

        if DIALOGUE_DIRS.iter().any(|d| has_dir(d)) {
            (KnowledgeType::DialogueExtract, None)
        } else if has_dir("insights") {
            (KnowledgeType::Insight, Some(InsightType::Pattern))
        } else if has_dir("lessons") || has_dir("postmortem") || has_dir("postmortems") {
            (KnowledgeType::Insight, Some(InsightType::Lesson))
        } else {
            (KnowledgeType::Doc, None)
        }
    }
}

#[async_trait]
impl Extractor for PathRuleExtractor {
    async fn extract(&self, doc: &SourceDocument) -> Result<Vec<BlockDraft>, RoleError> {
        let (knowledge_type, insight_type) = Self::classify(&doc.source_path);
        let mut draft = BlockDraft::whole_document(doc, knowledge_type);
        draft.insight_type = doc.insight_type.or(insight_type);
        Ok(vec![draft])
    }
}

/// Keeps the first few non-blank lines of the body.
#[derive(Debug, Default, Clone, Copy)]
pub struct FirstLinesSummarizer;

#[async_trait]
impl Summarizer for FirstLinesSummarizer {
    async fn summarize(&self, _title: &str, body: &str) -> Result<Summary, RoleError> {
        let lines: Vec<&str> = body
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .take(SUMMARY_LINES)
            .collect();
        Ok(Summary {
            title: None,
            body: lines.join(" "),
        })
    }
}

/// Relates a draft to every neighbour the similarity search returned.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThroughLinker;

#[async_trait]
impl RelationLinker for PassThroughLinker {
    async fn link(&self, _draft: &BlockDraft, neighbors: &[Neighbor]) -> Result<Vec<RelatedRef>, RoleError> {
        Ok(neighbors
            .iter()
            .map(|n| RelatedRef {
                id: n.id.clone(),
                relation: "related".to_string(),
                score: n.score,
            })
            .collect())
    }
}

/// Word-overlap arbitration.
///
/// Identical text merges tags into the candidate. More than half of the
/// candidate's words already present means an update. Anything else keeps both.
#[derive(Debug, Default, Clone, Copy)]
pub struct OverlapArbiter;

impl OverlapArbiter {
    pub fn decide(new_text: &str, old_text: &str) -> ArbitrationDecision {
        if new_text.trim() == old_text.trim() {
            return ArbitrationDecision::MergeTags;
        }

        let new_words: Vec<&str> = new_text.split_whitespace().collect();
        let old_words: HashSet<&str> = old_text.split_whitespace().collect();
        if new_words.is_empty() || old_words.is_empty() {
            return ArbitrationDecision::KeepBoth;
        }

        let overlap = new_words.iter().filter(|w| old_words.contains(*w)).count();
        if overlap as f64 / new_words.len() as f64 > REPLACE_OVERLAP {
            ArbitrationDecision::Replace
        } else {
            ArbitrationDecision::KeepBoth
        }
    }
}

#[async_trait]
impl Arbiter for OverlapArbiter {
    async fn arbitrate(
        &self,
        existing: &KnowledgeBlock,
        candidate: &KnowledgeBlock,
    ) -> Result<ArbitrationDecision, RoleError> {
        Ok(Self::decide(
            candidate.summary.as_deref().unwrap_or(&candidate.body),
            existing.summary.as_deref().unwrap_or(&existing.body),
        ))
    }
}

/// Alphanumeric tokens of at least two characters, at most ten.
pub fn fallback_tags(content: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    content
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= 2)
        .map(str::to_lowercase)
        .filter(|t| seen.insert(t.clone()))
        .take(10)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BlockId;
    use chrono::Utc;

    #[test]
    fn test_path_rules() {
        assert_eq!(
            PathRuleExtractor::classify("/kb/insights/caching.md"),
            (KnowledgeType::Insight, Some(InsightType::Pattern))
        );
        assert_eq!(
            PathRuleExtractor::classify("/kb/Lessons/outage.md"),
            (KnowledgeType::Insight, Some(InsightType::Lesson))
        );
        assert_eq!(
            PathRuleExtractor::classify("/kb/postmortem/db.md"),
            (KnowledgeType::Insight, Some(InsightType::Lesson))
        );
        assert_eq!(PathRuleExtractor::classify("/kb/docs/api.md"), (KnowledgeType::Doc, None));
        assert_eq!(PathRuleExtractor::classify("/kb/docs/insights.md"), (KnowledgeType::Doc, None));
        assert_eq!(
            PathRuleExtractor::classify("/kb/.claude/insights/chat.md"),
            (KnowledgeType::DialogueExtract, None)
        );
    }

    #[tokio::test]
    async fn test_extractor_yields_one_draft() {
        let doc = SourceDocument::from_content("/kb/insights/x.md", "# Cache\n\nWarm it up.", Utc::now());
        let drafts = PathRuleExtractor.extract(&doc).await.unwrap();
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].title, "Cache");
        assert_eq!(drafts[0].knowledge_type, KnowledgeType::Insight);
    }

    #[tokio::test]
    async fn test_first_lines_summary() {
        let summary = FirstLinesSummarizer
            .summarize("t", "one\n\n two \nthree\nfour")
            .await
            .unwrap();
        assert_eq!(summary.body, "one two three");
        assert!(summary.title.is_none());
    }

    #[test]
    fn test_overlap_decisions() {
        assert_eq!(OverlapArbiter::decide(" same text ", "same text"), ArbitrationDecision::MergeTags);
        assert_eq!(
            OverlapArbiter::decide("retry the flaky db call", "retry the db call twice"),
            ArbitrationDecision::Replace
        );
        assert_eq!(
            OverlapArbiter::decide("completely different topic here", "retry the db call"),
            ArbitrationDecision::KeepBoth
        );
        assert_eq!(OverlapArbiter::decide("", "old"), ArbitrationDecision::KeepBoth);
    }

    #[tokio::test]
    async fn test_pass_through_linker() {
        let draft = BlockDraft {
            knowledge_type: KnowledgeType::Doc,
            insight_type: None,
            title: "t".to_string(),
            title_source: crate::documents::TitleSource::Heading,
            body: "b".to_string(),
            tags: Default::default(),
        };
        let neighbors = vec![Neighbor {
            id: BlockId::from_raw("n1"),
            source_path: "/kb/b.md".to_string(),
            title: "other".to_string(),
            knowledge_type: KnowledgeType::Doc,
            score: 0.91,
        }];
        let related = PassThroughLinker.link(&draft, &neighbors).await.unwrap();
        assert_eq!(related.len(), 1);
        assert_eq!(related[0].relation, "related");
    }

    #[test]
    fn test_fallback_tags() {
        let tags = fallback_tags("Go, go! a DB-migration; db x");
        assert_eq!(tags, vec!["go", "db", "migration"]);
    }
}
