//! Per-slot merge of freshly distilled candidates into a source's block set.
//!
//! Pure: all model calls happen before, their answers arrive as `decisions`.

use std::collections::HashMap;

use crate::types::{BlockId, KnowledgeBlock};

use super::roles::ArbitrationDecision;

/// Final block set for one source.
///
/// Candidates keep their slots. A candidate whose slot was occupied by an
/// existing block is resolved by its decision (missing means `Replace`):
///
/// - `Replace`: the candidate wins.
/// - `MergeTags`: the candidate wins and the existing block's tags are
///   unioned into it.
/// - `KeepBoth`: the candidate wins the slot and the existing block is moved to
///   a fresh slot appended after all candidates.
///
/// Existing blocks with no candidate in their slot are dropped. Every returned
/// block carries `fingerprint`.
pub fn arbitrate(
    existing: &[KnowledgeBlock],
    candidates: Vec<KnowledgeBlock>,
    decisions: &HashMap<BlockId, ArbitrationDecision>,
    fingerprint: &str,
) -> Vec<KnowledgeBlock> {
    let by_id: HashMap<&BlockId, &KnowledgeBlock> = existing.iter().map(|b| (&b.id, b)).collect();

    let mut resolved = Vec::with_capacity(candidates.len());
    let mut displaced = Vec::new();

    for candidate in candidates {
        let Some(old) = by_id.get(&candidate.id).copied() else {
            resolved.push(candidate);
            continue;
        };

        match decisions
            .get(&candidate.id)
            .copied()
            .unwrap_or(ArbitrationDecision::Replace)
        {
            ArbitrationDecision::Replace => resolved.push(candidate),
            ArbitrationDecision::MergeTags => {
                let mut merged = candidate;
                merged.tags.extend(old.tags.iter().cloned());
                resolved.push(merged);
            }
            ArbitrationDecision::KeepBoth => {
                resolved.push(candidate);
                displaced.push(old.clone());
            }
        }
    }

    let mut next_seq = resolved.len();
    for mut block in displaced {
        block.seq = next_seq;
        block.id = BlockId::derive(&block.project_id, &block.source_path, next_seq);
        next_seq += 1;
        resolved.push(block);
    }

    for block in &mut resolved {
        block.content_fingerprint = fingerprint.to_string();
    }
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Categories, DecayRule, KnowledgeType, RelatedRef, normalize_tags};
    use chrono::Utc;

    fn block(seq: usize, title: &str, tags: &[&str]) -> KnowledgeBlock {
        let now = Utc::now();
        KnowledgeBlock {
            id: BlockId::derive("p", "/kb/a.md", seq),
            project_id: "p".to_string(),
            source_path: "/kb/a.md".to_string(),
            seq,
            knowledge_type: KnowledgeType::Doc,
            insight_type: None,
            title: title.to_string(),
            body: format!("{title} body"),
            summary: None,
            tags: normalize_tags(tags.iter().copied()),
            related: Vec::new(),
            content_fingerprint: "old".to_string(),
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

    #[test]
    fn test_no_existing_passes_candidates_through() {
        let out = arbitrate(&[], vec![block(0, "a", &[]), block(1, "b", &[])], &HashMap::new(), "new");
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|b| b.content_fingerprint == "new"));
    }

    #[test]
    fn test_replace_is_default() {
        let existing = vec![block(0, "old", &[])];
        let out = arbitrate(&existing, vec![block(0, "new", &[])], &HashMap::new(), "f");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].title, "new");
    }

    #[test]
    fn test_merge_tags_keeps_candidate_content() {
        let existing = vec![block(0, "old", &["a", "b"])];
        let mut candidate = block(0, "new", &["c", "a"]);
        candidate.related = vec![RelatedRef {
            id: BlockId::from_raw("x"),
            relation: "related".to_string(),
            score: 0.9,
        }];
        candidate.summary = Some("fresh".to_string());
        candidate.embedding = Some(vec![1.0, 0.0]);
        let decisions = HashMap::from([(candidate.id.clone(), ArbitrationDecision::MergeTags)]);

        let out = arbitrate(&existing, vec![candidate], &decisions, "f");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].title, "new");
        assert_eq!(out[0].body, "new body");
        assert_eq!(out[0].summary.as_deref(), Some("fresh"));
        assert_eq!(out[0].embedding, Some(vec![1.0, 0.0]));
        let tags: Vec<_> = out[0].tags.iter().map(String::as_str).collect();
        assert_eq!(tags, vec!["c", "a", "b"]);
        assert_eq!(out[0].related.len(), 1);
        assert_eq!(out[0].content_fingerprint, "f");
    }

    #[test]
    fn test_keep_both_appends_existing_in_new_slot() {
        let existing = vec![block(0, "old", &[])];
        let candidates = vec![block(0, "new", &[]), block(1, "second", &[])];
        let decisions = HashMap::from([(candidates[0].id.clone(), ArbitrationDecision::KeepBoth)]);

        let out = arbitrate(&existing, candidates, &decisions, "f");
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].title, "new");
        assert_eq!(out[2].title, "old");
        assert_eq!(out[2].seq, 2);
        assert_eq!(out[2].id, BlockId::derive("p", "/kb/a.md", 2));
    }

    #[test]
    fn test_unmatched_existing_blocks_are_dropped() {
        let existing = vec![block(0, "a", &[]), block(1, "b", &[]), block(2, "c", &[])];
        let out = arbitrate(&existing, vec![block(0, "a2", &[])], &HashMap::new(), "f");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].title, "a2");
    }
}
