//! Remote roles over an OpenAI-compatible chat-completions endpoint.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};

use crate::config::LlmConfig;
use crate::documents::title::{TitleSource, derive_title, truncate_chars};
use crate::documents::SourceDocument;
use crate::types::{InsightType, KnowledgeBlock, KnowledgeType, Neighbor, RelatedRef, normalize_tags};

use super::error::RoleError;
use super::heuristic::fallback_tags;
use super::roles::{ArbitrationDecision, Arbiter, BlockDraft, Extractor, RelationLinker, Summary, Summarizer};

const CACHE_TTL: Duration = Duration::from_secs(30 * 60);
const CACHE_CAPACITY: usize = 500;

/// Longest document excerpt sent for extraction, in characters.
const EXTRACT_INPUT_CHARS: usize = 12_000;
const SUMMARY_INPUT_CHARS: usize = 12_000;
const ARBITRATE_INPUT_CHARS: usize = 4_000;

struct CacheEntry {
    value: String,
    inserted_at: Instant,
    /// Insertion order, for eviction
    seq: u64,
}

/// Bounded response cache with expiry.
///
/// When full, the oldest entries are evicted down to 90% of capacity.
pub struct LlmCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    next_seq: AtomicU64,
    ttl: Duration,
    capacity: usize,
}

impl Default for LlmCache {
    fn default() -> Self {
        Self::new(CACHE_TTL, CACHE_CAPACITY)
    }
}

impl LlmCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
            ttl,
            capacity: capacity.max(1),
        }
    }

    pub fn key(model: &str, role: &str, input: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(model.as_bytes());
        hasher.update(b"|");
        hasher.update(role.as_bytes());
        hasher.update(b"|");
        hasher.update(input.as_bytes());
        format!("{role}:{:x}", hasher.finalize())
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.inserted_at.elapsed() < self.ttl => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, key: String, value: String) {
        let mut entries = self.entries.lock();
        let ttl = self.ttl;
        entries.retain(|_, e| e.inserted_at.elapsed() < ttl);

        if entries.len() >= self.capacity {
            let target = self.capacity - self.capacity / 10;
            let mut by_age: Vec<(String, u64)> =
                entries.iter().map(|(k, e)| (k.clone(), e.seq)).collect();
            by_age.sort_by_key(|(_, at)| *at);
            let excess = (entries.len() + 1).saturating_sub(target);
            for (key, _) in by_age.into_iter().take(excess) {
                entries.remove(&key);
            }
        }

        entries.insert(
            key,
            CacheEntry {
                value,
                inserted_at: Instant::now(),
                seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

/// Shared chat-completions client used by every remote role.
pub struct ChatClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    timeout: Duration,
    cache: LlmCache,
}

impl ChatClient {
    pub fn new(api_key: String, base_url: &str, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
            cache: LlmCache::default(),
        }
    }

    pub fn from_config(config: &LlmConfig, timeout: Duration) -> Result<Self, RoleError> {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| RoleError::Unavailable {
                role: "llm",
                reason: format!("environment variable {} is not set", config.api_key_env),
            })?;
        Ok(Self::new(api_key, &config.base_url, timeout))
    }

    /// Single-turn completion, served from cache when possible.
    pub async fn complete(
        &self,
        role: &'static str,
        model: &str,
        prompt: &str,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String, RoleError> {
        let key = LlmCache::key(model, role, prompt);
        if let Some(hit) = self.cache.get(&key) {
            crate::debug_event!("llm", "cache hit", "{role}");
            return Ok(hit);
        }

        let request = serde_json::json!({
            "model": model,
            "messages": [{ "role": "user", "content": prompt }],
            "temperature": temperature,
            "max_tokens": max_tokens,
        });

        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| RoleError::Request {
                role,
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            let reason = format!("API error ({status}): {error_text}");
            return Err(match status.as_u16() {
                401 | 403 | 404 => RoleError::Unavailable { role, reason },
                _ => RoleError::Request { role, reason },
            });
        }

        let parsed: ChatResponse = response.json().await.map_err(|e| RoleError::InvalidResponse {
            role,
            reason: format!("Failed to parse response: {e}"),
        })?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .ok_or_else(|| RoleError::InvalidResponse {
                role,
                reason: "No content in response".to_string(),
            })?;

        self.cache.insert(key, content.clone());
        Ok(content)
    }
}

/// Parse model output as JSON, tolerating code fences and a `json` prefix.
pub fn parse_json<T: DeserializeOwned>(role: &'static str, raw: &str) -> Result<T, RoleError> {
    let mut text = raw.trim();
    if let Some(inner) = text.strip_prefix("```") {
        text = inner;
        if let Some(end) = text.rfind("```") {
            text = &text[..end];
        }
    }
    let text = text.trim();
    let text = text
        .strip_prefix("json")
        .or_else(|| text.strip_prefix("JSON"))
        .unwrap_or(text)
        .trim();

    serde_json::from_str(text).map_err(|e| RoleError::InvalidResponse {
        role,
        reason: format!("{e}: {}", truncate_chars(text, 200)),
    })
}

#[derive(Deserialize)]
struct RawDraft {
    #[serde(default)]
    knowledge_type: Option<String>,
    #[serde(default)]
    insight_type: Option<String>,
    #[serde(default)]
    title: String,
    #[serde(default)]
    body: String,
    #[serde(default)]
    tags: Vec<String>,
}

pub struct LlmExtractor {
    client: Arc<ChatClient>,
    model: String,
}

impl LlmExtractor {
    pub fn new(client: Arc<ChatClient>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }

    fn prompt(doc: &SourceDocument) -> String {
        format!(
            "You maintain a knowledge base. Split the document below into one or more \
             self-contained knowledge blocks.\n\
             Respond with a JSON array only. Each element has:\n\
             - \"knowledge_type\": \"doc\", \"insight\" or \"dialogue_extract\"\n\
             - \"insight_type\": \"solution\", \"lesson\", \"pattern\", \"decision\" or null\n\
             - \"title\": a short title\n\
             - \"body\": the block text, quoted from the document where possible\n\
             - \"tags\": 3 to 10 short tags\n\n\
             Path: {}\n\nDocument:\n{}",
            doc.source_path,
            truncate_chars(&doc.body, EXTRACT_INPUT_CHARS)
        )
    }

    fn into_draft(raw: RawDraft, file_stem: &str) -> Option<BlockDraft> {
        let body = raw.body.trim().to_string();
        if body.is_empty() {
            return None;
        }
        let knowledge_type = raw
            .knowledge_type
            .as_deref()
            .and_then(|k| k.parse::<KnowledgeType>().ok())
            .unwrap_or(KnowledgeType::Doc);
        let insight_type = raw
            .insight_type
            .as_deref()
            .and_then(|k| k.parse::<InsightType>().ok())
            .filter(|_| knowledge_type == KnowledgeType::Insight);

        let (title, title_source) = match raw.title.trim() {
            "" => derive_title(None, &body, file_stem),
            title => (title.to_string(), TitleSource::Generated),
        };

        let mut tags = normalize_tags(raw.tags);
        if tags.is_empty() {
            tags = normalize_tags(fallback_tags(&body));
        }

        Some(BlockDraft {
            knowledge_type,
            insight_type,
            title,
            title_source,
            body,
            tags,
        })
    }
}

#[async_trait]
impl Extractor for LlmExtractor {
    async fn extract(&self, doc: &SourceDocument) -> Result<Vec<BlockDraft>, RoleError> {
        let raw = self
            .client
            .complete("extract", &self.model, &Self::prompt(doc), 0.2, 2_000)
            .await?;
        let drafts: Vec<RawDraft> = parse_json("extract", &raw)?;

        let stem = Path::new(&doc.source_path)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(drafts
            .into_iter()
            .filter_map(|d| Self::into_draft(d, &stem))
            .collect())
    }
}

#[derive(Deserialize)]
struct RawSummary {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    summary: String,
}

pub struct LlmSummarizer {
    client: Arc<ChatClient>,
    model: String,
}

impl LlmSummarizer {
    pub fn new(client: Arc<ChatClient>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }
}

#[async_trait]
impl Summarizer for LlmSummarizer {
    async fn summarize(&self, title: &str, body: &str) -> Result<Summary, RoleError> {
        let prompt = format!(
            "Condense the text below into a 3-5 sentence summary that keeps its core \
             conclusions, plus a short title.\n\
             Respond with JSON only: {{\"title\": \"...\", \"summary\": \"...\"}}\n\n\
             Title: {title}\n\nText:\n{}",
            truncate_chars(body, SUMMARY_INPUT_CHARS)
        );
        let raw = self.client.complete("summarize", &self.model, &prompt, 0.2, 400).await?;
        let parsed: RawSummary = parse_json("summarize", &raw)?;

        let body = parsed.summary.trim().to_string();
        if body.is_empty() {
            return Err(RoleError::InvalidResponse {
                role: "summarize",
                reason: "empty summary".to_string(),
            });
        }
        Ok(Summary {
            title: parsed.title.map(|t| t.trim().to_string()).filter(|t| !t.is_empty()),
            body,
        })
    }
}

#[derive(Deserialize)]
struct RawRelation {
    id: String,
    #[serde(default)]
    relation: Option<String>,
    #[serde(default)]
    score: Option<f32>,
}

pub struct LlmRelationLinker {
    client: Arc<ChatClient>,
    model: String,
}

impl LlmRelationLinker {
    pub fn new(client: Arc<ChatClient>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }
}

#[async_trait]
impl RelationLinker for LlmRelationLinker {
    async fn link(&self, draft: &BlockDraft, neighbors: &[Neighbor]) -> Result<Vec<RelatedRef>, RoleError> {
        if neighbors.is_empty() {
            return Ok(Vec::new());
        }

        let listing = neighbors
            .iter()
            .map(|n| format!("- id={} type={} title={}", n.id, n.knowledge_type, n.title))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            "A new knowledge block is being added. Decide which existing blocks it is \
             related to and how (for example \"extends\", \"contradicts\", \"duplicates\", \
             \"related\").\n\
             Respond with a JSON array only: [{{\"id\": \"...\", \"relation\": \"...\", \
             \"score\": 0.0-1.0}}]. Use only ids from the list; return [] if none apply.\n\n\
             New block: {}\n{}\n\nExisting blocks:\n{listing}",
            draft.title,
            truncate_chars(&draft.body, ARBITRATE_INPUT_CHARS)
        );
        let raw = self.client.complete("relate", &self.model, &prompt, 0.1, 400).await?;
        let relations: Vec<RawRelation> = parse_json("relate", &raw)?;

        Ok(relations
            .into_iter()
            .filter_map(|r| {
                let neighbor = neighbors.iter().find(|n| n.id.as_str() == r.id)?;
                Some(RelatedRef {
                    id: neighbor.id.clone(),
                    relation: r
                        .relation
                        .map(|s| s.trim().to_lowercase())
                        .filter(|s| !s.is_empty())
                        .unwrap_or_else(|| "related".to_string()),
                    score: r.score.unwrap_or(neighbor.score).clamp(0.0, 1.0),
                })
            })
            .collect())
    }
}

pub struct LlmArbiter {
    client: Arc<ChatClient>,
    model: String,
}

impl LlmArbiter {
    pub fn new(client: Arc<ChatClient>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }

    /// Map the model's one-word answer; unrecognized answers keep both.
    pub fn parse_decision(raw: &str) -> ArbitrationDecision {
        let answer = raw.trim().to_uppercase();
        if answer.contains("REPLACE") {
            ArbitrationDecision::Replace
        } else if answer.contains("MERGE") || answer.contains("SKIP") {
            ArbitrationDecision::MergeTags
        } else {
            ArbitrationDecision::KeepBoth
        }
    }
}

#[async_trait]
impl Arbiter for LlmArbiter {
    async fn arbitrate(
        &self,
        existing: &KnowledgeBlock,
        candidate: &KnowledgeBlock,
    ) -> Result<ArbitrationDecision, RoleError> {
        let text = |b: &KnowledgeBlock| {
            truncate_chars(b.summary.as_deref().unwrap_or(&b.body), ARBITRATE_INPUT_CHARS)
        };
        let prompt = format!(
            "You curate a knowledge base. Compare the existing block with the new one.\n\n\
             Existing: {}\n{}\n\nNew: {}\n{}\n\n\
             Answer REPLACE if the new block is an update or correction of the same topic, \
             KEEP_BOTH if they cover different topics that merely read alike, or MERGE_TAGS \
             if they are essentially identical.\n\
             Answer with exactly one word: REPLACE, KEEP_BOTH or MERGE_TAGS.",
            existing.title,
            text(existing),
            candidate.title,
            text(candidate)
        );
        let raw = self.client.complete("arbitrate", &self.model, &prompt, 0.1, 20).await?;
        Ok(Self::parse_decision(&raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_json_strips_fences() {
        let raw = "```json\n[{\"id\": \"a\"}]\n```";
        let parsed: Vec<serde_json::Value> = parse_json("test", raw).unwrap();
        assert_eq!(parsed.len(), 1);

        let bare: serde_json::Value = parse_json("test", " {\"title\": \"x\"} ").unwrap();
        assert_eq!(bare["title"], "x");

        assert!(parse_json::<Vec<serde_json::Value>>("test", "not json").is_err());
    }

    #[test]
    fn test_cache_expires_entries() {
        let cache = LlmCache::new(Duration::ZERO, 10);
        cache.insert("k".to_string(), "v".to_string());
        assert!(cache.get("k").is_none());
    }

    #[test]
    fn test_cache_evicts_oldest_when_full() {
        let cache = LlmCache::new(Duration::from_secs(60), 10);
        for i in 0..10 {
            cache.insert(format!("k{i}"), i.to_string());
        }
        assert_eq!(cache.len(), 10);

        cache.insert("k10".to_string(), "10".to_string());
        // Evicted down to 90% of capacity before the insert
        assert_eq!(cache.len(), 9);
        assert!(cache.get("k0").is_none());
        assert_eq!(cache.get("k10").as_deref(), Some("10"));
    }

    #[test]
    fn test_cache_key_depends_on_model_and_role() {
        let a = LlmCache::key("m1", "extract", "text");
        assert_eq!(a, LlmCache::key("m1", "extract", "text"));
        assert_ne!(a, LlmCache::key("m2", "extract", "text"));
        assert_ne!(a, LlmCache::key("m1", "summarize", "text"));
    }

    #[test]
    fn test_parse_decision() {
        assert_eq!(LlmArbiter::parse_decision("replace"), ArbitrationDecision::Replace);
        assert_eq!(LlmArbiter::parse_decision(" MERGE_TAGS\n"), ArbitrationDecision::MergeTags);
        assert_eq!(LlmArbiter::parse_decision("SKIP"), ArbitrationDecision::MergeTags);
        assert_eq!(LlmArbiter::parse_decision("KEEP_BOTH"), ArbitrationDecision::KeepBoth);
        assert_eq!(LlmArbiter::parse_decision("unsure"), ArbitrationDecision::KeepBoth);
    }

    #[test]
    fn test_raw_draft_conversion() {
        let raw = RawDraft {
            knowledge_type: Some("insight".to_string()),
            insight_type: Some("lesson".to_string()),
            title: String::new(),
            body: "# Retry budgets\n\nCap retries.".to_string(),
            tags: Vec::new(),
        };
        let draft = LlmExtractor::into_draft(raw, "notes").unwrap();
        assert_eq!(draft.knowledge_type, KnowledgeType::Insight);
        assert_eq!(draft.insight_type, Some(InsightType::Lesson));
        assert_eq!(draft.title, "Retry budgets");
        assert!(!draft.tags.is_empty());

        let empty = RawDraft {
            knowledge_type: None,
            insight_type: None,
            title: "t".to_string(),
            body: "  ".to_string(),
            tags: Vec::new(),
        };
        assert!(LlmExtractor::into_draft(empty, "notes").is_none());
    }
}
