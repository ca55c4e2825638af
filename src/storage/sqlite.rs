//! SQLite-backed knowledge store.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use serde::Serialize;

use crate::config::DatabaseLocation;
use crate::semantic::cosine_similarity;
use crate::types::{
    BlockId, Categories, DecayRule, DocType, InsightType, KnowledgeBlock, KnowledgeType, Neighbor,
    RelatedRef, Tags, UnknownVariant,
};

use super::connection::SqlitePool;
use super::error::{StoreError, StoreResult};
use super::locks::SourceLocks;

const COLUMNS: &str = "id, project_id, source_path, seq, knowledge_type, insight_type, title, \
     body, summary, tags, related, content_fingerprint, embedding, host_id, created_at, updated_at, \
     category_l1, category_l2, category_l3, doc_type, decay_rule, expires_at";

/// Read filters for [`KnowledgeStore::query`].
#[derive(Debug, Clone, Default)]
pub struct BlockFilter {
    pub knowledge_type: Option<KnowledgeType>,
    pub insight_type: Option<InsightType>,
    /// Match blocks carrying any of these tags (case-insensitive)
    pub tags: Vec<String>,
    pub source_path: Option<String>,
    /// Substring of title or body
    pub text: Option<String>,
    /// First-level category
    pub category: Option<String>,
    pub doc_type: Option<DocType>,
    /// Also return blocks whose `expires_at` has passed
    pub include_expired: bool,
    pub limit: Option<usize>,
}

/// What a replace did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReplaceOutcome {
    pub removed: usize,
    pub written: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub blocks: u64,
    pub sources: u64,
    pub pending_embeddings: u64,
    pub expired: u64,
    pub by_type: Vec<(String, u64)>,
    /// Committed mutations since this handle was opened
    pub mutations: u64,
}

/// Durable, project-scoped store of knowledge blocks.
///
/// Writes to one `(project_id, source_path)` are mutually exclusive; writes to
/// different sources only contend on SQLite's single writer for the duration of
/// their transaction. Readers see either the old or the new set of a source.
#[derive(Clone)]
pub struct KnowledgeStore {
    pool: SqlitePool,
    locks: Arc<SourceLocks>,
    mutations: Arc<AtomicU64>,
}

impl KnowledgeStore {
    pub fn open(location: &DatabaseLocation) -> StoreResult<Self> {
        Ok(Self::with_pool(SqlitePool::open(location)?))
    }

    pub fn memory() -> StoreResult<Self> {
        Ok(Self::with_pool(SqlitePool::memory()?))
    }

    fn with_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            locks: Arc::new(SourceLocks::new()),
            mutations: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Run a store operation on the blocking pool.
    pub async fn run_blocking<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&KnowledgeStore) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
    }

    /// Atomically swap the block set of one source.
    ///
    /// Blocks whose id already existed keep their `created_at`; every written
    /// block gets `updated_at = now`. An empty `blocks` deletes the source.
    pub fn replace_for_source(
        &self,
        project_id: &str,
        source_path: &str,
        blocks: &[KnowledgeBlock],
    ) -> StoreResult<ReplaceOutcome> {
        for block in blocks {
            validate(block, project_id, source_path)?;
        }

        self.locks.with_source(project_id, source_path, || {
            let prior = self.pool.with_reader(|conn| created_at_by_id(conn, project_id, source_path))?;
            let now = Utc::now();

            let rows = blocks
                .iter()
                .map(|block| {
                    let created_at = prior.get(block.id.as_str()).copied().unwrap_or(block.created_at);
                    PreparedRow::new(block, created_at, now)
                })
                .collect::<StoreResult<Vec<_>>>()?;

            let removed = self.pool.with_writer(|conn| {
                let tx = conn.transaction()?;
                let removed = tx.execute(
                    "DELETE FROM knowledge_blocks WHERE project_id = ?1 AND source_path = ?2",
                    params![project_id, source_path],
                )?;
                {
                    let mut stmt = tx.prepare_cached(&format!(
                        "INSERT INTO knowledge_blocks ({COLUMNS}, needs_embedding) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, \
                         ?17, ?18, ?19, ?20, ?21, ?22, ?23)"
                    ))?;
                    for row in &rows {
                        row.insert(&mut stmt)?;
                    }
                }
                tx.commit()?;
                Ok(removed)
            })?;

            let outcome = ReplaceOutcome {
                removed,
                written: rows.len(),
            };
            if outcome.removed + outcome.written > 0 {
                self.mutations.fetch_add(1, Ordering::SeqCst);
            }
            crate::debug_event!(
                "store",
                "replaced",
                "{source_path}: -{} +{}",
                outcome.removed,
                outcome.written
            );
            Ok(outcome)
        })
    }

    /// Remove every block of one source. Returns the number removed.
    pub fn delete_for_source(&self, project_id: &str, source_path: &str) -> StoreResult<usize> {
        self.locks.with_source(project_id, source_path, || {
            let removed = self.pool.with_writer(|conn| {
                Ok(conn.execute(
                    "DELETE FROM knowledge_blocks WHERE project_id = ?1 AND source_path = ?2",
                    params![project_id, source_path],
                )?)
            })?;
            if removed > 0 {
                self.mutations.fetch_add(1, Ordering::SeqCst);
            }
            Ok(removed)
        })
    }

    /// Current blocks of one source, in sequence order, expired ones included.
    pub fn blocks_for_source(&self, project_id: &str, source_path: &str) -> StoreResult<Vec<KnowledgeBlock>> {
        self.query(
            project_id,
            &BlockFilter {
                source_path: Some(source_path.to_string()),
                include_expired: true,
                ..Default::default()
            },
        )
    }

    pub fn query(&self, project_id: &str, filter: &BlockFilter) -> StoreResult<Vec<KnowledgeBlock>> {
        let mut sql = format!("SELECT {COLUMNS} FROM knowledge_blocks WHERE project_id = ?");
        let mut values = vec![Value::Text(project_id.to_string())];

        if let Some(kind) = filter.knowledge_type {
            sql.push_str(" AND knowledge_type = ?");
            values.push(Value::Text(kind.as_str().to_string()));
        }
        if let Some(kind) = filter.insight_type {
            sql.push_str(" AND insight_type = ?");
            values.push(Value::Text(kind.as_str().to_string()));
        }
        if let Some(path) = &filter.source_path {
            sql.push_str(" AND source_path = ?");
            values.push(Value::Text(path.clone()));
        }
        let tags: Vec<String> = filter
            .tags
            .iter()
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        if !tags.is_empty() {
            let placeholders = vec!["?"; tags.len()].join(", ");
            sql.push_str(&format!(
                " AND EXISTS (SELECT 1 FROM json_each(knowledge_blocks.tags) \
                 WHERE lower(json_each.value) IN ({placeholders}))"
            ));
            values.extend(tags.into_iter().map(Value::Text));
        }
        if let Some(text) = filter.text.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            sql.push_str(" AND (title LIKE ? ESCAPE '\\' OR body LIKE ? ESCAPE '\\')");
            let pattern = format!("%{}%", escape_like(text));
            values.push(Value::Text(pattern.clone()));
            values.push(Value::Text(pattern));
        }
        if let Some(category) = filter.category.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
            sql.push_str(" AND lower(category_l1) = ?");
            values.push(Value::Text(category.to_lowercase()));
        }
        if let Some(doc_type) = filter.doc_type {
            sql.push_str(" AND doc_type = ?");
            values.push(Value::Text(doc_type.as_str().to_string()));
        }
        if !filter.include_expired {
            sql.push_str(" AND (expires_at IS NULL OR expires_at > ?)");
            values.push(Value::Text(timestamp(Utc::now())));
        }
        sql.push_str(" ORDER BY source_path, seq");
        if let Some(limit) = filter.limit {
            sql.push_str(" LIMIT ?");
            values.push(Value::Integer(limit as i64));
        }

        let raw = self.pool.with_reader(|conn| {
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(values.iter()), RawBlock::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        raw.into_iter().map(RawBlock::into_block).collect()
    }

    /// Every source path with at least one block in the project.
    pub fn known_paths(&self, project_id: &str) -> StoreResult<HashSet<String>> {
        self.pool.with_reader(|conn| {
            let mut stmt = conn
                .prepare_cached("SELECT DISTINCT source_path FROM knowledge_blocks WHERE project_id = ?1")?;
            let paths = stmt
                .query_map([project_id], |row| row.get::<_, String>(0))?
                .collect::<Result<HashSet<_>, _>>()?;
            Ok(paths)
        })
    }

    /// Most similar embedded blocks of the project, outside `exclude_source`.
    pub fn nearest(
        &self,
        project_id: &str,
        vector: &[f32],
        exclude_source: &str,
        limit: usize,
        threshold: f32,
    ) -> StoreResult<Vec<Neighbor>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let candidates = self.pool.with_reader(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, source_path, title, knowledge_type, embedding FROM knowledge_blocks \
                 WHERE project_id = ?1 AND source_path != ?2 AND embedding IS NOT NULL",
            )?;
            let rows = stmt
                .query_map(params![project_id, exclude_source], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Vec<u8>>(4)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        let mut neighbors = Vec::new();
        for (id, source_path, title, kind, blob) in candidates {
            let score = cosine_similarity(vector, &decode_embedding(&blob));
            if score < threshold {
                continue;
            }
            let knowledge_type = kind
                .parse()
                .map_err(|e: crate::types::UnknownVariant| StoreError::Corrupt {
                    id: id.clone(),
                    reason: e.to_string(),
                })?;
            neighbors.push(Neighbor {
                id: BlockId::from_raw(id),
                source_path,
                title,
                knowledge_type,
                score,
            });
        }

        neighbors.sort_by(|a, b| b.score.total_cmp(&a.score));
        neighbors.truncate(limit);
        Ok(neighbors)
    }

    /// Blocks persisted without a vector.
    ///
    /// Fewest failed attempts first, then oldest, so blocks that keep failing
    /// sink behind fresh ones instead of filling every page.
    pub fn pending_embeddings(&self, project_id: &str, limit: usize) -> StoreResult<Vec<KnowledgeBlock>> {
        let raw = self.pool.with_reader(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {COLUMNS} FROM knowledge_blocks \
                 WHERE project_id = ?1 AND needs_embedding = 1 \
                 ORDER BY embed_attempts, updated_at LIMIT ?2"
            ))?;
            let rows = stmt
                .query_map(params![project_id, limit as i64], RawBlock::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;
        raw.into_iter().map(RawBlock::into_block).collect()
    }

    /// Attach a vector to a block if it was not re-distilled in the meantime.
    ///
    /// Returns whether the vector was written.
    pub fn set_embedding(&self, block: &KnowledgeBlock, vector: &[f32]) -> StoreResult<bool> {
        self.locks.with_source(&block.project_id, &block.source_path, || {
            let updated = self.pool.with_writer(|conn| {
                Ok(conn.execute(
                    "UPDATE knowledge_blocks SET embedding = ?1, needs_embedding = 0 \
                     WHERE id = ?2 AND content_fingerprint = ?3",
                    params![encode_embedding(vector), block.id.as_str(), block.content_fingerprint],
                )?)
            })?;
            if updated > 0 {
                self.mutations.fetch_add(1, Ordering::SeqCst);
            }
            Ok(updated > 0)
        })
    }

    /// Count a failed background embedding of `block`.
    ///
    /// A no-op when the block was re-distilled since it was read; the rewrite
    /// starts its count from zero.
    pub fn record_embedding_failure(&self, block: &KnowledgeBlock) -> StoreResult<()> {
        self.locks.with_source(&block.project_id, &block.source_path, || {
            self.pool.with_writer(|conn| {
                conn.execute(
                    "UPDATE knowledge_blocks SET embed_attempts = embed_attempts + 1 \
                     WHERE id = ?1 AND content_fingerprint = ?2",
                    params![block.id.as_str(), block.content_fingerprint],
                )?;
                Ok(())
            })
        })
    }

    /// Failed background embeddings recorded for a block.
    pub fn embedding_attempts(&self, id: &BlockId) -> StoreResult<u32> {
        self.pool.with_reader(|conn| {
            let attempts: Option<i64> = conn
                .query_row(
                    "SELECT embed_attempts FROM knowledge_blocks WHERE id = ?1",
                    [id.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(attempts.unwrap_or(0).max(0) as u32)
        })
    }

    pub fn stats(&self, project_id: &str) -> StoreResult<StoreStats> {
        let now = timestamp(Utc::now());
        let mut stats = self.pool.with_reader(|conn| {
            let (blocks, sources, pending, expired): (i64, i64, i64, i64) = conn.query_row(
                "SELECT COUNT(*), COUNT(DISTINCT source_path), COALESCE(SUM(needs_embedding), 0), \
                 COALESCE(SUM(expires_at IS NOT NULL AND expires_at <= ?2), 0) \
                 FROM knowledge_blocks WHERE project_id = ?1",
                params![project_id, now],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )?;

            let mut stmt = conn.prepare_cached(
                "SELECT knowledge_type, COUNT(*) FROM knowledge_blocks \
                 WHERE project_id = ?1 GROUP BY knowledge_type ORDER BY knowledge_type",
            )?;
            let by_type = stmt
                .query_map([project_id], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            Ok(StoreStats {
                blocks: blocks as u64,
                sources: sources as u64,
                pending_embeddings: pending as u64,
                expired: expired as u64,
                by_type,
                mutations: 0,
            })
        })?;
        stats.mutations = self.mutation_count();
        Ok(stats)
    }

    /// Committed mutations since open.
    pub fn mutation_count(&self) -> u64 {
        self.mutations.load(Ordering::SeqCst)
    }
}

fn validate(block: &KnowledgeBlock, project_id: &str, source_path: &str) -> StoreResult<()> {
    let invalid = |reason: &str| StoreError::InvalidBlock {
        id: block.id.to_string(),
        reason: reason.to_string(),
    };
    if block.project_id != project_id || block.source_path != source_path {
        return Err(invalid("block belongs to a different source"));
    }
    if block.title.trim().is_empty() {
        return Err(invalid("title is empty"));
    }
    Ok(())
}

fn created_at_by_id(
    conn: &Connection,
    project_id: &str,
    source_path: &str,
) -> StoreResult<HashMap<String, DateTime<Utc>>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, created_at FROM knowledge_blocks WHERE project_id = ?1 AND source_path = ?2",
    )?;
    let rows = stmt
        .query_map(params![project_id, source_path], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(id, created_at)| {
            let ts = parse_timestamp(&id, &created_at)?;
            Ok((id, ts))
        })
        .collect()
}

/// A block serialized into column values.
struct PreparedRow {
    id: String,
    project_id: String,
    source_path: String,
    seq: i64,
    knowledge_type: &'static str,
    insight_type: Option<&'static str>,
    title: String,
    body: String,
    summary: Option<String>,
    tags: String,
    related: String,
    fingerprint: String,
    embedding: Option<Vec<u8>>,
    host_id: String,
    created_at: String,
    updated_at: String,
    categories: Categories,
    doc_type: Option<&'static str>,
    decay_rule: &'static str,
    expires_at: Option<String>,
}

impl PreparedRow {
    fn new(block: &KnowledgeBlock, created_at: DateTime<Utc>, updated_at: DateTime<Utc>) -> StoreResult<Self> {
        Ok(Self {
            id: block.id.to_string(),
            project_id: block.project_id.clone(),
            source_path: block.source_path.clone(),
            seq: block.seq as i64,
            knowledge_type: block.knowledge_type.as_str(),
            insight_type: block.insight_type.map(|i| i.as_str()),
            title: block.title.clone(),
            body: block.body.clone(),
            summary: block.summary.clone(),
            tags: serde_json::to_string(&block.tags)?,
            related: serde_json::to_string(&block.related)?,
            fingerprint: block.content_fingerprint.clone(),
            embedding: block.embedding.as_deref().map(encode_embedding),
            host_id: block.host_id.clone(),
            created_at: created_at.to_rfc3339(),
            updated_at: updated_at.to_rfc3339(),
            categories: block.categories.clone(),
            doc_type: block.doc_type.map(|d| d.as_str()),
            decay_rule: block.decay_rule.as_str(),
            expires_at: block.expires_at.map(timestamp),
        })
    }

    fn insert(&self, stmt: &mut rusqlite::CachedStatement<'_>) -> rusqlite::Result<usize> {
        stmt.execute(params![
            self.id,
            self.project_id,
            self.source_path,
            self.seq,
            self.knowledge_type,
            self.insight_type,
            self.title,
            self.body,
            self.summary,
            self.tags,
            self.related,
            self.fingerprint,
            self.embedding,
            self.host_id,
            self.created_at,
            self.updated_at,
            self.categories.l1,
            self.categories.l2,
            self.categories.l3,
            self.doc_type,
            self.decay_rule,
            self.expires_at,
            self.embedding.is_none(),
        ])
    }
}

/// Column values as read, before conversion.
struct RawBlock {
    id: String,
    project_id: String,
    source_path: String,
    seq: i64,
    knowledge_type: String,
    insight_type: Option<String>,
    title: String,
    body: String,
    summary: Option<String>,
    tags: String,
    related: String,
    fingerprint: String,
    embedding: Option<Vec<u8>>,
    host_id: String,
    created_at: String,
    updated_at: String,
    category_l1: Option<String>,
    category_l2: Option<String>,
    category_l3: Option<String>,
    doc_type: Option<String>,
    decay_rule: String,
    expires_at: Option<String>,
}

impl RawBlock {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            project_id: row.get(1)?,
            source_path: row.get(2)?,
            seq: row.get(3)?,
            knowledge_type: row.get(4)?,
            insight_type: row.get(5)?,
            title: row.get(6)?,
            body: row.get(7)?,
            summary: row.get(8)?,
            tags: row.get(9)?,
            related: row.get(10)?,
            fingerprint: row.get(11)?,
            embedding: row.get(12)?,
            host_id: row.get(13)?,
            created_at: row.get(14)?,
            updated_at: row.get(15)?,
            category_l1: row.get(16)?,
            category_l2: row.get(17)?,
            category_l3: row.get(18)?,
            doc_type: row.get(19)?,
            decay_rule: row.get(20)?,
            expires_at: row.get(21)?,
        })
    }

    fn into_block(self) -> StoreResult<KnowledgeBlock> {
        let corrupt = |reason: String| StoreError::Corrupt {
            id: self.id.clone(),
            reason,
        };

        let knowledge_type: KnowledgeType = self
            .knowledge_type
            .parse()
            .map_err(|e: crate::types::UnknownVariant| corrupt(e.to_string()))?;
        let insight_type: Option<InsightType> = self
            .insight_type
            .as_deref()
            .map(str::parse)
            .transpose()
            .map_err(|e: UnknownVariant| corrupt(e.to_string()))?;
        let doc_type: Option<DocType> = self
            .doc_type
            .as_deref()
            .map(str::parse)
            .transpose()
            .map_err(|e: UnknownVariant| corrupt(e.to_string()))?;
        let decay_rule: DecayRule = self
            .decay_rule
            .parse()
            .map_err(|e: UnknownVariant| corrupt(e.to_string()))?;
        let tags: Tags = serde_json::from_str(&self.tags).map_err(|e| corrupt(e.to_string()))?;
        let related: Vec<RelatedRef> =
            serde_json::from_str(&self.related).map_err(|e| corrupt(e.to_string()))?;
        let created_at = parse_timestamp(&self.id, &self.created_at)?;
        let updated_at = parse_timestamp(&self.id, &self.updated_at)?;
        let expires_at = self
            .expires_at
            .as_deref()
            .map(|raw| parse_timestamp(&self.id, raw))
            .transpose()?;

        Ok(KnowledgeBlock {
            project_id: self.project_id,
            source_path: self.source_path,
            seq: self.seq.max(0) as usize,
            knowledge_type,
            insight_type,
            title: self.title,
            body: self.body,
            summary: self.summary,
            tags,
            related,
            content_fingerprint: self.fingerprint,
            categories: Categories {
                l1: self.category_l1,
                l2: self.category_l2,
                l3: self.category_l3,
            },
            doc_type,
            decay_rule,
            expires_at,
            embedding: self.embedding.as_deref().map(decode_embedding),
            host_id: self.host_id,
            created_at,
            updated_at,
            id: BlockId::from_raw(self.id),
        })
    }
}

fn parse_timestamp(id: &str, raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt {
            id: id.to_string(),
            reason: format!("bad timestamp '{raw}': {e}"),
        })
}

/// Fixed-width UTC form, so stored expiries compare correctly as text.
fn timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn escape_like(text: &str) -> String {
    text.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

pub(crate) fn encode_embedding(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub(crate) fn decode_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::normalize_tags;
    use chrono::Duration;

    fn block(source: &str, seq: usize, fingerprint: &str) -> KnowledgeBlock {
        let now = Utc::now();
        KnowledgeBlock {
            id: BlockId::derive("proj", source, seq),
            project_id: "proj".to_string(),
            source_path: source.to_string(),
            seq,
            knowledge_type: KnowledgeType::Doc,
            insight_type: None,
            title: format!("Block {seq}"),
            body: format!("Body of block {seq}"),
            summary: None,
            tags: normalize_tags(["Rust", "storage"]),
            related: Vec::new(),
            content_fingerprint: fingerprint.to_string(),
            categories: Categories::default(),
            doc_type: None,
            decay_rule: DecayRule::None,
            expires_at: None,
            embedding: None,
            host_id: "host-a".to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_replace_then_read_back() {
        let store = KnowledgeStore::memory().unwrap();
        let mut first = block("/kb/a.md", 0, "f1");
        first.embedding = Some(vec![0.5, 0.25]);
        first.related = vec![RelatedRef {
            id: BlockId::from_raw("other"),
            relation: "related".to_string(),
            score: 0.9,
        }];

        let outcome = store
            .replace_for_source("proj", "/kb/a.md", &[first.clone(), block("/kb/a.md", 1, "f1")])
            .unwrap();
        assert_eq!(outcome, ReplaceOutcome { removed: 0, written: 2 });

        let blocks = store.blocks_for_source("proj", "/kb/a.md").unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].embedding.as_deref(), Some(&[0.5f32, 0.25][..]));
        assert_eq!(blocks[0].related, first.related);
        assert_eq!(blocks[0].tags, first.tags);
    }

    #[test]
    fn test_replace_never_mixes_old_and_new() {
        let store = KnowledgeStore::memory().unwrap();
        store
            .replace_for_source(
                "proj",
                "/kb/a.md",
                &[block("/kb/a.md", 0, "old"), block("/kb/a.md", 1, "old"), block("/kb/a.md", 2, "old")],
            )
            .unwrap();
        store
            .replace_for_source("proj", "/kb/a.md", &[block("/kb/a.md", 0, "new")])
            .unwrap();

        let blocks = store.blocks_for_source("proj", "/kb/a.md").unwrap();
        assert_eq!(blocks.len(), 1);
        assert!(blocks.iter().all(|b| b.content_fingerprint == "new"));
    }

    #[test]
    fn test_replace_preserves_created_at_for_matching_ids() {
        let store = KnowledgeStore::memory().unwrap();
        let mut original = block("/kb/a.md", 0, "v1");
        original.created_at = Utc::now() - Duration::days(3);
        store.replace_for_source("proj", "/kb/a.md", &[original.clone()]).unwrap();

        let updated = block("/kb/a.md", 0, "v2");
        store.replace_for_source("proj", "/kb/a.md", &[updated]).unwrap();

        let stored = &store.blocks_for_source("proj", "/kb/a.md").unwrap()[0];
        assert_eq!(stored.created_at.timestamp(), original.created_at.timestamp());
        assert!(stored.updated_at > original.created_at);
        assert_eq!(stored.content_fingerprint, "v2");
    }

    #[test]
    fn test_failed_replace_leaves_old_set() {
        let store = KnowledgeStore::memory().unwrap();
        store.replace_for_source("proj", "/kb/a.md", &[block("/kb/a.md", 0, "old")]).unwrap();

        // Duplicate ids violate the primary key mid-transaction
        let dup = block("/kb/a.md", 5, "new");
        assert!(store.replace_for_source("proj", "/kb/a.md", &[dup.clone(), dup]).is_err());

        let blocks = store.blocks_for_source("proj", "/kb/a.md").unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].content_fingerprint, "old");
    }

    #[test]
    fn test_replace_rejects_foreign_block() {
        let store = KnowledgeStore::memory().unwrap();
        let err = store
            .replace_for_source("proj", "/kb/a.md", &[block("/kb/b.md", 0, "f")])
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidBlock { .. }));
    }

    #[test]
    fn test_delete_for_source() {
        let store = KnowledgeStore::memory().unwrap();
        store.replace_for_source("proj", "/kb/a.md", &[block("/kb/a.md", 0, "f")]).unwrap();
        store.replace_for_source("proj", "/kb/b.md", &[block("/kb/b.md", 0, "f")]).unwrap();

        assert_eq!(store.delete_for_source("proj", "/kb/a.md").unwrap(), 1);
        assert!(store.blocks_for_source("proj", "/kb/a.md").unwrap().is_empty());
        assert_eq!(store.blocks_for_source("proj", "/kb/b.md").unwrap().len(), 1);
        assert_eq!(store.delete_for_source("proj", "/kb/a.md").unwrap(), 0);
    }

    #[test]
    fn test_query_filters() {
        let store = KnowledgeStore::memory().unwrap();
        let mut insight = block("/kb/lessons/x.md", 0, "f");
        insight.knowledge_type = KnowledgeType::Insight;
        insight.insight_type = Some(InsightType::Lesson);
        insight.tags = normalize_tags(["golang", "Migration"]);
        store.replace_for_source("proj", "/kb/lessons/x.md", &[insight]).unwrap();
        store.replace_for_source("proj", "/kb/docs/a.md", &[block("/kb/docs/a.md", 0, "f")]).unwrap();

        let by_type = store
            .query(
                "proj",
                &BlockFilter {
                    knowledge_type: Some(KnowledgeType::Insight),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(by_type.len(), 1);

        let by_tag = store
            .query(
                "proj",
                &BlockFilter {
                    tags: vec!["MIGRATION".to_string(), "nope".to_string()],
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(by_tag.len(), 1);
        assert_eq!(by_tag[0].insight_type, Some(InsightType::Lesson));

        let by_text = store
            .query(
                "proj",
                &BlockFilter {
                    text: Some("body of".to_string()),
                    limit: Some(1),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(by_text.len(), 1);

        assert!(store.query("other", &BlockFilter::default()).unwrap().is_empty());
    }

    #[test]
    fn test_nearest_ranks_and_excludes_source() {
        let store = KnowledgeStore::memory().unwrap();
        let mut close = block("/kb/b.md", 0, "f");
        close.embedding = Some(vec![1.0, 0.1]);
        let mut far = block("/kb/c.md", 0, "f");
        far.embedding = Some(vec![0.0, 1.0]);
        let mut own = block("/kb/a.md", 0, "f");
        own.embedding = Some(vec![1.0, 0.0]);
        store.replace_for_source("proj", "/kb/b.md", &[close.clone()]).unwrap();
        store.replace_for_source("proj", "/kb/c.md", &[far]).unwrap();
        store.replace_for_source("proj", "/kb/a.md", &[own]).unwrap();

        let neighbors = store.nearest("proj", &[1.0, 0.0], "/kb/a.md", 5, 0.5).unwrap();
        assert_eq!(neighbors.len(), 1);
        assert_eq!(neighbors[0].id, close.id);
    }

    #[test]
    fn test_set_embedding_respects_fingerprint() {
        let store = KnowledgeStore::memory().unwrap();
        let pending = block("/kb/a.md", 0, "v1");
        store.replace_for_source("proj", "/kb/a.md", &[pending.clone()]).unwrap();
        assert_eq!(store.pending_embeddings("proj", 10).unwrap().len(), 1);

        let mut stale = pending.clone();
        stale.content_fingerprint = "v0".to_string();
        assert!(!store.set_embedding(&stale, &[1.0, 2.0]).unwrap());

        assert!(store.set_embedding(&pending, &[1.0, 2.0]).unwrap());
        assert!(store.pending_embeddings("proj", 10).unwrap().is_empty());
    }

    #[test]
    fn test_classification_round_trips_and_filters() {
        let store = KnowledgeStore::memory().unwrap();
        let mut progress = block("/kb/docs/progress/w1.md", 0, "f");
        progress.categories = Categories::from_relative("docs/progress/w1.md");
        progress.doc_type = Some(DocType::Progress);
        progress.decay_rule = DecayRule::Time30Days;
        progress.expires_at = Some(Utc::now() + Duration::days(30));
        store
            .replace_for_source("proj", "/kb/docs/progress/w1.md", &[progress.clone()])
            .unwrap();
        store.replace_for_source("proj", "/kb/docs/a.md", &[block("/kb/docs/a.md", 0, "f")]).unwrap();

        let stored = &store.blocks_for_source("proj", "/kb/docs/progress/w1.md").unwrap()[0];
        assert_eq!(stored.categories, progress.categories);
        assert_eq!(stored.decay_rule, DecayRule::Time30Days);
        assert_eq!(
            stored.expires_at.map(|t| t.timestamp()),
            progress.expires_at.map(|t| t.timestamp())
        );

        let by_category = store
            .query(
                "proj",
                &BlockFilter {
                    category: Some("Progress".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(by_category.len(), 1);

        let by_doc_type = store
            .query(
                "proj",
                &BlockFilter {
                    doc_type: Some(DocType::Progress),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(by_doc_type.len(), 1);
    }

    #[test]
    fn test_expired_blocks_are_hidden_unless_asked_for() {
        let store = KnowledgeStore::memory().unwrap();
        let mut stale = block("/kb/docs/progress/old.md", 0, "f");
        stale.decay_rule = DecayRule::Time30Days;
        stale.expires_at = Some(Utc::now() - Duration::days(1));
        store
            .replace_for_source("proj", "/kb/docs/progress/old.md", &[stale])
            .unwrap();

        assert!(store.query("proj", &BlockFilter::default()).unwrap().is_empty());
        let all = BlockFilter {
            include_expired: true,
            ..Default::default()
        };
        assert_eq!(store.query("proj", &all).unwrap().len(), 1);
        assert_eq!(store.blocks_for_source("proj", "/kb/docs/progress/old.md").unwrap().len(), 1);
        assert_eq!(store.stats("proj").unwrap().expired, 1);
    }

    #[test]
    fn test_failing_embeddings_sink_behind_fresh_ones() {
        let store = KnowledgeStore::memory().unwrap();
        let stubborn = block("/kb/a.md", 0, "f");
        store.replace_for_source("proj", "/kb/a.md", &[stubborn.clone()]).unwrap();
        let fresh = block("/kb/b.md", 0, "f");
        store.replace_for_source("proj", "/kb/b.md", &[fresh.clone()]).unwrap();

        // Oldest first while nothing has failed
        assert_eq!(store.pending_embeddings("proj", 1).unwrap()[0].id, stubborn.id);

        store.record_embedding_failure(&stubborn).unwrap();
        assert_eq!(store.embedding_attempts(&stubborn.id).unwrap(), 1);
        assert_eq!(store.pending_embeddings("proj", 1).unwrap()[0].id, fresh.id);

        // A rewrite starts over
        store.replace_for_source("proj", "/kb/a.md", &[block("/kb/a.md", 0, "f2")]).unwrap();
        assert_eq!(store.embedding_attempts(&stubborn.id).unwrap(), 0);
    }

    #[test]
    fn test_stats_and_mutation_counter() {
        let store = KnowledgeStore::memory().unwrap();
        store.replace_for_source("proj", "/kb/a.md", &[block("/kb/a.md", 0, "f")]).unwrap();
        store.delete_for_source("proj", "/kb/missing.md").unwrap();

        let stats = store.stats("proj").unwrap();
        assert_eq!(stats.blocks, 1);
        assert_eq!(stats.sources, 1);
        assert_eq!(stats.pending_embeddings, 1);
        assert_eq!(stats.by_type, vec![("doc".to_string(), 1)]);
        assert_eq!(stats.mutations, 1);
    }

    #[test]
    fn test_known_paths() {
        let store = KnowledgeStore::memory().unwrap();
        store.replace_for_source("proj", "/kb/a.md", &[block("/kb/a.md", 0, "f")]).unwrap();
        let paths = store.known_paths("proj").unwrap();
        assert!(paths.contains("/kb/a.md"));
        assert_eq!(paths.len(), 1);
    }

    #[test]
    fn test_embedding_blob_encoding() {
        let vector = vec![1.5f32, -0.25, 0.0];
        assert_eq!(decode_embedding(&encode_embedding(&vector)), vector);
    }
}
