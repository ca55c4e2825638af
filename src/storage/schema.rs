//! Schema management and migrations

use rusqlite::Connection;

use super::error::{StoreError, StoreResult};

/// Schema version - increment when making schema changes
const SCHEMA_VERSION: i32 = 2;

/// Ordered migrations, each applied once.
const MIGRATIONS: [(i32, &str); 2] = [(1, SCHEMA_V1), (2, SCHEMA_V2)];

/// Apply all pending migrations
pub fn apply_migrations(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )?;

    let current_version: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;

    if current_version < SCHEMA_VERSION {
        tracing::info!(
            target: "storage",
            "applying schema migrations {current_version} -> {SCHEMA_VERSION}"
        );
        for (version, sql) in MIGRATIONS.iter().filter(|(v, _)| *v > current_version) {
            conn.execute_batch(sql).map_err(|e| {
                StoreError::Schema(format!("Failed to apply v{version} schema: {e}"))
            })?;
            conn.execute("INSERT INTO schema_migrations (version) VALUES (?1)", [version])?;
        }
    }

    Ok(())
}

/// Knowledge blocks, keyed by logical id and grouped by `(project_id, source_path)`.
///
/// `tags` and `related` are JSON arrays; `embedding` is little-endian f32.
const SCHEMA_V1: &str = r#"
CREATE TABLE IF NOT EXISTS knowledge_blocks (
    id TEXT PRIMARY KEY NOT NULL,
    project_id TEXT NOT NULL,
    source_path TEXT NOT NULL,
    seq INTEGER NOT NULL,
    knowledge_type TEXT NOT NULL CHECK (knowledge_type IN ('doc', 'insight', 'dialogue_extract')),
    insight_type TEXT CHECK (insight_type IN ('solution', 'lesson', 'pattern', 'decision')),
    title TEXT NOT NULL CHECK (length(title) > 0),
    body TEXT NOT NULL,
    summary TEXT,
    tags TEXT NOT NULL DEFAULT '[]',
    related TEXT NOT NULL DEFAULT '[]',
    content_fingerprint TEXT NOT NULL,
    embedding BLOB,
    needs_embedding INTEGER NOT NULL DEFAULT 0,
    host_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_blocks_source ON knowledge_blocks(project_id, source_path, seq);
CREATE INDEX IF NOT EXISTS idx_blocks_type ON knowledge_blocks(project_id, knowledge_type);
CREATE INDEX IF NOT EXISTS idx_blocks_pending ON knowledge_blocks(project_id) WHERE needs_embedding = 1;
"#;

/// Path classification, decay and embedding retry bookkeeping.
///
/// `embed_attempts` counts failed background embeddings since the last write.
const SCHEMA_V2: &str = r#"
ALTER TABLE knowledge_blocks ADD COLUMN category_l1 TEXT;
ALTER TABLE knowledge_blocks ADD COLUMN category_l2 TEXT;
ALTER TABLE knowledge_blocks ADD COLUMN category_l3 TEXT;
ALTER TABLE knowledge_blocks ADD COLUMN doc_type TEXT;
ALTER TABLE knowledge_blocks ADD COLUMN decay_rule TEXT NOT NULL DEFAULT 'none';
ALTER TABLE knowledge_blocks ADD COLUMN expires_at TEXT;
ALTER TABLE knowledge_blocks ADD COLUMN embed_attempts INTEGER NOT NULL DEFAULT 0;

CREATE INDEX IF NOT EXISTS idx_blocks_category ON knowledge_blocks(project_id, category_l1, category_l2);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        apply_migrations(&conn).unwrap();
        apply_migrations(&conn).unwrap();

        let versions: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(versions, 2);
    }

    #[test]
    fn test_upgrades_v1_database() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            );",
        )
        .unwrap();
        conn.execute_batch(SCHEMA_V1).unwrap();
        conn.execute("INSERT INTO schema_migrations (version) VALUES (1)", []).unwrap();

        apply_migrations(&conn).unwrap();

        let attempts: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM pragma_table_info('knowledge_blocks') WHERE name = 'embed_attempts'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(attempts, 1);
    }
}
