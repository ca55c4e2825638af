//! `query`: plain filtering over stored blocks.

use std::path::PathBuf;

use anyhow::Context;
use comfy_table::{Cell, Color, ContentArrangement, Table};

use crate::config::Settings;
use crate::documents::title::truncate_chars;
use crate::storage::BlockFilter;
use crate::types::{DocType, InsightType, KnowledgeBlock, KnowledgeType, ProjectIdentity, source_key};

pub struct QueryArgs {
    pub knowledge_type: Option<KnowledgeType>,
    pub insight_type: Option<InsightType>,
    pub tags: Vec<String>,
    pub source: Option<PathBuf>,
    pub text: Option<String>,
    pub category: Option<String>,
    pub doc_type: Option<DocType>,
    pub include_expired: bool,
    pub limit: usize,
    pub json: bool,
}

pub fn run(settings: &Settings, args: QueryArgs) -> anyhow::Result<()> {
    let store = super::open_store(settings)?;
    let identity = ProjectIdentity::from_settings(settings);

    let filter = BlockFilter {
        knowledge_type: args.knowledge_type,
        insight_type: args.insight_type,
        tags: args.tags,
        source_path: args.source.as_deref().map(source_key),
        text: args.text,
        category: args.category,
        doc_type: args.doc_type,
        include_expired: args.include_expired,
        limit: Some(args.limit),
    };
    let blocks = store
        .query(&identity.project_id, &filter)
        .context("Query failed")?;

    if args.json {
        let json: Vec<_> = blocks.iter().map(without_embedding).collect();
        println!("{}", serde_json::to_string_pretty(&json)?);
        return Ok(());
    }

    if blocks.is_empty() {
        println!("No matching blocks in project {}", identity.project_id);
        return Ok(());
    }

    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Type", "Title", "Category", "Tags", "Source", "Updated"]);
    for block in &blocks {
        let kind = match block.insight_type {
            Some(insight) => format!("{}/{insight}", block.knowledge_type),
            None => block.knowledge_type.to_string(),
        };
        let kind_cell = match block.knowledge_type {
            KnowledgeType::Insight => Cell::new(kind).fg(Color::Green),
            _ => Cell::new(kind),
        };
        table.add_row(vec![
            kind_cell,
            Cell::new(truncate_chars(&block.title, 60)),
            Cell::new(category_path(block)),
            Cell::new(block.tags.iter().cloned().collect::<Vec<_>>().join(", ")),
            Cell::new(format!("{}#{}", block.source_path, block.seq)),
            Cell::new(block.updated_at.format("%Y-%m-%d %H:%M")),
        ]);
    }
    println!("{table}");
    println!("{} blocks", blocks.len());
    Ok(())
}

fn category_path(block: &KnowledgeBlock) -> String {
    let c = &block.categories;
    [&c.l1, &c.l2, &c.l3]
        .into_iter()
        .flatten()
        .cloned()
        .collect::<Vec<_>>()
        .join("/")
}

fn without_embedding(block: &KnowledgeBlock) -> KnowledgeBlock {
    KnowledgeBlock {
        embedding: None,
        ..block.clone()
    }
}
