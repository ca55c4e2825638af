//! `stats`: store counters for the configured project.

use anyhow::Context;
use comfy_table::Table;

use crate::config::Settings;
use crate::types::ProjectIdentity;

pub fn run(settings: &Settings, json: bool) -> anyhow::Result<()> {
    let store = super::open_store(settings)?;
    let identity = ProjectIdentity::from_settings(settings);
    let stats = store
        .stats(&identity.project_id)
        .context("Failed to read store statistics")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    let mut table = Table::new();
    table.set_header(vec!["Metric", "Value"]);
    table.add_row(vec!["Project".to_string(), identity.project_id.clone()]);
    table.add_row(vec!["Blocks".to_string(), stats.blocks.to_string()]);
    table.add_row(vec!["Sources".to_string(), stats.sources.to_string()]);
    table.add_row(vec![
        "Pending embeddings".to_string(),
        stats.pending_embeddings.to_string(),
    ]);
    table.add_row(vec!["Expired".to_string(), stats.expired.to_string()]);
    for (kind, count) in &stats.by_type {
        table.add_row(vec![format!("  {kind}"), count.to_string()]);
    }
    println!("{table}");
    Ok(())
}
