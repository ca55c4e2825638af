//! CLI argument parsing using clap.

use clap::{
    Parser, Subcommand,
    builder::styling::{AnsiColor, Effects, Styles},
};
use std::path::PathBuf;

use crate::types::{DocType, InsightType, KnowledgeType};

fn clap_cargo_style() -> Styles {
    Styles::styled()
        .header(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .usage(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

/// Knowledge distillation for watched document folders
#[derive(Parser)]
#[command(
    name = "distillery",
    version = env!("CARGO_PKG_VERSION"),
    about = "Distill watched documents into a searchable knowledge store",
    long_about = "Watch document folders, distill changed files into structured knowledge \
                  blocks, embed them, and keep the knowledge store in sync with disk.",
    next_line_help = true,
    styles = clap_cargo_style()
)]
pub struct Cli {
    /// Path to a settings file (TOML or YAML)
    #[arg(short, long, global = true, env = "DISTILLERY_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Watch the configured roots until interrupted
    #[command(about = "Watch roots and keep the knowledge store in sync")]
    Watch,

    /// Reconcile once and exit
    #[command(about = "Ingest every changed, new or deleted file once, then exit")]
    Scan,

    /// List stored knowledge blocks
    #[command(about = "Filter knowledge blocks in the store")]
    Query {
        /// Knowledge type: doc, insight, dialogue_extract
        #[arg(long = "type", value_name = "TYPE")]
        knowledge_type: Option<KnowledgeType>,

        /// Insight type: solution, lesson, pattern, decision
        #[arg(long = "insight", value_name = "TYPE")]
        insight_type: Option<InsightType>,

        /// Match blocks carrying any of these tags (repeatable)
        #[arg(long = "tag", value_name = "TAG")]
        tags: Vec<String>,

        /// Restrict to one source file
        #[arg(long)]
        source: Option<PathBuf>,

        /// Substring of title or body
        #[arg(long)]
        text: Option<String>,

        /// First-level category, e.g. the directory below docs/
        #[arg(long)]
        category: Option<String>,

        /// Doc type: background, requirements, architecture, design, ...
        #[arg(long = "doc-type", value_name = "TYPE")]
        doc_type: Option<DocType>,

        /// Include blocks past their expiry
        #[arg(long)]
        include_expired: bool,

        /// Maximum number of blocks
        #[arg(short, long, default_value_t = 50)]
        limit: usize,

        /// Output JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Show store statistics
    #[command(about = "Show block, source and pending-embedding counts")]
    Stats {
        /// Output JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Print the effective settings
    #[command(about = "Display active settings")]
    Config,
}
