use anyhow::Context;
use clap::Parser;

use distillery::Settings;
use distillery::cli::commands::{self, query::QueryArgs};
use distillery::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let settings = Settings::load(cli.config.as_deref()).context("Configuration error")?;
    distillery::logging::init_with_config(&settings.logging);

    match cli.command {
        Commands::Watch => commands::run::watch(settings).await,
        Commands::Scan => commands::run::scan(settings).await,
        Commands::Query {
            knowledge_type,
            insight_type,
            tags,
            source,
            text,
            category,
            doc_type,
            include_expired,
            limit,
            json,
        } => commands::query::run(
            &settings,
            QueryArgs {
                knowledge_type,
                insight_type,
                tags,
                source,
                text,
                category,
                doc_type,
                include_expired,
                limit,
                json,
            },
        ),
        Commands::Stats { json } => commands::stats::run(&settings, json),
        Commands::Config => commands::config::run(&settings),
    }
}
