use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fellows_core::{distribute_fairly, Opportunity};
use fellows_pipeline::PipelineConfig;
use fellows_storage::{CounterStore, PgCounterStore};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "fellows-cli")]
#[command(about = "Fellowship opportunity finder command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the JSON API (default).
    Serve,
    /// Apply database migrations.
    Migrate,
    /// Print a JSON array of opportunities in fair display order.
    Distribute { path: PathBuf },
    /// Rank the catalog against a free-text profile.
    Match {
        #[arg(long)]
        identity: String,
        query: String,
    },
    /// Search the web and extract a draft opportunity for review.
    Assist { query: String },
    /// Delete rate-limit windows that have expired.
    SweepCounters,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => fellows_web::serve_from_env().await?,
        Commands::Migrate => {
            let config = PipelineConfig::from_env();
            let pool = fellows_storage::connect(&config.database_url).await?;
            fellows_storage::migrate(&pool).await?;
            println!("migrations applied");
        }
        Commands::Distribute { path } => {
            let raw = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("failed to read {}", path.display()))?;
            let records: Vec<Opportunity> = serde_json::from_str(&raw)
                .with_context(|| format!("{} is not a JSON array of opportunities", path.display()))?;
            println!("{}", serde_json::to_string_pretty(&distribute_fairly(records))?);
        }
        Commands::Match { identity, query } => {
            let (pipeline, _) = fellows_pipeline::pipeline_from_env().await?;
            let ranked = pipeline.matcher.recommend(Some(&identity), &query).await?;
            println!("{}", serde_json::to_string_pretty(&ranked)?);
        }
        Commands::Assist { query } => {
            let (pipeline, _) = fellows_pipeline::pipeline_from_env().await?;
            let assisted = pipeline.assistant.assist(&query).await?;
            println!("{}", serde_json::to_string_pretty(&assisted)?);
        }
        Commands::SweepCounters => {
            let config = PipelineConfig::from_env();
            let pool = fellows_storage::connect(&config.database_url).await?;
            let removed = PgCounterStore::new(pool).sweep_expired(chrono::Utc::now()).await?;
            println!("sweep complete: removed={removed}");
        }
    }

    Ok(())
}
