//! intentctl: operator CLI over the SQLite store.
//!
//! Build: `cargo build --features cli --bin intentctl`
//!
//! Discovery passes need a content fetcher and an evidence evaluator, so they
//! are driven by the host application. This tool covers the read side plus
//! episode ingestion and checkpoint inspection.

use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;

use intent_discovery::checkpoint;
use intent_discovery::embeddings::select_strategy;
use intent_discovery::engine::default_checkpoint_path;
use intent_discovery::episodes::{ingest_episodes, EpisodeClusterer, EpisodeRecord, IngestionQueue};
use intent_discovery::queries::{top_opportunities, OpportunityFilter};
use intent_discovery::{EngineConfig, PersistentStore, SqliteStore};

#[derive(Parser)]
#[command(name = "intentctl", about = "Procurement-intent discovery operator tool")]
#[command(version)]
struct Cli {
    /// SQLite database (default ~/.intent-discovery/intent.db)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Engine config JSON (default ~/.intent-discovery/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest episode records from a JSON array file
    Ingest {
        #[arg(short, long)]
        file: PathBuf,
    },

    /// List top opportunities by confidence
    Top {
        #[arg(long)]
        cluster: Option<String>,
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        min_confidence: Option<f64>,
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Show the compressed evidence timeline for an entity
    Compress {
        #[arg(short, long)]
        entity: String,
    },

    /// Inspect the batch checkpoint file
    Checkpoint {
        #[arg(short, long)]
        path: Option<PathBuf>,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TimelineSummary {
    entity_id: String,
    strategy: &'static str,
    raw_episodes: usize,
    clustered_episodes: usize,
    compression_ratio: f64,
    skipped: usize,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => EngineConfig::load(path),
        None => EngineConfig::load_default(),
    }
    .context("Failed to load engine config")?;

    let open_store = || -> anyhow::Result<SqliteStore> {
        let store = match &cli.db {
            Some(path) => SqliteStore::open_at(path.clone()),
            None => SqliteStore::open_default(),
        };
        store.context("Failed to open database")
    };

    match cli.command {
        Commands::Ingest { file } => {
            let content = fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let records: Vec<EpisodeRecord> =
                serde_json::from_str(&content).context("Expected a JSON array of episode records")?;
            let store = open_store()?;
            let queue = IngestionQueue::new();
            let report = ingest_episodes(
                &store,
                &queue,
                records,
                config.clustering.embedding_dimension,
            )?;
            print_json(&report)?;
        }
        Commands::Top {
            cluster,
            category,
            min_confidence,
            limit,
        } => {
            let store = open_store()?;
            let filter = OpportunityFilter {
                cluster_id: cluster,
                category,
                min_confidence,
                limit: Some(limit),
            };
            print_json(&top_opportunities(&store, &filter)?)?;
        }
        Commands::Compress { entity } => {
            let store = open_store()?;
            if store.get_entity(&entity)?.is_none() {
                anyhow::bail!("Unknown entity: {}", entity);
            }
            let clusterer =
                EpisodeClusterer::new(config.clustering.clone(), select_strategy(&config.clustering));
            let timeline = clusterer.compress(&entity, &store.episodes_for_entity(&entity)?);
            print_json(&TimelineSummary {
                entity_id: entity,
                strategy: clusterer.strategy_name(),
                raw_episodes: timeline.raw_episode_count,
                clustered_episodes: timeline.episodes.len(),
                compression_ratio: timeline.compression_ratio(),
                skipped: timeline.skipped.len(),
            })?;
        }
        Commands::Checkpoint { path } => {
            let path = match path {
                Some(path) => path,
                None => default_checkpoint_path(&config)?,
            };
            let loaded = checkpoint::load(&path)?;
            print_json(&serde_json::json!({
                "path": path.display().to_string(),
                "source": loaded.source,
                "entries": loaded.checkpoint,
            }))?;
        }
    }

    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
