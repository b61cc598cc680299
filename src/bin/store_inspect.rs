use std::fs;
use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::Parser;
use issue_sync::config::Config;
use issue_sync::db;
use issue_sync::model::{PaginationMode, Source};

#[derive(Parser, Debug)]
struct Args {
    /// Path to YAML config
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Database URL; defaults to DATABASE_URL or the store under app.data_dir
    #[arg(long)]
    database_url: Option<String>,

    /// Only show cache entries of this repository (owner/name)
    #[arg(long)]
    repo: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // No token needed to look at the store, so skip validation.
    let raw = fs::read_to_string(&args.config)?;
    let cfg: Config = serde_yaml::from_str(&raw)?;
    let database_url = args
        .database_url
        .or_else(|| std::env::var("DATABASE_URL").ok())
        .unwrap_or_else(|| cfg.default_database_url());

    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    println!("Collections:");
    for count in db::collection_counts(&pool).await? {
        println!("  {:<40} {}", count.collection, count.documents);
    }

    let entries = match args.repo.as_deref() {
        Some(name) => {
            let source = Source::parse(name, PaginationMode::Offset)
                .ok_or_else(|| anyhow!("--repo must look like owner/name, got {}", name))?;
            db::load_cache_entries(&pool, &source.owner, &source.repo).await?
        }
        None => db::list_cache_entries(&pool).await?,
    };
    println!("Cache entries:");
    for entry in entries {
        println!(
            "  {}/{} {} -> {}",
            entry.owner, entry.repo, entry.position, entry.key
        );
    }
    Ok(())
}
