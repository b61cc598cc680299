use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

use issue_sync::config;
use issue_sync::db::{self, SqliteStore};
use issue_sync::github::{GraphqlClient, RestClient};
use issue_sync::sync::SyncOrchestrator;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Incrementally sync GitHub issues and pull requests into the document store"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Only sync this repository (owner/name); it must be configured
    #[arg(long)]
    only: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let mut sources = cfg.sources();
    if let Some(only) = args.only.as_deref() {
        sources.retain(|s| s.full_name() == only);
        if sources.is_empty() {
            bail!("{} is not a configured source", only);
        }
    }

    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| cfg.default_database_url());
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool)
        .await
        .context("failed to apply migrations")?;

    let rest = RestClient::from_config(&cfg.github)?;
    let graphql = GraphqlClient::from_config(&cfg.github)?;
    let orchestrator = SyncOrchestrator::new(Arc::new(SqliteStore::new(pool)), cfg.sync.clone())
        .with_fetcher(Arc::new(rest))
        .with_fetcher(Arc::new(graphql));

    let shutdown: Arc<AtomicBool> = orchestrator.shutdown_handle();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("interrupt received; stopping after the current page");
                shutdown.store(true, Ordering::SeqCst);
            }
            Err(err) => error!(?err, "failed to listen for interrupt"),
        }
    });

    info!(sources = sources.len(), "starting issue sync");
    let summary = orchestrator.run(sources).await;
    print!("{}", summary.render());

    if !summary.is_success() {
        bail!("{} source(s) failed", summary.count("failed"));
    }
    Ok(())
}
