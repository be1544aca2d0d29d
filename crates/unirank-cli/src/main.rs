use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing_subscriber::EnvFilter;
use unirank_crawl::{CrawlJob, Settings};
use unirank_feed::RankingFeed;
use unirank_fetch::RateLimitedTransport;
use unirank_reconcile::FillPolicy;
use unirank_store::{MemoryStore, RecordStore, RestStore};

#[derive(Debug, Parser)]
#[command(name = "unirank")]
#[command(about = "University ranking catalogue crawler")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch the ranking feed and reconcile its rows into the catalogue.
    Crawl {
        /// Ranking feed JSON endpoint.
        #[arg(long)]
        feed_url: String,
        /// Referer for the feed fetch; recorded as source_url on stored rows.
        #[arg(long)]
        referer: Option<String>,
        /// Keep only rows ranked at or better than this cutoff.
        #[arg(long)]
        max_rank: Option<i64>,
        /// Stop after this many candidates.
        #[arg(long)]
        limit: Option<usize>,
        /// Reconcile into an in-memory store and print the summary only.
        #[arg(long)]
        dry_run: bool,
        /// Overwrite populated fields instead of filling only empty ones.
        #[arg(long)]
        overwrite: bool,
    },
    /// Probe the catalogue service and report reachability.
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let settings = Settings::from_env();

    match cli.command {
        Commands::Crawl {
            feed_url,
            referer,
            max_rank,
            limit,
            dry_run,
            overwrite,
        } => {
            let transport = Arc::new(RateLimitedTransport::new(settings.transport_config())?);

            let mut feed = RankingFeed::new(transport.clone(), feed_url.clone());
            if let Some(referer) = referer {
                feed = feed.with_referer(referer);
            }
            if let Some(max_rank) = max_rank {
                feed = feed.with_max_rank(max_rank);
            }

            let store: Arc<dyn RecordStore> = if dry_run {
                Arc::new(MemoryStore::new())
            } else {
                if settings.store_key.is_empty() {
                    bail!("UNIRANK_STORE_KEY is required unless --dry-run is set");
                }
                Arc::new(RestStore::new(
                    transport.clone(),
                    &settings.store_url,
                    &settings.store_key,
                )?)
            };

            let policy = if overwrite {
                FillPolicy::Overwrite
            } else {
                FillPolicy::IfEmpty
            };
            let job = CrawlJob::new(store, "ranking_feed_crawl")
                .with_policy(policy)
                .with_pacing(settings.pacing)
                .with_limit(limit)
                .with_metadata(json!({
                    "feed_url": feed_url,
                    "max_rank": max_rank,
                    "limit": limit,
                    "dry_run": dry_run,
                }));

            let mut source = feed.into_source();
            let summary = job.run(&mut source).await?;
            println!(
                "crawl complete{}: processed={} inserted={} enriched={} skipped={} failed={}",
                if dry_run { " (dry run)" } else { "" },
                summary.processed,
                summary.inserted,
                summary.enriched,
                summary.skipped,
                summary.failed
            );
        }
        Commands::Check => {
            if settings.store_key.is_empty() {
                bail!("UNIRANK_STORE_KEY is required");
            }
            let transport = Arc::new(RateLimitedTransport::new(settings.transport_config())?);
            let store = RestStore::new(transport, &settings.store_url, &settings.store_key)?;
            if store.health_check().await? {
                println!("catalogue reachable: {}", settings.store_url);
            } else {
                bail!("catalogue rejected the probe: {}", settings.store_url);
            }
        }
    }

    Ok(())
}
