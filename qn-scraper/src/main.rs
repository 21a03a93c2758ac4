use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;
use uuid::Uuid;

use qn_core::Database;
use qn_scraper::assets::FsAssetStore;
use qn_scraper::geocode::HttpGeocoder;
use qn_scraper::http::{HttpFetcher, Limits, RateLimiter};
use qn_scraper::observability::logging::init_logging;
use qn_scraper::pipeline::dedup;
use qn_scraper::pipeline::merge::{MergeOptions, MergeService};
use qn_scraper::{AppConfig, Pipeline};

#[derive(Parser)]
#[command(name = "qn-scraper")]
#[command(about = "Quiz-night listings ingestion pipeline")]
#[command(version = "0.1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an index pass for one source (or all configured sources)
    Ingest {
        /// Source ID to ingest; omit to run every configured source
        #[arg(long)]
        source: Option<String>,
        /// Bypass the freshness window and the outbound throttle
        #[arg(long)]
        force: bool,
    },
    /// Drain every currently-due job from the persistent queue
    RunQueue,
    /// Scan all venues for duplicate candidates
    ScanDuplicates {
        /// Clear previously stored candidates before scanning
        #[arg(long)]
        clear: bool,
    },
    /// Merge a duplicate venue into its canonical counterpart
    Merge {
        #[arg(long)]
        primary: Uuid,
        #[arg(long)]
        secondary: Uuid,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Show what a merge would do without performing it
    PreviewMerge {
        #[arg(long)]
        primary: Uuid,
        #[arg(long)]
        secondary: Uuid,
    },
    /// Reverse a previous merge by its log entry id
    RollbackMerge {
        #[arg(long)]
        log_id: Uuid,
    },
    /// List provenance rows no source has confirmed recently
    StaleReport {
        #[arg(long, default_value_t = 7)]
        days: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    dotenv::dotenv().ok();
    init_logging();

    let config = AppConfig::load()?;
    let db = Database::open(&config.database_path)?;
    db.run_migrations()?;

    match cli.command {
        Commands::Ingest { source, force } => {
            let pipeline = build_pipeline(&config, db)?;
            pipeline.sync_sources()?;
            let source_ids: Vec<String> = match source {
                Some(id) => vec![id],
                None => config.sources.iter().map(|s| s.id.clone()).collect(),
            };
            for source_id in source_ids {
                let run = pipeline.run_index(&source_id, force).await?;
                println!(
                    "{source_id}: {} listings, {} enqueued, {} skipped",
                    run.processed, run.enqueued, run.skipped
                );
            }
            let stats = Arc::clone(&pipeline).drain_queue().await?;
            println!(
                "queue: {} completed, {} retried, {} failed",
                stats.completed, stats.retried, stats.failed
            );
        }
        Commands::RunQueue => {
            let pipeline = build_pipeline(&config, db)?;
            pipeline.sync_sources()?;
            let stats = Arc::clone(&pipeline).drain_queue().await?;
            println!(
                "queue: {} completed, {} retried, {} failed",
                stats.completed, stats.retried, stats.failed
            );
        }
        Commands::ScanDuplicates { clear } => {
            let summary = dedup::scan_all(&db, &config.dedup, clear, |p| {
                info!(
                    batch = p.batch,
                    total_batches = p.total_batches,
                    venues_processed = p.venues_processed,
                    duplicates_found = p.duplicates_found,
                    "scan progress"
                );
            })?;
            println!(
                "scanned {} venues, found {} duplicate pairs ({} stored)",
                summary.venues_processed, summary.duplicates_found, summary.duplicates_stored
            );
        }
        Commands::Merge {
            primary,
            secondary,
            notes,
        } => {
            let service = MergeService::new(db);
            let entry = service.merge_venues(primary, secondary, &operator_opts(notes))?;
            println!("merged {secondary} into {primary}; log entry {}", entry.id);
        }
        Commands::PreviewMerge { primary, secondary } => {
            let service = MergeService::new(db);
            let (diff, entry) = service.preview_merge(primary, secondary, &operator_opts(None))?;
            println!(
                "would move {} events and {} provenance rows ({} left in place); log entry {}",
                diff.moved_event_ids.len(),
                diff.moved_provenance.len(),
                diff.unmigrated_event_ids.len(),
                entry.id
            );
        }
        Commands::RollbackMerge { log_id } => {
            let service = MergeService::new(db);
            let entry = service.rollback_merge(log_id, &operator_opts(None))?;
            println!("rolled back merge {log_id}; log entry {}", entry.id);
        }
        Commands::StaleReport { days } => {
            let cutoff = chrono::Utc::now() - chrono::Duration::days(days);
            let stale = db.with_conn(|conn| qn_core::db::events::stale_event_sources(conn, cutoff))?;
            println!("{} provenance rows older than {days} days:", stale.len());
            for es in stale {
                println!(
                    "  {} {} last seen {}",
                    es.source_id,
                    es.source_url,
                    es.last_seen_at.to_rfc3339()
                );
            }
        }
    }

    Ok(())
}

fn build_pipeline(config: &AppConfig, db: Database) -> anyhow::Result<Arc<Pipeline>> {
    let limiter = RateLimiter::new(Limits {
        requests_per_min: Some(config.scheduler.requests_per_min),
        concurrency: Some(config.scheduler.concurrency),
    });
    let fetcher = Arc::new(HttpFetcher::new(&config.user_agent, limiter)?);
    let geocoder_url = config
        .geocoder_url
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("geocoder_url is not configured"))?;
    let geocoder = Arc::new(HttpGeocoder::new(geocoder_url, Arc::clone(&fetcher)));
    let assets = Arc::new(FsAssetStore::new(&config.assets_dir, Arc::clone(&fetcher)));
    Ok(Arc::new(Pipeline::new(
        config.clone(),
        db,
        fetcher,
        geocoder,
        assets,
    )?))
}

fn operator_opts(notes: Option<String>) -> MergeOptions {
    MergeOptions {
        performed_by: std::env::var("USER").unwrap_or_else(|_| "operator".to_string()),
        notes,
    }
}
