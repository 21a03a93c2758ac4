//! Per-source orchestration: index runs that enqueue throttled detail
//! jobs, detail processing that drives resolution and upsert inside one
//! transaction, and the worker loop that drains the persistent queue.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

use qn_core::db::{events, jobs, sources, venues};
use qn_core::domain::{Job, JobKind, JobRun, JobStatus, ListingInput};
use qn_core::{Database, IngestError, Result};

use crate::assets::{try_download, AssetStore};
use crate::config::AppConfig;
use crate::geocode::Geocoder;
use crate::http::HttpFetcher;
use crate::observability::metrics;
use crate::pipeline::resolver::{Resolution, VenueResolver};
use crate::pipeline::scheduler::Scheduler;
use crate::pipeline::upserter::EventUpserter;
use crate::sources::{extractor_for_source, normalize::normalize_detail, Extractor};

#[derive(Debug, Clone, Copy, Default)]
pub struct QueueStats {
    pub completed: u32,
    pub retried: u32,
    pub failed: u32,
}

/// The assembled ingestion pipeline. Everything here is shared-nothing
/// apart from the database, so clones of the `Arc` can process jobs in
/// parallel.
pub struct Pipeline {
    db: Database,
    config: AppConfig,
    scheduler: Scheduler,
    resolver: VenueResolver,
    geocoder: Arc<dyn Geocoder>,
    assets: Arc<dyn AssetStore>,
    extractors: HashMap<String, Arc<dyn Extractor>>,
}

impl Pipeline {
    pub fn new(
        config: AppConfig,
        db: Database,
        fetcher: Arc<HttpFetcher>,
        geocoder: Arc<dyn Geocoder>,
        assets: Arc<dyn AssetStore>,
    ) -> Result<Self> {
        let mut extractors: HashMap<String, Arc<dyn Extractor>> = HashMap::new();
        for source in &config.sources {
            match extractor_for_source(source, Arc::clone(&fetcher)) {
                Some(extractor) => {
                    extractors.insert(source.id.clone(), Arc::from(extractor));
                }
                None => warn!(source = %source.id, "no extractor registered for source"),
            }
        }
        Ok(Self {
            scheduler: Scheduler::new(db.clone(), config.scheduler.clone()),
            resolver: VenueResolver::new(config.resolver.clone()),
            db,
            config,
            geocoder,
            assets,
            extractors,
        })
    }

    /// Swap in an extractor, bypassing the factory. Test seam.
    pub fn with_extractor(mut self, source_id: &str, extractor: Arc<dyn Extractor>) -> Self {
        self.extractors.insert(source_id.to_string(), extractor);
        self
    }

    /// Upsert source reference rows from the configuration.
    pub fn sync_sources(&self) -> Result<()> {
        self.db.with_tx(|tx| {
            for source in self.config.source_records() {
                sources::upsert_source(tx, &source)?;
            }
            Ok(())
        })
    }

    fn extractor(&self, source_id: &str) -> Result<Arc<dyn Extractor>> {
        self.extractors.get(source_id).cloned().ok_or_else(|| {
            IngestError::fatal(format!("no extractor configured for source '{source_id}'"))
        })
    }

    /// Pull the source's index, skip listings confirmed within the
    /// freshness window (their provenance still gets touched), and
    /// enqueue one throttled detail job for the rest.
    pub async fn run_index(&self, source_id: &str, force: bool) -> Result<JobRun> {
        let started_at = Utc::now();
        let extractor = self.extractor(source_id)?;
        let listings = extractor.fetch_index().await?;
        let total = listings.len() as u32;

        let window = Duration::hours(self.config.freshness.window_hours);
        let cutoff = started_at - window;
        let mut fresh = Vec::new();
        let mut skipped = 0u32;
        for listing in listings {
            let recently_seen = if force {
                false
            } else {
                self.db
                    .with_conn(|conn| events::last_seen_for_url(conn, source_id, &listing.url))?
                    .map(|seen| seen > cutoff)
                    .unwrap_or(false)
            };
            if recently_seen {
                self.db.with_conn(|conn| {
                    events::touch_last_seen(conn, source_id, &listing.url, Utc::now())
                })?;
                metrics::ingest::listings_skipped_fresh();
                skipped += 1;
            } else {
                fresh.push(listing);
            }
        }

        let enqueued = self.scheduler.schedule_batch(source_id, &fresh, force)?;

        let run = JobRun {
            id: Uuid::new_v4(),
            source_id: source_id.to_string(),
            kind: JobKind::Index,
            started_at,
            finished_at: Some(Utc::now()),
            processed: total,
            enqueued,
            skipped,
            failed: 0,
            error: None,
        };
        self.db.with_conn(|conn| jobs::insert_job_run(conn, &run))?;
        info!(source_id, total, enqueued, skipped, "index run finished");
        Ok(run)
    }

    /// Fetch, normalize and ingest one listing. Venue resolution, event
    /// upsert and provenance land in a single transaction; an enrichment
    /// failure strips the offending field and retries the core upsert
    /// once.
    pub async fn process_detail(&self, source_id: &str, url: &str) -> Result<()> {
        let extractor = self.extractor(source_id)?;
        let detail = extractor.fetch_detail(url).await?;
        let mut listing = normalize_detail(source_id, &detail)?;

        self.enrich_locale(&mut listing).await?;
        let image_ref = try_download(self.assets.as_ref(), listing.event.image_url.as_deref()).await;

        match self.ingest_listing(&listing, image_ref.as_deref()) {
            Ok(()) => {}
            Err(IngestError::PartialEnrichment { field, message }) => {
                warn!(url, field, message, "enrichment failed, retrying stripped");
                metrics::upsert::enrichment_stripped();
                let mut stripped = listing.clone();
                let image_ref = match field.as_str() {
                    "performer" => {
                        stripped.event.performer = None;
                        image_ref
                    }
                    _ => None,
                };
                self.ingest_listing(&stripped, image_ref.as_deref())?;
            }
            Err(e) => return Err(e),
        }
        metrics::ingest::listings_processed();
        Ok(())
    }

    /// Fill city/country (and missing coordinates) from the geocoder when
    /// the source did not carry them. Runs before the transaction; the
    /// resolver itself never makes outbound calls.
    async fn enrich_locale(&self, listing: &mut ListingInput) -> Result<()> {
        if listing.venue.city.is_some() && listing.venue.country_code.is_some() {
            return Ok(());
        }
        let geo = match (listing.venue.latitude, listing.venue.longitude) {
            (Some(lat), Some(lng)) => self.geocoder.lookup_coords(lat, lng).await?,
            _ => self.geocoder.lookup_address(&listing.venue.address).await?,
        };
        let venue = &mut listing.venue;
        if venue.latitude.is_none() {
            venue.latitude = Some(geo.latitude);
            venue.longitude = Some(geo.longitude);
        }
        if !geo.city.is_empty() {
            venue.city.get_or_insert(geo.city);
        }
        if !geo.country_code.is_empty() {
            venue.country_code.get_or_insert(geo.country_code);
        }
        if venue.postcode.is_none() {
            venue.postcode = geo.postcode;
        }
        if venue.place_id.is_none() {
            venue.place_id = geo.place_id;
        }
        Ok(())
    }

    fn ingest_listing(&self, listing: &ListingInput, image_ref: Option<&str>) -> Result<()> {
        let now = Utc::now();
        self.db.with_tx(|tx| {
            let resolution = self.resolver.resolve(tx, &listing.venue)?;
            if let Resolution::Found(venue) = &resolution {
                venues::fill_missing_fields(
                    tx,
                    venue.id,
                    listing.venue.postcode.as_deref(),
                    listing.venue.place_id.as_deref(),
                    listing.venue.phone.as_deref(),
                    listing.venue.website.as_deref(),
                )?;
            }
            EventUpserter.upsert(
                tx,
                resolution.venue().id,
                &listing.source_id,
                &listing.source_url,
                &listing.event,
                image_ref,
                &listing.metadata,
                now,
            )?;
            Ok(())
        })
    }

    /// Drain every currently-due job, up to `concurrency` in flight at a
    /// time. Jobs scheduled for later stay untouched; callers loop or
    /// re-invoke on their own cadence. Abandoned `running` rows past the
    /// stale timeout are claimed along with the pending ones.
    pub async fn drain_queue(self: Arc<Self>) -> Result<QueueStats> {
        let concurrency = self.config.scheduler.concurrency.max(1) as usize;
        let stale_after = self.config.scheduler.stale_running_secs;
        let mut stats = QueueStats::default();

        loop {
            let batch = self
                .db
                .with_tx(|tx| jobs::claim_due(tx, Utc::now(), concurrency, stale_after))?;
            if batch.is_empty() {
                break;
            }

            let mut set = JoinSet::new();
            for job in batch {
                let pipeline = Arc::clone(&self);
                set.spawn(async move {
                    let outcome = pipeline.run_job(&job).await;
                    (job, outcome)
                });
            }
            while let Some(joined) = set.join_next().await {
                let (job, outcome) = match joined {
                    Ok(pair) => pair,
                    Err(e) => {
                        // the stranded running row comes back through the
                        // stale-claim path on a later drain
                        warn!(error = %e, "worker task panicked");
                        metrics::ingest::listings_failed();
                        stats.failed += 1;
                        continue;
                    }
                };
                match outcome {
                    Ok(()) => {
                        self.db.with_conn(|conn| jobs::complete(conn, job.id))?;
                        stats.completed += 1;
                    }
                    Err(e) => {
                        metrics::ingest::listings_failed();
                        let status = self.db.with_conn(|conn| {
                            jobs::fail(
                                conn,
                                &job,
                                &e.to_string(),
                                e.is_transient(),
                                self.config.scheduler.backoff_base_secs,
                            )
                        })?;
                        match status {
                            JobStatus::Pending => stats.retried += 1,
                            _ => {
                                warn!(job = %job.id, error = %e, "job failed terminally");
                                stats.failed += 1;
                            }
                        }
                    }
                }
            }
        }
        info!(
            completed = stats.completed,
            retried = stats.retried,
            failed = stats.failed,
            "queue drained"
        );
        Ok(stats)
    }

    async fn run_job(&self, job: &Job) -> Result<()> {
        match job.kind {
            JobKind::Index => {
                self.run_index(&job.source_id, false).await?;
                Ok(())
            }
            JobKind::Detail => {
                let url = job
                    .payload
                    .get("url")
                    .and_then(|u| u.as_str())
                    .ok_or_else(|| IngestError::Validation {
                        message: format!("detail job {} has no url in payload", job.id),
                    })?;
                self.process_detail(&job.source_id, url).await
            }
        }
    }

    /// Provenance rows not confirmed since the cutoff, oldest first.
    pub fn stale_report(&self, older_than_days: i64) -> Result<Vec<qn_core::domain::EventSource>> {
        let cutoff = Utc::now() - Duration::days(older_than_days);
        self.db.with_conn(|conn| events::stale_event_sources(conn, cutoff))
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }
}
