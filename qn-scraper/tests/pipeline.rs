//! End-to-end runs against an in-memory database with stubbed
//! collaborators: a scripted extractor, a fixed-answer geocoder, and an
//! asset store that always fails.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chrono::Utc;

use qn_core::db::{events, jobs, merge, venues};
use qn_core::domain::{JobStatus, RawDetail, RawListing};
use qn_core::{Database, IngestError, Result};

use qn_scraper::assets::FailingAssetStore;
use qn_scraper::config::{AppConfig, SourceConfig};
use qn_scraper::geocode::{GeoResult, StaticGeocoder};
use qn_scraper::http::{HttpFetcher, Limits, RateLimiter};
use qn_scraper::pipeline::merge::{MergeOptions, MergeService};
use qn_scraper::sources::Extractor;
use qn_scraper::Pipeline;

const SOURCE: &str = "quizfeed";

/// Serves a fixed set of listings and counts detail fetches.
struct ScriptedExtractor {
    listings: Vec<(String, RawDetail)>,
    detail_fetches: AtomicU32,
    fail_first_n_details: u32,
    panic_on: Option<String>,
}

impl ScriptedExtractor {
    fn new(listings: Vec<(String, RawDetail)>) -> Self {
        Self {
            listings,
            detail_fetches: AtomicU32::new(0),
            fail_first_n_details: 0,
            panic_on: None,
        }
    }
}

#[async_trait::async_trait]
impl Extractor for ScriptedExtractor {
    fn source_id(&self) -> &str {
        SOURCE
    }

    async fn fetch_index(&self) -> Result<Vec<RawListing>> {
        Ok(self
            .listings
            .iter()
            .map(|(url, detail)| RawListing {
                source_id: SOURCE.to_string(),
                url: url.clone(),
                name: Some(detail.name.clone()),
            })
            .collect())
    }

    async fn fetch_detail(&self, url: &str) -> Result<RawDetail> {
        let n = self.detail_fetches.fetch_add(1, Ordering::SeqCst);
        if n < self.fail_first_n_details {
            return Err(IngestError::transient("scripted network failure"));
        }
        if self.panic_on.as_deref() == Some(url) {
            panic!("scripted extractor panic for {url}");
        }
        self.listings
            .iter()
            .find(|(u, _)| u == url)
            .map(|(_, d)| d.clone())
            .ok_or_else(|| IngestError::fatal(format!("no scripted detail for {url}")))
    }
}

fn railway_detail(url: &str) -> (String, RawDetail) {
    (
        url.to_string(),
        RawDetail {
            url: url.to_string(),
            name: "The Railway (Back Room)".to_string(),
            address: "12 High St, SW6 4UL".to_string(),
            time_text: "Wednesday 20:00".to_string(),
            fee_text: Some("£2.50".to_string()),
            frequency_text: None,
            description: None,
            latitude: None,
            longitude: None,
            postcode: None,
            place_id: None,
            phone: None,
            website: None,
            performer_name: None,
            performer_image: None,
            image_url: None,
            payload_sha256: None,
        },
    )
}

fn london_geo() -> GeoResult {
    GeoResult {
        latitude: 51.4745,
        longitude: -0.1950,
        city: "London".to_string(),
        country: "United Kingdom".to_string(),
        country_code: "GB".to_string(),
        postcode: Some("SW6 4UL".to_string()),
        place_id: None,
    }
}

fn build_pipeline(
    db: Database,
    extractor: ScriptedExtractor,
    geo: GeoResult,
) -> Arc<Pipeline> {
    let mut config = AppConfig::default();
    config.sources = vec![SourceConfig {
        id: SOURCE.to_string(),
        name: "QuizFeed".to_string(),
        base_url: "https://quizfeed.example".to_string(),
    }];
    // tests drive the queue directly, no spacing wanted
    config.scheduler.cap_per_hour = 3_600_000;

    let fetcher = Arc::new(
        HttpFetcher::new("qn-scraper-tests", RateLimiter::new(Limits::default())).unwrap(),
    );
    let pipeline = Pipeline::new(
        config,
        db,
        fetcher,
        Arc::new(StaticGeocoder { result: geo }),
        Arc::new(FailingAssetStore),
    )
    .unwrap()
    .with_extractor(SOURCE, Arc::new(extractor));
    pipeline.sync_sources().unwrap();
    Arc::new(pipeline)
}

fn test_db() -> Database {
    let db = Database::open_in_memory().unwrap();
    db.run_migrations().unwrap();
    db
}

/// Forced index run plus queue drain. Forcing keeps every detail job
/// due immediately so a single drain pass finishes the batch.
async fn ingest_once(pipeline: &Arc<Pipeline>) {
    pipeline.run_index(SOURCE, true).await.unwrap();
    Arc::clone(pipeline).drain_queue().await.unwrap();
}

#[tokio::test]
async fn double_ingest_is_idempotent() {
    let db = test_db();
    let extractor =
        ScriptedExtractor::new(vec![railway_detail("https://quizfeed.example/railway")]);
    let pipeline = build_pipeline(db.clone(), extractor, london_geo());

    ingest_once(&pipeline).await;

    let venue_count = db.with_conn(venues::count_active).unwrap();
    assert_eq!(venue_count, 1);
    let venue = db
        .with_conn(|conn| venues::find_by_slug(conn, "the-railway"))
        .unwrap()
        .unwrap();
    assert_eq!(venue.name, "The Railway");

    let event = db
        .with_conn(|conn| events::find_by_venue_day(conn, venue.id, 3))
        .unwrap()
        .unwrap();
    assert_eq!(event.start_time.format("%H:%M").to_string(), "20:00");
    assert_eq!(event.entry_fee_cents, Some(250));
    let first_seen = db
        .with_conn(|conn| events::get_event_source(conn, event.id, SOURCE))
        .unwrap()
        .unwrap()
        .last_seen_at;

    // second run: force past the freshness window so the listing is
    // reprocessed rather than merely touched
    ingest_once(&pipeline).await;

    assert_eq!(db.with_conn(venues::count_active).unwrap(), 1);
    let event_after = db
        .with_conn(|conn| events::find_by_venue_day(conn, venue.id, 3))
        .unwrap()
        .unwrap();
    assert_eq!(event_after.id, event.id);
    assert_eq!(event_after.updated_at, event.updated_at);

    let provenance = db
        .with_conn(|conn| events::sources_for_event(conn, event.id))
        .unwrap();
    assert_eq!(provenance.len(), 1);
    assert!(provenance[0].last_seen_at > first_seen);
}

#[tokio::test]
async fn freshness_window_skips_but_touches() {
    let db = test_db();
    let extractor =
        ScriptedExtractor::new(vec![railway_detail("https://quizfeed.example/railway")]);
    let pipeline = build_pipeline(db.clone(), extractor, london_geo());

    ingest_once(&pipeline).await;
    let venue = db
        .with_conn(|conn| venues::find_by_slug(conn, "the-railway"))
        .unwrap()
        .unwrap();
    let event = db
        .with_conn(|conn| events::find_by_venue_day(conn, venue.id, 3))
        .unwrap()
        .unwrap();
    let first_seen = db
        .with_conn(|conn| events::get_event_source(conn, event.id, SOURCE))
        .unwrap()
        .unwrap()
        .last_seen_at;

    // un-forced second run inside the 24h window: no detail job, but the
    // provenance timestamp still advances
    let run = pipeline.run_index(SOURCE, false).await.unwrap();
    assert_eq!(run.skipped, 1);
    assert_eq!(run.enqueued, 0);

    let after = db
        .with_conn(|conn| events::get_event_source(conn, event.id, SOURCE))
        .unwrap()
        .unwrap()
        .last_seen_at;
    assert!(after > first_seen);
}

#[tokio::test]
async fn nearby_listings_resolve_to_one_venue() {
    let db = test_db();
    let (url_a, mut detail_a) = railway_detail("https://quizfeed.example/railway");
    detail_a.latitude = Some(51.5074);
    detail_a.longitude = Some(-0.1278);

    // 30 m away, same normalized name, different weekday
    let (url_b, mut detail_b) = railway_detail("https://quizfeed.example/railway-2");
    detail_b.url = url_b.clone();
    detail_b.name = "The Railway".to_string();
    detail_b.latitude = Some(51.50767);
    detail_b.longitude = Some(-0.1278);
    detail_b.time_text = "Thursday 19:30".to_string();

    let extractor = ScriptedExtractor::new(vec![(url_a, detail_a), (url_b.clone(), detail_b)]);
    let pipeline = build_pipeline(db.clone(), extractor, london_geo());
    ingest_once(&pipeline).await;

    assert_eq!(db.with_conn(venues::count_active).unwrap(), 1);
    let venue = db
        .with_conn(|conn| venues::find_by_slug(conn, "the-railway"))
        .unwrap()
        .unwrap();
    let events_here = db
        .with_conn(|conn| events::events_for_venue(conn, venue.id))
        .unwrap();
    assert_eq!(events_here.len(), 2);
}

#[tokio::test]
async fn distant_listings_stay_distinct() {
    let db = test_db();
    let (url_a, mut detail_a) = railway_detail("https://quizfeed.example/railway");
    detail_a.latitude = Some(51.5074);
    detail_a.longitude = Some(-0.1278);

    // 5 km away with a different name and address
    let (url_b, mut detail_b) = railway_detail("https://quizfeed.example/crown");
    detail_b.url = url_b.clone();
    detail_b.name = "The Crown".to_string();
    detail_b.address = "1 Crown Rd, N1 9AA".to_string();
    detail_b.latitude = Some(51.5524);
    detail_b.longitude = Some(-0.1278);

    let extractor = ScriptedExtractor::new(vec![(url_a, detail_a), (url_b, detail_b)]);
    let pipeline = build_pipeline(db.clone(), extractor, london_geo());
    ingest_once(&pipeline).await;

    assert_eq!(db.with_conn(venues::count_active).unwrap(), 2);
}

#[tokio::test]
async fn changed_description_updates_the_event() {
    let db = test_db();
    let url = "https://quizfeed.example/railway";
    let (_, base) = railway_detail(url);

    let extractor = ScriptedExtractor::new(vec![(url.to_string(), base.clone())]);
    let pipeline = build_pipeline(db.clone(), extractor, london_geo());
    ingest_once(&pipeline).await;

    let venue = db
        .with_conn(|conn| venues::find_by_slug(conn, "the-railway"))
        .unwrap()
        .unwrap();
    let before = db
        .with_conn(|conn| events::find_by_venue_day(conn, venue.id, 3))
        .unwrap()
        .unwrap();

    let mut altered = base;
    altered.description = Some("Now with a music round".to_string());
    let extractor = ScriptedExtractor::new(vec![(url.to_string(), altered)]);
    let pipeline = build_pipeline(db.clone(), extractor, london_geo());
    ingest_once(&pipeline).await;

    let after = db
        .with_conn(|conn| events::find_by_venue_day(conn, venue.id, 3))
        .unwrap()
        .unwrap();
    assert_eq!(after.id, before.id);
    assert_eq!(after.description.as_deref(), Some("Now with a music round"));
    assert!(after.updated_at > before.updated_at);
}

#[tokio::test]
async fn transient_failures_are_rescheduled_with_backoff() {
    let db = test_db();
    let mut extractor =
        ScriptedExtractor::new(vec![railway_detail("https://quizfeed.example/railway")]);
    extractor.fail_first_n_details = 1;
    let pipeline = build_pipeline(db.clone(), extractor, london_geo());

    pipeline.run_index(SOURCE, true).await.unwrap();
    let stats = Arc::clone(&pipeline).drain_queue().await.unwrap();
    assert_eq!(stats.retried, 1);
    assert_eq!(stats.completed, 0);

    // the retry is backed off into the future; nothing is due yet
    let pending = db
        .with_conn(|conn| jobs::count_with_status(conn, JobStatus::Pending))
        .unwrap();
    assert_eq!(pending, 1);
    assert_eq!(db.with_conn(venues::count_active).unwrap(), 0);
}

#[tokio::test]
async fn validation_failures_skip_the_listing_only() {
    let db = test_db();
    let good = railway_detail("https://quizfeed.example/railway");
    let (url_bad, mut bad) = railway_detail("https://quizfeed.example/mystery");
    bad.url = url_bad.clone();
    bad.name = "The Mystery".to_string();
    bad.address = "3 Fog Lane".to_string();
    bad.time_text = "whenever we feel like it".to_string();

    let extractor = ScriptedExtractor::new(vec![good, (url_bad, bad)]);
    let pipeline = build_pipeline(db.clone(), extractor, london_geo());

    pipeline.run_index(SOURCE, true).await.unwrap();
    let stats = Arc::clone(&pipeline).drain_queue().await.unwrap();
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.retried, 0);

    // the good listing landed; the bad one is simply absent
    assert_eq!(db.with_conn(venues::count_active).unwrap(), 1);
    let failed = db
        .with_conn(|conn| jobs::count_with_status(conn, JobStatus::Failed))
        .unwrap();
    assert_eq!(failed, 1);
}

#[tokio::test]
async fn worker_panic_does_not_abort_the_drain() {
    let db = test_db();
    let good = railway_detail("https://quizfeed.example/railway");
    let (url_bad, mut bad) = railway_detail("https://quizfeed.example/haunted");
    bad.url = url_bad.clone();
    bad.name = "The Haunted Cellar".to_string();

    let mut extractor = ScriptedExtractor::new(vec![good, (url_bad.clone(), bad)]);
    extractor.panic_on = Some(url_bad);
    let pipeline = build_pipeline(db.clone(), extractor, london_geo());

    pipeline.run_index(SOURCE, true).await.unwrap();
    let stats = Arc::clone(&pipeline).drain_queue().await.unwrap();

    // the sibling job still finishes; the panic is counted, not propagated
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.failed, 1);
    assert_eq!(db.with_conn(venues::count_active).unwrap(), 1);

    // the panicked job never reported back and sits in 'running' until the
    // stale timeout makes it claimable again
    let running = db
        .with_conn(|conn| jobs::count_with_status(conn, JobStatus::Running))
        .unwrap();
    assert_eq!(running, 1);
    let reclaimed = db
        .with_tx(|tx| jobs::claim_due(tx, Utc::now(), 10, 0))
        .unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].attempts, 2);
}

#[tokio::test]
async fn blank_performer_is_stripped_and_the_listing_still_lands() {
    let db = test_db();
    let url = "https://quizfeed.example/railway";
    let (_, mut detail) = railway_detail(url);
    detail.performer_name = Some("   ".to_string());

    let extractor = ScriptedExtractor::new(vec![(url.to_string(), detail)]);
    let pipeline = build_pipeline(db.clone(), extractor, london_geo());
    ingest_once(&pipeline).await;

    let venue = db
        .with_conn(|conn| venues::find_by_slug(conn, "the-railway"))
        .unwrap()
        .unwrap();
    let event = db
        .with_conn(|conn| events::find_by_venue_day(conn, venue.id, 3))
        .unwrap()
        .unwrap();
    assert!(event.performer_id.is_none());
    assert_eq!(event.entry_fee_cents, Some(250));

    let provenance = db
        .with_conn(|conn| events::sources_for_event(conn, event.id))
        .unwrap();
    assert_eq!(provenance.len(), 1);
}

#[tokio::test]
async fn merge_and_rollback_round_trip_through_ingested_data() {
    let db = test_db();
    let (url_a, mut detail_a) = railway_detail("https://quizfeed.example/railway");
    detail_a.latitude = Some(51.5074);
    detail_a.longitude = Some(-0.1278);

    // far enough away to resolve separately, close enough in name that an
    // operator later decides they are the same place
    let (url_b, mut detail_b) = railway_detail("https://quizfeed.example/railway-fulham");
    detail_b.url = url_b.clone();
    detail_b.name = "Railway Fulham".to_string();
    detail_b.address = "14 Station Approach".to_string();
    detail_b.latitude = Some(51.5524);
    detail_b.longitude = Some(-0.1278);
    detail_b.time_text = "Thursday 19:30".to_string();

    let extractor = ScriptedExtractor::new(vec![(url_a, detail_a), (url_b, detail_b)]);
    let pipeline = build_pipeline(db.clone(), extractor, london_geo());
    ingest_once(&pipeline).await;
    assert_eq!(db.with_conn(venues::count_active).unwrap(), 2);

    let primary = db
        .with_conn(|conn| venues::find_by_slug(conn, "the-railway"))
        .unwrap()
        .unwrap();
    let secondary = db
        .with_conn(|conn| venues::find_by_slug(conn, "railway-fulham"))
        .unwrap()
        .unwrap();
    let secondary_events = db
        .with_conn(|conn| events::events_for_venue(conn, secondary.id))
        .unwrap();

    let service = MergeService::new(db.clone());
    let opts = MergeOptions {
        performed_by: "ops".to_string(),
        notes: Some("same pub, two directories".to_string()),
    };
    let entry = service.merge_venues(primary.id, secondary.id, &opts).unwrap();
    assert_eq!(db.with_conn(venues::count_active).unwrap(), 1);

    service.rollback_merge(entry.id, &opts).unwrap();
    assert_eq!(db.with_conn(venues::count_active).unwrap(), 2);
    let restored = db
        .with_conn(|conn| events::events_for_venue(conn, secondary.id))
        .unwrap();
    assert_eq!(
        restored.iter().map(|e| e.id).collect::<Vec<_>>(),
        secondary_events.iter().map(|e| e.id).collect::<Vec<_>>()
    );

    let log = db
        .with_conn(|conn| merge::logs_for_venue(conn, secondary.id))
        .unwrap();
    assert_eq!(log.len(), 2);
}
