//! Offline fuzzy scan for venues that likely describe the same physical
//! establishment. Name similarity and geographic closeness are thresholded
//! independently; a pair must clear both gates before it is scored.

use chrono::Utc;
use strsim::jaro_winkler;
use tracing::info;

use qn_core::db::{merge, venues};
use qn_core::domain::Venue;
use qn_core::normalize::distance_m;
use qn_core::{Database, Result};

use crate::config::DedupConfig;
use crate::observability::metrics;

/// Similarity in [0, 1] if the pair clears both thresholds, else None.
/// Pairs where only one side has coordinates fall back to the name gate
/// alone, best-effort, as exact elimination without geodata is out of
/// reach.
pub fn score_pair(a: &Venue, b: &Venue, config: &DedupConfig) -> Option<f64> {
    let name_sim = jaro_winkler(&a.normalized_name, &b.normalized_name);
    if name_sim < config.name_threshold {
        return None;
    }

    match (coords(a), coords(b)) {
        (Some((alat, alng)), Some((blat, blng))) => {
            let dist = distance_m(alat, alng, blat, blng);
            if dist > config.max_distance_m {
                return None;
            }
            let geo_score = 1.0 - dist / config.max_distance_m;
            Some((name_sim + geo_score) / 2.0)
        }
        _ => Some(name_sim * 0.9),
    }
}

fn coords(v: &Venue) -> Option<(f64, f64)> {
    match (v.latitude, v.longitude) {
        (Some(lat), Some(lng)) => Some((lat, lng)),
        _ => None,
    }
}

/// Ranked duplicate candidates for one venue, best first.
pub fn find_potential_duplicates(
    db: &Database,
    venue: &Venue,
    config: &DedupConfig,
) -> Result<Vec<(f64, Venue)>> {
    let mut matches = Vec::new();
    let total = db.with_conn(venues::count_active)?;
    let mut offset = 0;
    while offset < total {
        let page = db.with_conn(|conn| venues::list_active_page(conn, config.page_size, offset))?;
        if page.is_empty() {
            break;
        }
        offset += page.len();
        for candidate in page {
            if candidate.id == venue.id {
                continue;
            }
            if let Some(score) = score_pair(venue, &candidate, config) {
                matches.push((score, candidate));
            }
        }
    }
    matches.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    Ok(matches)
}

#[derive(Debug, Clone, Copy)]
pub struct ScanProgress {
    pub batch: usize,
    pub total_batches: usize,
    pub venues_processed: usize,
    pub total_venues: usize,
    pub duplicates_found: usize,
    pub duplicates_stored: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ScanSummary {
    pub venues_processed: usize,
    pub duplicates_found: usize,
    pub duplicates_stored: usize,
}

/// Full pairwise scan in fixed-size pages. Each page is compared against
/// every later venue (pairs are visited once, lower-id side first), found
/// pairs are stored, and `progress` fires once per page.
pub fn scan_all(
    db: &Database,
    config: &DedupConfig,
    clear_first: bool,
    mut progress: impl FnMut(ScanProgress),
) -> Result<ScanSummary> {
    if clear_first {
        let cleared = db.with_conn(merge::clear_candidates)?;
        info!(cleared, "cleared stored duplicate candidates");
    }

    let total_venues = db.with_conn(venues::count_active)?;
    let total_batches = total_venues.div_ceil(config.page_size.max(1));
    let mut summary = ScanSummary::default();
    let now = Utc::now();

    for batch in 0..total_batches {
        let page = db.with_conn(|conn| {
            venues::list_active_page(conn, config.page_size, batch * config.page_size)
        })?;

        for venue in &page {
            // compare against venues after this one in the stable scan
            // order so each pair is visited exactly once
            let mut inner_offset = batch * config.page_size;
            let mut seen_self = false;
            while inner_offset < total_venues {
                let inner = db.with_conn(|conn| {
                    venues::list_active_page(conn, config.page_size, inner_offset)
                })?;
                if inner.is_empty() {
                    break;
                }
                inner_offset += inner.len();
                for candidate in inner {
                    if candidate.id == venue.id {
                        seen_self = true;
                        continue;
                    }
                    if !seen_self {
                        continue;
                    }
                    if let Some(score) = score_pair(venue, &candidate, config) {
                        summary.duplicates_found += 1;
                        let stored = db.with_conn(|conn| {
                            merge::store_candidate(conn, venue.id, candidate.id, score, now)
                        })?;
                        if stored {
                            summary.duplicates_stored += 1;
                        }
                    }
                }
            }
            summary.venues_processed += 1;
        }

        progress(ScanProgress {
            batch: batch + 1,
            total_batches,
            venues_processed: summary.venues_processed,
            total_venues,
            duplicates_found: summary.duplicates_found,
            duplicates_stored: summary.duplicates_stored,
        });
    }

    metrics::dedup::candidates_found(summary.duplicates_found);
    info!(
        venues = summary.venues_processed,
        found = summary.duplicates_found,
        stored = summary.duplicates_stored,
        "duplicate scan finished"
    );
    Ok(summary)
}
