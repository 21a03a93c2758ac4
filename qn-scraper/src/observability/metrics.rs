//! Counter helpers for the hot paths of the pipeline. A metrics exporter
//! can be installed by the embedding process; without one these are no-ops.

pub mod ingest {
    pub fn listings_processed() {
        metrics::counter!("qn_ingest_listings_processed_total").increment(1);
    }
    pub fn listings_skipped_fresh() {
        metrics::counter!("qn_ingest_listings_skipped_fresh_total").increment(1);
    }
    pub fn listings_failed() {
        metrics::counter!("qn_ingest_listings_failed_total").increment(1);
    }
    pub fn jobs_enqueued() {
        metrics::counter!("qn_ingest_jobs_enqueued_total").increment(1);
    }
}

pub mod resolver {
    pub fn matched_place_id() {
        metrics::counter!("qn_resolver_matched_total", "strategy" => "place_id").increment(1);
    }
    pub fn matched_proximity() {
        metrics::counter!("qn_resolver_matched_total", "strategy" => "proximity").increment(1);
    }
    pub fn matched_name() {
        metrics::counter!("qn_resolver_matched_total", "strategy" => "name_postcode").increment(1);
    }
    pub fn matched_address() {
        metrics::counter!("qn_resolver_matched_total", "strategy" => "address").increment(1);
    }
    pub fn venue_created() {
        metrics::counter!("qn_resolver_venues_created_total").increment(1);
    }
    pub fn conflict_recovered() {
        metrics::counter!("qn_resolver_conflicts_recovered_total").increment(1);
    }
}

pub mod upsert {
    pub fn events_created() {
        metrics::counter!("qn_upsert_events_created_total").increment(1);
    }
    pub fn events_updated() {
        metrics::counter!("qn_upsert_events_updated_total").increment(1);
    }
    pub fn events_unchanged() {
        metrics::counter!("qn_upsert_events_unchanged_total").increment(1);
    }
    pub fn enrichment_stripped() {
        metrics::counter!("qn_upsert_enrichment_stripped_total").increment(1);
    }
}

pub mod dedup {
    pub fn candidates_found(n: usize) {
        metrics::counter!("qn_dedup_candidates_found_total").increment(n as u64);
    }
    pub fn merges_performed() {
        metrics::counter!("qn_merge_performed_total").increment(1);
    }
    pub fn rollbacks_performed() {
        metrics::counter!("qn_merge_rollbacks_total").increment(1);
    }
}
