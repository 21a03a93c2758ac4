//! Spreads detail jobs out so outbound traffic to a source stays under a
//! per-hour cap.
//!
//! The persisted slot cursor in `rate_slots` is what makes the cap hold
//! across workers and across runs: every enqueue reserves the next slot
//! with one atomic UPDATE, advancing the cursor by `spacing_ms`, so two
//! processes scheduling concurrently can never land two jobs inside the
//! same spacing interval.

use chrono::Utc;
use tracing::{info, warn};

use qn_core::db::jobs::{self, NewJob};
use qn_core::domain::{JobKind, RawListing};
use qn_core::{Database, Result};

use crate::config::SchedulerConfig;
use crate::observability::metrics;

/// Gap between consecutive slots. With slots this far apart, any rolling
/// 3600-second window holds at most `cap_per_hour` of them.
fn spacing_ms(cap_per_hour: u32) -> i64 {
    if cap_per_hour == 0 {
        3_600_000
    } else {
        3_600_000 / cap_per_hour as i64
    }
}

pub struct Scheduler {
    db: Database,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(db: Database, config: SchedulerConfig) -> Self {
        Self { db, config }
    }

    /// Enqueue one deferred detail job per listing. Never executes work
    /// itself. With `force` set the throttle is bypassed and every job is
    /// due immediately; the slot cursor is left untouched so manual
    /// re-runs do not starve scheduled traffic.
    pub fn schedule_batch(
        &self,
        source_id: &str,
        listings: &[RawListing],
        force: bool,
    ) -> Result<u32> {
        if self.config.cap_per_hour == 0 {
            warn!(source_id, "cap_per_hour is 0, falling back to one job per hour");
        }
        let spacing = spacing_ms(self.config.cap_per_hour);
        let mut enqueued = 0u32;

        for (index, listing) in listings.iter().enumerate() {
            if listing.url.trim().is_empty() {
                warn!(
                    source_id,
                    index, "listing with empty url, scheduling into default slot"
                );
            }
            let run_at = if force {
                Utc::now()
            } else {
                self.db
                    .with_conn(|conn| jobs::reserve_slot(conn, source_id, spacing))?
            };
            self.db.with_conn(|conn| {
                jobs::enqueue(
                    conn,
                    NewJob {
                        kind: JobKind::Detail,
                        source_id: source_id.to_string(),
                        payload: serde_json::json!({
                            "url": listing.url,
                            "name": listing.name,
                        }),
                        run_at,
                        priority: 0,
                        max_attempts: self.config.max_attempts,
                    },
                )
            })?;
            metrics::ingest::jobs_enqueued();
            enqueued += 1;
        }
        info!(source_id, enqueued, force, "scheduled detail batch");
        Ok(enqueued)
    }

    /// Enqueue an index run for a source, due immediately with priority
    /// over detail jobs.
    pub fn schedule_index(&self, source_id: &str) -> Result<()> {
        self.db.with_conn(|conn| {
            jobs::enqueue(
                conn,
                NewJob {
                    kind: JobKind::Index,
                    source_id: source_id.to_string(),
                    payload: serde_json::json!({}),
                    run_at: Utc::now(),
                    priority: 10,
                    max_attempts: self.config.max_attempts,
                },
            )
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rolling_window_never_exceeds_cap() {
        // 500 slots at 60/hour: count slot times landing in every rolling
        // 3600-second window
        let cap = 60u32;
        let spacing = spacing_ms(cap);
        let slots: Vec<i64> = (0..500).map(|i| i * spacing / 1000).collect();
        for &start in &slots {
            let in_window = slots
                .iter()
                .filter(|&&s| s >= start && s < start + 3600)
                .count();
            assert!(in_window <= cap as usize, "window at {start} holds {in_window}");
        }
    }

    #[test]
    fn zero_cap_falls_back_to_hourly() {
        assert_eq!(spacing_ms(0), 3_600_000);
    }

    #[test]
    fn schedule_batch_spaces_jobs_through_slot_cursor() {
        let db = qn_core::Database::open_in_memory().unwrap();
        db.run_migrations().unwrap();
        let scheduler = Scheduler::new(db.clone(), SchedulerConfig::default());

        let listings: Vec<RawListing> = (0..5)
            .map(|i| RawListing {
                source_id: "quizfeed".to_string(),
                url: format!("https://quizfeed.example/l{i}"),
                name: None,
            })
            .collect();
        let enqueued = scheduler.schedule_batch("quizfeed", &listings, false).unwrap();
        assert_eq!(enqueued, 5);

        let run_ats: Vec<String> = db
            .with_conn(|conn| {
                let mut stmt = conn
                    .prepare("SELECT run_at FROM jobs ORDER BY run_at")
                    .map_err(qn_core::IngestError::from)?;
                let rows = stmt
                    .query_map([], |r| r.get(0))
                    .map_err(qn_core::IngestError::from)?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row.map_err(qn_core::IngestError::from)?);
                }
                Ok(out)
            })
            .unwrap();
        assert_eq!(run_ats.len(), 5);
        // strictly increasing: each reservation advanced the cursor
        for pair in run_ats.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn force_bypasses_the_throttle() {
        let db = qn_core::Database::open_in_memory().unwrap();
        db.run_migrations().unwrap();
        let scheduler = Scheduler::new(db.clone(), SchedulerConfig::default());
        let listings: Vec<RawListing> = (0..3)
            .map(|i| RawListing {
                source_id: "quizfeed".to_string(),
                url: format!("https://quizfeed.example/l{i}"),
                name: None,
            })
            .collect();
        scheduler.schedule_batch("quizfeed", &listings, true).unwrap();

        let due = db
            .with_tx(|tx| qn_core::db::jobs::claim_due(tx, Utc::now(), 10, 900))
            .unwrap();
        assert_eq!(due.len(), 3);
    }
}
