//! Idempotent create/update of an Event plus its per-source provenance
//! row. Runs entirely against the caller's connection so the detail
//! processor can wrap it in one transaction with venue resolution.

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::debug;
use uuid::Uuid;

use qn_core::db::events;
use qn_core::domain::{Event, EventInput, EventSource};
use qn_core::Result;

use crate::observability::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
    Unchanged,
}

pub struct EventUpserter;

impl EventUpserter {
    /// Find-or-create the event keyed by `(venue_id, day_of_week)`, update
    /// the change-detection subset only on a real difference, and upsert
    /// exactly one provenance row per `(event_id, source_id)`.
    ///
    /// `image_ref` is the already-downloaded local asset reference, or
    /// None when the listing has no image or the download failed.
    pub fn upsert(
        &self,
        conn: &Connection,
        venue_id: Uuid,
        source_id: &str,
        source_url: &str,
        input: &EventInput,
        image_ref: Option<&str>,
        listing_metadata: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<(Event, UpsertOutcome)> {
        let performer_id = match &input.performer {
            Some(p) => Some(
                events::find_or_create_performer(
                    conn,
                    &p.name,
                    source_id,
                    p.profile_image.as_deref(),
                )?
                .id,
            ),
            None => None,
        };

        let (event, outcome) =
            self.upsert_event(conn, venue_id, input, performer_id, image_ref, now)?;
        self.record_provenance(conn, event.id, source_id, source_url, listing_metadata, now)?;
        Ok((event, outcome))
    }

    fn upsert_event(
        &self,
        conn: &Connection,
        venue_id: Uuid,
        input: &EventInput,
        performer_id: Option<Uuid>,
        image_ref: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(Event, UpsertOutcome)> {
        let existing = events::find_by_venue_day(conn, venue_id, input.day_of_week)?;
        let Some(mut event) = existing else {
            let event = Event {
                id: Uuid::new_v4(),
                venue_id,
                day_of_week: input.day_of_week,
                start_time: input.start_time,
                frequency: input.frequency,
                entry_fee_cents: input.entry_fee_cents,
                description: input.description.clone(),
                performer_id,
                image_ref: image_ref.map(str::to_string),
                created_at: now,
                updated_at: now,
            };
            events::insert_event(conn, &event)?;
            metrics::upsert::events_created();
            return Ok((event, UpsertOutcome::Created));
        };

        // Change detection compares a fixed field subset; provenance is
        // refreshed either way, so an unchanged event is a true no-op here.
        let changed = event.start_time != input.start_time
            || event.frequency != input.frequency
            || event.entry_fee_cents != input.entry_fee_cents
            || event.description != input.description
            || differs_when_present(event.image_ref.as_deref(), image_ref);

        if changed {
            event.start_time = input.start_time;
            event.frequency = input.frequency;
            event.entry_fee_cents = input.entry_fee_cents;
            event.description = input.description.clone();
            if image_ref.is_some() {
                event.image_ref = image_ref.map(str::to_string);
            }
            event.updated_at = now;
            events::update_core_fields(conn, &event)?;
            metrics::upsert::events_updated();
        } else {
            metrics::upsert::events_unchanged();
        }

        // performer_id sits outside the change-detection subset: a newly
        // discovered performer lands via a narrow single-field update
        if let Some(pid) = performer_id {
            if event.performer_id != Some(pid) {
                events::update_performer(conn, event.id, pid)?;
                event.performer_id = Some(pid);
                debug!(event = %event.id, performer = %pid, "attached performer");
            }
        }

        let outcome = if changed {
            UpsertOutcome::Updated
        } else {
            UpsertOutcome::Unchanged
        };
        Ok((event, outcome))
    }

    fn record_provenance(
        &self,
        conn: &Connection,
        event_id: Uuid,
        source_id: &str,
        source_url: &str,
        metadata: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<()> {
        match events::get_event_source(conn, event_id, source_id)? {
            Some(es) => events::refresh_event_source(conn, es.id, source_url, metadata, now),
            None => events::insert_event_source(
                conn,
                &EventSource {
                    id: Uuid::new_v4(),
                    event_id,
                    source_id: source_id.to_string(),
                    source_url: source_url.to_string(),
                    status: "active".to_string(),
                    last_seen_at: now,
                    metadata: metadata.clone(),
                },
            ),
        }
    }
}

/// An absent incoming image never clears a stored one; a present one that
/// differs counts as a change.
fn differs_when_present(stored: Option<&str>, incoming: Option<&str>) -> bool {
    match incoming {
        Some(new_ref) => stored != Some(new_ref),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;
    use qn_core::db::{sources, venues};
    use qn_core::domain::{Frequency, PerformerInput, Source, Venue};
    use qn_core::Database;

    fn test_db() -> (Database, Uuid) {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().unwrap();
        let venue_id = db
            .with_tx(|tx| {
                sources::upsert_source(
                    tx,
                    &Source {
                        id: "quizfeed".to_string(),
                        name: "QuizFeed".to_string(),
                        base_url: "https://quizfeed.example".to_string(),
                    },
                )?;
                let country = venues::find_or_create_country(tx, "GB", "GB")?;
                let city = venues::find_or_create_city(tx, "London", country.id)?;
                let venue = Venue {
                    id: Uuid::new_v4(),
                    name: "The Railway".to_string(),
                    normalized_name: "the railway".to_string(),
                    slug: "the-railway".to_string(),
                    address: "12 High St".to_string(),
                    latitude: None,
                    longitude: None,
                    postcode: None,
                    place_id: None,
                    city_id: city.id,
                    phone: None,
                    website: None,
                    created_at: Utc::now(),
                    deleted_at: None,
                    merged_into_id: None,
                    deleted_by: None,
                };
                venues::insert_venue(tx, &venue)?;
                Ok(venue.id)
            })
            .unwrap();
        (db, venue_id)
    }

    /// Timestamps at stored precision so equality assertions hold after a
    /// database round trip.
    fn now_micros() -> DateTime<Utc> {
        qn_core::db::parse_ts(&qn_core::db::fmt_ts(Utc::now())).unwrap()
    }

    fn event_input() -> EventInput {
        EventInput {
            day_of_week: 3,
            start_time: NaiveTime::from_hms_opt(20, 0, 0).unwrap(),
            frequency: Frequency::Weekly,
            entry_fee_cents: Some(250),
            description: Some("General knowledge".to_string()),
            performer: None,
            image_url: None,
        }
    }

    fn upsert_once(
        db: &Database,
        venue_id: Uuid,
        input: &EventInput,
        now: DateTime<Utc>,
    ) -> (Event, UpsertOutcome) {
        db.with_tx(|tx| {
            EventUpserter.upsert(
                tx,
                venue_id,
                "quizfeed",
                "https://quizfeed.example/railway",
                input,
                None,
                &serde_json::json!({}),
                now,
            )
        })
        .unwrap()
    }

    #[test]
    fn second_identical_run_only_advances_last_seen() {
        let (db, venue_id) = test_db();
        let input = event_input();

        let t1 = now_micros();
        let (event1, outcome1) = upsert_once(&db, venue_id, &input, t1);
        assert_eq!(outcome1, UpsertOutcome::Created);

        let t2 = t1 + chrono::Duration::hours(1);
        let (event2, outcome2) = upsert_once(&db, venue_id, &input, t2);
        assert_eq!(outcome2, UpsertOutcome::Unchanged);
        assert_eq!(event1.id, event2.id);
        assert_eq!(event2.updated_at, t1);

        let es = db
            .with_conn(|conn| events::get_event_source(conn, event1.id, "quizfeed"))
            .unwrap()
            .unwrap();
        assert!(es.last_seen_at > t1);
    }

    #[test]
    fn description_change_updates_the_event() {
        let (db, venue_id) = test_db();
        let input = event_input();
        let t1 = now_micros();
        let (event1, _) = upsert_once(&db, venue_id, &input, t1);

        let mut altered = event_input();
        altered.description = Some("Music round added".to_string());
        let t2 = t1 + chrono::Duration::hours(1);
        let (event2, outcome) = upsert_once(&db, venue_id, &altered, t2);
        assert_eq!(outcome, UpsertOutcome::Updated);
        assert_eq!(event1.id, event2.id);
        assert_eq!(event2.description.as_deref(), Some("Music round added"));
        assert_eq!(event2.updated_at, t2);
    }

    #[test]
    fn performer_update_is_narrow() {
        let (db, venue_id) = test_db();
        let input = event_input();
        let t1 = now_micros();
        let (event1, _) = upsert_once(&db, venue_id, &input, t1);

        let mut with_performer = event_input();
        with_performer.performer = Some(PerformerInput {
            name: "Quiz Keith".to_string(),
            profile_image: None,
        });
        let t2 = t1 + chrono::Duration::hours(1);
        let (event2, outcome) = upsert_once(&db, venue_id, &with_performer, t2);

        // otherwise unchanged: updated_at stays put, performer lands anyway
        assert_eq!(outcome, UpsertOutcome::Unchanged);
        assert!(event2.performer_id.is_some());
        let stored = db
            .with_conn(|conn| events::get_event(conn, event1.id))
            .unwrap()
            .unwrap();
        assert_eq!(stored.performer_id, event2.performer_id);
        assert_eq!(stored.updated_at, t1);
    }

    #[test]
    fn exactly_one_provenance_row_per_source() {
        let (db, venue_id) = test_db();
        let input = event_input();
        let t1 = now_micros();
        let (event, _) = upsert_once(&db, venue_id, &input, t1);
        upsert_once(&db, venue_id, &input, t1 + chrono::Duration::hours(1));

        let rows = db
            .with_conn(|conn| events::sources_for_event(conn, event.id))
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn absent_image_never_clears_a_stored_one() {
        assert!(!differs_when_present(Some("a.jpg"), None));
        assert!(differs_when_present(Some("a.jpg"), Some("b.jpg")));
        assert!(differs_when_present(None, Some("a.jpg")));
        assert!(!differs_when_present(None, None));
    }
}
