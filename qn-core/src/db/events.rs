//! Event, provenance and performer queries.

use chrono::{DateTime, NaiveTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::common::error::{IngestError, Result};
use crate::domain::{Event, EventSource, Frequency, Performer};

use super::{fmt_ts, json_col, opt_uuid_col, ts_col, uuid_col};

const EVENT_COLS: &str = "id, venue_id, day_of_week, start_time, frequency, entry_fee_cents, \
     description, performer_id, image_ref, created_at, updated_at";

const EVENT_SOURCE_COLS: &str =
    "id, event_id, source_id, source_url, status, last_seen_at, metadata";

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<Event> {
    let freq_text: String = row.get(4)?;
    let frequency = Frequency::parse(&freq_text).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            rusqlite::types::Type::Text,
            format!("unknown frequency '{freq_text}'").into(),
        )
    })?;
    let time_text: String = row.get(3)?;
    let start_time = NaiveTime::parse_from_str(&time_text, "%H:%M").map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(Event {
        id: uuid_col(row, 0)?,
        venue_id: uuid_col(row, 1)?,
        day_of_week: row.get::<_, i64>(2)? as u8,
        start_time,
        frequency,
        entry_fee_cents: row.get(5)?,
        description: row.get(6)?,
        performer_id: opt_uuid_col(row, 7)?,
        image_ref: row.get(8)?,
        created_at: ts_col(row, 9)?,
        updated_at: ts_col(row, 10)?,
    })
}

fn row_to_event_source(row: &Row<'_>) -> rusqlite::Result<EventSource> {
    Ok(EventSource {
        id: uuid_col(row, 0)?,
        event_id: uuid_col(row, 1)?,
        source_id: row.get(2)?,
        source_url: row.get(3)?,
        status: row.get(4)?,
        last_seen_at: ts_col(row, 5)?,
        metadata: json_col(row, 6)?,
    })
}

fn fmt_time(time: NaiveTime) -> String {
    time.format("%H:%M").to_string()
}

pub fn find_by_venue_day(
    conn: &Connection,
    venue_id: Uuid,
    day_of_week: u8,
) -> Result<Option<Event>> {
    let sql = format!("SELECT {EVENT_COLS} FROM events WHERE venue_id = ?1 AND day_of_week = ?2");
    let event = conn
        .query_row(
            &sql,
            params![venue_id.to_string(), day_of_week as i64],
            row_to_event,
        )
        .optional()?;
    Ok(event)
}

pub fn get_event(conn: &Connection, id: Uuid) -> Result<Option<Event>> {
    let sql = format!("SELECT {EVENT_COLS} FROM events WHERE id = ?1");
    let event = conn
        .query_row(&sql, params![id.to_string()], row_to_event)
        .optional()?;
    Ok(event)
}

pub fn insert_event(conn: &Connection, event: &Event) -> Result<()> {
    conn.execute(
        "INSERT INTO events (id, venue_id, day_of_week, start_time, frequency, entry_fee_cents, \
         description, performer_id, image_ref, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            event.id.to_string(),
            event.venue_id.to_string(),
            event.day_of_week as i64,
            fmt_time(event.start_time),
            event.frequency.as_str(),
            event.entry_fee_cents,
            event.description,
            event.performer_id.map(|p| p.to_string()),
            event.image_ref,
            fmt_ts(event.created_at),
            fmt_ts(event.updated_at),
        ],
    )?;
    Ok(())
}

/// Rewrite the change-detection field subset plus `updated_at`. Callers
/// only invoke this after detecting a real difference.
pub fn update_core_fields(conn: &Connection, event: &Event) -> Result<()> {
    conn.execute(
        "UPDATE events SET start_time = ?2, frequency = ?3, entry_fee_cents = ?4, \
         description = ?5, image_ref = ?6, updated_at = ?7 WHERE id = ?1",
        params![
            event.id.to_string(),
            fmt_time(event.start_time),
            event.frequency.as_str(),
            event.entry_fee_cents,
            event.description,
            event.image_ref,
            fmt_ts(event.updated_at),
        ],
    )?;
    Ok(())
}

/// Narrow single-field update that keeps the change-detection subset
/// stable while still capturing newly discovered performer data.
pub fn update_performer(conn: &Connection, event_id: Uuid, performer_id: Uuid) -> Result<()> {
    conn.execute(
        "UPDATE events SET performer_id = ?2 WHERE id = ?1",
        params![event_id.to_string(), performer_id.to_string()],
    )?;
    Ok(())
}

pub fn events_for_venue(conn: &Connection, venue_id: Uuid) -> Result<Vec<Event>> {
    let sql =
        format!("SELECT {EVENT_COLS} FROM events WHERE venue_id = ?1 ORDER BY day_of_week");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![venue_id.to_string()], row_to_event)?;
    let mut events = Vec::new();
    for row in rows {
        events.push(row?);
    }
    Ok(events)
}

pub fn reassign_venue(conn: &Connection, event_id: Uuid, venue_id: Uuid) -> Result<()> {
    conn.execute(
        "UPDATE events SET venue_id = ?2 WHERE id = ?1",
        params![event_id.to_string(), venue_id.to_string()],
    )?;
    Ok(())
}

// --- event_sources ---------------------------------------------------------

pub fn get_event_source(
    conn: &Connection,
    event_id: Uuid,
    source_id: &str,
) -> Result<Option<EventSource>> {
    let sql = format!(
        "SELECT {EVENT_SOURCE_COLS} FROM event_sources WHERE event_id = ?1 AND source_id = ?2"
    );
    let es = conn
        .query_row(
            &sql,
            params![event_id.to_string(), source_id],
            row_to_event_source,
        )
        .optional()?;
    Ok(es)
}

pub fn insert_event_source(conn: &Connection, es: &EventSource) -> Result<()> {
    let metadata = serde_json::to_string(&es.metadata)?;
    conn.execute(
        "INSERT INTO event_sources (id, event_id, source_id, source_url, status, last_seen_at, metadata) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            es.id.to_string(),
            es.event_id.to_string(),
            es.source_id,
            es.source_url,
            es.status,
            fmt_ts(es.last_seen_at),
            metadata,
        ],
    )?;
    Ok(())
}

pub fn refresh_event_source(
    conn: &Connection,
    id: Uuid,
    source_url: &str,
    metadata: &serde_json::Value,
    last_seen_at: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "UPDATE event_sources SET source_url = ?2, metadata = ?3, last_seen_at = ?4, \
         status = 'active' WHERE id = ?1",
        params![
            id.to_string(),
            source_url,
            serde_json::to_string(metadata)?,
            fmt_ts(last_seen_at),
        ],
    )?;
    Ok(())
}

/// Most recent sighting of a listing URL from this source, across events.
pub fn last_seen_for_url(
    conn: &Connection,
    source_id: &str,
    source_url: &str,
) -> Result<Option<DateTime<Utc>>> {
    let text: Option<String> = conn
        .query_row(
            "SELECT MAX(last_seen_at) FROM event_sources WHERE source_id = ?1 AND source_url = ?2",
            params![source_id, source_url],
            |row| row.get(0),
        )
        .optional()?
        .flatten();
    match text {
        Some(t) => Ok(Some(super::parse_ts(&t)?)),
        None => Ok(None),
    }
}

/// Advance `last_seen_at` for a listing skipped inside the freshness
/// window; keeps staleness reporting honest without reprocessing.
pub fn touch_last_seen(
    conn: &Connection,
    source_id: &str,
    source_url: &str,
    now: DateTime<Utc>,
) -> Result<usize> {
    let updated = conn.execute(
        "UPDATE event_sources SET last_seen_at = ?3 WHERE source_id = ?1 AND source_url = ?2",
        params![source_id, source_url, fmt_ts(now)],
    )?;
    Ok(updated)
}

pub fn sources_for_event(conn: &Connection, event_id: Uuid) -> Result<Vec<EventSource>> {
    let sql = format!(
        "SELECT {EVENT_SOURCE_COLS} FROM event_sources WHERE event_id = ?1 ORDER BY source_id"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![event_id.to_string()], row_to_event_source)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

pub fn reassign_event_source(conn: &Connection, id: Uuid, event_id: Uuid) -> Result<()> {
    conn.execute(
        "UPDATE event_sources SET event_id = ?2 WHERE id = ?1",
        params![id.to_string(), event_id.to_string()],
    )?;
    Ok(())
}

/// Provenance rows not confirmed by their source since the cutoff.
pub fn stale_event_sources(conn: &Connection, cutoff: DateTime<Utc>) -> Result<Vec<EventSource>> {
    let sql = format!(
        "SELECT {EVENT_SOURCE_COLS} FROM event_sources WHERE last_seen_at < ?1 \
         ORDER BY last_seen_at"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![fmt_ts(cutoff)], row_to_event_source)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

// --- performers ------------------------------------------------------------

pub fn find_or_create_performer(
    conn: &Connection,
    name: &str,
    source_id: &str,
    profile_image: Option<&str>,
) -> Result<Performer> {
    if name.trim().is_empty() {
        return Err(IngestError::PartialEnrichment {
            field: "performer".to_string(),
            message: "performer name is blank".to_string(),
        });
    }
    let existing = conn
        .query_row(
            "SELECT id, name, source_id, profile_image FROM performers \
             WHERE name = ?1 AND source_id = ?2",
            params![name, source_id],
            |row| {
                Ok(Performer {
                    id: uuid_col(row, 0)?,
                    name: row.get(1)?,
                    source_id: row.get(2)?,
                    profile_image: row.get(3)?,
                })
            },
        )
        .optional()?;
    if let Some(performer) = existing {
        return Ok(performer);
    }
    let performer = Performer {
        id: Uuid::new_v4(),
        name: name.to_string(),
        source_id: source_id.to_string(),
        profile_image: profile_image.map(str::to_string),
    };
    conn.execute(
        "INSERT INTO performers (id, name, source_id, profile_image) VALUES (?1, ?2, ?3, ?4)",
        params![
            performer.id.to_string(),
            performer.name,
            performer.source_id,
            performer.profile_image,
        ],
    )
    .map_err(|e| IngestError::PartialEnrichment {
        field: "performer".to_string(),
        message: e.to_string(),
    })?;
    Ok(performer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    #[test]
    fn blank_performer_name_is_a_partial_enrichment() {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().unwrap();
        let err = db
            .with_conn(|conn| find_or_create_performer(conn, "   ", "quizfeed", None))
            .unwrap_err();
        match err {
            IngestError::PartialEnrichment { field, .. } => assert_eq!(field, "performer"),
            other => panic!("expected partial enrichment, got {other}"),
        }
    }
}
