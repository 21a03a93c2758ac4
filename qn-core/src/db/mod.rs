//! Canonical store: venues, events, provenance, merge audit log, and the
//! persistent job queue, all in one SQLite database.
//!
//! The connection is shared behind a mutex; callers that need atomicity
//! run inside [`Database::with_tx`], which serializes concurrent writers
//! the same way row-level locking would: last commit wins, never a torn
//! write.

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, Transaction};
use tracing::info;
use uuid::Uuid;

use crate::common::error::{IngestError, Result};

pub mod events;
pub mod jobs;
pub mod merge;
pub mod sources;
pub mod venues;

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).map_err(IngestError::from)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(IngestError::from)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(IngestError::from)?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(IngestError::from)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Idempotent schema setup; safe to run on every startup.
    pub fn run_migrations(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch(SCHEMA).map_err(IngestError::from)?;
            Ok(())
        })?;
        info!("database migrations applied");
        Ok(())
    }

    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self.conn.lock().map_err(|_| IngestError::Database {
            message: "connection mutex poisoned".to_string(),
        })?;
        f(&guard)
    }

    /// Run `f` inside a transaction. Any error rolls back every write made
    /// by the closure; commit happens only on `Ok`.
    pub fn with_tx<T>(&self, f: impl FnOnce(&Transaction) -> Result<T>) -> Result<T> {
        let mut guard = self.conn.lock().map_err(|_| IngestError::Database {
            message: "connection mutex poisoned".to_string(),
        })?;
        let tx = guard.transaction().map_err(IngestError::from)?;
        let out = f(&tx)?;
        tx.commit().map_err(IngestError::from)?;
        Ok(out)
    }
}

/// Fixed-width UTC text form so SQL string comparison orders correctly.
pub fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_ts(text: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| IngestError::Database {
            message: format!("invalid timestamp '{text}': {e}"),
        })
}

pub fn parse_uuid(text: &str) -> Result<Uuid> {
    Uuid::parse_str(text).map_err(|e| IngestError::Database {
        message: format!("invalid uuid '{text}': {e}"),
    })
}

// Column readers for use inside rusqlite row-mapping closures, which must
// return rusqlite::Result.

fn conversion_err(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}

pub(crate) fn uuid_col(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let text: String = row.get(idx)?;
    Uuid::parse_str(&text).map_err(|e| conversion_err(idx, e))
}

pub(crate) fn opt_uuid_col(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<Uuid>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|t| Uuid::parse_str(&t).map_err(|e| conversion_err(idx, e)))
        .transpose()
}

pub(crate) fn ts_col(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, e))
}

pub(crate) fn opt_ts_col(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|t| {
        DateTime::parse_from_rfc3339(&t)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| conversion_err(idx, e))
    })
    .transpose()
}

pub(crate) fn json_col(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<serde_json::Value> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text).map_err(|e| conversion_err(idx, e))
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sources (
    id        TEXT PRIMARY KEY,
    name      TEXT NOT NULL,
    base_url  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS countries (
    id    TEXT PRIMARY KEY,
    name  TEXT NOT NULL,
    code  TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS cities (
    id               TEXT PRIMARY KEY,
    name             TEXT NOT NULL,
    normalized_name  TEXT NOT NULL,
    country_id       TEXT NOT NULL REFERENCES countries(id),
    UNIQUE(normalized_name, country_id)
);

CREATE TABLE IF NOT EXISTS venues (
    id               TEXT PRIMARY KEY,
    name             TEXT NOT NULL,
    normalized_name  TEXT NOT NULL,
    slug             TEXT NOT NULL UNIQUE,
    address          TEXT NOT NULL,
    latitude         REAL,
    longitude        REAL,
    postcode         TEXT,
    place_id         TEXT UNIQUE,
    city_id          TEXT NOT NULL REFERENCES cities(id),
    phone            TEXT,
    website          TEXT,
    created_at       TEXT NOT NULL,
    deleted_at       TEXT,
    merged_into_id   TEXT REFERENCES venues(id),
    deleted_by       TEXT
);
CREATE INDEX IF NOT EXISTS idx_venues_normalized_name ON venues(normalized_name);
CREATE INDEX IF NOT EXISTS idx_venues_city ON venues(city_id);

CREATE TABLE IF NOT EXISTS performers (
    id             TEXT PRIMARY KEY,
    name           TEXT NOT NULL,
    source_id      TEXT NOT NULL REFERENCES sources(id),
    profile_image  TEXT,
    UNIQUE(name, source_id)
);

CREATE TABLE IF NOT EXISTS events (
    id               TEXT PRIMARY KEY,
    venue_id         TEXT NOT NULL REFERENCES venues(id),
    day_of_week      INTEGER NOT NULL CHECK (day_of_week BETWEEN 1 AND 7),
    start_time       TEXT NOT NULL,
    frequency        TEXT NOT NULL,
    entry_fee_cents  INTEGER,
    description      TEXT,
    performer_id     TEXT REFERENCES performers(id),
    image_ref        TEXT,
    created_at       TEXT NOT NULL,
    updated_at       TEXT NOT NULL,
    UNIQUE(venue_id, day_of_week)
);

CREATE TABLE IF NOT EXISTS event_sources (
    id            TEXT PRIMARY KEY,
    event_id      TEXT NOT NULL REFERENCES events(id),
    source_id     TEXT NOT NULL REFERENCES sources(id),
    source_url    TEXT NOT NULL,
    status        TEXT NOT NULL DEFAULT 'active',
    last_seen_at  TEXT NOT NULL,
    metadata      TEXT NOT NULL DEFAULT '{}',
    UNIQUE(event_id, source_id)
);
CREATE INDEX IF NOT EXISTS idx_event_sources_url ON event_sources(source_id, source_url);

CREATE TABLE IF NOT EXISTS merge_log (
    id                 TEXT PRIMARY KEY,
    action_type        TEXT NOT NULL CHECK (action_type IN ('merge','preview','rollback')),
    primary_venue_id   TEXT NOT NULL,
    secondary_venue_id TEXT NOT NULL,
    metadata           TEXT NOT NULL DEFAULT '{}',
    performed_by       TEXT NOT NULL,
    notes              TEXT,
    created_at         TEXT NOT NULL,
    CHECK (primary_venue_id <> secondary_venue_id)
);

CREATE TABLE IF NOT EXISTS duplicate_candidates (
    id            TEXT PRIMARY KEY,
    venue_id      TEXT NOT NULL REFERENCES venues(id),
    candidate_id  TEXT NOT NULL REFERENCES venues(id),
    score         REAL NOT NULL,
    detected_at   TEXT NOT NULL,
    UNIQUE(venue_id, candidate_id)
);

CREATE TABLE IF NOT EXISTS jobs (
    id            TEXT PRIMARY KEY,
    kind          TEXT NOT NULL,
    source_id     TEXT NOT NULL,
    payload       TEXT NOT NULL,
    run_at        TEXT NOT NULL,
    priority      INTEGER NOT NULL DEFAULT 0,
    attempts      INTEGER NOT NULL DEFAULT 0,
    max_attempts  INTEGER NOT NULL DEFAULT 3,
    status        TEXT NOT NULL DEFAULT 'pending',
    last_error    TEXT,
    claimed_at    TEXT,
    created_at    TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_jobs_due ON jobs(status, run_at);

CREATE TABLE IF NOT EXISTS rate_slots (
    source_id    TEXT PRIMARY KEY,
    next_run_at  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS job_runs (
    id           TEXT PRIMARY KEY,
    source_id    TEXT NOT NULL,
    kind         TEXT NOT NULL,
    started_at   TEXT NOT NULL,
    finished_at  TEXT,
    processed    INTEGER NOT NULL DEFAULT 0,
    enqueued     INTEGER NOT NULL DEFAULT 0,
    skipped      INTEGER NOT NULL DEFAULT 0,
    failed       INTEGER NOT NULL DEFAULT 0,
    error        TEXT
);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent() {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().unwrap();
        db.run_migrations().unwrap();
    }

    #[test]
    fn tx_rolls_back_on_error() {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().unwrap();
        let result: Result<()> = db.with_tx(|tx| {
            tx.execute(
                "INSERT INTO sources (id, name, base_url) VALUES ('s1', 'S1', 'http://x')",
                [],
            )?;
            Err(IngestError::fatal("boom"))
        });
        assert!(result.is_err());
        let count: i64 = db
            .with_conn(|conn| {
                conn.query_row("SELECT COUNT(*) FROM sources", [], |r| r.get(0))
                    .map_err(IngestError::from)
            })
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn on_disk_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("quiz.db");
        {
            let db = Database::open(&path).unwrap();
            db.run_migrations().unwrap();
            db.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO sources (id, name, base_url) VALUES ('s1', 'S1', 'http://x')",
                    [],
                )
                .map_err(IngestError::from)?;
                Ok(())
            })
            .unwrap();
        }
        let db = Database::open(&path).unwrap();
        db.run_migrations().unwrap();
        let count: i64 = db
            .with_conn(|conn| {
                conn.query_row("SELECT COUNT(*) FROM sources", [], |r| r.get(0))
                    .map_err(IngestError::from)
            })
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn timestamps_round_trip_and_sort() {
        // truncate to the stored precision before comparing
        let a = parse_ts(&fmt_ts(Utc::now())).unwrap();
        let b = a + chrono::Duration::microseconds(1);
        assert!(fmt_ts(a) < fmt_ts(b));
        assert_eq!(parse_ts(&fmt_ts(a)).unwrap(), a);
    }
}
