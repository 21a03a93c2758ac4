//! Merge audit log and stored duplicate candidates.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::common::error::{IngestError, Result};
use crate::domain::{DuplicateCandidate, MergeAction, MergeLogEntry};

use super::{fmt_ts, json_col, ts_col, uuid_col};

const LOG_COLS: &str =
    "id, action_type, primary_venue_id, secondary_venue_id, metadata, performed_by, notes, created_at";

fn row_to_log(row: &Row<'_>) -> rusqlite::Result<MergeLogEntry> {
    let action_text: String = row.get(1)?;
    let action = MergeAction::parse(&action_text).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            rusqlite::types::Type::Text,
            format!("unknown merge action '{action_text}'").into(),
        )
    })?;
    Ok(MergeLogEntry {
        id: uuid_col(row, 0)?,
        action,
        primary_venue_id: uuid_col(row, 2)?,
        secondary_venue_id: uuid_col(row, 3)?,
        metadata: json_col(row, 4)?,
        performed_by: row.get(5)?,
        notes: row.get(6)?,
        created_at: ts_col(row, 7)?,
    })
}

/// Append-only: there is deliberately no update or delete counterpart.
pub fn append_log(conn: &Connection, entry: &MergeLogEntry) -> Result<()> {
    if entry.primary_venue_id == entry.secondary_venue_id {
        return Err(IngestError::fatal(
            "merge log rejects primary == secondary",
        ));
    }
    conn.execute(
        "INSERT INTO merge_log (id, action_type, primary_venue_id, secondary_venue_id, \
         metadata, performed_by, notes, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            entry.id.to_string(),
            entry.action.as_str(),
            entry.primary_venue_id.to_string(),
            entry.secondary_venue_id.to_string(),
            serde_json::to_string(&entry.metadata)?,
            entry.performed_by,
            entry.notes,
            fmt_ts(entry.created_at),
        ],
    )?;
    Ok(())
}

pub fn get_log(conn: &Connection, id: Uuid) -> Result<Option<MergeLogEntry>> {
    let sql = format!("SELECT {LOG_COLS} FROM merge_log WHERE id = ?1");
    let entry = conn
        .query_row(&sql, params![id.to_string()], row_to_log)
        .optional()?;
    Ok(entry)
}

/// Whether a rollback row already references this merge log entry.
pub fn rollback_exists_for(conn: &Connection, merge_log_id: Uuid) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM merge_log \
         WHERE action_type = 'rollback' \
           AND json_extract(metadata, '$.merge_log_id') = ?1",
        params![merge_log_id.to_string()],
        |r| r.get(0),
    )?;
    Ok(count > 0)
}

pub fn logs_for_venue(conn: &Connection, venue_id: Uuid) -> Result<Vec<MergeLogEntry>> {
    let sql = format!(
        "SELECT {LOG_COLS} FROM merge_log \
         WHERE primary_venue_id = ?1 OR secondary_venue_id = ?1 ORDER BY created_at"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![venue_id.to_string()], row_to_log)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

// --- duplicate candidates ---------------------------------------------------

pub fn store_candidate(
    conn: &Connection,
    venue_id: Uuid,
    candidate_id: Uuid,
    score: f64,
    detected_at: DateTime<Utc>,
) -> Result<bool> {
    let inserted = conn.execute(
        "INSERT INTO duplicate_candidates (id, venue_id, candidate_id, score, detected_at) \
         VALUES (?1, ?2, ?3, ?4, ?5) \
         ON CONFLICT(venue_id, candidate_id) DO UPDATE SET \
             score = excluded.score, detected_at = excluded.detected_at",
        params![
            Uuid::new_v4().to_string(),
            venue_id.to_string(),
            candidate_id.to_string(),
            score,
            fmt_ts(detected_at),
        ],
    )?;
    Ok(inserted > 0)
}

pub fn clear_candidates(conn: &Connection) -> Result<usize> {
    let deleted = conn.execute("DELETE FROM duplicate_candidates", [])?;
    Ok(deleted)
}

pub fn list_candidates(conn: &Connection) -> Result<Vec<DuplicateCandidate>> {
    let mut stmt = conn.prepare(
        "SELECT id, venue_id, candidate_id, score, detected_at FROM duplicate_candidates \
         ORDER BY score DESC",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(DuplicateCandidate {
            id: uuid_col(row, 0)?,
            venue_id: uuid_col(row, 1)?,
            candidate_id: uuid_col(row, 2)?,
            score: row.get(3)?,
            detected_at: ts_col(row, 4)?,
        })
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}
