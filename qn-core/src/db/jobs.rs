//! Persistent job queue, per-source rate slots, and run metadata.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, Row};
use uuid::Uuid;

use crate::common::error::Result;
use crate::domain::{Job, JobKind, JobRun, JobStatus};

use super::{fmt_ts, ts_col, uuid_col};

const JOB_COLS: &str = "id, kind, source_id, payload, run_at, priority, attempts, max_attempts, \
     status, last_error, created_at";

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<Job> {
    let kind_text: String = row.get(1)?;
    let status_text: String = row.get(8)?;
    let payload_text: String = row.get(3)?;
    let bad = |idx: usize, msg: String| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, msg.into())
    };
    Ok(Job {
        id: uuid_col(row, 0)?,
        kind: JobKind::parse(&kind_text)
            .ok_or_else(|| bad(1, format!("unknown job kind '{kind_text}'")))?,
        source_id: row.get(2)?,
        payload: serde_json::from_str(&payload_text)
            .map_err(|e| bad(3, format!("bad job payload: {e}")))?,
        run_at: ts_col(row, 4)?,
        priority: row.get(5)?,
        attempts: row.get::<_, i64>(6)? as u32,
        max_attempts: row.get::<_, i64>(7)? as u32,
        status: JobStatus::parse(&status_text)
            .ok_or_else(|| bad(8, format!("unknown job status '{status_text}'")))?,
        last_error: row.get(9)?,
        created_at: ts_col(row, 10)?,
    })
}

pub struct NewJob {
    pub kind: JobKind,
    pub source_id: String,
    pub payload: serde_json::Value,
    pub run_at: DateTime<Utc>,
    pub priority: i64,
    pub max_attempts: u32,
}

pub fn enqueue(conn: &Connection, job: NewJob) -> Result<Uuid> {
    let id = Uuid::new_v4();
    conn.execute(
        "INSERT INTO jobs (id, kind, source_id, payload, run_at, priority, max_attempts, \
         status, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', ?8)",
        params![
            id.to_string(),
            job.kind.as_str(),
            job.source_id,
            serde_json::to_string(&job.payload)?,
            fmt_ts(job.run_at),
            job.priority,
            job.max_attempts as i64,
            fmt_ts(Utc::now()),
        ],
    )?;
    Ok(id)
}

/// Claim up to `limit` due jobs, flipping them to running. Takes pending
/// jobs whose run_at has arrived, plus running jobs claimed more than
/// `stale_after_secs` ago; those belong to a worker that crashed or was
/// aborted mid-job and would otherwise be stranded forever. A stale job
/// with no attempts left is marked failed instead of reclaimed. Runs
/// inside the caller's transaction so two workers never claim the same
/// row.
pub fn claim_due(
    conn: &Connection,
    now: DateTime<Utc>,
    limit: usize,
    stale_after_secs: i64,
) -> Result<Vec<Job>> {
    let stale_cutoff = fmt_ts(now - Duration::seconds(stale_after_secs));
    conn.execute(
        "UPDATE jobs SET status = 'failed', last_error = 'timed out while running' \
         WHERE status = 'running' AND claimed_at <= ?1 AND attempts >= max_attempts",
        params![stale_cutoff],
    )?;

    let sql = format!(
        "SELECT {JOB_COLS} FROM jobs \
         WHERE (status = 'pending' AND run_at <= ?1) \
            OR (status = 'running' AND claimed_at <= ?2) \
         ORDER BY priority DESC, run_at, created_at LIMIT ?3"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(
        params![fmt_ts(now), stale_cutoff, limit as i64],
        row_to_job,
    )?;
    let mut jobs = Vec::new();
    for row in rows {
        jobs.push(row?);
    }
    for job in &mut jobs {
        conn.execute(
            "UPDATE jobs SET status = 'running', attempts = attempts + 1, claimed_at = ?2 \
             WHERE id = ?1",
            params![job.id.to_string(), fmt_ts(now)],
        )?;
        job.status = JobStatus::Running;
        job.attempts += 1;
    }
    Ok(jobs)
}

pub fn complete(conn: &Connection, job_id: Uuid) -> Result<()> {
    conn.execute(
        "UPDATE jobs SET status = 'done', last_error = NULL WHERE id = ?1",
        params![job_id.to_string()],
    )?;
    Ok(())
}

/// Record a failure. Transient failures go back to pending with
/// exponential backoff until attempts are exhausted; everything else (and
/// exhausted jobs) is marked failed.
pub fn fail(
    conn: &Connection,
    job: &Job,
    error: &str,
    retryable: bool,
    backoff_base_secs: i64,
) -> Result<JobStatus> {
    let exhausted = job.attempts >= job.max_attempts;
    if retryable && !exhausted {
        let backoff = backoff_base_secs << (job.attempts.saturating_sub(1).min(10));
        let next = Utc::now() + Duration::seconds(backoff);
        conn.execute(
            "UPDATE jobs SET status = 'pending', run_at = ?2, last_error = ?3 WHERE id = ?1",
            params![job.id.to_string(), fmt_ts(next), error],
        )?;
        Ok(JobStatus::Pending)
    } else {
        conn.execute(
            "UPDATE jobs SET status = 'failed', last_error = ?2 WHERE id = ?1",
            params![job.id.to_string(), error],
        )?;
        Ok(JobStatus::Failed)
    }
}

pub fn count_with_status(conn: &Connection, status: JobStatus) -> Result<usize> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM jobs WHERE status = ?1",
        params![status.as_str()],
        |r| r.get(0),
    )?;
    Ok(count as usize)
}

// --- rate slots -------------------------------------------------------------

/// Atomically reserve the next send slot for a source. The cursor is
/// persisted, so the cap holds across runs and across workers, not just
/// within one process. Consecutive reservations are at least
/// `spacing_ms` apart, which bounds any rolling hour at the configured cap.
pub fn reserve_slot(conn: &Connection, source_id: &str, spacing_ms: i64) -> Result<DateTime<Utc>> {
    let now_ms = Utc::now().timestamp_millis();
    let slot_ms: i64 = conn.query_row(
        "INSERT INTO rate_slots (source_id, next_run_at) VALUES (?1, ?2) \
         ON CONFLICT(source_id) DO UPDATE SET \
             next_run_at = MAX(next_run_at + ?3, ?2) \
         RETURNING next_run_at",
        params![source_id, now_ms, spacing_ms],
        |r| r.get(0),
    )?;
    Ok(DateTime::from_timestamp_millis(slot_ms).unwrap_or_else(Utc::now))
}

// --- job runs ---------------------------------------------------------------

pub fn insert_job_run(conn: &Connection, run: &JobRun) -> Result<()> {
    conn.execute(
        "INSERT INTO job_runs (id, source_id, kind, started_at, finished_at, processed, \
         enqueued, skipped, failed, error) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            run.id.to_string(),
            run.source_id,
            run.kind.as_str(),
            fmt_ts(run.started_at),
            run.finished_at.map(fmt_ts),
            run.processed as i64,
            run.enqueued as i64,
            run.skipped as i64,
            run.failed as i64,
            run.error,
        ],
    )?;
    Ok(())
}
