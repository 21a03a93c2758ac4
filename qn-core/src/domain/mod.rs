use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Static reference data describing one quiz-night directory we ingest from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: String,
    pub name: String,
    pub base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Country {
    pub id: Uuid,
    pub name: String,
    pub code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct City {
    pub id: Uuid,
    pub name: String,
    pub normalized_name: String,
    pub country_id: Uuid,
}

/// Canonical venue. Never hard-deleted; merges soft-delete the secondary
/// and point it at the surviving row via `merged_into_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Venue {
    pub id: Uuid,
    pub name: String,
    pub normalized_name: String,
    pub slug: String,
    pub address: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub postcode: Option<String>,
    pub place_id: Option<String>,
    pub city_id: Uuid,
    pub phone: Option<String>,
    pub website: Option<String>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub merged_into_id: Option<Uuid>,
    pub deleted_by: Option<String>,
}

impl Venue {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Count of populated optional profile fields, used by the merge
    /// service's deterministic primary-venue tiebreak.
    pub fn profile_richness(&self) -> usize {
        [
            self.latitude.is_some(),
            self.longitude.is_some(),
            self.postcode.is_some(),
            self.place_id.is_some(),
            self.phone.is_some(),
            self.website.is_some(),
            !self.address.is_empty(),
        ]
        .iter()
        .filter(|present| **present)
        .count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Weekly,
    Biweekly,
    Monthly,
    Irregular,
}

impl Frequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Frequency::Weekly => "weekly",
            Frequency::Biweekly => "biweekly",
            Frequency::Monthly => "monthly",
            Frequency::Irregular => "irregular",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "weekly" => Some(Frequency::Weekly),
            "biweekly" => Some(Frequency::Biweekly),
            "monthly" => Some(Frequency::Monthly),
            "irregular" => Some(Frequency::Irregular),
            _ => None,
        }
    }
}

/// A recurring quiz night at a venue. Upsert identity key is
/// `(venue_id, day_of_week)` with `day_of_week` in 1..=7 (Monday = 1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub venue_id: Uuid,
    pub day_of_week: u8,
    pub start_time: NaiveTime,
    pub frequency: Frequency,
    pub entry_fee_cents: Option<i64>,
    pub description: Option<String>,
    pub performer_id: Option<Uuid>,
    pub image_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-source provenance for an event; one row per `(event_id, source_id)`.
/// `last_seen_at` drives the freshness-skip window and staleness reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSource {
    pub id: Uuid,
    pub event_id: Uuid,
    pub source_id: String,
    pub source_url: String,
    pub status: String,
    pub last_seen_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Performer {
    pub id: Uuid,
    pub name: String,
    pub source_id: String,
    pub profile_image: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeAction {
    Merge,
    Preview,
    Rollback,
}

impl MergeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeAction::Merge => "merge",
            MergeAction::Preview => "preview",
            MergeAction::Rollback => "rollback",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "merge" => Some(MergeAction::Merge),
            "preview" => Some(MergeAction::Preview),
            "rollback" => Some(MergeAction::Rollback),
            _ => None,
        }
    }
}

/// Append-only audit record for merge-related actions. Rows are never
/// edited in place; a rollback appends a new row referencing the original.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeLogEntry {
    pub id: Uuid,
    pub action: MergeAction,
    pub primary_venue_id: Uuid,
    pub secondary_venue_id: Uuid,
    pub metadata: serde_json::Value,
    pub performed_by: String,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicateCandidate {
    pub id: Uuid,
    pub venue_id: Uuid,
    pub candidate_id: Uuid,
    pub score: f64,
    pub detected_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Typed ingestion inputs, constructed once at the extractor boundary and
// never re-normalized downstream.
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueInput {
    pub name: String,
    pub address: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub place_id: Option<String>,
    pub postcode: Option<String>,
    pub phone: Option<String>,
    pub website: Option<String>,
    /// Locale resolved at the boundary (geocoder or source data); the
    /// resolver never makes outbound calls itself.
    pub city: Option<String>,
    pub country_code: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformerInput {
    pub name: String,
    pub profile_image: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventInput {
    pub day_of_week: u8,
    pub start_time: NaiveTime,
    pub frequency: Frequency,
    pub entry_fee_cents: Option<i64>,
    pub description: Option<String>,
    pub performer: Option<PerformerInput>,
    pub image_url: Option<String>,
}

/// One fully-normalized listing: everything the detail processor needs to
/// resolve the venue and upsert the event inside a single transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListingInput {
    pub source_id: String,
    pub source_url: String,
    pub venue: VenueInput,
    pub event: EventInput,
    pub metadata: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Raw extractor handoff types.
// ---------------------------------------------------------------------------

/// One raw record from a source's index feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawListing {
    pub source_id: String,
    pub url: String,
    pub name: Option<String>,
}

/// The detail payload for a listing, as extracted (still source-shaped text).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawDetail {
    pub url: String,
    pub name: String,
    pub address: String,
    pub time_text: String,
    pub fee_text: Option<String>,
    pub frequency_text: Option<String>,
    pub description: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub postcode: Option<String>,
    pub place_id: Option<String>,
    pub phone: Option<String>,
    pub website: Option<String>,
    pub performer_name: Option<String>,
    pub performer_image: Option<String>,
    pub image_url: Option<String>,
    pub payload_sha256: Option<String>,
}

// ---------------------------------------------------------------------------
// Job queue and run metadata.
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Index,
    Detail,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Index => "index",
            JobKind::Detail => "detail",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "index" => Some(JobKind::Index),
            "detail" => Some(JobKind::Detail),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "done" => Some(JobStatus::Done),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub kind: JobKind,
    pub source_id: String,
    pub payload: serde_json::Value,
    pub run_at: DateTime<Utc>,
    pub priority: i64,
    pub attempts: u32,
    pub max_attempts: u32,
    pub status: JobStatus,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Structured per-run metadata emitted for operational visibility.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRun {
    pub id: Uuid,
    pub source_id: String,
    pub kind: JobKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub processed: u32,
    pub enqueued: u32,
    pub skipped: u32,
    pub failed: u32,
    pub error: Option<String>,
}
