//! Merge, preview and rollback of duplicate venues, with an append-only
//! audit log. The log's metadata records exactly which rows moved so a
//! rollback can put every association back where it was.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use qn_core::db::{events, merge, venues};
use qn_core::domain::{MergeAction, MergeLogEntry, Venue};
use qn_core::{Database, IngestError, Result};

use crate::observability::metrics;

/// What a merge did (or would do). Serialized into the merge log metadata
/// and read back verbatim by rollback.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MergeDiff {
    /// Secondary events reassigned wholesale to the primary venue.
    pub moved_event_ids: Vec<Uuid>,
    /// Provenance rows moved onto an existing primary event because the
    /// primary already had an event on that weekday: (row, from, to).
    pub moved_provenance: Vec<ProvenanceMove>,
    /// Secondary events left in place because the primary event already
    /// carried provenance from every one of their sources.
    pub unmigrated_event_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvenanceMove {
    pub event_source_id: Uuid,
    pub from_event_id: Uuid,
    pub to_event_id: Uuid,
}

pub struct MergeOptions {
    pub performed_by: String,
    pub notes: Option<String>,
}

pub struct MergeService {
    db: Database,
}

impl MergeService {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Deterministic primary pick: richer profile wins, earliest creation
    /// date breaks ties, venue id as the final stable tiebreak.
    pub fn determine_primary_venue<'a>(a: &'a Venue, b: &'a Venue) -> (&'a Venue, &'a Venue) {
        let ra = a.profile_richness();
        let rb = b.profile_richness();
        if ra != rb {
            if ra > rb {
                (a, b)
            } else {
                (b, a)
            }
        } else if a.created_at != b.created_at {
            if a.created_at < b.created_at {
                (a, b)
            } else {
                (b, a)
            }
        } else if a.id < b.id {
            (a, b)
        } else {
            (b, a)
        }
    }

    /// Migrate all events and provenance from `secondary_id` to
    /// `primary_id`, soft-delete the secondary, and append a "merge" log
    /// row. One transaction: a failure leaves both venues untouched.
    pub fn merge_venues(
        &self,
        primary_id: Uuid,
        secondary_id: Uuid,
        opts: &MergeOptions,
    ) -> Result<MergeLogEntry> {
        let entry = self.db.with_tx(|tx| {
            let (primary, secondary) = load_pair(tx, primary_id, secondary_id)?;
            let diff = apply_migration(tx, &primary, &secondary)?;
            venues::soft_delete(tx, secondary.id, primary.id, &opts.performed_by, Utc::now())?;

            let entry = log_entry(MergeAction::Merge, &primary, &secondary, &diff, opts)?;
            merge::append_log(tx, &entry)?;
            Ok(entry)
        })?;
        metrics::dedup::merges_performed();
        info!(
            primary = %primary_id,
            secondary = %secondary_id,
            moved_events = entry_diff(&entry)?.moved_event_ids.len(),
            "merged venues"
        );
        Ok(entry)
    }

    /// Compute the same diff as `merge_venues` without migrating anything.
    /// The preview itself is still recorded in the audit log.
    pub fn preview_merge(
        &self,
        primary_id: Uuid,
        secondary_id: Uuid,
        opts: &MergeOptions,
    ) -> Result<(MergeDiff, MergeLogEntry)> {
        self.db.with_tx(|tx| {
            let (primary, secondary) = load_pair(tx, primary_id, secondary_id)?;
            let diff = compute_diff(tx, &primary, &secondary)?;
            let entry = log_entry(MergeAction::Preview, &primary, &secondary, &diff, opts)?;
            merge::append_log(tx, &entry)?;
            Ok((diff, entry))
        })
    }

    /// Reverse a previous merge: restore the secondary venue and move
    /// every migrated row back. Appends a new "rollback" log row; the
    /// original merge row is never edited.
    pub fn rollback_merge(&self, merge_log_id: Uuid, opts: &MergeOptions) -> Result<MergeLogEntry> {
        let entry = self.db.with_tx(|tx| {
            let original = merge::get_log(tx, merge_log_id)?.ok_or_else(|| {
                IngestError::fatal(format!("merge log entry {merge_log_id} not found"))
            })?;
            if original.action != MergeAction::Merge {
                return Err(IngestError::fatal(format!(
                    "log entry {merge_log_id} is a {} action, not a merge",
                    original.action.as_str()
                )));
            }
            if merge::rollback_exists_for(tx, merge_log_id)? {
                return Err(IngestError::fatal(format!(
                    "merge {merge_log_id} was already rolled back"
                )));
            }
            let diff: MergeDiff = serde_json::from_value(
                original
                    .metadata
                    .get("diff")
                    .cloned()
                    .unwrap_or_default(),
            )?;

            venues::restore(tx, original.secondary_venue_id)?;
            for event_id in &diff.moved_event_ids {
                events::reassign_venue(tx, *event_id, original.secondary_venue_id)?;
            }
            for moved in &diff.moved_provenance {
                events::reassign_event_source(tx, moved.event_source_id, moved.from_event_id)?;
            }

            let entry = MergeLogEntry {
                id: Uuid::new_v4(),
                action: MergeAction::Rollback,
                primary_venue_id: original.primary_venue_id,
                secondary_venue_id: original.secondary_venue_id,
                metadata: serde_json::json!({
                    "merge_log_id": merge_log_id,
                    "restored_event_ids": diff.moved_event_ids,
                    "restored_provenance": diff.moved_provenance,
                }),
                performed_by: opts.performed_by.clone(),
                notes: opts.notes.clone(),
                created_at: Utc::now(),
            };
            merge::append_log(tx, &entry)?;
            Ok(entry)
        })?;
        metrics::dedup::rollbacks_performed();
        info!(merge_log_id = %merge_log_id, "rolled back merge");
        Ok(entry)
    }
}

fn load_pair(
    conn: &rusqlite::Connection,
    primary_id: Uuid,
    secondary_id: Uuid,
) -> Result<(Venue, Venue)> {
    if primary_id == secondary_id {
        return Err(IngestError::fatal("cannot merge a venue into itself"));
    }
    let primary = venues::get_venue(conn, primary_id)?
        .ok_or_else(|| IngestError::fatal(format!("primary venue {primary_id} not found")))?;
    let secondary = venues::get_venue(conn, secondary_id)?
        .ok_or_else(|| IngestError::fatal(format!("secondary venue {secondary_id} not found")))?;
    if primary.is_deleted() {
        return Err(IngestError::fatal("primary venue is deleted"));
    }
    if secondary.is_deleted() {
        return Err(IngestError::fatal("secondary venue is already deleted"));
    }
    Ok((primary, secondary))
}

/// Plan the migration without writing. Events whose weekday is free on the
/// primary move wholesale; where the primary already has an event that
/// day, provenance rows move across instead (the primary's event row
/// survives, per the one-event-per-weekday identity key).
fn compute_diff(
    conn: &rusqlite::Connection,
    primary: &Venue,
    secondary: &Venue,
) -> Result<MergeDiff> {
    let mut diff = MergeDiff::default();
    for event in events::events_for_venue(conn, secondary.id)? {
        match events::find_by_venue_day(conn, primary.id, event.day_of_week)? {
            None => diff.moved_event_ids.push(event.id),
            Some(primary_event) => {
                let primary_sources: Vec<String> =
                    events::sources_for_event(conn, primary_event.id)?
                        .into_iter()
                        .map(|es| es.source_id)
                        .collect();
                let mut any_moved = false;
                for es in events::sources_for_event(conn, event.id)? {
                    if !primary_sources.contains(&es.source_id) {
                        diff.moved_provenance.push(ProvenanceMove {
                            event_source_id: es.id,
                            from_event_id: event.id,
                            to_event_id: primary_event.id,
                        });
                        any_moved = true;
                    }
                }
                if !any_moved {
                    diff.unmigrated_event_ids.push(event.id);
                }
            }
        }
    }
    Ok(diff)
}

fn apply_migration(
    conn: &rusqlite::Connection,
    primary: &Venue,
    secondary: &Venue,
) -> Result<MergeDiff> {
    let diff = compute_diff(conn, primary, secondary)?;
    for event_id in &diff.moved_event_ids {
        events::reassign_venue(conn, *event_id, primary.id)?;
    }
    for moved in &diff.moved_provenance {
        events::reassign_event_source(conn, moved.event_source_id, moved.to_event_id)?;
    }
    Ok(diff)
}

fn log_entry(
    action: MergeAction,
    primary: &Venue,
    secondary: &Venue,
    diff: &MergeDiff,
    opts: &MergeOptions,
) -> Result<MergeLogEntry> {
    Ok(MergeLogEntry {
        id: Uuid::new_v4(),
        action,
        primary_venue_id: primary.id,
        secondary_venue_id: secondary.id,
        metadata: serde_json::json!({
            "diff": diff,
            "before": {
                "primary": { "name": primary.name, "slug": primary.slug },
                "secondary": { "name": secondary.name, "slug": secondary.slug },
            },
        }),
        performed_by: opts.performed_by.clone(),
        notes: opts.notes.clone(),
        created_at: Utc::now(),
    })
}

fn entry_diff(entry: &MergeLogEntry) -> Result<MergeDiff> {
    Ok(serde_json::from_value(
        entry.metadata.get("diff").cloned().unwrap_or_default(),
    )?)
}
