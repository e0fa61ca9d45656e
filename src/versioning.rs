// ⏰ Satellite Versioner - change detection and end-dating per hash key
//
// State machine for one hash key's satellite history:
//
//   NoVersion ──ingest──▶ Current(d)
//   Current(d) ──ingest(diff == d)──▶ Current(d)              (no-op)
//   Current(d) ──ingest(diff != d)──▶ Current(diff)           (close + insert)
//
// Deciding is pure; applying the decision happens inside the chunk
// transaction (see `handlers`), so the close and the insert commit together.

use crate::error::Result;
use crate::record::{format_timestamp, parse_timestamp};
use crate::registry::EntityDefinition;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};

// ============================================================================
// STATE
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum SatelliteState {
    NoVersion,
    Current {
        hash_diff: String,
        start_date: DateTime<Utc>,
    },
}

impl SatelliteState {
    /// Read the current version of `hash_key` from storage.
    pub fn load(conn: &Connection, def: &EntityDefinition, hash_key: &str) -> Result<Self> {
        let row: Option<(String, String)> = conn
            .query_row(def.sql.current_version, params![hash_key], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .optional()?;

        Ok(match row {
            None => SatelliteState::NoVersion,
            Some((hash_diff, start)) => SatelliteState::Current {
                hash_diff,
                // Rows written by this crate always parse; anything else sorts first
                start_date: parse_timestamp(&start).unwrap_or(DateTime::<Utc>::MIN_UTC),
            },
        })
    }

    pub fn is_current(&self) -> bool {
        matches!(self, SatelliteState::Current { .. })
    }

    /// Decide what ingesting a version with `hash_diff` means for this key.
    ///
    /// `effective_at` is the source's authoritative start date, if it has one;
    /// otherwise the run's `load_date` is used.
    pub fn ingest(
        &self,
        hash_diff: &str,
        effective_at: Option<DateTime<Utc>>,
        load_date: DateTime<Utc>,
    ) -> VersionDecision {
        let candidate = effective_at.unwrap_or(load_date);

        match self {
            SatelliteState::NoVersion => VersionDecision::Insert {
                start_date: candidate,
            },
            SatelliteState::Current {
                hash_diff: current, ..
            } if current == hash_diff => VersionDecision::Unchanged,
            SatelliteState::Current { start_date, .. } => {
                let start = next_start_date(*start_date, candidate, load_date);
                VersionDecision::Supersede {
                    end_date: start,
                    start_date: start,
                }
            }
        }
    }

    /// State after a decision has been applied.
    pub fn apply(self, decision: &VersionDecision, hash_diff: &str) -> SatelliteState {
        match decision {
            VersionDecision::Unchanged => self,
            VersionDecision::Insert { start_date }
            | VersionDecision::Supersede { start_date, .. } => SatelliteState::Current {
                hash_diff: hash_diff.to_string(),
                start_date: *start_date,
            },
        }
    }
}

// ============================================================================
// DECISION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionDecision {
    /// First version for this key
    Insert { start_date: DateTime<Utc> },
    /// Close the current version at `end_date`, then insert the new one
    Supersede {
        end_date: DateTime<Utc>,
        start_date: DateTime<Utc>,
    },
    /// Same hash diff as the current version
    Unchanged,
}

/// Start date for a version that supersedes one starting at `current_start`.
///
/// Versions must start strictly after the version they close. A candidate
/// that does not (an older effective date, or the same timestamp twice in
/// one run) moves to the load date, or one microsecond past the current
/// start when the load date is no later either.
pub fn next_start_date(
    current_start: DateTime<Utc>,
    candidate: DateTime<Utc>,
    load_date: DateTime<Utc>,
) -> DateTime<Utc> {
    if candidate > current_start {
        candidate
    } else if load_date > current_start {
        load_date
    } else {
        current_start + Duration::microseconds(1)
    }
}

// ============================================================================
// APPLY
// ============================================================================

/// Values bound into `insert_version` besides the attributes.
pub struct VersionRow<'a> {
    pub hash_key: &'a str,
    pub hash_diff: &'a str,
    pub load_date: DateTime<Utc>,
    pub source: &'a str,
}

/// Write a decision inside the caller's transaction. Returns whether a
/// previous version was closed.
pub fn apply_decision(
    conn: &Connection,
    def: &EntityDefinition,
    decision: &VersionDecision,
    row: &VersionRow<'_>,
    attributes: &[&dyn rusqlite::ToSql],
) -> Result<bool> {
    let start_date = match decision {
        VersionDecision::Unchanged => return Ok(false),
        VersionDecision::Insert { start_date } => *start_date,
        VersionDecision::Supersede {
            end_date,
            start_date,
        } => {
            conn.execute(
                def.sql.close_version,
                params![format_timestamp(*end_date), row.hash_key],
            )?;
            *start_date
        }
    };

    let start = format_timestamp(start_date);
    let load = format_timestamp(row.load_date);

    let mut values: Vec<&dyn rusqlite::ToSql> = Vec::with_capacity(attributes.len() + 5);
    values.push(&row.hash_key);
    values.extend_from_slice(attributes);
    values.push(&start);
    values.push(&load);
    values.push(&row.source);
    values.push(&row.hash_diff);

    conn.execute(def.sql.insert_version, values.as_slice())?;

    Ok(matches!(decision, VersionDecision::Supersede { .. }))
}
