// 📊 Run Report - what a completed ingestion run did
//
// Per-record problems are collected here (count + first samples) rather than
// raised, and failed chunks carry enough detail to re-run just their input.

use crate::quality::GateSummary;
use crate::registry::EntityKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Samples kept per run; the count keeps going past this.
pub const ISSUE_SAMPLE_LIMIT: usize = 20;

// ============================================================================
// RECORD ISSUES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    /// Dropped by the quality gate
    Validation,
    /// Link rejected because a referenced hub is not in storage
    UnresolvedReference,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordIssue {
    pub kind: IssueKind,
    pub entity: EntityKind,
    pub line_number: usize,
    /// Offending natural key (the record's own, or the unresolved reference)
    pub natural_key: Option<String>,
    pub message: String,
}

impl RecordIssue {
    pub fn validation(entity: EntityKind, line_number: usize, message: impl Into<String>) -> Self {
        RecordIssue {
            kind: IssueKind::Validation,
            entity,
            line_number,
            natural_key: None,
            message: message.into(),
        }
    }

    pub fn unresolved(
        entity: EntityKind,
        line_number: usize,
        natural_key: &str,
        message: impl Into<String>,
    ) -> Self {
        RecordIssue {
            kind: IssueKind::UnresolvedReference,
            entity,
            line_number,
            natural_key: Some(natural_key.to_string()),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IssueLog {
    pub count: usize,
    /// Totals per kind, including issues past the sample limit
    #[serde(default)]
    pub by_kind: BTreeMap<IssueKind, usize>,
    pub samples: Vec<RecordIssue>,
}

impl IssueLog {
    pub fn record(&mut self, issue: RecordIssue) {
        self.count += 1;
        *self.by_kind.entry(issue.kind).or_default() += 1;
        if self.samples.len() < ISSUE_SAMPLE_LIMIT {
            self.samples.push(issue);
        }
    }

    pub fn extend(&mut self, issues: impl IntoIterator<Item = RecordIssue>) {
        for issue in issues {
            self.record(issue);
        }
    }

    pub fn count_of(&self, kind: IssueKind) -> usize {
        self.by_kind.get(&kind).copied().unwrap_or(0)
    }
}

// ============================================================================
// LOAD COUNTERS
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadCounters {
    pub hubs_inserted: usize,
    pub hubs_present: usize,
    pub satellites_versioned: usize,
    pub satellites_unchanged: usize,
    /// Versions end-dated because a changed version superseded them
    pub satellites_closed: usize,
    pub links_inserted: usize,
    pub links_present: usize,
    pub links_rejected: usize,
}

impl LoadCounters {
    pub fn merge(&mut self, other: &LoadCounters) {
        self.hubs_inserted += other.hubs_inserted;
        self.hubs_present += other.hubs_present;
        self.satellites_versioned += other.satellites_versioned;
        self.satellites_unchanged += other.satellites_unchanged;
        self.satellites_closed += other.satellites_closed;
        self.links_inserted += other.links_inserted;
        self.links_present += other.links_present;
        self.links_rejected += other.links_rejected;
    }
}

// ============================================================================
// CHUNK FAILURES
// ============================================================================

/// A chunk whose transaction was rolled back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkFailure {
    pub stage: usize,
    pub chunk: usize,
    pub error: String,
    /// Source lines of every record in the chunk, for a targeted re-run
    pub line_numbers: Vec<(EntityKind, usize)>,
    pub natural_keys: Vec<String>,
}

// ============================================================================
// RUN REPORT
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub load_date: DateTime<Utc>,
    pub workers: usize,
    pub counters: LoadCounters,
    pub gates: Vec<GateSummary>,
    pub issues: IssueLog,
    pub chunk_failures: Vec<ChunkFailure>,
    /// `table.column` for every drift column added by this run
    pub drift_columns: Vec<String>,
}

impl RunReport {
    pub fn new(load_date: DateTime<Utc>, workers: usize) -> Self {
        RunReport {
            run_id: Uuid::new_v4(),
            load_date,
            workers,
            counters: LoadCounters::default(),
            gates: Vec::new(),
            issues: IssueLog::default(),
            chunk_failures: Vec::new(),
            drift_columns: Vec::new(),
        }
    }

    pub fn has_failures(&self) -> bool {
        !self.chunk_failures.is_empty()
    }

    pub fn summary(&self) -> String {
        let c = &self.counters;
        format!(
            "run {}: hubs {} new / {} present | satellites {} versioned, {} unchanged, {} closed | links {} new / {} present / {} rejected | {} issues ({} validation, {} unresolved), {} failed chunks",
            self.run_id,
            c.hubs_inserted,
            c.hubs_present,
            c.satellites_versioned,
            c.satellites_unchanged,
            c.satellites_closed,
            c.links_inserted,
            c.links_present,
            c.links_rejected,
            self.issues.count,
            self.issues.count_of(IssueKind::Validation),
            self.issues.count_of(IssueKind::UnresolvedReference),
            self.chunk_failures.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_log_caps_samples() {
        let mut log = IssueLog::default();
        for line in 0..(ISSUE_SAMPLE_LIMIT + 5) {
            log.record(RecordIssue::validation(EntityKind::Customer, line, "missing customer_id"));
        }

        assert_eq!(log.count, ISSUE_SAMPLE_LIMIT + 5);
        assert_eq!(log.samples.len(), ISSUE_SAMPLE_LIMIT);
        assert_eq!(log.count_of(IssueKind::Validation), ISSUE_SAMPLE_LIMIT + 5);
    }

    #[test]
    fn test_kind_totals_count_past_the_samples() {
        let mut log = IssueLog::default();
        for line in 0..25 {
            log.record(RecordIssue::validation(EntityKind::Customer, line, "missing customer_id"));
        }
        for line in 0..5 {
            log.record(RecordIssue::unresolved(EntityKind::Sale, line, "C9", "customer C9 not found"));
        }

        assert_eq!(log.count, 30);
        assert_eq!(log.count_of(IssueKind::Validation), 25);
        assert_eq!(log.count_of(IssueKind::UnresolvedReference), 5);
        assert!(log.samples.iter().all(|i| i.kind == IssueKind::Validation));

        let mut report = RunReport::new(Utc::now(), 1);
        report.issues = log;
        assert!(report.summary().contains("30 issues (25 validation, 5 unresolved)"));

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["issues"]["by_kind"]["validation"], 25);
        assert_eq!(json["issues"]["by_kind"]["unresolved_reference"], 5);
    }

    #[test]
    fn test_counters_merge() {
        let mut total = LoadCounters::default();
        let chunk = LoadCounters {
            hubs_inserted: 2,
            satellites_versioned: 2,
            links_rejected: 1,
            ..Default::default()
        };

        total.merge(&chunk);
        total.merge(&chunk);

        assert_eq!(total.hubs_inserted, 4);
        assert_eq!(total.satellites_versioned, 4);
        assert_eq!(total.links_rejected, 2);
        assert_eq!(total.links_inserted, 0);
    }

    #[test]
    fn test_summary_and_json() {
        let mut report = RunReport::new(Utc::now(), 4);
        report.counters.hubs_inserted = 3;
        report.issues.record(RecordIssue::unresolved(
            EntityKind::Sale,
            7,
            "C9",
            "customer C9 not found",
        ));

        let summary = report.summary();
        assert!(summary.contains("hubs 3 new"));
        assert!(summary.contains("1 issues (0 validation, 1 unresolved)"));
        assert!(!report.has_failures());

        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"unresolved_reference\""));
        assert!(json.contains("\"C9\""));
    }
}
