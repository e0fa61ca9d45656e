// ✅ Quality Gate - raw rows in, staged records out
//
// Runs before any key derivation:
// 1. Map source headers to registry fields (unknown headers become drift fields)
// 2. Require the entity's natural key; drop and report rows without one
// 3. Coerce numerics (default 0), normalize missing text to "Unknown", parse dates
// 4. Contain numeric outliers per batch with the IQR rule (replace with median)
// 5. Protect sensitive natural keys for display

use crate::error::{Result, VaultError};
use crate::protection::ProtectionContext;
use crate::record::{FieldValue, RawRecord, StagedRecord};
use crate::registry::{EntityDefinition, EntityKind, FieldDefinition, FieldKind};
use crate::report::RecordIssue;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Replacement for missing text and reference keys.
pub const UNKNOWN: &str = "Unknown";

/// Header that overrides the configured source label per row.
pub const SOURCE_FIELD: &str = "source";

/// Batches smaller than this are not checked for outliers.
pub const MIN_OUTLIER_BATCH: usize = 4;

const MISSING_MARKERS: [&str; 5] = ["", "n/a", "na", "null", "none"];

/// Satellite bookkeeping columns a drift field must never shadow.
const RESERVED_COLUMNS: [&str; 5] = ["start_date", "end_date", "load_date", "hash_diff", "source"];

// ============================================================================
// GATE SUMMARY
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GateSummary {
    pub entity: Option<EntityKind>,
    pub rows_in: usize,
    pub accepted: usize,
    pub dropped: usize,
    /// Missing or unparseable values replaced by a default
    pub values_defaulted: usize,
    pub outliers_replaced: usize,
}

impl GateSummary {
    pub fn summary(&self) -> String {
        format!(
            "{}: {} rows, {} accepted, {} dropped | {} defaulted, {} outliers replaced",
            self.entity.map(|e| e.as_str()).unwrap_or("batch"),
            self.rows_in,
            self.accepted,
            self.dropped,
            self.values_defaulted,
            self.outliers_replaced
        )
    }
}

/// Result of gating one entity batch.
#[derive(Debug, Clone, Default)]
pub struct GateOutcome {
    pub records: Vec<StagedRecord>,
    pub summary: GateSummary,
    pub issues: Vec<RecordIssue>,
}

// ============================================================================
// QUALITY GATE
// ============================================================================

pub struct QualityGate<'a> {
    protection: &'a ProtectionContext,
    default_source: String,
}

impl<'a> QualityGate<'a> {
    pub fn new(protection: &'a ProtectionContext, default_source: impl Into<String>) -> Self {
        QualityGate {
            protection,
            default_source: default_source.into(),
        }
    }

    /// Gate a whole batch of one entity. Needs the full batch because outlier
    /// bounds are batch statistics.
    pub fn stage_batch(&self, def: &EntityDefinition, rows: &[RawRecord]) -> Result<GateOutcome> {
        let mut outcome = GateOutcome {
            summary: GateSummary {
                entity: Some(def.kind),
                rows_in: rows.len(),
                ..Default::default()
            },
            ..Default::default()
        };

        for raw in rows {
            match self.stage_record(def, raw, &mut outcome.summary) {
                Ok(record) => outcome.records.push(record),
                Err(VaultError::Validation { line, reason, .. }) => {
                    outcome.summary.dropped += 1;
                    warn!(entity = %def.kind, line, "dropping row: {}", reason);
                    outcome
                        .issues
                        .push(RecordIssue::validation(def.kind, line, reason));
                }
                Err(err) => return Err(err),
            }
        }

        outcome.summary.outliers_replaced = contain_outliers(def, &mut outcome.records);
        outcome.summary.accepted = outcome.records.len();

        Ok(outcome)
    }

    /// `VaultError::Validation` when the row has no natural key.
    fn stage_record(
        &self,
        def: &EntityDefinition,
        raw: &RawRecord,
        summary: &mut GateSummary,
    ) -> Result<StagedRecord> {
        let mut canonical: BTreeMap<&'static str, &str> = BTreeMap::new();
        let mut extras = BTreeMap::new();
        let mut source = None;

        for (header, value) in &raw.fields {
            if header == SOURCE_FIELD {
                source = present(value).map(str::to_string);
            } else if let Some(field) = def.canonical_field(header) {
                // An exact header wins over an alias for the same field
                if header == field || !canonical.contains_key(field) {
                    canonical.insert(field, value.as_str());
                }
            } else if is_reserved(def, header) {
                debug!(entity = %def.kind, header = %header, "ignoring reserved header");
            } else {
                // Blank drift values are kept as "" and stored as NULL
                let value = present(value).unwrap_or_default();
                extras.insert(header.clone(), value.to_string());
            }
        }

        let Some(natural_key) = canonical
            .get(def.natural_key.name)
            .and_then(|v| present(v))
            .map(str::to_string)
        else {
            return Err(VaultError::Validation {
                entity: def.kind.to_string(),
                line: raw.line_number,
                reason: format!("missing required natural key {}", def.natural_key.name),
            });
        };

        let display_key = if def.natural_key.sensitive {
            self.protection.protect(&natural_key)?
        } else {
            natural_key.clone()
        };

        let attributes = def
            .attributes
            .iter()
            .map(|f| coerce(f, canonical.get(f.name).copied(), summary))
            .collect::<Vec<_>>();

        let references = def
            .references
            .iter()
            .map(|r| match canonical.get(r.field.name).and_then(|v| present(v)) {
                Some(key) => key.to_string(),
                None => {
                    summary.values_defaulted += 1;
                    UNKNOWN.to_string()
                }
            })
            .collect();

        // Measures shared with attributes reuse the coerced attribute value
        let measures = def
            .measures
            .iter()
            .map(|m| match def.attributes.iter().position(|a| a.name == m.name) {
                Some(idx) => attributes[idx].clone(),
                None => coerce(m, canonical.get(m.name).copied(), summary),
            })
            .collect::<Vec<_>>();

        let effective_at = def.effective_date.and_then(|name| {
            def.attributes
                .iter()
                .position(|a| a.name == name)
                .and_then(|idx| attributes[idx].as_timestamp())
                .or_else(|| {
                    def.measures
                        .iter()
                        .position(|m| m.name == name)
                        .and_then(|idx| measures[idx].as_timestamp())
                })
        });

        Ok(StagedRecord {
            entity: def.kind,
            line_number: raw.line_number,
            natural_key,
            display_key,
            attributes,
            references,
            measures,
            extras,
            effective_at,
            source: source.unwrap_or_else(|| self.default_source.clone()),
        })
    }
}

// ============================================================================
// COERCION
// ============================================================================

/// `None` for missing-value markers, otherwise the trimmed value.
pub fn present(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if MISSING_MARKERS
        .iter()
        .any(|m| trimmed.eq_ignore_ascii_case(m))
    {
        None
    } else {
        Some(trimmed)
    }
}

fn is_reserved(def: &EntityDefinition, header: &str) -> bool {
    RESERVED_COLUMNS.contains(&header) || header == def.hash_key_column
}

fn coerce(field: &FieldDefinition, raw: Option<&str>, summary: &mut GateSummary) -> FieldValue {
    let value = raw.and_then(present);

    match field.kind {
        FieldKind::Text => match value {
            Some(v) => FieldValue::Text(v.to_string()),
            None => {
                summary.values_defaulted += 1;
                FieldValue::Text(UNKNOWN.to_string())
            }
        },
        FieldKind::Numeric => match value.and_then(parse_numeric) {
            Some(n) => FieldValue::Number(n),
            None => {
                summary.values_defaulted += 1;
                FieldValue::Number(0.0)
            }
        },
        // Missing dates stay null; the load date stands in as start date
        FieldKind::Date => match value.and_then(parse_date) {
            Some(ts) => FieldValue::Timestamp(ts),
            None => {
                summary.values_defaulted += 1;
                FieldValue::Null
            }
        },
    }
}

/// Parse a number, ignoring currency decoration (`$1,234.50`).
pub fn parse_numeric(value: &str) -> Option<f64> {
    let cleaned: String = value
        .chars()
        .filter(|c| *c != '$' && *c != ',' && !c.is_whitespace())
        .collect();

    cleaned.parse::<f64>().ok().filter(|n| n.is_finite())
}

/// Accepts `YYYY-MM-DD`, `MM/DD/YYYY`, `YYYY-MM-DD HH:MM:SS` and RFC 3339.
pub fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }

    if let Ok(naive) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S") {
        return Some(Utc.from_utc_datetime(&naive));
    }

    ["%Y-%m-%d", "%m/%d/%Y"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(value, fmt).ok())
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

// ============================================================================
// OUTLIER CONTAINMENT
// ============================================================================

/// Replace values outside `[Q1 - 1.5*IQR, Q3 + 1.5*IQR]` with the batch
/// median, for every numeric field of the entity. Returns the number of
/// values replaced.
pub fn contain_outliers(def: &EntityDefinition, records: &mut [StagedRecord]) -> usize {
    if records.len() < MIN_OUTLIER_BATCH {
        return 0;
    }

    let mut replaced = 0;

    for name in def.numeric_fields() {
        let attr_idx = def.attributes.iter().position(|a| a.name == name);
        let measure_idx = def.measures.iter().position(|m| m.name == name);

        let column: Vec<f64> = records
            .iter()
            .filter_map(|r| match (attr_idx, measure_idx) {
                (Some(i), _) => r.attributes[i].as_f64(),
                (None, Some(i)) => r.measures[i].as_f64(),
                (None, None) => None,
            })
            .collect();

        let Some(bounds) = OutlierBounds::from_values(&column) else {
            continue;
        };

        for record in records.iter_mut() {
            let current = match (attr_idx, measure_idx) {
                (Some(i), _) => record.attributes[i].as_f64(),
                (None, Some(i)) => record.measures[i].as_f64(),
                (None, None) => None,
            };
            let Some(value) = current else { continue };

            if bounds.contains(value) {
                continue;
            }

            debug!(
                entity = %def.kind,
                line = record.line_number,
                field = name,
                value,
                median = bounds.median,
                "replacing outlier"
            );
            if let Some(i) = attr_idx {
                record.attributes[i] = FieldValue::Number(bounds.median);
            }
            if let Some(i) = measure_idx {
                record.measures[i] = FieldValue::Number(bounds.median);
            }
            replaced += 1;
        }
    }

    replaced
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutlierBounds {
    pub lower: f64,
    pub upper: f64,
    pub median: f64,
}

impl OutlierBounds {
    pub fn from_values(values: &[f64]) -> Option<Self> {
        if values.len() < MIN_OUTLIER_BATCH {
            return None;
        }

        let mut sorted = values.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));

        let q1 = quantile(&sorted, 0.25);
        let q3 = quantile(&sorted, 0.75);
        let iqr = q3 - q1;

        Some(OutlierBounds {
            lower: q1 - 1.5 * iqr,
            upper: q3 + 1.5 * iqr,
            median: quantile(&sorted, 0.5),
        })
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.lower && value <= self.upper
    }
}

/// Linear-interpolated quantile over sorted values.
fn quantile(sorted: &[f64], q: f64) -> f64 {
    let pos = (sorted.len() - 1) as f64 * q;
    let lower = pos.floor() as usize;
    let upper = pos.ceil() as usize;
    let frac = pos - lower as f64;

    sorted[lower] + (sorted[upper] - sorted[lower]) * frac
}
