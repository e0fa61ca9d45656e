// 📄 Record model - raw rows, staged rows, hashed vault rows
//
// raw (header -> string) → quality gate → StagedRecord → key derivation → VaultRecord

use crate::hashing::{derive_hash_diff, derive_hash_key};
use crate::registry::EntityKind;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{Null, ToSql, ToSqlOutput};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ============================================================================
// FIELD VALUE
// ============================================================================

/// A typed value after coercion by the quality gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Text(String),
    Number(f64),
    Timestamp(DateTime<Utc>),
    Null,
}

impl FieldValue {
    /// Canonical string form fed into hash diffs. `None` only for `Null`.
    pub fn canonical(&self) -> Option<String> {
        match self {
            FieldValue::Text(s) => Some(s.clone()),
            FieldValue::Number(n) => Some(format!("{}", n)),
            FieldValue::Timestamp(ts) => Some(format_timestamp(*ts)),
            FieldValue::Null => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            FieldValue::Timestamp(ts) => Some(*ts),
            _ => None,
        }
    }
}

impl ToSql for FieldValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            FieldValue::Text(s) => ToSqlOutput::from(s.as_str()),
            FieldValue::Number(n) => ToSqlOutput::from(*n),
            FieldValue::Timestamp(ts) => ToSqlOutput::from(format_timestamp(*ts)),
            FieldValue::Null => ToSqlOutput::from(Null),
        })
    }
}

/// Fixed-width RFC 3339 (microseconds, `Z`), so string order is time order.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

// ============================================================================
// RAW RECORD
// ============================================================================

/// One row as read from a tabular source, keyed by normalized header.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawRecord {
    /// Line in the source file (1-based, header is line 1)
    pub line_number: usize,
    pub fields: BTreeMap<String, String>,
}

impl RawRecord {
    pub fn new(line_number: usize) -> Self {
        RawRecord {
            line_number,
            fields: BTreeMap::new(),
        }
    }

    /// Builder: add a field, normalizing its name.
    pub fn with(mut self, name: &str, value: impl Into<String>) -> Self {
        self.fields.insert(normalize_header(name), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(|s| s.as_str())
    }
}

/// `"Customer Name "` → `"customer_name"`.
pub fn normalize_header(header: &str) -> String {
    header
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c == ' ' || c == '-' || c == '.' { '_' } else { c })
        .collect()
}

// ============================================================================
// STAGED RECORD
// ============================================================================

/// A row that passed the quality gate, shaped by its entity definition.
///
/// `attributes`, `references` and `measures` follow the registry order of
/// the corresponding definition lists.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedRecord {
    pub entity: EntityKind,
    pub line_number: usize,
    /// Plaintext business key; never persisted for sensitive entities
    pub natural_key: String,
    /// What the hub stores as the natural key (protected when sensitive)
    pub display_key: String,
    pub attributes: Vec<FieldValue>,
    /// Natural keys of referenced hubs
    pub references: Vec<String>,
    pub measures: Vec<FieldValue>,
    /// Drift fields: present in the source, unknown to the registry
    pub extras: BTreeMap<String, String>,
    /// Authoritative start date when the entity declares one
    pub effective_at: Option<DateTime<Utc>>,
    pub source: String,
}

impl StagedRecord {
    /// Derive the hub hash key and the satellite hash diff.
    pub fn into_vault_record(self) -> VaultRecord {
        let hash_key = derive_hash_key(&self.natural_key);
        let hash_diff = derive_hash_diff(self.attributes.iter().map(FieldValue::canonical));

        VaultRecord {
            hash_key,
            hash_diff,
            record: self,
        }
    }
}

// ============================================================================
// VAULT RECORD
// ============================================================================

/// A staged record with its derived keys, ready for loading.
#[derive(Debug, Clone, PartialEq)]
pub struct VaultRecord {
    pub hash_key: String,
    pub hash_diff: String,
    pub record: StagedRecord,
}

impl VaultRecord {
    pub fn entity(&self) -> EntityKind {
        self.record.entity
    }

    /// Ordering timestamp for same-key versions within a batch.
    pub fn effective_or(&self, load_date: DateTime<Utc>) -> DateTime<Utc> {
        self.record.effective_at.unwrap_or(load_date)
    }
}
