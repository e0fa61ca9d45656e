use crate::error::{Result, VaultError};
use crate::record::{normalize_header, RawRecord};
use crate::registry::{EntityKind, EntityRegistry};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Longest identifier accepted for a drift column.
pub const MAX_IDENTIFIER_LEN: usize = 63;

// ============================================================================
// CONNECTIONS
// ============================================================================

/// Where the vault lives and how connections to it are configured.
///
/// Every worker opens its own connection; connections are never shared
/// across threads.
#[derive(Debug, Clone)]
pub struct VaultStore {
    path: PathBuf,
    busy_timeout: Duration,
}

impl VaultStore {
    pub fn new(path: impl Into<PathBuf>, busy_timeout: Duration) -> Self {
        VaultStore {
            path: path.into(),
            busy_timeout,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn open(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)?;
        configure_connection(&conn, self.busy_timeout)?;
        Ok(conn)
    }
}

pub fn configure_connection(conn: &Connection, busy_timeout: Duration) -> Result<()> {
    // Before the WAL switch, which may itself wait on another connection
    conn.busy_timeout(busy_timeout)?;
    // WAL lets readers continue while one chunk holds the write lock
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(())
}

// ============================================================================
// SCHEMA
// ============================================================================

/// Create every registered entity's tables. Safe to run repeatedly.
pub fn setup_vault(conn: &Connection, registry: &EntityRegistry) -> Result<()> {
    // Hubs before links: link DDL references hub tables
    for stage in registry.stages() {
        for kind in stage {
            let def = registry.get(kind)?;
            conn.execute_batch(def.sql.ddl)?;
            debug!(entity = %kind, table = def.anchor_table, "vault tables ready");
        }
    }

    Ok(())
}

/// Column names of `table`, in declaration order. Empty if the table is missing.
pub fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1)")?;
    let columns = stmt
        .query_map(params![table], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(columns)
}

/// `[a-z_][a-z0-9_]{0,62}`
pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };

    name.len() <= MAX_IDENTIFIER_LEN
        && (first.is_ascii_lowercase() || first == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Double-quoted identifier. Only call with names that passed
/// [`is_valid_identifier`] or come from the registry.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Additive schema change: a nullable TEXT column. Existing data is untouched.
pub fn add_text_column(conn: &Connection, table: &str, column: &str) -> Result<()> {
    if !is_valid_identifier(column) {
        return Err(VaultError::SchemaReconciliation {
            table: table.to_string(),
            column: column.to_string(),
            reason: "not a valid column identifier".to_string(),
        });
    }

    let sql = format!(
        "ALTER TABLE {} ADD COLUMN {} TEXT",
        quote_identifier(table),
        quote_identifier(column)
    );
    conn.execute(&sql, [])
        .map_err(|e| VaultError::SchemaReconciliation {
            table: table.to_string(),
            column: column.to_string(),
            reason: e.to_string(),
        })?;

    info!(table, column, "added drift column");
    Ok(())
}

// ============================================================================
// SOURCE FILES
// ============================================================================

/// Read a CSV file into raw records keyed by normalized header.
pub fn load_csv(csv_path: &Path) -> Result<Vec<RawRecord>> {
    let file = std::fs::File::open(csv_path)?;
    let records = read_csv(file)?;

    info!(path = %csv_path.display(), rows = records.len(), "loaded source file");
    Ok(records)
}

pub fn read_csv<R: Read>(reader: R) -> Result<Vec<RawRecord>> {
    let mut rdr = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::Headers)
        .from_reader(reader);

    let headers: Vec<String> = rdr.headers()?.iter().map(normalize_header).collect();

    let mut records = Vec::new();
    for (index, result) in rdr.records().enumerate() {
        let row = result?;
        // Header is line 1
        let line_number = row
            .position()
            .map(|p| p.line() as usize)
            .unwrap_or(index + 2);

        let mut record = RawRecord::new(line_number);
        for (header, value) in headers.iter().zip(row.iter()) {
            record.fields.insert(header.clone(), value.to_string());
        }
        records.push(record);
    }

    Ok(records)
}

// ============================================================================
// COUNTS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityCounts {
    pub entity: EntityKind,
    pub anchor_rows: i64,
    pub satellite_rows: i64,
}

pub fn entity_counts(conn: &Connection, registry: &EntityRegistry) -> Result<Vec<EntityCounts>> {
    registry
        .all()
        .iter()
        .map(|def| {
            let anchor_rows = conn.query_row(def.sql.count_anchor, [], |row| row.get(0))?;
            let satellite_rows = conn.query_row(def.sql.count_versions, [], |row| row.get(0))?;
            Ok::<_, VaultError>(EntityCounts {
                entity: def.kind,
                anchor_rows,
                satellite_rows,
            })
        })
        .collect()
}
