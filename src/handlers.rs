// 🧩 Record Handlers - hub, satellite and link writes for one record
//
// Each entity role maps to a fixed handler pipeline:
//   hub  → HubHandler, SatelliteHandler
//   link → LinkHandler, SatelliteHandler
// Handlers run inside the chunk's transaction, in that order. A rejected
// record stops its pipeline, so a link with an unresolved hub never gets a
// satellite row.

use crate::db::{is_valid_identifier, quote_identifier};
use crate::error::{Result, VaultError};
use crate::record::{format_timestamp, VaultRecord};
use crate::registry::{EntityDefinition, EntityRole};
use crate::report::{LoadCounters, RecordIssue};
use crate::resolver::{ReferentialResolver, Resolved};
use crate::versioning::{apply_decision, SatelliteState, VersionDecision, VersionRow};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, ToSql};
use tracing::{debug, warn};

/// Mutable state of one chunk while its records are applied.
pub struct ChunkContext<'a> {
    pub load_date: DateTime<Utc>,
    pub resolver: ReferentialResolver<'a>,
    pub counters: LoadCounters,
    pub issues: Vec<RecordIssue>,
}

impl<'a> ChunkContext<'a> {
    pub fn new(load_date: DateTime<Utc>, resolver: ReferentialResolver<'a>) -> Self {
        ChunkContext {
            load_date,
            resolver,
            counters: LoadCounters::default(),
            issues: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Inserted,
    /// Insert-if-absent hit an existing row
    AlreadyPresent,
}

impl WriteOutcome {
    fn from_changes(changed: usize) -> Self {
        if changed == 0 {
            WriteOutcome::AlreadyPresent
        } else {
            WriteOutcome::Inserted
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    Continue,
    Rejected,
}

pub trait RecordHandler {
    fn apply(
        &self,
        conn: &Connection,
        record: &VaultRecord,
        ctx: &mut ChunkContext<'_>,
    ) -> Result<Applied>;
}

// ============================================================================
// HUB
// ============================================================================

pub struct HubHandler<'d> {
    def: &'d EntityDefinition,
}

impl RecordHandler for HubHandler<'_> {
    fn apply(
        &self,
        conn: &Connection,
        record: &VaultRecord,
        ctx: &mut ChunkContext<'_>,
    ) -> Result<Applied> {
        let changed = conn.execute(
            self.def.sql.insert_anchor,
            rusqlite::params![
                record.hash_key,
                record.record.display_key,
                format_timestamp(ctx.load_date),
                record.record.source
            ],
        )?;

        match WriteOutcome::from_changes(changed) {
            WriteOutcome::Inserted => ctx.counters.hubs_inserted += 1,
            WriteOutcome::AlreadyPresent => ctx.counters.hubs_present += 1,
        }

        Ok(Applied::Continue)
    }
}

// ============================================================================
// LINK
// ============================================================================

pub struct LinkHandler<'d> {
    def: &'d EntityDefinition,
}

impl RecordHandler for LinkHandler<'_> {
    fn apply(
        &self,
        conn: &Connection,
        record: &VaultRecord,
        ctx: &mut ChunkContext<'_>,
    ) -> Result<Applied> {
        let resolved = ctx
            .resolver
            .resolve_all(conn, self.def, &record.record.references)?;

        let hash_keys = match resolved {
            Resolved::All(hash_keys) => hash_keys,
            Resolved::Missing {
                hub,
                natural_key,
                hub_table,
            } => {
                let err = VaultError::UnresolvedReference {
                    entity: format!("{} -> {}", self.def.kind, hub),
                    natural_key: natural_key.clone(),
                    hub_table: hub_table.to_string(),
                };
                warn!(
                    entity = %self.def.kind,
                    line = record.record.line_number,
                    "{}",
                    err
                );

                ctx.counters.links_rejected += 1;
                ctx.issues.push(RecordIssue::unresolved(
                    self.def.kind,
                    record.record.line_number,
                    &natural_key,
                    err.to_string(),
                ));
                return Ok(Applied::Rejected);
            }
        };

        let load_date = format_timestamp(ctx.load_date);
        let mut values: Vec<&dyn ToSql> = Vec::new();
        values.push(&record.hash_key);
        values.push(&record.record.display_key);
        values.extend(hash_keys.iter().map(|h| h as &dyn ToSql));
        values.extend(record.record.measures.iter().map(|m| m as &dyn ToSql));
        values.push(&load_date);
        values.push(&record.record.source);

        let changed = conn.execute(self.def.sql.insert_anchor, values.as_slice())?;

        match WriteOutcome::from_changes(changed) {
            WriteOutcome::Inserted => ctx.counters.links_inserted += 1,
            WriteOutcome::AlreadyPresent => ctx.counters.links_present += 1,
        }
        Ok(Applied::Continue)
    }
}

// ============================================================================
// SATELLITE
// ============================================================================

pub struct SatelliteHandler<'d> {
    def: &'d EntityDefinition,
}

impl SatelliteHandler<'_> {
    /// Drift values ride along on the version row they arrived with.
    fn write_extras(
        &self,
        conn: &Connection,
        record: &VaultRecord,
        start_date: DateTime<Utc>,
    ) -> Result<()> {
        let extras: Vec<(&String, Option<&str>)> = record
            .record
            .extras
            .iter()
            .filter(|(name, _)| is_valid_identifier(name))
            .map(|(name, value)| (name, Some(value.as_str()).filter(|v| !v.is_empty())))
            .collect();

        if extras.is_empty() {
            return Ok(());
        }

        let assignments = extras
            .iter()
            .enumerate()
            .map(|(i, (name, _))| format!("{} = ?{}", quote_identifier(name), i + 1))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE {} SET {} WHERE {} = ?{} AND start_date = ?{}",
            quote_identifier(self.def.satellite_table),
            assignments,
            quote_identifier(self.def.hash_key_column),
            extras.len() + 1,
            extras.len() + 2
        );

        let start = format_timestamp(start_date);
        let mut values: Vec<&dyn ToSql> = extras.iter().map(|(_, v)| v as &dyn ToSql).collect();
        values.push(&record.hash_key);
        values.push(&start);

        conn.execute(&sql, values.as_slice())?;
        Ok(())
    }
}

impl RecordHandler for SatelliteHandler<'_> {
    fn apply(
        &self,
        conn: &Connection,
        record: &VaultRecord,
        ctx: &mut ChunkContext<'_>,
    ) -> Result<Applied> {
        let state = SatelliteState::load(conn, self.def, &record.hash_key)?;
        let decision = state.ingest(&record.hash_diff, record.record.effective_at, ctx.load_date);

        let attributes: Vec<&dyn ToSql> = record
            .record
            .attributes
            .iter()
            .map(|a| a as &dyn ToSql)
            .collect();
        let row = VersionRow {
            hash_key: &record.hash_key,
            hash_diff: &record.hash_diff,
            load_date: ctx.load_date,
            source: &record.record.source,
        };

        let closed = apply_decision(conn, self.def, &decision, &row, &attributes)?;

        match decision {
            VersionDecision::Unchanged => {
                ctx.counters.satellites_unchanged += 1;
            }
            VersionDecision::Insert { start_date } | VersionDecision::Supersede { start_date, .. } => {
                ctx.counters.satellites_versioned += 1;
                if closed {
                    ctx.counters.satellites_closed += 1;
                }
                self.write_extras(conn, record, start_date)?;
            }
        }

        debug!(
            entity = %self.def.kind,
            line = record.record.line_number,
            decision = ?decision,
            "satellite"
        );

        Ok(Applied::Continue)
    }
}

// ============================================================================
// DISPATCH
// ============================================================================

/// Handler pipeline for an entity, chosen by its declared role.
pub fn handlers_for(def: &EntityDefinition) -> Vec<Box<dyn RecordHandler + '_>> {
    match def.role {
        EntityRole::Hub => vec![
            Box::new(HubHandler { def }),
            Box::new(SatelliteHandler { def }),
        ],
        EntityRole::Link => vec![
            Box::new(LinkHandler { def }),
            Box::new(SatelliteHandler { def }),
        ],
    }
}

/// Run a record through its entity's handler pipeline.
pub fn apply_record(
    conn: &Connection,
    handlers: &[Box<dyn RecordHandler + '_>],
    record: &VaultRecord,
    ctx: &mut ChunkContext<'_>,
) -> Result<Applied> {
    for handler in handlers {
        if handler.apply(conn, record, ctx)? == Applied::Rejected {
            return Ok(Applied::Rejected);
        }
    }

    Ok(Applied::Continue)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{add_text_column, setup_vault};
    use crate::protection::ProtectionContext;
    use crate::record::{FieldValue, StagedRecord};
    use crate::registry::{EntityKind, EntityRegistry};
    use chrono::TimeZone;
    use std::collections::BTreeMap;

    fn product(id: &str, name: &str) -> VaultRecord {
        StagedRecord {
            entity: EntityKind::Product,
            line_number: 2,
            natural_key: id.to_string(),
            display_key: id.to_string(),
            attributes: vec![
                FieldValue::Text(name.to_string()),
                FieldValue::Text("Tools".to_string()),
                FieldValue::Text("Acme".to_string()),
            ],
            references: Vec::new(),
            measures: Vec::new(),
            extras: BTreeMap::new(),
            effective_at: None,
            source: "CSV".to_string(),
        }
        .into_vault_record()
    }

    fn sale(id: &str, customer: &str, product: &str) -> VaultRecord {
        let day = Utc.with_ymd_and_hms(2024, 1, 5, 0, 0, 0).unwrap();
        StagedRecord {
            entity: EntityKind::Sale,
            line_number: 4,
            natural_key: id.to_string(),
            display_key: id.to_string(),
            attributes: vec![
                FieldValue::Timestamp(day),
                FieldValue::Number(19.99),
                FieldValue::Number(2.0),
            ],
            references: vec![customer.to_string(), product.to_string()],
            measures: vec![
                FieldValue::Timestamp(day),
                FieldValue::Number(19.99),
                FieldValue::Number(2.0),
            ],
            extras: BTreeMap::new(),
            effective_at: Some(day),
            source: "CSV".to_string(),
        }
        .into_vault_record()
    }

    fn count(conn: &Connection, sql: &str) -> i64 {
        conn.query_row(sql, [], |r| r.get(0)).unwrap()
    }

    #[test]
    fn test_hub_pipeline_inserts_then_noops() {
        let conn = Connection::open_in_memory().unwrap();
        let registry = EntityRegistry::new();
        setup_vault(&conn, &registry).unwrap();
        let protection = ProtectionContext::generate().unwrap();
        let def = registry.get(EntityKind::Product).unwrap();
        let handlers = handlers_for(def);
        let load_date = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();

        let mut ctx = ChunkContext::new(load_date, ReferentialResolver::new(&registry, &protection));
        let record = product("P1", "Widget");
        apply_record(&conn, &handlers, &record, &mut ctx).unwrap();
        apply_record(&conn, &handlers, &record, &mut ctx).unwrap();

        assert_eq!(ctx.counters.hubs_inserted, 1);
        assert_eq!(ctx.counters.hubs_present, 1);
        assert_eq!(ctx.counters.satellites_versioned, 1);
        assert_eq!(ctx.counters.satellites_unchanged, 1);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM products_satellite"), 1);
    }

    #[test]
    fn test_link_with_unknown_customer_is_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        let registry = EntityRegistry::new();
        setup_vault(&conn, &registry).unwrap();
        let protection = ProtectionContext::generate().unwrap();
        let load_date = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();

        let product_def = registry.get(EntityKind::Product).unwrap();
        let sale_def = registry.get(EntityKind::Sale).unwrap();
        let mut ctx = ChunkContext::new(load_date, ReferentialResolver::new(&registry, &protection));
        apply_record(&conn, &handlers_for(product_def), &product("P1", "Widget"), &mut ctx).unwrap();

        let applied =
            apply_record(&conn, &handlers_for(sale_def), &sale("T1", "C9", "P1"), &mut ctx).unwrap();

        assert_eq!(applied, Applied::Rejected);
        assert_eq!(ctx.counters.links_rejected, 1);
        assert_eq!(ctx.issues[0].natural_key.as_deref(), Some("C9"));
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM sales_link"), 0);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM sales_transactions_satellite"), 0);
    }

    #[test]
    fn test_link_stores_resolved_keys_and_measures() {
        let conn = Connection::open_in_memory().unwrap();
        let registry = EntityRegistry::new();
        setup_vault(&conn, &registry).unwrap();
        let protection = ProtectionContext::generate().unwrap();
        let load_date = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        let mut ctx = ChunkContext::new(load_date, ReferentialResolver::new(&registry, &protection));

        let customer_def = registry.get(EntityKind::Customer).unwrap();
        let customer = StagedRecord {
            entity: EntityKind::Customer,
            line_number: 2,
            natural_key: "C1".to_string(),
            display_key: protection.protect("C1").unwrap(),
            attributes: vec![
                FieldValue::Text("Alice".to_string()),
                FieldValue::Text("a@x.com".to_string()),
                FieldValue::Text("Unknown".to_string()),
            ],
            references: Vec::new(),
            measures: Vec::new(),
            extras: BTreeMap::new(),
            effective_at: None,
            source: "CSV".to_string(),
        }
        .into_vault_record();
        apply_record(&conn, &handlers_for(customer_def), &customer, &mut ctx).unwrap();
        apply_record(
            &conn,
            &handlers_for(registry.get(EntityKind::Product).unwrap()),
            &product("P1", "Widget"),
            &mut ctx,
        )
        .unwrap();

        let sale_def = registry.get(EntityKind::Sale).unwrap();
        let record = sale("T1", "C1", "P1");
        apply_record(&conn, &handlers_for(sale_def), &record, &mut ctx).unwrap();

        let (customer_hash, amount, start): (String, f64, String) = conn
            .query_row(
                "SELECT l.customer_hash_key, l.transaction_amount, s.start_date
                 FROM sales_link l JOIN sales_transactions_satellite s
                   ON s.transaction_hash_key = l.transaction_hash_key",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .unwrap();

        assert_eq!(customer_hash, customer.hash_key);
        assert_eq!(amount, 19.99);
        assert_eq!(start, "2024-01-05T00:00:00.000000Z");
        assert_eq!(ctx.counters.links_inserted, 1);
    }

    #[test]
    fn test_extras_written_to_drift_columns() {
        let conn = Connection::open_in_memory().unwrap();
        let registry = EntityRegistry::new();
        setup_vault(&conn, &registry).unwrap();
        add_text_column(&conn, "products_satellite", "color").unwrap();
        let protection = ProtectionContext::generate().unwrap();
        let load_date = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        let mut ctx = ChunkContext::new(load_date, ReferentialResolver::new(&registry, &protection));

        let mut record = product("P1", "Widget");
        record.record.extras.insert("color".to_string(), "red".to_string());
        apply_record(
            &conn,
            &handlers_for(registry.get(EntityKind::Product).unwrap()),
            &record,
            &mut ctx,
        )
        .unwrap();

        let color: Option<String> = conn
            .query_row("SELECT color FROM products_satellite", [], |r| r.get(0))
            .unwrap();
        assert_eq!(color.as_deref(), Some("red"));
    }
}
