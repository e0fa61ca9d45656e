// ⚡ Parallel Bulk Loader - schema reconciliation, partitioning, chunk workers
//
// Per stage:
// 1. Partition records into at most N chunks, keeping every hash key's
//    versions in one chunk, ordered by effective timestamp
// 2. Each worker opens its own connection and applies its chunk inside one
//    IMMEDIATE transaction
// 3. A failed chunk rolls back alone; siblings are never cancelled
//
// SQLite admits one writer at a time. Workers take the in-process write gate
// before BEGIN IMMEDIATE, so they queue on each other without a timeout and
// `busy_timeout` only applies to writers outside this process.
//
// Drift columns are added once, before the first stage starts.

use crate::db::{add_text_column, table_columns, VaultStore};
use crate::error::{Result, VaultError};
use crate::handlers::{apply_record, handlers_for, ChunkContext, RecordHandler};
use crate::protection::ProtectionContext;
use crate::record::VaultRecord;
use crate::registry::{EntityKind, EntityRegistry};
use crate::report::{ChunkFailure, LoadCounters, RecordIssue};
use crate::resolver::ReferentialResolver;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, TransactionBehavior};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info, warn};

/// Worker count: the configured value, else one per available core.
pub fn resolve_workers(configured: Option<usize>) -> usize {
    configured.filter(|n| *n > 0).unwrap_or_else(|| {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    })
}

// ============================================================================
// SCHEMA RECONCILIATION
// ============================================================================

/// Add a TEXT column to each satellite for every drift field its records
/// carry. Runs in one transaction: either every column is added or none is.
///
/// Returns `table.column` for each column added.
pub fn reconcile_schema(
    conn: &mut Connection,
    registry: &EntityRegistry,
    records: &[VaultRecord],
) -> Result<Vec<String>> {
    let mut drift: BTreeMap<EntityKind, BTreeSet<&str>> = BTreeMap::new();
    for record in records {
        if record.record.extras.is_empty() {
            continue;
        }
        drift
            .entry(record.entity())
            .or_default()
            .extend(record.record.extras.keys().map(String::as_str));
    }

    if drift.is_empty() {
        return Ok(Vec::new());
    }

    let tx = conn.transaction()?;
    let mut added = Vec::new();

    for (kind, fields) in &drift {
        let def = registry.get(*kind)?;
        let existing = table_columns(&tx, def.satellite_table)?;

        for field in fields {
            if existing.iter().any(|c| c == field) {
                continue;
            }
            add_text_column(&tx, def.satellite_table, field)?;
            added.push(format!("{}.{}", def.satellite_table, field));
        }
    }

    tx.commit()?;

    if !added.is_empty() {
        info!(columns = ?added, "schema reconciled");
    }
    Ok(added)
}

// ============================================================================
// PARTITIONING
// ============================================================================

/// Split records into at most `workers` contiguous chunks of near-equal size.
///
/// Records sharing `(entity, hash_key)` always land in the same chunk, sorted
/// by effective timestamp (stable, so ties keep batch order). Groups keep the
/// order in which their first record appeared.
pub fn partition(
    records: Vec<VaultRecord>,
    workers: usize,
    load_date: DateTime<Utc>,
) -> Vec<Vec<VaultRecord>> {
    let total = records.len();
    let mut groups: Vec<Vec<VaultRecord>> = Vec::new();
    let mut index: HashMap<(EntityKind, String), usize> = HashMap::new();

    for record in records {
        let key = (record.entity(), record.hash_key.clone());
        let slot = *index.entry(key).or_insert_with(|| {
            groups.push(Vec::new());
            groups.len() - 1
        });
        groups[slot].push(record);
    }

    for group in groups.iter_mut() {
        group.sort_by_key(|r| r.effective_or(load_date));
    }

    let chunk_count = workers.max(1).min(groups.len());
    if chunk_count == 0 {
        return Vec::new();
    }

    let target = total.div_ceil(chunk_count);
    let mut chunks: Vec<Vec<VaultRecord>> = Vec::with_capacity(chunk_count);
    let mut current: Vec<VaultRecord> = Vec::new();

    for group in groups {
        current.extend(group);
        if current.len() >= target && chunks.len() + 1 < chunk_count {
            chunks.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }

    chunks
}

// ============================================================================
// CHUNK WORKERS
// ============================================================================

#[derive(Debug)]
pub enum ChunkOutcome {
    Committed {
        chunk: usize,
        counters: LoadCounters,
        issues: Vec<RecordIssue>,
    },
    Failed(ChunkFailure),
}

/// Merged outcome of every chunk of one stage.
#[derive(Debug, Default)]
pub struct StageOutcome {
    pub counters: LoadCounters,
    pub issues: Vec<RecordIssue>,
    pub failures: Vec<ChunkFailure>,
}

impl StageOutcome {
    fn absorb(&mut self, outcome: ChunkOutcome) {
        match outcome {
            ChunkOutcome::Committed {
                counters, issues, ..
            } => {
                self.counters.merge(&counters);
                self.issues.extend(issues);
            }
            ChunkOutcome::Failed(failure) => self.failures.push(failure),
        }
    }
}

pub struct BulkLoader<'a> {
    store: &'a VaultStore,
    registry: &'a EntityRegistry,
    protection: &'a ProtectionContext,
    workers: usize,
    load_date: DateTime<Utc>,
    write_gate: Mutex<()>,
}

impl<'a> BulkLoader<'a> {
    pub fn new(
        store: &'a VaultStore,
        registry: &'a EntityRegistry,
        protection: &'a ProtectionContext,
        workers: usize,
        load_date: DateTime<Utc>,
    ) -> Self {
        BulkLoader {
            store,
            registry,
            protection,
            workers: workers.max(1),
            load_date,
            write_gate: Mutex::new(()),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Load one stage. Returns once every chunk has committed or rolled back.
    pub fn load_stage(&self, stage: usize, records: Vec<VaultRecord>) -> StageOutcome {
        let chunks = partition(records, self.workers, self.load_date);
        info!(
            stage,
            chunks = chunks.len(),
            records = chunks.iter().map(Vec::len).sum::<usize>(),
            "loading stage"
        );

        let mut outcome = StageOutcome::default();

        std::thread::scope(|scope| {
            let handles = chunks
                .iter()
                .enumerate()
                .map(|(index, chunk)| {
                    let handle = scope.spawn(move || self.run_chunk(stage, index, chunk));
                    (index, handle)
                })
                .collect::<Vec<_>>();

            for (index, handle) in handles {
                let chunk_outcome = match handle.join() {
                    Ok(chunk_outcome) => chunk_outcome,
                    Err(_) => ChunkOutcome::Failed(failure_for(
                        stage,
                        index,
                        &chunks[index],
                        &VaultError::WorkerPanic(index),
                    )),
                };
                outcome.absorb(chunk_outcome);
            }
        });

        outcome
    }

    fn run_chunk(&self, stage: usize, index: usize, chunk: &[VaultRecord]) -> ChunkOutcome {
        match self.apply_chunk(chunk) {
            Ok(ctx) => {
                info!(
                    stage,
                    chunk = index,
                    records = chunk.len(),
                    rejected = ctx.issues.len(),
                    "chunk committed"
                );
                ChunkOutcome::Committed {
                    chunk: index,
                    counters: ctx.counters,
                    issues: ctx.issues,
                }
            }
            Err(source) => {
                let err = VaultError::ChunkLoad {
                    stage,
                    chunk: index,
                    source: Box::new(source),
                };
                warn!(stage, chunk = index, records = chunk.len(), "{}", err);
                ChunkOutcome::Failed(failure_for(stage, index, chunk, &err))
            }
        }
    }

    /// Apply every record of the chunk in one transaction. Any error drops
    /// the transaction, which rolls the whole chunk back.
    fn apply_chunk(&self, chunk: &[VaultRecord]) -> Result<ChunkContext<'a>> {
        // A panicked sibling poisons the gate but guards no data
        let _writer = self
            .write_gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let mut conn = self.store.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut handlers: HashMap<EntityKind, Vec<Box<dyn RecordHandler + 'a>>> = HashMap::new();
        let mut ctx = ChunkContext::new(
            self.load_date,
            ReferentialResolver::new(self.registry, self.protection),
        );

        for record in chunk {
            let kind = record.entity();
            if !handlers.contains_key(&kind) {
                handlers.insert(kind, handlers_for(self.registry.get(kind)?));
            }
            let Some(pipeline) = handlers.get(&kind) else {
                continue;
            };

            apply_record(&tx, pipeline, record, &mut ctx)?;
        }

        tx.commit()?;
        debug!(records = chunk.len(), "chunk transaction committed");
        Ok(ctx)
    }
}

fn failure_for(stage: usize, chunk: usize, records: &[VaultRecord], err: &VaultError) -> ChunkFailure {
    ChunkFailure {
        stage,
        chunk,
        error: err.to_string(),
        line_numbers: records
            .iter()
            .map(|r| (r.entity(), r.record.line_number))
            .collect(),
        natural_keys: records.iter().map(|r| r.record.natural_key.clone()).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::setup_vault;
    use crate::record::{FieldValue, StagedRecord};
    use chrono::{Duration, TimeZone};
    use std::collections::BTreeMap;

    fn product(id: &str, name: &str, line: usize) -> VaultRecord {
        StagedRecord {
            entity: EntityKind::Product,
            line_number: line,
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

    fn load_date() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_partition_keeps_same_key_together() {
        let mut records = Vec::new();
        for i in 0..20 {
            records.push(product(&format!("P{}", i % 5), &format!("v{}", i), i + 2));
        }

        let chunks = partition(records, 4, load_date());

        assert!(chunks.len() <= 4);
        assert_eq!(chunks.iter().map(Vec::len).sum::<usize>(), 20);
        for key in 0..5 {
            let hash = crate::hashing::derive_hash_key(&format!("P{}", key));
            let holding = chunks
                .iter()
                .filter(|c| c.iter().any(|r| r.hash_key == hash))
                .count();
            assert_eq!(holding, 1, "P{} split across chunks", key);
        }
    }

    #[test]
    fn test_partition_orders_versions_by_effective_date() {
        let mut late = product("P1", "late", 2);
        late.record.effective_at = Some(load_date() - Duration::days(1));
        let mut early = product("P1", "early", 3);
        early.record.effective_at = Some(load_date() - Duration::days(5));
        let undated = product("P1", "undated", 4);

        let chunks = partition(vec![late, early, undated], 3, load_date());

        assert_eq!(chunks.len(), 1);
        let lines: Vec<usize> = chunks[0].iter().map(|r| r.record.line_number).collect();
        assert_eq!(lines, vec![3, 2, 4]);
    }

    #[test]
    fn test_partition_respects_worker_limit() {
        let records = (0..10).map(|i| product(&format!("P{}", i), "x", i)).collect();
        let chunks = partition(records, 3, load_date());

        assert_eq!(chunks.len(), 3);
        assert!(partition(Vec::new(), 4, load_date()).is_empty());
    }

    #[test]
    fn test_reconcile_adds_missing_columns_once() {
        let mut conn = Connection::open_in_memory().unwrap();
        let registry = EntityRegistry::new();
        setup_vault(&conn, &registry).unwrap();

        let mut record = product("P1", "Widget", 2);
        record.record.extras.insert("color".to_string(), "red".to_string());
        let records = vec![record];

        let added = reconcile_schema(&mut conn, &registry, &records).unwrap();
        assert_eq!(added, vec!["products_satellite.color".to_string()]);

        let again = reconcile_schema(&mut conn, &registry, &records).unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn test_reconcile_rejects_invalid_identifier() {
        let mut conn = Connection::open_in_memory().unwrap();
        let registry = EntityRegistry::new();
        setup_vault(&conn, &registry).unwrap();

        let mut good = product("P1", "Widget", 2);
        good.record.extras.insert("color".to_string(), "red".to_string());
        let mut bad = product("P2", "Gadget", 3);
        bad.record.extras.insert("tier#1".to_string(), "gold".to_string());

        let err = reconcile_schema(&mut conn, &registry, &[good, bad]).unwrap_err();

        assert!(matches!(err, VaultError::SchemaReconciliation { .. }));
        let columns = table_columns(&conn, "products_satellite").unwrap();
        assert!(!columns.contains(&"color".to_string()), "reconciliation is all or nothing");
    }

    #[test]
    fn test_failed_chunk_rolls_back_alone() {
        let dir = tempfile::tempdir().unwrap();
        let store = VaultStore::new(dir.path().join("vault.db"), std::time::Duration::from_secs(5));
        let registry = EntityRegistry::new();
        setup_vault(&store.open().unwrap(), &registry).unwrap();
        let protection = ProtectionContext::generate().unwrap();

        // Wrong attribute count: the satellite insert fails for this record
        let mut broken = product("P2", "Broken", 3);
        broken.record.attributes.pop();
        let records = vec![product("P1", "Widget", 2), broken];

        let loader = BulkLoader::new(&store, &registry, &protection, 2, load_date());
        let outcome = loader.load_stage(0, records);

        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].natural_keys, vec!["P2".to_string()]);
        assert_eq!(outcome.failures[0].line_numbers, vec![(EntityKind::Product, 3)]);
        assert_eq!(outcome.counters.hubs_inserted, 1);

        let conn = store.open().unwrap();
        let hubs: i64 = conn
            .query_row("SELECT COUNT(*) FROM products_hub", [], |r| r.get(0))
            .unwrap();
        assert_eq!(hubs, 1, "the failed chunk's hub insert was rolled back");
    }

    #[test]
    fn test_workers_queue_for_the_write_lock() {
        let dir = tempfile::tempdir().unwrap();
        // Far shorter than any chunk transaction below
        let store = VaultStore::new(dir.path().join("vault.db"), std::time::Duration::from_millis(1));
        let registry = EntityRegistry::new();
        setup_vault(&store.open().unwrap(), &registry).unwrap();
        let protection = ProtectionContext::generate().unwrap();

        let records = (0..4000)
            .map(|i| product(&format!("P{}", i), &format!("Item {}", i), i + 2))
            .collect();

        let loader = BulkLoader::new(&store, &registry, &protection, 8, load_date());
        let outcome = loader.load_stage(0, records);

        assert!(outcome.failures.is_empty(), "{:?}", outcome.failures);
        assert_eq!(outcome.counters.hubs_inserted, 4000);
        assert_eq!(outcome.counters.satellites_versioned, 4000);

        let conn = store.open().unwrap();
        let hubs: i64 = conn
            .query_row("SELECT COUNT(*) FROM products_hub", [], |r| r.get(0))
            .unwrap();
        assert_eq!(hubs, 4000);
    }

    #[test]
    fn test_resolve_workers() {
        assert_eq!(resolve_workers(Some(3)), 3);
        assert!(resolve_workers(None) >= 1);
        assert!(resolve_workers(Some(0)) >= 1);
    }
}
