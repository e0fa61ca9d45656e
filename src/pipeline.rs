// 🏗️ Vault Pipeline - one ingestion run from raw rows to committed vault tables
//
// raw rows → quality gate → key derivation → schema reconciliation (barrier)
//          → stage 0: hubs + satellites → stage 1: links + satellites
//
// The protection context lives exactly as long as the pipeline. Each stage
// only starts after every chunk of the previous stage has committed or
// rolled back, so links always resolve against committed hubs.

use crate::db::{setup_vault, VaultStore};
use crate::error::Result;
use crate::loader::{reconcile_schema, BulkLoader};
use crate::protection::ProtectionContext;
use crate::quality::QualityGate;
use crate::record::{RawRecord, VaultRecord};
use crate::registry::{EntityKind, EntityRegistry};
use crate::report::RunReport;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tracing::{info, warn};

/// Raw rows per entity for one run.
pub type SourceBatches = BTreeMap<EntityKind, Vec<RawRecord>>;

pub struct VaultPipeline {
    store: VaultStore,
    registry: EntityRegistry,
    protection: ProtectionContext,
    workers: usize,
    default_source: String,
}

impl VaultPipeline {
    pub fn new(
        store: VaultStore,
        registry: EntityRegistry,
        protection: ProtectionContext,
        workers: usize,
    ) -> Self {
        VaultPipeline {
            store,
            registry,
            protection,
            workers: workers.max(1),
            default_source: "CSV".to_string(),
        }
    }

    /// Builder: source label for rows without their own `source` column
    pub fn with_default_source(mut self, source: impl Into<String>) -> Self {
        self.default_source = source.into();
        self
    }

    pub fn protection(&self) -> &ProtectionContext {
        &self.protection
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    pub fn store(&self) -> &VaultStore {
        &self.store
    }

    /// Create the vault tables if they do not exist yet.
    pub fn initialize(&self) -> Result<()> {
        self.registry.validate()?;
        let conn = self.store.open()?;
        setup_vault(&conn, &self.registry)
    }

    pub fn run(&self, batches: SourceBatches) -> Result<RunReport> {
        self.run_at(batches, Utc::now())
    }

    /// Run with an explicit load timestamp.
    ///
    /// Errors only for run-fatal conditions (configuration, schema
    /// reconciliation, storage unavailable before loading). Record issues and
    /// failed chunks are part of the returned report.
    pub fn run_at(&self, batches: SourceBatches, load_date: DateTime<Utc>) -> Result<RunReport> {
        self.initialize()?;

        let mut report = RunReport::new(load_date, self.workers);
        info!(run_id = %report.run_id, workers = self.workers, "starting vault run");

        // Quality gate + key derivation
        let gate = QualityGate::new(&self.protection, self.default_source.clone());
        let mut records: Vec<VaultRecord> = Vec::new();

        for (kind, rows) in &batches {
            let def = self.registry.get(*kind)?;
            let outcome = gate.stage_batch(def, rows)?;

            info!("{}", outcome.summary.summary());
            report.issues.extend(outcome.issues);
            report.gates.push(outcome.summary);
            records.extend(outcome.records.into_iter().map(|r| r.into_vault_record()));
        }

        // Barrier: every drift column exists before any chunk starts
        let mut conn = self.store.open()?;
        report.drift_columns = reconcile_schema(&mut conn, &self.registry, &records)?;
        drop(conn);

        let loader = BulkLoader::new(
            &self.store,
            &self.registry,
            &self.protection,
            self.workers,
            load_date,
        );

        let mut by_stage: BTreeMap<usize, Vec<VaultRecord>> = BTreeMap::new();
        for record in records {
            let stage = self.registry.get(record.entity())?.stage();
            by_stage.entry(stage).or_default().push(record);
        }

        for (stage, stage_records) in by_stage {
            let outcome = loader.load_stage(stage, stage_records);

            report.counters.merge(&outcome.counters);
            report.issues.extend(outcome.issues);
            report.chunk_failures.extend(outcome.failures);
        }

        if report.has_failures() {
            warn!(
                failed_chunks = report.chunk_failures.len(),
                "run finished with failed chunks"
            );
        }
        info!("{}", report.summary());

        Ok(report)
    }
}
