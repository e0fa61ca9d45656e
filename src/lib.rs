// Data Vault Ingestion Engine - Core Library
// Exposes all modules for use in the CLI and tests

pub mod config;
pub mod db;
pub mod entities;
pub mod error;
pub mod handlers;
pub mod hashing;
pub mod loader;
pub mod logging;
pub mod pipeline;
pub mod protection;
pub mod quality;
pub mod record;
pub mod registry;
pub mod report;
pub mod resolver;
pub mod versioning;

// Re-export commonly used types
pub use config::{InputPaths, LogFormat, VaultConfig};
pub use db::{
    add_text_column, entity_counts, load_csv, read_csv, setup_vault, table_columns,
    EntityCounts, VaultStore,
};
pub use error::{Result, VaultError};
pub use handlers::{
    apply_record, handlers_for, Applied, ChunkContext, HubHandler, LinkHandler, RecordHandler,
    SatelliteHandler, WriteOutcome,
};
pub use hashing::{derive_hash_diff, derive_hash_key};
pub use loader::{
    partition, reconcile_schema, resolve_workers, BulkLoader, ChunkOutcome, StageOutcome,
};
pub use pipeline::{SourceBatches, VaultPipeline};
pub use protection::ProtectionContext;
pub use quality::{GateOutcome, GateSummary, OutlierBounds, QualityGate};
pub use record::{FieldValue, RawRecord, StagedRecord, VaultRecord};
pub use registry::{
    EntityDefinition, EntityKind, EntityRegistry, EntityRole, EntitySql, FieldDefinition,
    FieldKind, HubReference,
};
pub use report::{ChunkFailure, IssueKind, IssueLog, LoadCounters, RecordIssue, RunReport};
pub use resolver::{ReferentialResolver, Resolution, Resolved};
pub use versioning::{SatelliteState, VersionDecision};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
