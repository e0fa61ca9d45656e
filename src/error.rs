// ⚠️ Error taxonomy for the vault ingestion engine
//
// Per-record problems (validation, unresolved references) are built as errors
// but collected into the run report instead of being raised. Only chunk
// failures and schema reconciliation failures surface from the loader.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum VaultError {
    /// A raw row could not be shaped into the registry's record form.
    #[error("validation failed for {entity} on line {line}: {reason}")]
    Validation {
        entity: String,
        line: usize,
        reason: String,
    },

    /// A link referenced a hub that is not present in committed storage.
    #[error("unresolved reference: {entity} {natural_key:?} not found in {hub_table}")]
    UnresolvedReference {
        entity: String,
        natural_key: String,
        hub_table: String,
    },

    /// Storage failure inside one chunk's transaction; only that chunk is rolled back.
    #[error("chunk {chunk} of stage {stage} failed: {source}")]
    ChunkLoad {
        stage: usize,
        chunk: usize,
        #[source]
        source: Box<VaultError>,
    },

    /// An additive column change failed; the run aborts before loading.
    #[error("schema reconciliation failed for {table}.{column}: {reason}")]
    SchemaReconciliation {
        table: String,
        column: String,
        reason: String,
    },

    #[error("protection error: {0}")]
    Protection(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A worker thread panicked before reporting its chunk outcome.
    #[error("worker panicked while loading chunk {0}")]
    WorkerPanic(usize),
}

pub type Result<T, E = VaultError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_error_keeps_source() {
        let inner = VaultError::Storage(rusqlite::Error::InvalidQuery);
        let err = VaultError::ChunkLoad {
            stage: 1,
            chunk: 3,
            source: Box::new(inner),
        };

        let message = err.to_string();
        assert!(message.contains("chunk 3"));
        assert!(message.contains("stage 1"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_schema_reconciliation_names_the_column() {
        let err = VaultError::SchemaReconciliation {
            table: "customers_satellite".to_string(),
            column: "loyalty tier".to_string(),
            reason: "invalid identifier".to_string(),
        };

        assert!(err.to_string().contains("customers_satellite.loyalty tier"));
    }
}
