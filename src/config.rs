// ⚙️ Configuration - optional TOML file layered under VAULT_* environment variables
//
//   database_path = "vault.db"
//   workers = 4
//   source = "CSV"
//   protection_key = "<base64, 32 bytes>"
//
//   [inputs]
//   customers = "data/customers.csv"
//
// Nested keys use a double underscore in the environment:
// VAULT_INPUTS__CUSTOMERS=data/customers.csv

use crate::error::{Result, VaultError};
use crate::protection::ProtectionContext;
use crate::registry::EntityKind;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_PREFIX: &str = "VAULT";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputPaths {
    pub customers: Option<PathBuf>,
    pub products: Option<PathBuf>,
    pub sales: Option<PathBuf>,
}

impl InputPaths {
    /// Configured files in load order.
    pub fn entries(&self) -> Vec<(EntityKind, &Path)> {
        [
            (EntityKind::Customer, self.customers.as_deref()),
            (EntityKind::Product, self.products.as_deref()),
            (EntityKind::Sale, self.sales.as_deref()),
        ]
        .into_iter()
        .filter_map(|(kind, path)| path.map(|p| (kind, p)))
        .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    pub database_path: PathBuf,
    /// Loader workers; unset means one per available core
    pub workers: Option<usize>,
    /// Source label for rows without a `source` column
    pub source: String,
    pub busy_timeout_ms: u64,
    /// Base64 AES-256 key. Without it every run generates its own key and
    /// protected values cannot be revealed afterwards.
    pub protection_key: Option<String>,
    pub log_format: LogFormat,
    pub inputs: InputPaths,
}

impl Default for VaultConfig {
    fn default() -> Self {
        VaultConfig {
            database_path: PathBuf::from("vault.db"),
            workers: None,
            source: "CSV".to_string(),
            busy_timeout_ms: 30_000,
            protection_key: None,
            log_format: LogFormat::Text,
            inputs: InputPaths::default(),
        }
    }
}

impl VaultConfig {
    /// Load from an optional file plus the process environment.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        Self::from_sources(file, environment())
    }

    pub fn from_sources(file: Option<&Path>, env: config::Environment) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(false));
        }

        let settings = builder
            .add_source(env)
            .build()
            .map_err(|e| VaultError::Config(format!("failed to read configuration: {}", e)))?;

        let config: VaultConfig = settings
            .try_deserialize()
            .map_err(|e| VaultError::Config(format!("invalid configuration: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == Some(0) {
            return Err(VaultError::Config("workers must be at least 1".to_string()));
        }
        if self.source.trim().is_empty() {
            return Err(VaultError::Config("source label cannot be empty".to_string()));
        }
        Ok(())
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    /// Protection context for one run.
    pub fn protection(&self) -> Result<ProtectionContext> {
        match &self.protection_key {
            Some(key) => ProtectionContext::from_base64(key),
            None => ProtectionContext::generate(),
        }
    }
}

fn environment() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(vars: &[(&str, &str)]) -> config::Environment {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        environment().source(Some(map))
    }

    #[test]
    fn test_defaults_without_sources() {
        let config = VaultConfig::from_sources(None, env(&[])).unwrap();

        assert_eq!(config, VaultConfig::default());
        assert_eq!(config.busy_timeout(), Duration::from_secs(30));
        assert!(config.inputs.entries().is_empty());
    }

    #[test]
    fn test_file_then_environment() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "database_path = \"warehouse.db\"\nworkers = 2\nlog_format = \"json\"\n\n[inputs]\ncustomers = \"customers.csv\"\nsales = \"sales.csv\""
        )
        .unwrap();

        let config = VaultConfig::from_sources(
            Some(file.path()),
            env(&[("VAULT_WORKERS", "8"), ("VAULT_SOURCE", "ERP")]),
        )
        .unwrap();

        assert_eq!(config.database_path, PathBuf::from("warehouse.db"));
        assert_eq!(config.workers, Some(8), "environment overrides the file");
        assert_eq!(config.source, "ERP");
        assert_eq!(config.log_format, LogFormat::Json);

        let entries = config.inputs.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], (EntityKind::Customer, Path::new("customers.csv")));
        assert_eq!(entries[1].0, EntityKind::Sale);
    }

    #[test]
    fn test_nested_environment_keys() {
        let config =
            VaultConfig::from_sources(None, env(&[("VAULT_INPUTS__PRODUCTS", "products.csv")]))
                .unwrap();

        assert_eq!(config.inputs.products, Some(PathBuf::from("products.csv")));
    }

    #[test]
    fn test_rejects_zero_workers() {
        let result = VaultConfig::from_sources(None, env(&[("VAULT_WORKERS", "0")]));

        assert!(matches!(result, Err(VaultError::Config(_))));
    }

    #[test]
    fn test_configured_protection_key() {
        let key = ProtectionContext::generate().unwrap().export_key();
        let config = VaultConfig {
            protection_key: Some(key.clone()),
            ..Default::default()
        };

        assert_eq!(config.protection().unwrap().export_key(), key);
    }
}
