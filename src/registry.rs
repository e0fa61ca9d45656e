// 🏛️ Entity Registry - what each vault entity looks like
//
// Every other component asks the registry for the natural key, the ordered
// hash-diff attributes, the hub references and the storage mapping of an
// entity instead of hard-coding tables. Adding an entity means a new
// `EntityKind` variant, a definition under `entities/` registered in
// `EntityRegistry::new`, and an input path in `config::InputPaths` plus its
// `import` flag.

use crate::entities;
use crate::error::{Result, VaultError};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// ENTITY KIND / ROLE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Customer,
    Product,
    Sale,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Customer => "customer",
            EntityKind::Product => "product",
            EntityKind::Sale => "sale",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityRole {
    /// Business-key registry with a descriptive satellite
    Hub,
    /// Relationship between hubs, with its own satellite
    Link,
}

impl EntityRole {
    /// Load stage: links only load once every hub stage has committed.
    pub fn stage(&self) -> usize {
        match self {
            EntityRole::Hub => 0,
            EntityRole::Link => 1,
        }
    }
}

// ============================================================================
// FIELD DEFINITIONS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldKind {
    Text,
    Numeric,
    Date,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldDefinition {
    /// Canonical column name
    pub name: &'static str,
    /// Alternative source headers that map to this field
    pub aliases: Vec<&'static str>,
    pub kind: FieldKind,
    /// Protected before it is persisted
    pub sensitive: bool,
}

impl FieldDefinition {
    pub fn new(name: &'static str, kind: FieldKind) -> Self {
        FieldDefinition {
            name,
            aliases: Vec::new(),
            kind,
            sensitive: false,
        }
    }

    pub fn text(name: &'static str) -> Self {
        Self::new(name, FieldKind::Text)
    }

    pub fn numeric(name: &'static str) -> Self {
        Self::new(name, FieldKind::Numeric)
    }

    pub fn date(name: &'static str) -> Self {
        Self::new(name, FieldKind::Date)
    }

    /// Builder: accept another source header for this field
    pub fn with_alias(mut self, alias: &'static str) -> Self {
        self.aliases.push(alias);
        self
    }

    /// Builder: mark as sensitive
    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }

    pub fn matches(&self, header: &str) -> bool {
        self.name == header || self.aliases.iter().any(|a| *a == header)
    }
}

/// A hub that a link must resolve before it may be inserted.
#[derive(Debug, Clone, PartialEq)]
pub struct HubReference {
    /// Source field carrying the referenced hub's natural key
    pub field: FieldDefinition,
    pub hub: EntityKind,
}

// ============================================================================
// STORAGE MAPPING
// ============================================================================

/// Fixed SQL for one entity. Values are always bound; only these statements
/// name tables and columns.
///
/// Parameter order:
/// - `insert_anchor`: hash key, display key, reference hash keys.., measures.., load date, source
/// - `insert_version`: hash key, attributes.., start date, load date, source, hash diff
/// - `close_version`: end date, hash key
/// - `current_version`, `lookup_by_hash_key`: hash key
/// - `lookup_by_natural_key`: natural key; only for hubs whose key is stored in the clear
#[derive(Debug, Clone, PartialEq)]
pub struct EntitySql {
    pub ddl: &'static str,
    pub insert_anchor: &'static str,
    pub lookup_by_natural_key: Option<&'static str>,
    pub lookup_by_hash_key: &'static str,
    pub current_version: &'static str,
    pub close_version: &'static str,
    pub insert_version: &'static str,
    pub count_anchor: &'static str,
    pub count_versions: &'static str,
}

// ============================================================================
// ENTITY DEFINITION
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct EntityDefinition {
    pub kind: EntityKind,
    pub role: EntityRole,
    /// Hub table, or link table for links
    pub anchor_table: &'static str,
    pub satellite_table: &'static str,
    /// Hash key column shared by the anchor and its satellite
    pub hash_key_column: &'static str,
    pub natural_key: FieldDefinition,
    /// Hash-diff input, in contract order. Reordering creates spurious versions.
    pub attributes: Vec<FieldDefinition>,
    pub references: Vec<HubReference>,
    /// Non-versioned values stored on the anchor row (links only)
    pub measures: Vec<FieldDefinition>,
    /// Field whose value is the authoritative satellite start date
    pub effective_date: Option<&'static str>,
    pub sql: EntitySql,
}

impl EntityDefinition {
    /// Canonical field name for a source header, if the header is known.
    pub fn canonical_field(&self, header: &str) -> Option<&'static str> {
        std::iter::once(&self.natural_key)
            .chain(self.attributes.iter())
            .chain(self.references.iter().map(|r| &r.field))
            .chain(self.measures.iter())
            .find(|f| f.matches(header))
            .map(|f| f.name)
    }

    /// Every numeric field, deduplicated (attributes and measures may overlap).
    pub fn numeric_fields(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = Vec::new();
        for field in self.attributes.iter().chain(self.measures.iter()) {
            if field.kind == FieldKind::Numeric && !names.contains(&field.name) {
                names.push(field.name);
            }
        }
        names
    }

    pub fn stage(&self) -> usize {
        self.role.stage()
    }
}

// ============================================================================
// ENTITY REGISTRY
// ============================================================================

/// Catalog of all vault entities.
#[derive(Debug, Clone)]
pub struct EntityRegistry {
    definitions: Vec<EntityDefinition>,
}

impl EntityRegistry {
    /// Registry with the customer, product and sale entities.
    pub fn new() -> Self {
        let mut registry = EntityRegistry::empty();
        registry.register(entities::customer::definition());
        registry.register(entities::product::definition());
        registry.register(entities::sale::definition());
        registry
    }

    pub fn empty() -> Self {
        EntityRegistry {
            definitions: Vec::new(),
        }
    }

    /// Register (or replace) an entity definition.
    pub fn register(&mut self, definition: EntityDefinition) {
        self.definitions.retain(|d| d.kind != definition.kind);
        self.definitions.push(definition);
    }

    pub fn get(&self, kind: EntityKind) -> Result<&EntityDefinition> {
        self.definitions
            .iter()
            .find(|d| d.kind == kind)
            .ok_or_else(|| VaultError::Config(format!("entity {} is not registered", kind)))
    }

    pub fn all(&self) -> &[EntityDefinition] {
        &self.definitions
    }

    /// Entity kinds grouped by load stage, hubs first.
    pub fn stages(&self) -> Vec<Vec<EntityKind>> {
        let last = self.definitions.iter().map(|d| d.stage()).max();
        let Some(last) = last else {
            return Vec::new();
        };

        (0..=last)
            .map(|stage| {
                self.definitions
                    .iter()
                    .filter(|d| d.stage() == stage)
                    .map(|d| d.kind)
                    .collect::<Vec<_>>()
            })
            .filter(|kinds| !kinds.is_empty())
            .collect()
    }

    /// Check cross-entity consistency: references point at registered hubs and
    /// effective-date fields exist.
    pub fn validate(&self) -> Result<()> {
        for def in &self.definitions {
            for reference in &def.references {
                let target = self.get(reference.hub)?;
                if target.role != EntityRole::Hub {
                    return Err(VaultError::Config(format!(
                        "{} references {}, which is not a hub",
                        def.kind, reference.hub
                    )));
                }
                if !target.natural_key.sensitive && target.sql.lookup_by_natural_key.is_none() {
                    return Err(VaultError::Config(format!(
                        "{} references {}, which has no natural key lookup",
                        def.kind, reference.hub
                    )));
                }
            }

            if let Some(field) = def.effective_date {
                let declared = def
                    .attributes
                    .iter()
                    .chain(def.measures.iter())
                    .any(|f| f.name == field && f.kind == FieldKind::Date);
                if !declared {
                    return Err(VaultError::Config(format!(
                        "{} declares effective date {} but has no such date field",
                        def.kind, field
                    )));
                }
            }

            if def.role == EntityRole::Hub && !def.references.is_empty() {
                return Err(VaultError::Config(format!(
                    "hub {} cannot reference other hubs",
                    def.kind
                )));
            }
        }

        Ok(())
    }
}

impl Default for EntityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_initialization() {
        let registry = EntityRegistry::new();

        assert_eq!(registry.all().len(), 3);
        assert!(registry.validate().is_ok());

        let sale = registry.get(EntityKind::Sale).unwrap();
        assert_eq!(sale.role, EntityRole::Link);
        assert_eq!(sale.references.len(), 2);
    }

    #[test]
    fn test_stages_put_hubs_before_links() {
        let registry = EntityRegistry::new();
        let stages = registry.stages();

        assert_eq!(stages.len(), 2);
        assert!(stages[0].contains(&EntityKind::Customer));
        assert!(stages[0].contains(&EntityKind::Product));
        assert_eq!(stages[1], vec![EntityKind::Sale]);
    }

    #[test]
    fn test_canonical_field_uses_aliases() {
        let registry = EntityRegistry::new();
        let customer = registry.get(EntityKind::Customer).unwrap();

        assert_eq!(customer.canonical_field("name"), Some("customer_name"));
        assert_eq!(customer.canonical_field("customer_email"), Some("customer_email"));
        assert_eq!(customer.canonical_field("loyalty_tier"), None);
    }

    #[test]
    fn test_numeric_fields_are_deduplicated() {
        let registry = EntityRegistry::new();
        let sale = registry.get(EntityKind::Sale).unwrap();

        assert_eq!(sale.numeric_fields(), vec!["transaction_amount", "quantity"]);
    }

    #[test]
    fn test_validate_rejects_reference_to_link() {
        let mut registry = EntityRegistry::new();
        let mut sale = registry.get(EntityKind::Sale).unwrap().clone();
        sale.references[0].hub = EntityKind::Sale;
        registry.register(sale);

        assert!(matches!(registry.validate(), Err(VaultError::Config(_))));
    }

    #[test]
    fn test_validate_requires_lookup_for_clear_keys() {
        let mut registry = EntityRegistry::new();
        let mut product = registry.get(EntityKind::Product).unwrap().clone();
        product.sql.lookup_by_natural_key = None;
        registry.register(product);

        assert!(matches!(registry.validate(), Err(VaultError::Config(_))));
    }

    #[test]
    fn test_missing_entity_is_config_error() {
        let registry = EntityRegistry::empty();

        assert!(registry.get(EntityKind::Customer).is_err());
        assert!(registry.stages().is_empty());
    }
}
