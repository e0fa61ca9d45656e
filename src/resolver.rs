// 🔗 Referential Resolver - natural keys of referenced hubs to stored hash keys
//
// A link may only be written when every hub it references is present in
// committed storage. The resolver asks storage rather than trusting a locally
// derived hash key, so a missing hub is caught before the link is inserted.

use crate::error::Result;
use crate::hashing::derive_hash_key;
use crate::protection::ProtectionContext;
use crate::registry::{EntityDefinition, EntityKind, EntityRegistry};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Found(String),
    NotFound,
}

/// Outcome of resolving every reference of one link record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved {
    /// Hash keys in the definition's reference order
    All(Vec<String>),
    /// First reference that could not be resolved
    Missing {
        hub: EntityKind,
        natural_key: String,
        hub_table: &'static str,
    },
}

pub struct ReferentialResolver<'a> {
    registry: &'a EntityRegistry,
    protection: &'a ProtectionContext,
    /// Positive lookups only; hubs are never removed during a run
    cache: HashMap<(EntityKind, String), String>,
}

impl<'a> ReferentialResolver<'a> {
    pub fn new(registry: &'a EntityRegistry, protection: &'a ProtectionContext) -> Self {
        ReferentialResolver {
            registry,
            protection,
            cache: HashMap::new(),
        }
    }

    /// Look up the stored hash key of `natural_key` in `hub`.
    pub fn resolve(
        &mut self,
        conn: &Connection,
        natural_key: &str,
        hub: EntityKind,
    ) -> Result<Resolution> {
        let cache_key = (hub, natural_key.to_string());
        if let Some(hash_key) = self.cache.get(&cache_key) {
            return Ok(Resolution::Found(hash_key.clone()));
        }

        let def = self.registry.get(hub)?;
        let found = match def.sql.lookup_by_natural_key {
            Some(sql) if !def.natural_key.sensitive => conn
                .query_row(sql, params![natural_key], |row| row.get::<_, String>(0))
                .optional()?,
            _ => self.lookup_protected(conn, def, natural_key)?,
        };

        Ok(match found {
            Some(hash_key) => {
                self.cache.insert(cache_key, hash_key.clone());
                Resolution::Found(hash_key)
            }
            None => Resolution::NotFound,
        })
    }

    /// Protected display values are randomized, so a sensitive hub is found by
    /// its derived hash key. When the stored value can be revealed with this
    /// run's key it must match the requested natural key.
    fn lookup_protected(
        &self,
        conn: &Connection,
        def: &EntityDefinition,
        natural_key: &str,
    ) -> Result<Option<String>> {
        let derived = derive_hash_key(natural_key);
        let row: Option<(String, String)> = conn
            .query_row(def.sql.lookup_by_hash_key, params![derived], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .optional()?;

        let Some((hash_key, stored)) = row else {
            return Ok(None);
        };

        match self.protection.reveal(&stored) {
            Ok(plain) if plain != natural_key => {
                debug!(hub = %def.kind, "stored key does not match its hash key");
                Ok(None)
            }
            // Written under another run's key: the hash match stands
            _ => Ok(Some(hash_key)),
        }
    }

    /// Resolve every hub reference of a link record, stopping at the first miss.
    pub fn resolve_all(
        &mut self,
        conn: &Connection,
        def: &EntityDefinition,
        references: &[String],
    ) -> Result<Resolved> {
        let mut hash_keys = Vec::with_capacity(def.references.len());

        for (reference, natural_key) in def.references.iter().zip(references) {
            match self.resolve(conn, natural_key, reference.hub)? {
                Resolution::Found(hash_key) => hash_keys.push(hash_key),
                Resolution::NotFound => {
                    return Ok(Resolved::Missing {
                        hub: reference.hub,
                        natural_key: natural_key.clone(),
                        hub_table: self.registry.get(reference.hub)?.anchor_table,
                    })
                }
            }
        }

        Ok(Resolved::All(hash_keys))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::setup_vault;

    fn seeded(protection: &ProtectionContext) -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        let registry = EntityRegistry::new();
        setup_vault(&conn, &registry).unwrap();

        let customer = registry.get(EntityKind::Customer).unwrap();
        conn.execute(
            customer.sql.insert_anchor,
            params![
                derive_hash_key("C1"),
                protection.protect("C1").unwrap(),
                "2024-01-01T00:00:00.000000Z",
                "CSV"
            ],
        )
        .unwrap();

        let product = registry.get(EntityKind::Product).unwrap();
        conn.execute(
            product.sql.insert_anchor,
            params![
                derive_hash_key("P1"),
                "P1",
                "2024-01-01T00:00:00.000000Z",
                "CSV"
            ],
        )
        .unwrap();

        conn
    }

    #[test]
    fn test_resolves_plain_and_protected_hubs() {
        let protection = ProtectionContext::generate().unwrap();
        let conn = seeded(&protection);
        let registry = EntityRegistry::new();
        let mut resolver = ReferentialResolver::new(&registry, &protection);

        assert_eq!(
            resolver.resolve(&conn, "P1", EntityKind::Product).unwrap(),
            Resolution::Found(derive_hash_key("P1"))
        );
        assert_eq!(
            resolver.resolve(&conn, "C1", EntityKind::Customer).unwrap(),
            Resolution::Found(derive_hash_key("C1"))
        );
    }

    #[test]
    fn test_unknown_customer_is_not_found() {
        let protection = ProtectionContext::generate().unwrap();
        let conn = seeded(&protection);
        let registry = EntityRegistry::new();
        let sale = registry.get(EntityKind::Sale).unwrap();
        let mut resolver = ReferentialResolver::new(&registry, &protection);

        let resolved = resolver
            .resolve_all(&conn, sale, &["C9".to_string(), "P1".to_string()])
            .unwrap();

        assert_eq!(
            resolved,
            Resolved::Missing {
                hub: EntityKind::Customer,
                natural_key: "C9".to_string(),
                hub_table: "customers_hub",
            }
        );
    }

    #[test]
    fn test_resolve_all_keeps_reference_order() {
        let protection = ProtectionContext::generate().unwrap();
        let conn = seeded(&protection);
        let registry = EntityRegistry::new();
        let sale = registry.get(EntityKind::Sale).unwrap();
        let mut resolver = ReferentialResolver::new(&registry, &protection);

        let resolved = resolver
            .resolve_all(&conn, sale, &["C1".to_string(), "P1".to_string()])
            .unwrap();

        assert_eq!(
            resolved,
            Resolved::All(vec![derive_hash_key("C1"), derive_hash_key("P1")])
        );
    }

    #[test]
    fn test_other_runs_key_accepts_hash_match() {
        let first_run = ProtectionContext::generate().unwrap();
        let conn = seeded(&first_run);
        let registry = EntityRegistry::new();
        let second_run = ProtectionContext::generate().unwrap();
        let mut resolver = ReferentialResolver::new(&registry, &second_run);

        assert_eq!(
            resolver.resolve(&conn, "C1", EntityKind::Customer).unwrap(),
            Resolution::Found(derive_hash_key("C1"))
        );
    }
}
