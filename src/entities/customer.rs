// 👤 Customer hub + satellite
//
// The customer id is sensitive: the hub stores its protected form, while the
// hash key is derived from the plaintext id.

use crate::registry::{EntityDefinition, EntityKind, EntityRole, EntitySql, FieldDefinition};

pub const DDL: &str = "
CREATE TABLE IF NOT EXISTS customers_hub (
    customer_hash_key TEXT PRIMARY KEY,
    customer_id TEXT NOT NULL,
    load_date TEXT NOT NULL,
    source TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS customers_satellite (
    customer_hash_key TEXT NOT NULL REFERENCES customers_hub(customer_hash_key),
    customer_name TEXT,
    customer_email TEXT,
    customer_address TEXT,
    start_date TEXT NOT NULL,
    end_date TEXT,
    load_date TEXT NOT NULL,
    source TEXT NOT NULL,
    hash_diff TEXT NOT NULL,
    PRIMARY KEY (customer_hash_key, start_date)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_customers_satellite_current
    ON customers_satellite(customer_hash_key) WHERE end_date IS NULL;
";

pub fn definition() -> EntityDefinition {
    EntityDefinition {
        kind: EntityKind::Customer,
        role: EntityRole::Hub,
        anchor_table: "customers_hub",
        satellite_table: "customers_satellite",
        hash_key_column: "customer_hash_key",
        natural_key: FieldDefinition::text("customer_id")
            .with_alias("customer")
            .sensitive(),
        // Hash-diff contract: name, email, address
        attributes: vec![
            FieldDefinition::text("customer_name").with_alias("name"),
            FieldDefinition::text("customer_email").with_alias("email"),
            FieldDefinition::text("customer_address").with_alias("address"),
        ],
        references: Vec::new(),
        measures: Vec::new(),
        effective_date: None,
        sql: EntitySql {
            ddl: DDL,
            insert_anchor: "INSERT INTO customers_hub (customer_hash_key, customer_id, load_date, source)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (customer_hash_key) DO NOTHING",
            lookup_by_natural_key: None,
            lookup_by_hash_key: "SELECT customer_hash_key, customer_id FROM customers_hub
                 WHERE customer_hash_key = ?1",
            current_version: "SELECT hash_diff, start_date FROM customers_satellite
                 WHERE customer_hash_key = ?1 AND end_date IS NULL",
            close_version: "UPDATE customers_satellite SET end_date = ?1
                 WHERE customer_hash_key = ?2 AND end_date IS NULL",
            insert_version: "INSERT INTO customers_satellite (
                    customer_hash_key, customer_name, customer_email, customer_address,
                    start_date, end_date, load_date, source, hash_diff
                 ) VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6, ?7, ?8)",
            count_anchor: "SELECT COUNT(*) FROM customers_hub",
            count_versions: "SELECT COUNT(*) FROM customers_satellite",
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_diff_attribute_order() {
        let def = definition();
        let names: Vec<&str> = def.attributes.iter().map(|a| a.name).collect();

        assert_eq!(names, vec!["customer_name", "customer_email", "customer_address"]);
    }

    #[test]
    fn test_customer_id_is_sensitive() {
        let def = definition();

        assert!(def.natural_key.sensitive);
        assert!(def.attributes.iter().all(|a| !a.sensitive));
    }
}
