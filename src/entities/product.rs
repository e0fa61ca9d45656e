// 📦 Product hub + satellite

use crate::registry::{EntityDefinition, EntityKind, EntityRole, EntitySql, FieldDefinition};

pub const DDL: &str = "
CREATE TABLE IF NOT EXISTS products_hub (
    product_hash_key TEXT PRIMARY KEY,
    product_id TEXT NOT NULL,
    load_date TEXT NOT NULL,
    source TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_products_hub_natural_key ON products_hub(product_id);

CREATE TABLE IF NOT EXISTS products_satellite (
    product_hash_key TEXT NOT NULL REFERENCES products_hub(product_hash_key),
    product_name TEXT,
    product_category TEXT,
    product_brand TEXT,
    start_date TEXT NOT NULL,
    end_date TEXT,
    load_date TEXT NOT NULL,
    source TEXT NOT NULL,
    hash_diff TEXT NOT NULL,
    PRIMARY KEY (product_hash_key, start_date)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_products_satellite_current
    ON products_satellite(product_hash_key) WHERE end_date IS NULL;
";

pub fn definition() -> EntityDefinition {
    EntityDefinition {
        kind: EntityKind::Product,
        role: EntityRole::Hub,
        anchor_table: "products_hub",
        satellite_table: "products_satellite",
        hash_key_column: "product_hash_key",
        natural_key: FieldDefinition::text("product_id").with_alias("product"),
        // Hash-diff contract: name, category, brand
        attributes: vec![
            FieldDefinition::text("product_name").with_alias("name"),
            FieldDefinition::text("product_category").with_alias("category"),
            FieldDefinition::text("product_brand").with_alias("brand"),
        ],
        references: Vec::new(),
        measures: Vec::new(),
        effective_date: None,
        sql: EntitySql {
            ddl: DDL,
            insert_anchor: "INSERT INTO products_hub (product_hash_key, product_id, load_date, source)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (product_hash_key) DO NOTHING",
            lookup_by_natural_key: Some(
                "SELECT product_hash_key FROM products_hub WHERE product_id = ?1",
            ),
            lookup_by_hash_key: "SELECT product_hash_key, product_id FROM products_hub
                 WHERE product_hash_key = ?1",
            current_version: "SELECT hash_diff, start_date FROM products_satellite
                 WHERE product_hash_key = ?1 AND end_date IS NULL",
            close_version: "UPDATE products_satellite SET end_date = ?1
                 WHERE product_hash_key = ?2 AND end_date IS NULL",
            insert_version: "INSERT INTO products_satellite (
                    product_hash_key, product_name, product_category, product_brand,
                    start_date, end_date, load_date, source, hash_diff
                 ) VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6, ?7, ?8)",
            count_anchor: "SELECT COUNT(*) FROM products_hub",
            count_versions: "SELECT COUNT(*) FROM products_satellite",
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

        assert_eq!(names, vec!["product_name", "product_category", "product_brand"]);
        assert!(!def.natural_key.sensitive);
    }
}
