// 🧾 Sale link + transaction satellite
//
// A sale links one customer and one product. The transaction date is the
// authoritative start date of each satellite version.

use crate::registry::{
    EntityDefinition, EntityKind, EntityRole, EntitySql, FieldDefinition, HubReference,
};

pub const DDL: &str = "
CREATE TABLE IF NOT EXISTS sales_link (
    transaction_hash_key TEXT PRIMARY KEY,
    transaction_id TEXT NOT NULL,
    customer_hash_key TEXT NOT NULL REFERENCES customers_hub(customer_hash_key),
    product_hash_key TEXT NOT NULL REFERENCES products_hub(product_hash_key),
    transaction_date TEXT,
    transaction_amount REAL,
    quantity REAL,
    load_date TEXT NOT NULL,
    source TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sales_transactions_satellite (
    transaction_hash_key TEXT NOT NULL REFERENCES sales_link(transaction_hash_key),
    transaction_date TEXT,
    transaction_amount REAL,
    quantity REAL,
    start_date TEXT NOT NULL,
    end_date TEXT,
    load_date TEXT NOT NULL,
    source TEXT NOT NULL,
    hash_diff TEXT NOT NULL,
    PRIMARY KEY (transaction_hash_key, start_date)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_sales_transactions_satellite_current
    ON sales_transactions_satellite(transaction_hash_key) WHERE end_date IS NULL;
";

pub fn definition() -> EntityDefinition {
    EntityDefinition {
        kind: EntityKind::Sale,
        role: EntityRole::Link,
        anchor_table: "sales_link",
        satellite_table: "sales_transactions_satellite",
        hash_key_column: "transaction_hash_key",
        natural_key: FieldDefinition::text("transaction_id").with_alias("sale_id"),
        // Hash-diff contract: date, amount, quantity
        attributes: vec![
            FieldDefinition::date("transaction_date").with_alias("sale_date"),
            FieldDefinition::numeric("transaction_amount").with_alias("amount"),
            FieldDefinition::numeric("quantity"),
        ],
        references: vec![
            HubReference {
                field: FieldDefinition::text("customer_id"),
                hub: EntityKind::Customer,
            },
            HubReference {
                field: FieldDefinition::text("product_id"),
                hub: EntityKind::Product,
            },
        ],
        measures: vec![
            FieldDefinition::date("transaction_date").with_alias("sale_date"),
            FieldDefinition::numeric("transaction_amount").with_alias("amount"),
            FieldDefinition::numeric("quantity"),
        ],
        effective_date: Some("transaction_date"),
        sql: EntitySql {
            ddl: DDL,
            insert_anchor: "INSERT INTO sales_link (
                    transaction_hash_key, transaction_id, customer_hash_key, product_hash_key,
                    transaction_date, transaction_amount, quantity, load_date, source
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT (transaction_hash_key) DO NOTHING",
            lookup_by_natural_key: None,
            lookup_by_hash_key: "SELECT transaction_hash_key, transaction_id FROM sales_link
                 WHERE transaction_hash_key = ?1",
            current_version: "SELECT hash_diff, start_date FROM sales_transactions_satellite
                 WHERE transaction_hash_key = ?1 AND end_date IS NULL",
            close_version: "UPDATE sales_transactions_satellite SET end_date = ?1
                 WHERE transaction_hash_key = ?2 AND end_date IS NULL",
            insert_version: "INSERT INTO sales_transactions_satellite (
                    transaction_hash_key, transaction_date, transaction_amount, quantity,
                    start_date, end_date, load_date, source, hash_diff
                 ) VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6, ?7, ?8)",
            count_anchor: "SELECT COUNT(*) FROM sales_link",
            count_versions: "SELECT COUNT(*) FROM sales_transactions_satellite",
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_references_customer_then_product() {
        let def = definition();
        let hubs: Vec<EntityKind> = def.references.iter().map(|r| r.hub).collect();

        assert_eq!(hubs, vec![EntityKind::Customer, EntityKind::Product]);
        assert_eq!(def.effective_date, Some("transaction_date"));
    }

    #[test]
    fn test_insert_anchor_binds_every_column() {
        let def = definition();
        // hash key + display key + references + measures + load date + source
        let expected = 2 + def.references.len() + def.measures.len() + 2;

        assert!(def.sql.insert_anchor.contains(&format!("?{}", expected)));
        assert!(!def.sql.insert_anchor.contains(&format!("?{}", expected + 1)));
    }
}
