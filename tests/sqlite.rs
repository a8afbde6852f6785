#![cfg(feature = "sqlite")]

use std::sync::Arc;

use pretty_assertions::assert_eq;
use rusqlite::Connection;

use sqlweave::builder::SchemaModelBuilder;
use sqlweave::diagnostics::NullSink;
use sqlweave::emit::python_templates;
use sqlweave::introspect::{load_catalog, ExecContext, LoaderRegistry, SqliteLoader, TableFilter};
use sqlweave::pipeline::GenerationRun;
use sqlweave::query::QuerySource;
use sqlweave::schema::TableKind;
use sqlweave::typemap::TypeMapper;
use sqlweave::SqliteConnection;

const SHOP: &str = r#"
    CREATE TABLE customers (
        customer_id INTEGER PRIMARY KEY,
        email TEXT NOT NULL UNIQUE
    );
    CREATE TABLE orders (
        order_id INTEGER PRIMARY KEY,
        customer_id INTEGER NOT NULL REFERENCES customers,
        total REAL,
        note TEXT DEFAULT 'none'
    );
    CREATE VIEW big_orders AS SELECT order_id, total FROM orders WHERE total > 100;
"#;

fn shop() -> SqliteConnection {
    let conn = Connection::open_in_memory().unwrap();
    conn.execute_batch(SHOP).unwrap();
    SqliteConnection::from_connection(conn)
}

#[test]
fn test_introspects_tables_views_and_keys() {
    let db = shop();
    let catalog = load_catalog(
        &ExecContext::new(),
        &SqliteLoader,
        &db,
        "main",
        &TableFilter::default(),
        2,
    )
    .unwrap();

    let names: Vec<_> = catalog.tables.iter().map(|e| e.table.name.as_str()).collect();
    assert_eq!(names, vec!["big_orders", "customers", "orders"]);
    assert_eq!(catalog.tables[0].table.kind, TableKind::View);

    let orders = &catalog.tables[2];
    let columns: Vec<_> = orders.columns.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(columns, vec!["order_id", "customer_id", "total", "note"]);
    assert!(orders.columns[0].is_generated);
    assert!(!orders.columns[1].is_nullable);
    assert!(orders.columns[2].is_nullable);
    assert_eq!(orders.columns[3].default.as_deref(), Some("'none'"));

    let pk = orders.indexes.iter().find(|i| i.is_primary).unwrap();
    assert_eq!(pk.name, "orders_pkey");
    assert_eq!(pk.columns, vec!["order_id".to_string()]);

    let customers = &catalog.tables[1];
    assert!(customers.indexes.iter().any(|i| i.is_unique && !i.is_primary && i.columns == vec!["email".to_string()]));
}

#[test]
fn test_implicit_foreign_key_target_resolves_to_primary_key() {
    let db = shop();
    let catalog = load_catalog(
        &ExecContext::new(),
        &SqliteLoader,
        &db,
        "main",
        &TableFilter::default(),
        2,
    )
    .unwrap();

    let mapper = TypeMapper::builtin();
    let mut builder = SchemaModelBuilder::new(&mapper, Arc::new(NullSink));
    builder.add_catalog(catalog);
    let output = builder.build().unwrap();

    let orders = output.model.namespace("main").unwrap().table("orders").unwrap();
    assert_eq!(orders.foreign_keys.len(), 1);
    assert_eq!(orders.foreign_keys[0].ref_table, "customers");
    assert_eq!(orders.foreign_keys[0].ref_columns, vec!["customer_id".to_string()]);
}

#[test]
fn test_end_to_end_generation() {
    let db = shop();
    let registry = LoaderRegistry::default();
    let mapper = TypeMapper::builtin();
    let templates = python_templates();
    let run = GenerationRun::new(&registry, &mapper, &templates);
    let queries = vec![QuerySource::new(
        "orders.sql",
        "-- name: OrdersForCustomer :many\nSELECT order_id, total FROM orders WHERE customer_id = ?\n",
    )];

    let filter = TableFilter {
        include: None,
        exclude: Some(vec!["big_orders".to_string()]),
    };
    let output = run.run(&db, "main", &filter, &queries).unwrap();
    assert!(!output.files.contains_key("main/big_orders.py"));

    let orders = String::from_utf8(output.files["main/orders.py"].clone()).unwrap();
    assert!(orders.contains("def list_orders_by_customer_id(conn, customer_id: int) -> list[OrderRecord]:"));

    let queries = String::from_utf8(output.files["main/queries.py"].clone()).unwrap();
    assert!(queries.contains("class OrdersForCustomerRow:\n    order_id: int\n    total: float | None\n"));
    assert!(queries.contains("def orders_for_customer(conn, customer_id: int) -> list[OrdersForCustomerRow]:"));
}
