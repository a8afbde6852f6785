use std::sync::Arc;

use pretty_assertions::assert_eq;

use sqlweave::builder::SchemaModelBuilder;
use sqlweave::diagnostics::{DiagnosticKind, Diagnostics, NullSink, Severity};
use sqlweave::dialect::Dialect;
use sqlweave::emit::python_templates;
use sqlweave::error::{AnnotationErrorKind, SqlweaveError, ValidationError};
use sqlweave::introspect::{
    load_catalog, Catalog, CatalogColumn, CatalogEntry, CatalogRow, CatalogTable, CatalogValue, ExecContext,
    LoaderRegistry, MemoryConnection, SqliteLoader, TableFilter,
};
use sqlweave::pipeline::GenerationRun;
use sqlweave::query::{parse_query_file, ParsedFile, QuerySource};
use sqlweave::schema::{Cardinality, ForeignKey, Index, TableKind};
use sqlweave::typemap::TypeMapper;

fn sqlite_column(cid: i64, name: &str, native_type: &str, not_null: i64, pk: i64) -> CatalogRow {
    CatalogRow::new()
        .with("cid", cid)
        .with("name", name)
        .with("type", native_type)
        .with("not_null", not_null)
        .with("dflt_value", CatalogValue::Null)
        .with("pk", pk)
        .with("hidden", 0i64)
}

/// `products(product_id integer primary key, product_name varchar not null)`,
/// with the column rows deliberately out of ordinal order
fn products_db() -> MemoryConnection {
    MemoryConnection::new(Dialect::Sqlite)
        .with_rows(
            "sqlite_tables",
            &[],
            vec![CatalogRow::new()
                .with("table_name", "products")
                .with("table_kind", "table")],
        )
        .with_rows(
            "sqlite_columns",
            &["products"],
            vec![
                sqlite_column(1, "product_name", "varchar", 1, 0),
                sqlite_column(0, "product_id", "integer", 0, 1),
            ],
        )
        .with_rows(
            "sqlite_primary_key",
            &["products"],
            vec![CatalogRow::new()
                .with("column_name", "product_id")
                .with("position", 1i64)],
        )
}

fn column(name: &str, ordinal: u32, native_type: &str, is_nullable: bool) -> CatalogColumn {
    CatalogColumn {
        name: name.to_string(),
        ordinal,
        native_type: native_type.to_string(),
        is_nullable,
        default: None,
        is_generated: false,
    }
}

fn entry(name: &str, columns: Vec<CatalogColumn>) -> CatalogEntry {
    let pk = columns[0].name.clone();
    CatalogEntry {
        table: CatalogTable {
            name: name.to_string(),
            kind: TableKind::Table,
        },
        columns,
        indexes: vec![Index {
            name: format!("{}_pkey", name),
            table: name.to_string(),
            columns: vec![pk],
            is_unique: true,
            is_primary: true,
        }],
        foreign_keys: vec![],
    }
}

fn catalog(namespace: &str, tables: Vec<CatalogEntry>) -> Catalog {
    Catalog {
        namespace: namespace.to_string(),
        dialect: Dialect::Postgres,
        tables,
        enums: vec![],
        procs: vec![],
    }
}

const PRODUCT_BY_ID: &str = "-- name: ProductByID :one\n-- param: id int\nSELECT * FROM products WHERE product_id = $1\n";

#[test]
fn test_products_table_model() {
    let db = products_db();
    let catalog = load_catalog(
        &ExecContext::new(),
        &SqliteLoader,
        &db,
        "main",
        &TableFilter::default(),
        4,
    )
    .unwrap();

    let mapper = TypeMapper::builtin();
    let mut builder = SchemaModelBuilder::new(&mapper, Arc::new(NullSink));
    builder.add_catalog(catalog);
    let output = builder.build().unwrap();

    let namespace = output.model.namespace("main").unwrap();
    assert_eq!(namespace.tables.len(), 1);
    let products = namespace.table("products").unwrap();
    let columns: Vec<_> = products.columns.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(columns, vec!["product_id", "product_name"]);

    assert_eq!(products.indexes.len(), 1);
    let pk = &products.indexes[0];
    assert!(pk.is_primary);
    assert!(pk.is_unique);
    assert_eq!(pk.columns, vec!["product_id".to_string()]);
    assert!(output.diagnostics.is_empty());
}

#[test]
fn test_declared_parameter_matches_placeholder() {
    let queries = parse_query_file("queries.sql", PRODUCT_BY_ID, Dialect::Postgres).unwrap();
    assert_eq!(queries.len(), 1);
    let query = &queries[0];
    assert_eq!(query.name, "ProductByID");
    assert_eq!(query.cardinality, Cardinality::One);
    assert_eq!(query.params.len(), 1);
    assert_eq!(query.params[0].name, "id");
}

#[test]
fn test_parameter_mismatch_is_rejected() {
    let text = "-- name: ProductByID :one\n-- param: id int\n-- param: extra int\n\
                SELECT * FROM products WHERE product_id = $1\n";
    let err = parse_query_file("queries.sql", text, Dialect::Postgres).unwrap_err();
    assert_eq!(err.query.as_deref(), Some("ProductByID"));
    assert_eq!(
        err.kind,
        AnnotationErrorKind::ParameterMismatch {
            declared: 2,
            found: 1
        }
    );
    assert!(err.to_string().contains("declared 2, found 1"));
}

#[test]
fn test_dangling_foreign_key_aborts() {
    let mut orders = entry("orders", vec![column("order_id", 1, "integer", false)]);
    orders.foreign_keys.push(ForeignKey {
        name: "orders_archive_fkey".to_string(),
        table: "orders".to_string(),
        columns: vec!["order_id".to_string()],
        ref_namespace: "public".to_string(),
        ref_table: "orders_archive".to_string(),
        ref_columns: vec!["order_id".to_string()],
    });

    let mapper = TypeMapper::builtin();
    let mut builder = SchemaModelBuilder::new(&mapper, Arc::new(NullSink));
    builder.add_catalog(catalog("public", vec![orders]));
    match builder.build() {
        Err(SqlweaveError::Validation(ValidationError::DanglingForeignKey { ref_table, .. })) => {
            assert_eq!(ref_table, "orders_archive");
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_unmapped_type_falls_back_with_diagnostic() {
    let products = entry(
        "products",
        vec![
            column("product_id", 1, "integer", false),
            column("location", 2, "point", true),
        ],
    );
    let mapper = TypeMapper::builtin();
    let sink = Diagnostics::new();
    let mut builder = SchemaModelBuilder::new(&mapper, sink.clone());
    builder.add_catalog(catalog("public", vec![products]));
    let output = builder.build().unwrap();

    let location = &output.model.namespace("public").unwrap().table("products").unwrap().columns[1];
    assert!(location.ty.fallback);
    assert!(location.ty.nullable);

    let diagnostics = sink.snapshot();
    assert_eq!(diagnostics.len(), 1);
    assert_eq!(diagnostics[0].severity, Severity::Warning);
    assert_eq!(diagnostics[0].kind, DiagnosticKind::FallbackType);
    assert_eq!(diagnostics[0].entity, "products.location");
    assert_eq!(diagnostics[0].message, "unmapped type: point");
}

#[test]
fn test_generation_is_deterministic() {
    let registry = LoaderRegistry::default();
    let mapper = TypeMapper::builtin();
    let templates = python_templates();
    let run = GenerationRun::new(&registry, &mapper, &templates);
    let queries = vec![QuerySource::new(
        "products.sql",
        "-- name: ProductByID :one\nSELECT * FROM products WHERE product_id = ?\n\n\
         -- name: ProductNames :many\nSELECT product_name FROM products\n",
    )];

    let first = run.run(&products_db(), "main", &TableFilter::default(), &queries).unwrap();
    let second = run.run(&products_db(), "main", &TableFilter::default(), &queries).unwrap();
    assert_eq!(first.files, second.files);
    assert_eq!(first.model, second.model);

    let record = String::from_utf8(first.files["main/products.py"].clone()).unwrap();
    let id_at = record.find("    product_id: int").unwrap();
    let name_at = record.find("    product_name: str").unwrap();
    assert!(id_at < name_at);
}

#[test]
fn test_merge_is_independent_of_input_order() {
    let products = || entry("products", vec![column("product_id", 1, "integer", false)]);
    let customers = || entry("customers", vec![column("customer_id", 1, "integer", false)]);
    let file = |path: &str, text: &str| ParsedFile {
        path: path.to_string(),
        queries: parse_query_file(path, text, Dialect::Postgres).unwrap(),
    };
    let a = "-- name: CountProducts :scalar\nSELECT count(*) FROM products\n";
    let b = "-- name: CountCustomers :scalar\nSELECT count(*) FROM customers\n";

    let mapper = TypeMapper::builtin();

    let mut forward = SchemaModelBuilder::new(&mapper, Arc::new(NullSink));
    forward.add_catalog(catalog("public", vec![products(), customers()]));
    forward.add_catalog(catalog("sales", vec![]));
    forward.add_query_file("public", file("a.sql", a));
    forward.add_query_file("public", file("b.sql", b));

    let mut backward = SchemaModelBuilder::new(&mapper, Arc::new(NullSink));
    backward.add_catalog(catalog("sales", vec![]));
    backward.add_catalog(catalog("public", vec![customers(), products()]));
    backward.add_query_file("public", file("b.sql", b));
    backward.add_query_file("public", file("a.sql", a));

    let forward = forward.build().unwrap().model;
    let backward = backward.build().unwrap().model;
    assert_eq!(forward, backward);

    let tables: Vec<_> = forward
        .namespace("public")
        .unwrap()
        .tables
        .iter()
        .map(|t| t.name.as_str())
        .collect();
    assert_eq!(tables, vec!["customers", "products"]);
}
