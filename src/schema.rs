//! Schema data structures
//!
//! These types form the contract between the model builder (produces) and the
//! emitter (consumes). A [`SchemaModel`] is assembled once per run and only
//! handed out by shared reference afterwards.

use std::collections::BTreeMap;
use std::fmt;

use crate::dialect::Dialect;

/// The aggregate root: every namespace built during one run
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SchemaModel {
    namespaces: BTreeMap<String, Namespace>,
}

impl SchemaModel {
    pub(crate) fn from_namespaces(namespaces: BTreeMap<String, Namespace>) -> Self {
        Self { namespaces }
    }

    pub fn namespace(&self, name: &str) -> Option<&Namespace> {
        self.namespaces.get(name)
    }

    /// Namespaces in name order
    pub fn namespaces(&self) -> impl Iterator<Item = &Namespace> {
        self.namespaces.values()
    }

    pub fn is_empty(&self) -> bool {
        self.namespaces.is_empty()
    }
}

/// One database schema plus the queries written against it
#[derive(Debug, Clone, PartialEq)]
pub struct Namespace {
    pub name: String,
    pub dialect: Dialect,
    /// Tables and views, sorted by name
    pub tables: Vec<Table>,
    /// Sorted by name; labels keep catalog order
    pub enums: Vec<EnumType>,
    /// Sorted by name, then signature
    pub procs: Vec<Proc>,
    /// Ordered by source file path, then appearance within the file
    pub queries: Vec<Query>,
}

impl Namespace {
    pub fn table(&self, name: &str) -> Option<&Table> {
        let key = self.dialect.fold_identifier(name);
        self.tables
            .iter()
            .find(|t| self.dialect.fold_identifier(&t.name) == key)
    }

    pub fn enum_type(&self, name: &str) -> Option<&EnumType> {
        let key = self.dialect.fold_identifier(name);
        self.enums
            .iter()
            .find(|e| self.dialect.fold_identifier(&e.name) == key)
    }

    pub fn query(&self, name: &str) -> Option<&Query> {
        self.queries.iter().find(|q| q.name == name)
    }

    pub fn base_tables(&self) -> impl Iterator<Item = &Table> {
        self.tables.iter().filter(|t| t.kind == TableKind::Table)
    }

    pub fn views(&self) -> impl Iterator<Item = &Table> {
        self.tables.iter().filter(|t| t.kind == TableKind::View)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableKind {
    Table,
    View,
}

impl TableKind {
    pub fn label(self) -> &'static str {
        match self {
            TableKind::Table => "table",
            TableKind::View => "view",
        }
    }
}

/// Database table or view
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    pub name: String,
    pub namespace: String,
    pub kind: TableKind,
    /// Catalog ordinal order; defines record field order
    pub columns: Vec<Column>,
    /// Sorted by name
    pub indexes: Vec<Index>,
    /// Keys where this table is the referencing side, sorted by name
    pub foreign_keys: Vec<ForeignKey>,
}

impl Table {
    /// Returns PascalCase class name from snake_case table name
    pub fn class_name(&self) -> String {
        to_pascal_case(&self.name)
    }

    /// Returns singular form of the class name (basic heuristic)
    pub fn singular_class_name(&self) -> String {
        singularize(&self.class_name())
    }

    /// Returns singular form of the table name in snake_case (basic heuristic)
    pub fn singular_name(&self) -> String {
        singularize(&self.name)
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn primary_key(&self) -> Option<&Index> {
        self.indexes.iter().find(|i| i.is_primary)
    }

    /// Get primary key columns in order
    pub fn primary_key_columns(&self) -> Vec<&Column> {
        self.primary_key()
            .map(|pk| {
                pk.columns
                    .iter()
                    .filter_map(|name| self.column(name))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Check if the primary key is auto-generated (SERIAL, IDENTITY, rowid alias)
    pub fn has_auto_generated_pk(&self) -> bool {
        self.primary_key_columns().iter().any(|col| col.is_generated)
    }

    /// Columns a caller supplies on insert: not generated and without a
    /// server-side default, required columns first
    pub fn insert_columns(&self) -> Vec<&Column> {
        let mut cols: Vec<&Column> = self
            .columns
            .iter()
            .filter(|col| !col.is_generated && col.default.is_none())
            .collect();
        cols.sort_by_key(|col| col.is_nullable);
        cols
    }

    /// Get non-primary-key columns (for update SET clause)
    pub fn non_pk_columns(&self) -> Vec<&Column> {
        let pk: Vec<&str> = self
            .primary_key()
            .map(|pk| pk.columns.iter().map(String::as_str).collect())
            .unwrap_or_default();
        self.columns
            .iter()
            .filter(|col| !pk.contains(&col.name.as_str()))
            .collect()
    }
}

/// A table column
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    /// 1-based catalog position
    pub ordinal: u32,
    pub native_type: String,
    pub ty: TypeDescriptor,
    pub is_nullable: bool,
    /// Server-side default expression (DEFAULT value, NOW(), etc.)
    pub default: Option<String>,
    /// Identity, serial or computed column
    pub is_generated: bool,
}

/// An index over one table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Index {
    pub name: String,
    pub table: String,
    /// Member columns in index position order
    pub columns: Vec<String>,
    pub is_unique: bool,
    pub is_primary: bool,
}

/// A foreign key, from the referencing side
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    pub name: String,
    pub table: String,
    /// Referencing columns, position-aligned with `ref_columns`
    pub columns: Vec<String>,
    pub ref_namespace: String,
    pub ref_table: String,
    pub ref_columns: Vec<String>,
}

impl ForeignKey {
    /// `(local, referenced)` column pairs in key position order
    pub fn column_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.columns
            .iter()
            .map(String::as_str)
            .zip(self.ref_columns.iter().map(String::as_str))
    }
}

/// A custom enum type defined in the database
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumType {
    pub name: String,
    pub namespace: String,
    /// Labels in catalog sort order
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcKind {
    Function,
    Procedure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamMode {
    In,
    Out,
    InOut,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcParam {
    pub name: String,
    pub mode: ParamMode,
    pub native_type: String,
    pub ty: TypeDescriptor,
}

/// A stored procedure or function
#[derive(Debug, Clone, PartialEq)]
pub struct Proc {
    pub name: String,
    pub namespace: String,
    pub kind: ProcKind,
    /// Parameters in declaration order
    pub params: Vec<ProcParam>,
    pub return_type: Option<TypeDescriptor>,
    /// Overload discriminator: the input parameter types joined by `,`
    pub signature: String,
}

impl Proc {
    pub fn inputs(&self) -> impl Iterator<Item = &ProcParam> {
        self.params
            .iter()
            .filter(|p| matches!(p.mode, ParamMode::In | ParamMode::InOut))
    }

    pub fn outputs(&self) -> impl Iterator<Item = &ProcParam> {
        self.params
            .iter()
            .filter(|p| matches!(p.mode, ParamMode::Out | ParamMode::InOut))
    }
}

/// Declared row count of a query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cardinality {
    One,
    Many,
    Exec,
    ExecRows,
    Scalar,
}

impl Cardinality {
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            ":one" => Some(Cardinality::One),
            ":many" => Some(Cardinality::Many),
            ":exec" => Some(Cardinality::Exec),
            ":execrows" => Some(Cardinality::ExecRows),
            ":scalar" => Some(Cardinality::Scalar),
            _ => None,
        }
    }

    pub fn tag(self) -> &'static str {
        match self {
            Cardinality::One => ":one",
            Cardinality::Many => ":many",
            Cardinality::Exec => ":exec",
            Cardinality::ExecRows => ":execrows",
            Cardinality::Scalar => ":scalar",
        }
    }

    /// Whether the query yields rows that need a result shape
    pub fn returns_rows(self) -> bool {
        matches!(self, Cardinality::One | Cardinality::Many | Cardinality::Scalar)
    }
}

impl fmt::Display for Cardinality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryParam {
    pub name: String,
    /// 1-based placeholder index
    pub index: usize,
    pub native_type: Option<String>,
    pub ty: TypeDescriptor,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResultColumn {
    pub name: String,
    pub ty: TypeDescriptor,
    /// Named positionally because no name could be derived
    pub positional: bool,
}

/// Row shape a query yields
#[derive(Debug, Clone, PartialEq)]
pub enum ResultShape {
    /// No rows (exec / execrows)
    None,
    /// The row shape of a named table or view
    Table(String),
    /// The row shape of a named proc
    Proc(String),
    /// Derived from the SELECT / RETURNING list
    Inferred(Vec<ResultColumn>),
}

/// A query read from an annotated SQL file
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub name: String,
    /// Logical identifier of the file the query came from
    pub source: String,
    pub line: usize,
    pub sql: String,
    pub cardinality: Cardinality,
    pub params: Vec<QueryParam>,
    pub result: ResultShape,
    pub doc: Option<String>,
}

/// A resolved target-language type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDescriptor {
    /// Target type name for the scalar element
    pub target: String,
    /// Import the target type needs, if any
    pub import: Option<String>,
    pub nullable: bool,
    pub array: bool,
    /// No explicit mapping existed; `target` is the dialect's fallback
    pub fallback: bool,
    /// Name of a model enum this type refers to
    pub enum_ref: Option<String>,
}

impl TypeDescriptor {
    pub fn with_nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }
}

/// Basic singularization rules
fn singularize(name: &str) -> String {
    if let Some(stem) = name.strip_suffix("ies") {
        format!("{}y", stem)
    } else if name.ends_with('s') && !name.ends_with("ss") {
        name[..name.len() - 1].to_string()
    } else {
        name.to_string()
    }
}

/// Convert snake_case to PascalCase
///
/// This is a shared utility used by code generators for all target languages.
pub fn to_pascal_case(s: &str) -> String {
    s.split('_')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                None => String::new(),
                Some(first) => {
                    let first_upper = first.to_uppercase().to_string();
                    first_upper + chars.as_str()
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_type() -> TypeDescriptor {
        TypeDescriptor {
            target: "int".to_string(),
            import: None,
            nullable: false,
            array: false,
            fallback: false,
            enum_ref: None,
        }
    }

    fn column(name: &str, ordinal: u32, generated: bool, default: Option<&str>) -> Column {
        Column {
            name: name.to_string(),
            ordinal,
            native_type: "integer".to_string(),
            ty: int_type(),
            is_nullable: false,
            default: default.map(str::to_string),
            is_generated: generated,
        }
    }

    fn table(name: &str, columns: Vec<Column>, pk: &[&str]) -> Table {
        let indexes = if pk.is_empty() {
            vec![]
        } else {
            vec![Index {
                name: format!("{}_pkey", name),
                table: name.to_string(),
                columns: pk.iter().map(|c| c.to_string()).collect(),
                is_unique: true,
                is_primary: true,
            }]
        };
        Table {
            name: name.to_string(),
            namespace: "public".to_string(),
            kind: TableKind::Table,
            columns,
            indexes,
            foreign_keys: vec![],
        }
    }

    #[test]
    fn test_class_name_snake_case() {
        let t = table("order_line_items", vec![], &[]);
        assert_eq!(t.class_name(), "OrderLineItems");
    }

    #[test]
    fn test_singular_class_name() {
        assert_eq!(table("users", vec![], &[]).singular_class_name(), "User");
        assert_eq!(table("categories", vec![], &[]).singular_class_name(), "Category");
        assert_eq!(table("staff", vec![], &[]).singular_class_name(), "Staff");
        assert_eq!(table("addresses", vec![], &[]).singular_name(), "addresse");
    }

    #[test]
    fn test_has_auto_generated_pk() {
        let t = table("users", vec![column("id", 1, true, None)], &["id"]);
        assert!(t.has_auto_generated_pk());

        let t = table("users", vec![column("id", 1, false, None)], &["id"]);
        assert!(!t.has_auto_generated_pk());
    }

    #[test]
    fn test_insert_and_non_pk_columns() {
        let mut nullable = column("nickname", 3, false, None);
        nullable.is_nullable = true;
        let t = table(
            "users",
            vec![
                column("id", 1, true, None),
                nullable,
                column("created_at", 4, false, Some("now()")),
                column("age", 2, false, None),
            ],
            &["id"],
        );

        let insert: Vec<_> = t.insert_columns().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(insert, vec!["age", "nickname"]);

        let non_pk: Vec<_> = t.non_pk_columns().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(non_pk, vec!["nickname", "created_at", "age"]);
    }

    #[test]
    fn test_cardinality_tags() {
        assert_eq!(Cardinality::from_tag(":execrows"), Some(Cardinality::ExecRows));
        assert_eq!(Cardinality::from_tag(":first"), None);
        assert!(Cardinality::Scalar.returns_rows());
        assert!(!Cardinality::Exec.returns_rows());
    }

    #[test]
    fn test_fk_column_pairs() {
        let fk = ForeignKey {
            name: "fk".to_string(),
            table: "order_items".to_string(),
            columns: vec!["order_id".to_string(), "line".to_string()],
            ref_namespace: "public".to_string(),
            ref_table: "order_lines".to_string(),
            ref_columns: vec!["id".to_string(), "number".to_string()],
        };
        let pairs: Vec<_> = fk.column_pairs().collect();
        assert_eq!(pairs, vec![("order_id", "id"), ("line", "number")]);
    }

    #[test]
    fn test_to_pascal_case() {
        assert_eq!(to_pascal_case("user"), "User");
        assert_eq!(to_pascal_case("order_status"), "OrderStatus");
    }
}
