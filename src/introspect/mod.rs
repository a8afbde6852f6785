//! Database introspection
//!
//! A [`CatalogLoader`] knows one dialect's catalog shape and issues its
//! introspection queries through a [`CatalogConnection`]. The model builder
//! only ever sees the dialect-independent [`Catalog`] that [`load_catalog`]
//! assembles.

use std::collections::HashMap;

use rayon::prelude::*;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::dialect::Dialect;
use crate::error::{DriverError, LoaderError, SqlweaveError};
use crate::schema::{EnumType, ForeignKey, Index, ParamMode, ProcKind, TableKind};

pub mod driver;
pub mod memory;
mod mysql;
mod oracle;
mod postgres;
mod sqlite;
mod sqlserver;

pub use memory::MemoryConnection;
pub use mysql::MysqlLoader;
pub use oracle::OracleLoader;
pub use postgres::PostgresLoader;
pub use sqlite::SqliteLoader;
pub use sqlserver::SqlServerLoader;

/// A named catalog query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatalogQuery {
    /// Stable identifier used in logs, errors and canned connections
    pub name: &'static str,
    pub sql: &'static str,
}

/// One value in a catalog row
#[derive(Debug, Clone, PartialEq)]
pub enum CatalogValue {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
}

impl From<&str> for CatalogValue {
    fn from(v: &str) -> Self {
        CatalogValue::Text(v.to_string())
    }
}

impl From<String> for CatalogValue {
    fn from(v: String) -> Self {
        CatalogValue::Text(v)
    }
}

impl From<i64> for CatalogValue {
    fn from(v: i64) -> Self {
        CatalogValue::Int(v)
    }
}

impl From<bool> for CatalogValue {
    fn from(v: bool) -> Self {
        CatalogValue::Bool(v)
    }
}

impl<T: Into<CatalogValue>> From<Option<T>> for CatalogValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(CatalogValue::Null)
    }
}

/// A catalog row with named columns
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CatalogRow {
    values: Vec<(String, CatalogValue)>,
}

impl CatalogRow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style column append
    pub fn with(mut self, name: &str, value: impl Into<CatalogValue>) -> Self {
        self.push(name, value);
        self
    }

    pub fn push(&mut self, name: &str, value: impl Into<CatalogValue>) {
        self.values.push((name.to_lowercase(), value.into()));
    }

    fn value(&self, name: &str) -> Result<&CatalogValue, String> {
        self.values
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
            .ok_or_else(|| format!("missing column '{}'", name))
    }

    pub fn text(&self, name: &str) -> Result<String, String> {
        self.opt_text(name)?
            .ok_or_else(|| format!("column '{}' is null", name))
    }

    pub fn opt_text(&self, name: &str) -> Result<Option<String>, String> {
        match self.value(name)? {
            CatalogValue::Null => Ok(None),
            CatalogValue::Text(s) => Ok(Some(s.clone())),
            CatalogValue::Int(i) => Ok(Some(i.to_string())),
            CatalogValue::Bool(b) => Ok(Some(b.to_string())),
        }
    }

    pub fn int(&self, name: &str) -> Result<i64, String> {
        match self.value(name)? {
            CatalogValue::Int(i) => Ok(*i),
            CatalogValue::Text(s) => s
                .trim()
                .parse()
                .map_err(|_| format!("column '{}' is not an integer: {:?}", name, s)),
            CatalogValue::Bool(b) => Ok(i64::from(*b)),
            CatalogValue::Null => Err(format!("column '{}' is null", name)),
        }
    }

    /// A position or count that must fit in `u32`
    pub fn ordinal(&self, name: &str) -> Result<u32, String> {
        let value = self.int(name)?;
        u32::try_from(value).map_err(|_| format!("column '{}' is out of range: {}", name, value))
    }

    /// Booleans arrive as bools, 0/1 or YES/NO/Y/N/t/f depending on the catalog
    pub fn flag(&self, name: &str) -> Result<bool, String> {
        match self.value(name)? {
            CatalogValue::Bool(b) => Ok(*b),
            CatalogValue::Int(i) => Ok(*i != 0),
            CatalogValue::Null => Ok(false),
            CatalogValue::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
                "yes" | "y" | "t" | "true" | "1" => Ok(true),
                "no" | "n" | "f" | "false" | "0" | "" => Ok(false),
                other => Err(format!("column '{}' is not a flag: {:?}", name, other)),
            },
        }
    }
}

/// An open, dialect-tagged database handle
///
/// Implementations must be shareable across the loader's worker pool.
pub trait CatalogConnection: Send + Sync {
    fn dialect(&self) -> Dialect;

    /// Run a catalog query with positional text parameters
    fn query(&self, query: &CatalogQuery, params: &[&str]) -> Result<Vec<CatalogRow>, DriverError>;
}

/// Cancellable execution context for one run
#[derive(Debug, Clone, Default)]
pub struct ExecContext {
    token: CancellationToken,
}

impl ExecContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: CancellationToken) -> Self {
        Self { token }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Context cancelled together with this one but cancellable on its own
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
        }
    }

    pub fn check(&self, schema: &str) -> Result<(), LoaderError> {
        if self.is_cancelled() {
            return Err(LoaderError::Cancelled {
                schema: schema.to_string(),
            });
        }
        Ok(())
    }
}

/// A table or view as listed by the catalog
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogTable {
    pub name: String,
    pub kind: TableKind,
}

/// A column as listed by the catalog, type still native
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogColumn {
    pub name: String,
    pub ordinal: u32,
    pub native_type: String,
    pub is_nullable: bool,
    pub default: Option<String>,
    pub is_generated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogProcParam {
    pub name: String,
    pub mode: ParamMode,
    pub native_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogProc {
    pub name: String,
    pub kind: ProcKind,
    pub params: Vec<CatalogProcParam>,
    pub return_type: Option<String>,
    /// Catalog-specific identity separating overloads, e.g. an oid
    pub overload: String,
}

impl CatalogProc {
    /// Input types joined by `,`
    pub fn signature(&self) -> String {
        self.params
            .iter()
            .filter(|p| matches!(p.mode, ParamMode::In | ParamMode::InOut))
            .map(|p| p.native_type.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Everything the catalog says about one table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub table: CatalogTable,
    pub columns: Vec<CatalogColumn>,
    pub indexes: Vec<Index>,
    pub foreign_keys: Vec<ForeignKey>,
}

/// Sorted loader output for one schema
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Catalog {
    pub namespace: String,
    pub dialect: Dialect,
    pub tables: Vec<CatalogEntry>,
    pub enums: Vec<EnumType>,
    pub procs: Vec<CatalogProc>,
}

/// Trait for dialect-specific catalog readers
///
/// Every list operation returns results sorted by name (columns and index or
/// key members by position) regardless of the catalog's native order.
pub trait CatalogLoader: Send + Sync {
    fn dialect(&self) -> Dialect;

    fn list_tables(
        &self,
        ctx: &ExecContext,
        db: &dyn CatalogConnection,
        schema: &str,
    ) -> Result<Vec<CatalogTable>, LoaderError>;

    fn list_columns(
        &self,
        ctx: &ExecContext,
        db: &dyn CatalogConnection,
        schema: &str,
        table: &str,
    ) -> Result<Vec<CatalogColumn>, LoaderError>;

    fn list_indexes(
        &self,
        ctx: &ExecContext,
        db: &dyn CatalogConnection,
        schema: &str,
        table: &str,
    ) -> Result<Vec<Index>, LoaderError>;

    fn list_foreign_keys(
        &self,
        ctx: &ExecContext,
        db: &dyn CatalogConnection,
        schema: &str,
        table: &str,
    ) -> Result<Vec<ForeignKey>, LoaderError>;

    fn list_enums(
        &self,
        ctx: &ExecContext,
        db: &dyn CatalogConnection,
        schema: &str,
    ) -> Result<Vec<EnumType>, LoaderError>;

    fn list_procs(
        &self,
        ctx: &ExecContext,
        db: &dyn CatalogConnection,
        schema: &str,
    ) -> Result<Vec<CatalogProc>, LoaderError>;
}

/// Maps each supported dialect to its loader
pub struct LoaderRegistry {
    loaders: HashMap<Dialect, Box<dyn CatalogLoader>>,
}

impl LoaderRegistry {
    /// An empty registry
    pub fn empty() -> Self {
        Self {
            loaders: HashMap::new(),
        }
    }

    pub fn register(&mut self, loader: Box<dyn CatalogLoader>) {
        self.loaders.insert(loader.dialect(), loader);
    }

    pub fn get(&self, dialect: Dialect) -> Result<&dyn CatalogLoader, SqlweaveError> {
        self.loaders
            .get(&dialect)
            .map(|l| l.as_ref())
            .ok_or_else(|| SqlweaveError::Config(format!("no catalog loader registered for {}", dialect)))
    }
}

impl Default for LoaderRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(Box::new(PostgresLoader));
        registry.register(Box::new(SqliteLoader));
        registry.register(Box::new(MysqlLoader));
        registry.register(Box::new(SqlServerLoader));
        registry.register(Box::new(OracleLoader));
        registry
    }
}

/// Filters to apply during introspection
#[derive(Debug, Default, Clone)]
pub struct TableFilter {
    /// Only include these tables (if Some)
    pub include: Option<Vec<String>>,
    /// Exclude these tables
    pub exclude: Option<Vec<String>>,
}

impl TableFilter {
    /// Check if a table should be included
    pub fn should_include(&self, table_name: &str) -> bool {
        if let Some(include) = &self.include {
            if !include.iter().any(|t| t == table_name) {
                return false;
            }
        }

        if let Some(exclude) = &self.exclude {
            if exclude.iter().any(|t| t == table_name) {
                return false;
            }
        }

        true
    }
}

/// Introspect one schema with at most `workers` concurrent per-table calls
///
/// Per-table results are sorted by the loader before they are gathered, and
/// gathering keeps the sorted table order, so worker scheduling never shows up
/// in the output. Cancellation or any loader failure yields no catalog at all.
pub fn load_catalog(
    ctx: &ExecContext,
    loader: &dyn CatalogLoader,
    db: &dyn CatalogConnection,
    schema: &str,
    filter: &TableFilter,
    workers: usize,
) -> Result<Catalog, LoaderError> {
    if db.dialect() != loader.dialect() {
        return Err(LoaderError::DialectMismatch {
            connection: db.dialect(),
            loader: loader.dialect(),
        });
    }
    info!(schema = ?schema, dialect = ?loader.dialect(), "Starting schema introspection");

    let enums = loader.list_enums(ctx, db, schema)?;
    debug!(count = ?enums.len(), "Found enum types");

    let procs = loader.list_procs(ctx, db, schema)?;
    debug!(count = ?procs.len(), "Found procs");

    let all_tables = loader.list_tables(ctx, db, schema)?;
    debug!(count = ?all_tables.len(), "Found all tables");

    let tables: Vec<CatalogTable> = all_tables
        .into_iter()
        .filter(|t| filter.should_include(&t.name))
        .collect();
    debug!(count = ?tables.len(), "Tables after filtering");

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .thread_name(|i| format!("catalog-{}", i))
        .build()
        .map_err(|e| LoaderError::WorkerPool {
            schema: schema.to_string(),
            message: e.to_string(),
        })?;

    let entries = pool.install(|| {
        tables
            .into_par_iter()
            .map(|table| load_entry(ctx, loader, db, schema, table))
            .collect::<Result<Vec<_>, _>>()
    })?;
    ctx.check(schema)?;

    info!(
        schema = ?schema,
        tables = ?entries.len(),
        enums = ?enums.len(),
        procs = ?procs.len(),
        "Schema introspection complete"
    );

    Ok(Catalog {
        namespace: schema.to_string(),
        dialect: loader.dialect(),
        tables: entries,
        enums,
        procs,
    })
}

fn load_entry(
    ctx: &ExecContext,
    loader: &dyn CatalogLoader,
    db: &dyn CatalogConnection,
    schema: &str,
    table: CatalogTable,
) -> Result<CatalogEntry, LoaderError> {
    debug!(table = ?table.name, "Introspecting table");

    let columns = loader.list_columns(ctx, db, schema, &table.name)?;
    trace!(table = ?table.name, columns = ?columns.len(), "Found columns");

    let indexes = loader.list_indexes(ctx, db, schema, &table.name)?;
    trace!(table = ?table.name, indexes = ?indexes.len(), "Found indexes");

    let foreign_keys = loader.list_foreign_keys(ctx, db, schema, &table.name)?;
    trace!(table = ?table.name, foreign_keys = ?foreign_keys.len(), "Found foreign keys");

    Ok(CatalogEntry {
        table,
        columns,
        indexes,
        foreign_keys,
    })
}

/// Check cancellation, run the query, lift driver errors
pub(crate) fn run_query(
    ctx: &ExecContext,
    db: &dyn CatalogConnection,
    schema: &str,
    query: &CatalogQuery,
    params: &[&str],
) -> Result<Vec<CatalogRow>, LoaderError> {
    ctx.check(schema)?;
    trace!(schema = ?schema, query = query.name, params = ?params, "Running catalog query");
    let rows = db
        .query(query, params)
        .map_err(|e| LoaderError::from_driver(schema, query.name, e))?;
    // a query that raced a cancel must not feed a partial result onward
    ctx.check(schema)?;
    Ok(rows)
}

/// Attach schema and query context to a row decoding failure
pub(crate) fn malformed(schema: &str, query: &CatalogQuery) -> impl Fn(String) -> LoaderError {
    let schema = schema.to_string();
    let query = query.name;
    move |message| LoaderError::MalformedRow {
        schema: schema.clone(),
        query: query.to_string(),
        message,
    }
}

pub(crate) fn sort_tables(mut tables: Vec<CatalogTable>) -> Vec<CatalogTable> {
    tables.sort_by(|a, b| a.name.cmp(&b.name));
    tables.dedup_by(|a, b| a.name == b.name && a.kind == b.kind);
    tables
}

pub(crate) fn sort_columns(mut columns: Vec<CatalogColumn>) -> Vec<CatalogColumn> {
    columns.sort_by_key(|c| c.ordinal);
    columns
}

/// Member row of an index, before grouping
pub(crate) struct IndexMember {
    pub index: String,
    pub column: String,
    pub position: i64,
    pub is_unique: bool,
    pub is_primary: bool,
}

/// Group member rows into indexes, members by position, indexes by name
pub(crate) fn group_indexes(table: &str, members: Vec<IndexMember>) -> Vec<Index> {
    let mut grouped: Vec<(Index, Vec<(i64, String)>)> = Vec::new();
    for m in members {
        match grouped.iter_mut().find(|(idx, _)| idx.name == m.index) {
            Some((_, cols)) => cols.push((m.position, m.column)),
            None => grouped.push((
                Index {
                    name: m.index,
                    table: table.to_string(),
                    columns: vec![],
                    is_unique: m.is_unique || m.is_primary,
                    is_primary: m.is_primary,
                },
                vec![(m.position, m.column)],
            )),
        }
    }
    let mut indexes: Vec<Index> = grouped
        .into_iter()
        .map(|(mut idx, mut cols)| {
            cols.sort_by_key(|(pos, _)| *pos);
            idx.columns = cols.into_iter().map(|(_, c)| c).collect();
            idx
        })
        .collect();
    indexes.sort_by(|a, b| a.name.cmp(&b.name));
    indexes
}

/// Member row of a foreign key, before grouping
pub(crate) struct ForeignKeyMember {
    pub name: String,
    pub column: String,
    pub ref_namespace: String,
    pub ref_table: String,
    /// Empty when the catalog leaves the target to the referenced primary key
    pub ref_column: Option<String>,
    pub position: i64,
}

/// Group member rows into keys, pairs by position, keys by name
pub(crate) fn group_foreign_keys(table: &str, members: Vec<ForeignKeyMember>) -> Vec<ForeignKey> {
    let mut grouped: Vec<(ForeignKey, Vec<(i64, String, Option<String>)>)> = Vec::new();
    for m in members {
        match grouped.iter_mut().find(|(fk, _)| fk.name == m.name) {
            Some((_, pairs)) => pairs.push((m.position, m.column, m.ref_column)),
            None => grouped.push((
                ForeignKey {
                    name: m.name,
                    table: table.to_string(),
                    columns: vec![],
                    ref_namespace: m.ref_namespace,
                    ref_table: m.ref_table,
                    ref_columns: vec![],
                },
                vec![(m.position, m.column, m.ref_column)],
            )),
        }
    }
    let mut keys: Vec<ForeignKey> = grouped
        .into_iter()
        .map(|(mut fk, mut pairs)| {
            pairs.sort_by_key(|(pos, _, _)| *pos);
            for (_, local, referenced) in pairs {
                fk.columns.push(local);
                if let Some(r) = referenced {
                    fk.ref_columns.push(r);
                }
            }
            fk
        })
        .collect();
    keys.sort_by(|a, b| a.name.cmp(&b.name));
    keys
}

/// Group `(enum, label)` rows, labels in the order given
pub(crate) fn group_enums(namespace: &str, rows: Vec<(String, String)>) -> Vec<EnumType> {
    let mut enums: Vec<EnumType> = Vec::new();
    for (name, label) in rows {
        if let Some(existing) = enums.iter_mut().find(|e| e.name == name) {
            existing.labels.push(label);
        } else {
            trace!(enum_name = ?name, "Found new enum type");
            enums.push(EnumType {
                name,
                namespace: namespace.to_string(),
                labels: vec![label],
            });
        }
    }
    enums.sort_by(|a, b| a.name.cmp(&b.name));
    enums
}

/// Member row of a proc signature, before grouping
pub(crate) struct ProcMember {
    pub name: String,
    pub overload: String,
    pub kind: ProcKind,
    pub return_type: Option<String>,
    pub param: Option<(i64, CatalogProcParam)>,
}

/// Group parameter rows into procs, parameters by position, procs by
/// `(name, signature)`
pub(crate) fn group_procs(members: Vec<ProcMember>) -> Vec<CatalogProc> {
    let mut grouped: Vec<(CatalogProc, Vec<(i64, CatalogProcParam)>)> = Vec::new();
    for m in members {
        let slot = grouped
            .iter_mut()
            .position(|(p, _)| p.name == m.name && p.overload == m.overload);
        let idx = match slot {
            Some(idx) => idx,
            None => {
                grouped.push((
                    CatalogProc {
                        name: m.name,
                        kind: m.kind,
                        params: vec![],
                        return_type: m.return_type,
                        overload: m.overload,
                    },
                    vec![],
                ));
                grouped.len() - 1
            }
        };
        if let Some(param) = m.param {
            grouped[idx].1.push(param);
        }
    }
    let mut procs: Vec<CatalogProc> = grouped
        .into_iter()
        .map(|(mut proc, mut params)| {
            params.sort_by_key(|(pos, _)| *pos);
            proc.params = params.into_iter().map(|(_, p)| p).collect();
            proc
        })
        .collect();
    procs.sort_by(|a, b| {
        a.name
            .cmp(&b.name)
            .then_with(|| a.signature().cmp(&b.signature()))
            .then_with(|| a.overload.cmp(&b.overload))
    });
    procs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_include_exclude() {
        let filter = TableFilter {
            include: Some(vec!["users".to_string(), "orders".to_string()]),
            exclude: Some(vec!["orders".to_string()]),
        };
        assert!(filter.should_include("users"));
        assert!(!filter.should_include("orders"));
        assert!(!filter.should_include("products"));
        assert!(TableFilter::default().should_include("anything"));
    }

    #[test]
    fn test_row_flag_coercions() {
        let row = CatalogRow::new()
            .with("a", "YES")
            .with("b", 0i64)
            .with("c", true)
            .with("d", CatalogValue::Null);
        assert!(row.flag("a").unwrap());
        assert!(!row.flag("b").unwrap());
        assert!(row.flag("c").unwrap());
        assert!(!row.flag("d").unwrap());
        assert!(row.flag("missing").is_err());
    }

    #[test]
    fn test_row_int_from_text() {
        let row = CatalogRow::new().with("n", "42").with("bad", "x");
        assert_eq!(row.int("n").unwrap(), 42);
        assert!(row.int("bad").is_err());
    }

    #[test]
    fn test_row_ordinal_rejects_out_of_range() {
        let row = CatalogRow::new()
            .with("ok", 7i64)
            .with("negative", -1i64)
            .with("huge", i64::from(u32::MAX) + 1);
        assert_eq!(row.ordinal("ok").unwrap(), 7);
        assert!(row.ordinal("negative").unwrap_err().contains("out of range"));
        assert!(row.ordinal("huge").is_err());
    }

    #[test]
    fn test_group_indexes_sorts_members_and_names() {
        let members = vec![
            IndexMember {
                index: "b_idx".to_string(),
                column: "y".to_string(),
                position: 2,
                is_unique: false,
                is_primary: false,
            },
            IndexMember {
                index: "a_pkey".to_string(),
                column: "id".to_string(),
                position: 1,
                is_unique: false,
                is_primary: true,
            },
            IndexMember {
                index: "b_idx".to_string(),
                column: "x".to_string(),
                position: 1,
                is_unique: false,
                is_primary: false,
            },
        ];
        let indexes = group_indexes("t", members);
        assert_eq!(indexes[0].name, "a_pkey");
        assert!(indexes[0].is_unique);
        assert_eq!(indexes[1].columns, vec!["x", "y"]);
    }

    #[test]
    fn test_group_enums_keeps_label_order() {
        let rows = vec![
            ("mood".to_string(), "sad".to_string()),
            ("color".to_string(), "red".to_string()),
            ("mood".to_string(), "ok".to_string()),
            ("mood".to_string(), "happy".to_string()),
        ];
        let enums = group_enums("public", rows);
        assert_eq!(enums[0].name, "color");
        assert_eq!(enums[1].labels, vec!["sad", "ok", "happy"]);
    }

    #[test]
    fn test_group_procs_separates_overloads() {
        let param = |name: &str, ty: &str| CatalogProcParam {
            name: name.to_string(),
            mode: ParamMode::In,
            native_type: ty.to_string(),
        };
        let members = vec![
            ProcMember {
                name: "add".to_string(),
                overload: "2".to_string(),
                kind: ProcKind::Function,
                return_type: Some("text".to_string()),
                param: Some((1, param("a", "text"))),
            },
            ProcMember {
                name: "add".to_string(),
                overload: "1".to_string(),
                kind: ProcKind::Function,
                return_type: Some("integer".to_string()),
                param: Some((2, param("b", "integer"))),
            },
            ProcMember {
                name: "add".to_string(),
                overload: "1".to_string(),
                kind: ProcKind::Function,
                return_type: Some("integer".to_string()),
                param: Some((1, param("a", "integer"))),
            },
        ];
        let procs = group_procs(members);
        assert_eq!(procs.len(), 2);
        assert_eq!(procs[0].signature(), "integer,integer");
        assert_eq!(procs[1].signature(), "text");
    }

    #[test]
    fn test_cancelled_context_fails_fast() {
        let ctx = ExecContext::new();
        let child = ctx.child();
        ctx.cancel();
        assert!(matches!(child.check("public"), Err(LoaderError::Cancelled { .. })));
    }
}
