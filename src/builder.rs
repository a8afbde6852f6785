//! Schema model assembly and validation
//!
//! Catalogs and parsed query files are merged in a fixed order (namespace,
//! then entity name, then query file path), so the model never depends on the
//! order inputs were added in. Validation runs in four steps and stops at the
//! first failure: name uniqueness, foreign key targets, query parameters and
//! query result shapes.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, info};

use crate::diagnostics::{Diagnostic, DiagnosticKind, DiagnosticSink};
use crate::dialect::Dialect;
use crate::error::{AnnotationErrorKind, QueryAnnotationError, SqlweaveError, TypeMappingError, ValidationError};
use crate::introspect::{Catalog, CatalogEntry, CatalogProc};
use crate::query::infer::{infer_params, infer_result, ColumnSource, InferredShape, OutputColumn, ParamHint, Scope};
use crate::query::{ParsedFile, ParsedQuery, PlaceholderStyle};
use crate::schema::{
    to_pascal_case, Cardinality, Column, EnumType, Namespace, Proc, ProcKind, ProcParam, Query, QueryParam,
    ResultColumn, ResultShape, SchemaModel, Table, TypeDescriptor,
};
use crate::typemap::{bare_type_name, normalize, FallbackPolicy, TypeMapper};

#[derive(Debug, Clone, Copy, Default)]
pub struct BuildOptions {
    pub fallback_policy: FallbackPolicy,
}

/// The finished model and the diagnostics raised while building it
#[derive(Debug)]
pub struct BuildOutput {
    pub model: SchemaModel,
    /// In the order they were raised, which follows model order
    pub diagnostics: Vec<Diagnostic>,
}

/// Collects catalogs and parsed query files, then builds one [`SchemaModel`]
pub struct SchemaModelBuilder<'a> {
    mapper: &'a TypeMapper,
    sink: Arc<dyn DiagnosticSink>,
    options: BuildOptions,
    catalogs: Vec<Catalog>,
    query_files: Vec<(String, ParsedFile)>,
}

impl<'a> SchemaModelBuilder<'a> {
    pub fn new(mapper: &'a TypeMapper, sink: Arc<dyn DiagnosticSink>) -> Self {
        Self {
            mapper,
            sink,
            options: BuildOptions::default(),
            catalogs: Vec::new(),
            query_files: Vec::new(),
        }
    }

    pub fn with_options(mut self, options: BuildOptions) -> Self {
        self.options = options;
        self
    }

    pub fn add_catalog(&mut self, catalog: Catalog) -> &mut Self {
        self.catalogs.push(catalog);
        self
    }

    /// Attach a parsed query file to the namespace its queries run against
    pub fn add_query_file(&mut self, namespace: &str, file: ParsedFile) -> &mut Self {
        self.query_files.push((namespace.to_string(), file));
        self
    }

    pub fn build(self) -> Result<BuildOutput, SqlweaveError> {
        let SchemaModelBuilder {
            mapper,
            sink,
            options,
            mut catalogs,
            mut query_files,
        } = self;
        let mut resolver = Resolver {
            mapper,
            policy: options.fallback_policy,
            diagnostics: Vec::new(),
            deferred: None,
            deferring: true,
        };

        catalogs.sort_by(|a, b| a.namespace.cmp(&b.namespace));
        let mut namespaces = BTreeMap::new();
        for catalog in catalogs {
            if namespaces.contains_key(&catalog.namespace) {
                return Err(ValidationError::DuplicateNamespace {
                    namespace: catalog.namespace,
                }
                .into());
            }
            let namespace = assemble_namespace(&mut resolver, catalog)?;
            debug!(
                namespace = ?namespace.name,
                tables = ?namespace.tables.len(),
                enums = ?namespace.enums.len(),
                procs = ?namespace.procs.len(),
                "Assembled namespace"
            );
            namespaces.insert(namespace.name.clone(), namespace);
        }

        for namespace in namespaces.values() {
            check_unique_names(namespace)?;
        }
        resolve_foreign_keys(&mut namespaces)?;
        // catalog type failures surface only once structure has been validated
        resolver.deferring = false;
        if let Some(err) = resolver.deferred.take() {
            return Err(err.into());
        }

        query_files.sort_by(|a, b| (&a.0, &a.1.path).cmp(&(&b.0, &b.1.path)));
        let mut files_by_namespace: BTreeMap<String, Vec<ParsedFile>> = BTreeMap::new();
        for (namespace, file) in query_files {
            if !namespaces.contains_key(&namespace) {
                return Err(ValidationError::UnknownNamespace {
                    namespace,
                    file: file.path,
                }
                .into());
            }
            files_by_namespace.entry(namespace).or_default().push(file);
        }

        // parameters for every query first, then result shapes
        let mut staged: Vec<(&Namespace, &ParsedFile, &ParsedQuery, Vec<QueryParam>)> = Vec::new();
        for (name, files) in &files_by_namespace {
            let namespace = &namespaces[name];
            check_unique_queries(files)?;
            for file in files {
                for query in &file.queries {
                    let params = assemble_params(&mut resolver, namespace, query)?;
                    staged.push((namespace, file, query, params));
                }
            }
        }
        let mut queries: BTreeMap<String, Vec<Query>> = BTreeMap::new();
        for (namespace, file, query, params) in staged {
            let result = assemble_result(&mut resolver, namespace, query)?;
            queries.entry(namespace.name.clone()).or_default().push(Query {
                name: query.name.clone(),
                source: file.path.clone(),
                line: query.line,
                sql: query.sql.clone(),
                cardinality: query.cardinality,
                params,
                result,
                doc: query.doc.clone(),
            });
        }
        for (name, list) in queries {
            if let Some(namespace) = namespaces.get_mut(&name) {
                namespace.queries = list;
            }
        }

        let model = SchemaModel::from_namespaces(namespaces);
        info!(
            namespaces = ?model.namespaces().count(),
            diagnostics = ?resolver.diagnostics.len(),
            "Schema model built"
        );
        for diagnostic in &resolver.diagnostics {
            sink.report(diagnostic.clone());
        }
        Ok(BuildOutput {
            model,
            diagnostics: resolver.diagnostics,
        })
    }
}

/// Type resolution with enum detection and fallback bookkeeping
struct Resolver<'a> {
    mapper: &'a TypeMapper,
    policy: FallbackPolicy,
    diagnostics: Vec<Diagnostic>,
    /// First fallback refused while `deferring`
    deferred: Option<TypeMappingError>,
    deferring: bool,
}

impl Resolver<'_> {
    fn resolve(
        &mut self,
        dialect: Dialect,
        enums: &[EnumType],
        native: &str,
        nullable: bool,
        entity: &str,
    ) -> Result<TypeDescriptor, SqlweaveError> {
        let norm = normalize(dialect, native).ok();
        let bare = dialect.fold_identifier(&bare_type_name(native));
        let enum_type = enums.iter().find(|e| {
            let name = dialect.fold_identifier(&e.name);
            name == bare || norm.as_ref().is_some_and(|n| name == dialect.fold_identifier(&n.base))
        });
        if let Some(enum_type) = enum_type {
            return Ok(TypeDescriptor {
                target: to_pascal_case(&enum_type.name),
                import: None,
                nullable,
                array: norm.is_some_and(|n| n.array),
                fallback: false,
                enum_ref: Some(enum_type.name.clone()),
            });
        }

        let resolved = self.mapper.resolve(dialect, native, nullable);
        if let Some(err) = resolved.error {
            if self.policy == FallbackPolicy::Fail {
                if !self.deferring {
                    return Err(err.into());
                }
                self.deferred.get_or_insert(err);
                return Ok(resolved.descriptor);
            }
            self.diagnostics.push(Diagnostic::warning(
                DiagnosticKind::FallbackType,
                entity,
                err.to_string(),
            ));
        }
        Ok(resolved.descriptor)
    }

    fn info(&mut self, kind: DiagnosticKind, entity: impl Into<String>, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic::info(kind, entity, message));
    }
}

fn assemble_namespace(resolver: &mut Resolver<'_>, catalog: Catalog) -> Result<Namespace, SqlweaveError> {
    let Catalog {
        namespace,
        dialect,
        mut tables,
        mut enums,
        mut procs,
    } = catalog;
    enums.sort_by(|a, b| a.name.cmp(&b.name));
    tables.sort_by(|a, b| a.table.name.cmp(&b.table.name));
    procs.sort_by(|a, b| (&a.name, a.signature(), &a.overload).cmp(&(&b.name, b.signature(), &b.overload)));

    let mut assembled_tables = Vec::with_capacity(tables.len());
    for entry in tables {
        assembled_tables.push(assemble_table(resolver, dialect, &namespace, &enums, entry)?);
    }
    let mut assembled_procs = Vec::with_capacity(procs.len());
    for proc in procs {
        assembled_procs.push(assemble_proc(resolver, dialect, &namespace, &enums, proc)?);
    }

    Ok(Namespace {
        name: namespace,
        dialect,
        tables: assembled_tables,
        enums,
        procs: assembled_procs,
        queries: Vec::new(),
    })
}

fn assemble_table(
    resolver: &mut Resolver<'_>,
    dialect: Dialect,
    namespace: &str,
    enums: &[EnumType],
    entry: CatalogEntry,
) -> Result<Table, SqlweaveError> {
    let CatalogEntry {
        table,
        mut columns,
        mut indexes,
        mut foreign_keys,
    } = entry;
    columns.sort_by_key(|c| c.ordinal);
    indexes.sort_by(|a, b| a.name.cmp(&b.name));
    foreign_keys.sort_by(|a, b| a.name.cmp(&b.name));

    let mut assembled = Vec::with_capacity(columns.len());
    for column in columns {
        let entity = format!("{}.{}", table.name, column.name);
        let ty = resolver.resolve(dialect, enums, &column.native_type, column.is_nullable, &entity)?;
        assembled.push(Column {
            name: column.name,
            ordinal: column.ordinal,
            native_type: column.native_type,
            ty,
            is_nullable: column.is_nullable,
            default: column.default,
            is_generated: column.is_generated,
        });
    }

    Ok(Table {
        name: table.name,
        namespace: namespace.to_string(),
        kind: table.kind,
        columns: assembled,
        indexes,
        foreign_keys,
    })
}

fn assemble_proc(
    resolver: &mut Resolver<'_>,
    dialect: Dialect,
    namespace: &str,
    enums: &[EnumType],
    proc: CatalogProc,
) -> Result<Proc, SqlweaveError> {
    let signature = proc.signature();
    let mut params = Vec::with_capacity(proc.params.len());
    for param in proc.params {
        let entity = format!("{}.{}", proc.name, param.name);
        let ty = resolver.resolve(dialect, enums, &param.native_type, false, &entity)?;
        params.push(ProcParam {
            name: param.name,
            mode: param.mode,
            native_type: param.native_type,
            ty,
        });
    }
    let return_type = match proc.return_type.as_deref() {
        Some(native) if !native.eq_ignore_ascii_case("void") => {
            Some(resolver.resolve(dialect, enums, native, false, &proc.name)?)
        }
        _ => None,
    };

    Ok(Proc {
        name: proc.name,
        namespace: namespace.to_string(),
        kind: proc.kind,
        params,
        return_type,
        signature,
    })
}

fn proc_label(kind: ProcKind) -> &'static str {
    match kind {
        ProcKind::Function => "function",
        ProcKind::Procedure => "procedure",
    }
}

fn check_unique_names(namespace: &Namespace) -> Result<(), ValidationError> {
    let dialect = namespace.dialect;
    let mut seen: HashMap<String, (String, &'static str)> = HashMap::new();
    let mut claim = |name: &str, label: &'static str| -> Result<(), ValidationError> {
        let key = dialect.fold_identifier(name);
        if let Some((first_name, first)) = seen.get(&key) {
            return Err(ValidationError::DuplicateName {
                namespace: namespace.name.clone(),
                name: first_name.clone(),
                first: *first,
                second: label,
            });
        }
        seen.insert(key, (name.to_string(), label));
        Ok(())
    };

    for table in &namespace.tables {
        claim(&table.name, table.kind.label())?;
    }
    for enum_type in &namespace.enums {
        claim(&enum_type.name, "enum")?;
    }

    // overloads share a name and differ by signature
    let mut overloads: HashSet<(String, &str)> = HashSet::new();
    let mut proc_names = HashSet::new();
    for proc in &namespace.procs {
        let key = dialect.fold_identifier(&proc.name);
        if !overloads.insert((key.clone(), proc.signature.as_str())) {
            return Err(ValidationError::DuplicateName {
                namespace: namespace.name.clone(),
                name: proc.name.clone(),
                first: proc_label(proc.kind),
                second: proc_label(proc.kind),
            });
        }
        if proc_names.insert(key) {
            claim(&proc.name, proc_label(proc.kind))?;
        }
    }

    for table in &namespace.tables {
        let mut columns = HashSet::new();
        for column in &table.columns {
            if !columns.insert(dialect.fold_identifier(&column.name)) {
                return Err(ValidationError::DuplicateColumn {
                    namespace: namespace.name.clone(),
                    table: table.name.clone(),
                    column: column.name.clone(),
                });
            }
        }
    }
    Ok(())
}

fn find_namespace<'m>(
    namespaces: &'m BTreeMap<String, Namespace>,
    name: &str,
    dialect: Dialect,
) -> Option<&'m Namespace> {
    namespaces.get(name).or_else(|| {
        let key = dialect.fold_identifier(name);
        namespaces.values().find(|n| dialect.fold_identifier(&n.name) == key)
    })
}

/// Check every foreign key target and rewrite its names to the catalog's
/// spelling; an empty referenced column list means the target's primary key
fn resolve_foreign_keys(namespaces: &mut BTreeMap<String, Namespace>) -> Result<(), ValidationError> {
    let mut resolved = Vec::new();
    for (key, namespace) in namespaces.iter() {
        for (t, table) in namespace.tables.iter().enumerate() {
            for (f, fk) in table.foreign_keys.iter().enumerate() {
                let dangling = || ValidationError::DanglingForeignKey {
                    namespace: namespace.name.clone(),
                    table: table.name.clone(),
                    name: fk.name.clone(),
                    ref_namespace: fk.ref_namespace.clone(),
                    ref_table: fk.ref_table.clone(),
                };
                let target_namespace =
                    find_namespace(namespaces, &fk.ref_namespace, namespace.dialect).ok_or_else(dangling)?;
                let target = target_namespace.table(&fk.ref_table).ok_or_else(dangling)?;

                let wanted: Vec<String> = if fk.ref_columns.is_empty() {
                    target
                        .primary_key_columns()
                        .iter()
                        .map(|c| c.name.clone())
                        .collect()
                } else {
                    fk.ref_columns.clone()
                };
                if wanted.len() != fk.columns.len() || wanted.is_empty() {
                    return Err(ValidationError::ForeignKeyArity {
                        namespace: namespace.name.clone(),
                        table: table.name.clone(),
                        name: fk.name.clone(),
                        local: fk.columns.len(),
                        referenced: wanted.len(),
                    });
                }

                let dialect = target_namespace.dialect;
                let mut ref_columns = Vec::with_capacity(wanted.len());
                for name in &wanted {
                    let key = dialect.fold_identifier(name);
                    let column = target
                        .columns
                        .iter()
                        .find(|c| dialect.fold_identifier(&c.name) == key)
                        .ok_or_else(|| ValidationError::DanglingForeignKeyColumn {
                            namespace: namespace.name.clone(),
                            table: table.name.clone(),
                            name: fk.name.clone(),
                            ref_table: target.name.clone(),
                            column: name.clone(),
                        })?;
                    ref_columns.push(column.name.clone());
                }
                resolved.push((
                    key.clone(),
                    t,
                    f,
                    target_namespace.name.clone(),
                    target.name.clone(),
                    ref_columns,
                ));
            }
        }
    }

    for (key, t, f, ref_namespace, ref_table, ref_columns) in resolved {
        if let Some(fk) = namespaces
            .get_mut(&key)
            .and_then(|n| n.tables.get_mut(t))
            .and_then(|table| table.foreign_keys.get_mut(f))
        {
            fk.ref_namespace = ref_namespace;
            fk.ref_table = ref_table;
            fk.ref_columns = ref_columns;
        }
    }
    Ok(())
}

/// Query names are unique per namespace across all of its files
fn check_unique_queries(files: &[ParsedFile]) -> Result<(), QueryAnnotationError> {
    let mut seen: HashMap<&str, (&str, usize)> = HashMap::new();
    for file in files {
        for query in &file.queries {
            if let Some((first_file, first_line)) = seen.get(query.name.as_str()) {
                return Err(QueryAnnotationError {
                    file: file.path.clone(),
                    line: query.line,
                    query: Some(query.name.clone()),
                    kind: AnnotationErrorKind::DuplicateNameAcrossFiles {
                        first_file: first_file.to_string(),
                        first_line: *first_line,
                    },
                });
            }
            seen.insert(&query.name, (&file.path, query.line));
        }
    }
    Ok(())
}

fn claim_name(used: &mut HashSet<String>, name: String) -> String {
    if used.insert(name.clone()) {
        return name;
    }
    let mut n = 2;
    loop {
        let candidate = format!("{}_{}", name, n);
        if used.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}

fn scope(namespace: &Namespace) -> Scope<'_> {
    Scope {
        dialect: namespace.dialect,
        tables: &namespace.tables,
        procs: &namespace.procs,
    }
}

fn assemble_params(
    resolver: &mut Resolver<'_>,
    namespace: &Namespace,
    query: &ParsedQuery,
) -> Result<Vec<QueryParam>, SqlweaveError> {
    let dialect = namespace.dialect;
    if query.params.len() != query.placeholders.count {
        return Err(ValidationError::ParameterMismatch {
            namespace: namespace.name.clone(),
            query: query.name.clone(),
            declared: query.params.len(),
            found: query.placeholders.count,
        }
        .into());
    }

    let names: Vec<String> = match query.placeholders.style {
        Some(PlaceholderStyle::Named) => query.params.iter().map(|p| p.name.clone()).collect(),
        _ => Vec::new(),
    };
    let hints = infer_params(&query.sql, &scope(namespace), query.params.len(), &names);
    if hints.len() != query.params.len() {
        return Err(ValidationError::ParameterMismatch {
            namespace: namespace.name.clone(),
            query: query.name.clone(),
            declared: query.params.len(),
            found: hints.len(),
        }
        .into());
    }

    let mut used = HashSet::new();
    let mut params = Vec::with_capacity(query.params.len());
    for (i, (spec, hint)) in query.params.iter().zip(hints).enumerate() {
        let index = i + 1;
        let entity = format!("{}.{}", query.name, spec.name);
        let inferred_name = |name: &str| {
            if spec.explicit_name {
                spec.name.clone()
            } else {
                name.to_string()
            }
        };
        let (name, native_type, ty) = match (&spec.native_type, hint) {
            (Some(native), _) => (
                spec.name.clone(),
                Some(native.clone()),
                resolver.resolve(dialect, &namespace.enums, native, false, &entity)?,
            ),
            (None, Some(ParamHint::Column(column))) => (
                inferred_name(&column.name),
                Some(column.native_type.clone()),
                column.ty.clone().with_nullable(false),
            ),
            (None, Some(ParamHint::Integer(what))) => {
                let native = dialect.integer_type();
                (
                    inferred_name(what),
                    Some(native.to_string()),
                    resolver.resolve(dialect, &namespace.enums, native, false, &entity)?,
                )
            }
            (None, None) => {
                resolver.info(
                    DiagnosticKind::Other,
                    entity,
                    format!("type of parameter {} could not be inferred", index),
                );
                (spec.name.clone(), None, resolver.mapper.untyped(dialect, false))
            }
        };
        params.push(QueryParam {
            name: claim_name(&mut used, name),
            index,
            native_type,
            ty,
        });
    }
    Ok(params)
}

fn assemble_result(
    resolver: &mut Resolver<'_>,
    namespace: &Namespace,
    query: &ParsedQuery,
) -> Result<ResultShape, SqlweaveError> {
    if !query.cardinality.returns_rows() {
        return Ok(ResultShape::None);
    }
    let dialect = namespace.dialect;

    let shape = match &query.returns {
        Some(entity) => {
            let key = dialect.fold_identifier(entity);
            if let Some(table) = namespace.table(entity) {
                ResultShape::Table(table.name.clone())
            } else if let Some(proc) = namespace
                .procs
                .iter()
                .find(|p| dialect.fold_identifier(&p.name) == key)
            {
                ResultShape::Proc(proc.name.clone())
            } else {
                return Err(ValidationError::UnknownResultType {
                    namespace: namespace.name.clone(),
                    query: query.name.clone(),
                    entity: entity.clone(),
                }
                .into());
            }
        }
        None => match infer_result(&query.sql, &scope(namespace)) {
            InferredShape::Table(name) => ResultShape::Table(name),
            InferredShape::Proc(name) => ResultShape::Proc(name),
            InferredShape::Columns(columns) => {
                ResultShape::Inferred(result_columns(resolver, namespace, query, columns)?)
            }
            InferredShape::Unknown => {
                resolver.diagnostics.push(Diagnostic::warning(
                    DiagnosticKind::Other,
                    query.name.clone(),
                    "result shape could not be inferred",
                ));
                let columns = if query.cardinality == Cardinality::Scalar {
                    vec![ResultColumn {
                        name: "column1".to_string(),
                        ty: resolver.mapper.untyped(dialect, false),
                        positional: true,
                    }]
                } else {
                    Vec::new()
                };
                ResultShape::Inferred(columns)
            }
        },
    };

    if query.cardinality == Cardinality::Scalar {
        let columns = match &shape {
            ResultShape::None => 0,
            ResultShape::Table(name) => namespace.table(name).map_or(0, |t| t.columns.len()),
            ResultShape::Proc(name) => namespace
                .procs
                .iter()
                .find(|p| &p.name == name)
                .map_or(0, |p| match p.outputs().count() {
                    0 => usize::from(p.return_type.is_some()),
                    n => n,
                }),
            ResultShape::Inferred(columns) => columns.len(),
        };
        if columns != 1 {
            return Err(ValidationError::ScalarShape {
                namespace: namespace.name.clone(),
                query: query.name.clone(),
                columns,
            }
            .into());
        }
    }
    Ok(shape)
}

fn result_columns(
    resolver: &mut Resolver<'_>,
    namespace: &Namespace,
    query: &ParsedQuery,
    columns: Vec<OutputColumn<'_>>,
) -> Result<Vec<ResultColumn>, SqlweaveError> {
    let mut used = HashSet::new();
    let mut out = Vec::with_capacity(columns.len());
    for (i, column) in columns.into_iter().enumerate() {
        let position = i + 1;
        let (name, positional) = match column.name {
            Some(name) => (name, false),
            None => {
                let name = format!("column{}", position);
                resolver.info(
                    DiagnosticKind::UnnamedColumn,
                    query.name.clone(),
                    format!("result column {} has no name, using '{}'", position, name),
                );
                (name, true)
            }
        };
        let entity = format!("{}.{}", query.name, name);
        let ty = match column.source {
            ColumnSource::Column { column, nullable } => column.ty.clone().with_nullable(nullable),
            ColumnSource::Native { native_type, nullable } => {
                resolver.resolve(namespace.dialect, &namespace.enums, &native_type, nullable, &entity)?
            }
            ColumnSource::Unknown => resolver.mapper.untyped(namespace.dialect, false),
        };
        out.push(ResultColumn {
            name: claim_name(&mut used, name),
            ty,
            positional,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::{Diagnostics, NullSink, Severity};
    use crate::introspect::{CatalogColumn, CatalogProcParam, CatalogTable};
    use crate::query::parse_query_file;
    use crate::schema::{ForeignKey, Index, ParamMode, TableKind};
    use pretty_assertions::assert_eq;

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

    fn fk(table: &str, column: &str, ref_table: &str, ref_columns: &[&str]) -> ForeignKey {
        ForeignKey {
            name: format!("{}_{}_fkey", table, column),
            table: table.to_string(),
            columns: vec![column.to_string()],
            ref_namespace: "public".to_string(),
            ref_table: ref_table.to_string(),
            ref_columns: ref_columns.iter().map(|c| c.to_string()).collect(),
        }
    }

    fn shop(dialect: Dialect) -> Catalog {
        let mut orders = entry(
            "orders",
            vec![
                column("order_id", 1, "integer", false),
                column("product_id", 2, "integer", false),
                column("status", 3, "order_status", false),
            ],
        );
        orders.foreign_keys.push(fk("orders", "product_id", "products", &["product_id"]));
        Catalog {
            namespace: "public".to_string(),
            dialect,
            tables: vec![
                orders,
                entry(
                    "products",
                    vec![
                        column("product_id", 1, "integer", false),
                        column("location", 3, "point", true),
                        column("product_name", 2, "varchar", false),
                    ],
                ),
            ],
            enums: vec![EnumType {
                name: "order_status".to_string(),
                namespace: "public".to_string(),
                labels: vec!["pending".to_string(), "shipped".to_string()],
            }],
            procs: vec![],
        }
    }

    fn queries(text: &str) -> ParsedFile {
        ParsedFile {
            path: "queries.sql".to_string(),
            queries: parse_query_file("queries.sql", text, Dialect::Postgres).unwrap(),
        }
    }

    fn build(catalogs: Vec<Catalog>, files: Vec<ParsedFile>) -> Result<BuildOutput, SqlweaveError> {
        let mapper = TypeMapper::builtin();
        let mut builder = SchemaModelBuilder::new(&mapper, Arc::new(NullSink));
        for catalog in catalogs {
            builder.add_catalog(catalog);
        }
        for file in files {
            builder.add_query_file("public", file);
        }
        builder.build()
    }

    #[test]
    fn test_columns_sorted_by_ordinal_and_fallback_reported() {
        let output = build(vec![shop(Dialect::Postgres)], vec![]).unwrap();
        let ns = output.model.namespace("public").unwrap();
        let names: Vec<_> = ns.tables.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["orders", "products"]);

        let products = ns.table("products").unwrap();
        let columns: Vec<_> = products.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(columns, vec!["product_id", "product_name", "location"]);
        assert!(products.columns[2].ty.fallback);

        assert_eq!(output.diagnostics.len(), 1);
        let diagnostic = &output.diagnostics[0];
        assert_eq!(diagnostic.severity, Severity::Warning);
        assert_eq!(diagnostic.entity, "products.location");
        assert_eq!(diagnostic.message, "unmapped type: point");
    }

    #[test]
    fn test_enum_columns_refer_to_model_enum() {
        let output = build(vec![shop(Dialect::Postgres)], vec![]).unwrap();
        let orders = output.model.namespace("public").unwrap().table("orders").unwrap();
        let status = &orders.columns[2].ty;
        assert_eq!(status.enum_ref.as_deref(), Some("order_status"));
        assert_eq!(status.target, "OrderStatus");
        assert!(!status.fallback);
    }

    #[test]
    fn test_fail_policy_rejects_fallback() {
        let mapper = TypeMapper::builtin();
        let mut builder = SchemaModelBuilder::new(&mapper, Arc::new(NullSink)).with_options(BuildOptions {
            fallback_policy: FallbackPolicy::Fail,
        });
        builder.add_catalog(shop(Dialect::Postgres));
        assert!(matches!(builder.build(), Err(SqlweaveError::TypeMapping(_))));
    }

    #[test]
    fn test_fail_policy_reports_structure_errors_first() {
        let build_failing = |catalog: Catalog| {
            let mapper = TypeMapper::builtin();
            let mut builder = SchemaModelBuilder::new(&mapper, Arc::new(NullSink)).with_options(BuildOptions {
                fallback_policy: FallbackPolicy::Fail,
            });
            builder.add_catalog(catalog);
            builder.build()
        };

        let mut catalog = shop(Dialect::Postgres);
        catalog.tables[0]
            .foreign_keys
            .push(fk("orders", "order_id", "orders_archive", &["id"]));
        assert!(matches!(
            build_failing(catalog),
            Err(SqlweaveError::Validation(ValidationError::DanglingForeignKey { .. }))
        ));

        let mut catalog = shop(Dialect::Postgres);
        catalog
            .tables
            .push(entry("order_status", vec![column("id", 1, "integer", false)]));
        assert!(matches!(
            build_failing(catalog),
            Err(SqlweaveError::Validation(ValidationError::DuplicateName { .. }))
        ));
    }

    #[test]
    fn test_diagnostics_forwarded_to_sink() {
        let mapper = TypeMapper::builtin();
        let sink = Diagnostics::new();
        let mut builder = SchemaModelBuilder::new(&mapper, sink.clone());
        builder.add_catalog(shop(Dialect::Postgres));
        builder.build().unwrap();
        assert_eq!(sink.count(DiagnosticKind::FallbackType), 1);
    }

    #[test]
    fn test_name_uniqueness_follows_dialect_case_rules() {
        let mut catalog = shop(Dialect::Sqlite);
        catalog
            .tables
            .push(entry("Orders", vec![column("id", 1, "integer", false)]));
        let err = build(vec![catalog], vec![]).unwrap_err();
        assert!(matches!(
            err,
            SqlweaveError::Validation(ValidationError::DuplicateName { first: "table", .. })
        ));

        let mut catalog = shop(Dialect::Postgres);
        catalog
            .tables
            .push(entry("Orders", vec![column("id", 1, "integer", false)]));
        assert!(build(vec![catalog], vec![]).is_ok());
    }

    #[test]
    fn test_enum_and_table_share_namespace() {
        let mut catalog = shop(Dialect::Postgres);
        catalog
            .tables
            .push(entry("order_status", vec![column("id", 1, "integer", false)]));
        let err = build(vec![catalog], vec![]).unwrap_err();
        assert!(matches!(
            err,
            SqlweaveError::Validation(ValidationError::DuplicateName {
                first: "table",
                second: "enum",
                ..
            })
        ));
    }

    #[test]
    fn test_proc_overloads_are_distinct() {
        let proc = |overload: &str, native_type: &str| CatalogProc {
            name: "total".to_string(),
            kind: ProcKind::Function,
            params: vec![CatalogProcParam {
                name: "x".to_string(),
                mode: ParamMode::In,
                native_type: native_type.to_string(),
            }],
            return_type: Some("integer".to_string()),
            overload: overload.to_string(),
        };
        let mut catalog = shop(Dialect::Postgres);
        catalog.procs = vec![proc("2", "text"), proc("1", "integer")];
        let output = build(vec![catalog], vec![]).unwrap();
        let ns = output.model.namespace("public").unwrap();
        assert_eq!(ns.procs.len(), 2);
        assert_eq!(ns.procs[0].signature, "integer");

        let mut catalog = shop(Dialect::Postgres);
        catalog.procs = vec![proc("1", "integer"), proc("2", "integer")];
        assert!(build(vec![catalog], vec![]).is_err());
    }

    #[test]
    fn test_dangling_foreign_key_table() {
        let mut catalog = shop(Dialect::Postgres);
        catalog.tables[0]
            .foreign_keys
            .push(fk("orders", "order_id", "orders_archive", &["id"]));
        let err = build(vec![catalog], vec![]).unwrap_err();
        match err {
            SqlweaveError::Validation(ValidationError::DanglingForeignKey { ref_table, .. }) => {
                assert_eq!(ref_table, "orders_archive")
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_dangling_foreign_key_column_and_arity() {
        let mut catalog = shop(Dialect::Postgres);
        catalog.tables[0].foreign_keys[0].ref_columns = vec!["sku".to_string()];
        assert!(matches!(
            build(vec![catalog], vec![]),
            Err(SqlweaveError::Validation(ValidationError::DanglingForeignKeyColumn { .. }))
        ));

        let mut catalog = shop(Dialect::Postgres);
        catalog.tables[0].foreign_keys[0].ref_columns = vec!["product_id".to_string(), "product_name".to_string()];
        assert!(matches!(
            build(vec![catalog], vec![]),
            Err(SqlweaveError::Validation(ValidationError::ForeignKeyArity {
                local: 1,
                referenced: 2,
                ..
            }))
        ));
    }

    #[test]
    fn test_implicit_foreign_key_target_is_primary_key() {
        let mut catalog = shop(Dialect::Sqlite);
        catalog.tables[0].foreign_keys[0].ref_columns = vec![];
        catalog.tables[0].foreign_keys[0].ref_table = "PRODUCTS".to_string();
        let output = build(vec![catalog], vec![]).unwrap();
        let orders = output.model.namespace("public").unwrap().table("orders").unwrap();
        assert_eq!(orders.foreign_keys[0].ref_table, "products");
        assert_eq!(orders.foreign_keys[0].ref_columns, vec!["product_id".to_string()]);
    }

    #[test]
    fn test_declared_query_parameters() {
        let file = queries(
            "-- name: ProductByID :one\n-- param: id int\nSELECT * FROM products WHERE product_id = $1\n",
        );
        let output = build(vec![shop(Dialect::Postgres)], vec![file]).unwrap();
        let query = output.model.namespace("public").unwrap().query("ProductByID").unwrap();
        assert_eq!(query.cardinality, Cardinality::One);
        assert_eq!(query.params.len(), 1);
        assert_eq!(query.params[0].name, "id");
        assert_eq!(query.params[0].ty.target, "int");
        assert_eq!(query.result, ResultShape::Table("products".to_string()));
    }

    #[test]
    fn test_inferred_parameter_names_and_types() {
        let file = queries(
            "-- name: OrdersFor :many\nSELECT order_id, status FROM orders WHERE product_id = $1 AND order_id > $2 LIMIT $3\n",
        );
        let output = build(vec![shop(Dialect::Postgres)], vec![file]).unwrap();
        let query = output.model.namespace("public").unwrap().query("OrdersFor").unwrap();
        let names: Vec<_> = query.params.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["product_id", "order_id", "limit"]);
        assert_eq!(query.params[2].native_type.as_deref(), Some("bigint"));

        let ResultShape::Inferred(columns) = &query.result else {
            panic!("expected inferred shape, got {:?}", query.result);
        };
        assert_eq!(columns[0].name, "order_id");
        assert_eq!(columns[1].ty.enum_ref.as_deref(), Some("order_status"));
    }

    #[test]
    fn test_unnamed_columns_are_positional() {
        let file = queries("-- name: Stats :one\nSELECT count(*), 1 + 1 FROM orders\n");
        let output = build(vec![shop(Dialect::Postgres)], vec![file]).unwrap();
        let query = output.model.namespace("public").unwrap().query("Stats").unwrap();
        let ResultShape::Inferred(columns) = &query.result else {
            panic!("expected inferred shape, got {:?}", query.result);
        };
        assert_eq!(columns[1].name, "column2");
        assert!(columns[1].positional);
        assert!(output
            .diagnostics
            .iter()
            .any(|d| d.kind == DiagnosticKind::UnnamedColumn && d.entity == "Stats"));
    }

    #[test]
    fn test_scalar_needs_one_column() {
        let file = queries("-- name: Both :scalar\nSELECT order_id, product_id FROM orders\n");
        assert!(matches!(
            build(vec![shop(Dialect::Postgres)], vec![file]),
            Err(SqlweaveError::Validation(ValidationError::ScalarShape { columns: 2, .. }))
        ));
    }

    #[test]
    fn test_unknown_returns_entity() {
        let file = queries("-- name: Odd :one\n-- returns: invoices\nSELECT 1\n");
        assert!(matches!(
            build(vec![shop(Dialect::Postgres)], vec![file]),
            Err(SqlweaveError::Validation(ValidationError::UnknownResultType { .. }))
        ));
    }

    #[test]
    fn test_duplicate_query_across_files() {
        let mut a = queries("-- name: Ping :exec\nDELETE FROM orders\n");
        let mut b = queries("-- name: Ping :exec\nDELETE FROM products\n");
        a.path = "a.sql".to_string();
        b.path = "b.sql".to_string();
        match build(vec![shop(Dialect::Postgres)], vec![b, a]) {
            Err(SqlweaveError::Annotation(err)) => {
                assert_eq!(err.file, "b.sql");
                assert_eq!(err.line, 1);
                assert_eq!(err.query.as_deref(), Some("Ping"));
                assert_eq!(
                    err.kind,
                    AnnotationErrorKind::DuplicateNameAcrossFiles {
                        first_file: "a.sql".to_string(),
                        first_line: 1,
                    }
                );
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_namespace_and_duplicate_catalog() {
        let mapper = TypeMapper::builtin();
        let mut builder = SchemaModelBuilder::new(&mapper, Arc::new(NullSink));
        builder
            .add_catalog(shop(Dialect::Postgres))
            .add_query_file("sales", queries("-- name: Ping :exec\nSELECT 1\n"));
        assert!(matches!(
            builder.build(),
            Err(SqlweaveError::Validation(ValidationError::UnknownNamespace { .. }))
        ));

        assert!(matches!(
            build(vec![shop(Dialect::Postgres), shop(Dialect::Postgres)], vec![]),
            Err(SqlweaveError::Validation(ValidationError::DuplicateNamespace { .. }))
        ));
    }

    #[test]
    fn test_merge_is_independent_of_input_order() {
        let forward = build(vec![shop(Dialect::Postgres)], vec![]).unwrap();
        let mut reversed = shop(Dialect::Postgres);
        reversed.tables.reverse();
        for entry in &mut reversed.tables {
            entry.columns.reverse();
        }
        let backward = build(vec![reversed], vec![]).unwrap();
        assert_eq!(forward.model, backward.model);
        assert_eq!(forward.diagnostics, backward.diagnostics);
    }
}
