//! Template-driven code emission
//!
//! An [`Emitter`] turns an immutable [`SchemaModel`] into a map of output file
//! identifier to bytes. Each entity is rendered on its own, in parallel when
//! called inside a rayon pool, and fragments are then gathered into files in
//! model order. Nothing here touches the filesystem or the catalog.

pub mod python;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use minijinja::{context, Environment, Value};
use rayon::prelude::*;
use tracing::{debug, info};

use crate::diagnostics::{Diagnostic, DiagnosticKind, DiagnosticSink};
use crate::dialect::Dialect;
use crate::error::{SqlweaveError, TemplateError};
use crate::query::uses_named_placeholders;
use crate::schema::{
    to_pascal_case, Cardinality, Column, EnumType, Namespace, Proc, ProcKind, Query, ResultShape, SchemaModel,
    Table, TableKind, TypeDescriptor,
};

pub use python::python_templates;

/// Rendered output: file identifier → contents
pub type GeneratedFiles = BTreeMap<String, Vec<u8>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityKind {
    Table,
    Enum,
    Proc,
    Query,
}

impl EntityKind {
    /// Rendering order within a namespace
    pub const ALL: [EntityKind; 4] = [EntityKind::Enum, EntityKind::Table, EntityKind::Proc, EntityKind::Query];

    pub fn label(self) -> &'static str {
        match self {
            EntityKind::Table => "table",
            EntityKind::Enum => "enum",
            EntityKind::Proc => "proc",
            EntityKind::Query => "query",
        }
    }

    fn template_names(self) -> (&'static str, &'static str, &'static str) {
        match self {
            EntityKind::Table => ("table", "table.wrapper", "table.file"),
            EntityKind::Enum => ("enum", "enum.wrapper", "enum.file"),
            EntityKind::Proc => ("proc", "proc.wrapper", "proc.file"),
            EntityKind::Query => ("query", "query.wrapper", "query.file"),
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// How many entities share one output file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Granularity {
    /// One file per entity; two entities mapping to one file is a collision
    #[default]
    PerEntity,
    /// All entities of the kind in a namespace are gathered into one file
    PerNamespace,
}

/// What a failing hook or template does to the run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TemplatePolicy {
    #[default]
    Abort,
    /// Drop the entity, report a diagnostic and continue
    Skip,
}

/// Templates for one entity kind
#[derive(Debug, Clone)]
pub struct KindTemplates {
    /// Renders one entity, given `namespace`, `dialect` and `entity`
    pub fragment: String,
    /// Renders a whole file, given `namespace`, `imports`, `fragments` and `body`
    pub wrapper: Option<String>,
    /// Renders the output file identifier, given `namespace`, `kind` and `name`
    pub file_id: String,
    pub granularity: Granularity,
}

impl KindTemplates {
    pub fn new(fragment: impl Into<String>, file_id: impl Into<String>, granularity: Granularity) -> Self {
        Self {
            fragment: fragment.into(),
            wrapper: None,
            file_id: file_id.into(),
            granularity,
        }
    }

    pub fn with_wrapper(mut self, wrapper: impl Into<String>) -> Self {
        self.wrapper = Some(wrapper.into());
        self
    }
}

/// Per-namespace index file, e.g. a package `__init__`
#[derive(Debug, Clone)]
pub struct PackageTemplate {
    /// Given `namespace` and `modules`
    pub source: String,
    pub file_id: String,
}

/// How the target language spells composite types and local imports
#[derive(Debug, Clone)]
pub struct TypeSyntax {
    /// Array of `{}`
    pub array: String,
    /// Nullable `{}`
    pub nullable: String,
    /// Import of `{name}` from the generated module `{module}`
    pub local_import: Option<String>,
    /// Identifiers that need a trailing `_` when used as names
    pub reserved: Vec<String>,
}

impl TypeSyntax {
    /// The element type with array-ness applied and nullability ignored
    pub fn base(&self, ty: &TypeDescriptor) -> String {
        if ty.array {
            self.array.replace("{}", &ty.target)
        } else {
            ty.target.clone()
        }
    }

    pub fn spell(&self, ty: &TypeDescriptor) -> String {
        let base = self.base(ty);
        if ty.nullable {
            self.nullable.replace("{}", &base)
        } else {
            base
        }
    }

    pub fn escape(&self, name: &str) -> String {
        if self.reserved.iter().any(|r| r == name) {
            format!("{}_", name)
        } else {
            name.to_string()
        }
    }

    fn import(&self, module: &str, name: &str) -> Option<String> {
        self.local_import
            .as_ref()
            .map(|t| t.replace("{module}", module).replace("{name}", name))
    }
}

/// A named collection of templates for one target language
#[derive(Debug, Clone)]
pub struct TemplateSet {
    pub name: String,
    pub syntax: TypeSyntax,
    pub tables: Option<KindTemplates>,
    pub enums: Option<KindTemplates>,
    pub procs: Option<KindTemplates>,
    pub queries: Option<KindTemplates>,
    pub package: Option<PackageTemplate>,
}

impl TemplateSet {
    pub fn kind(&self, kind: EntityKind) -> Option<&KindTemplates> {
        match kind {
            EntityKind::Table => self.tables.as_ref(),
            EntityKind::Enum => self.enums.as_ref(),
            EntityKind::Proc => self.procs.as_ref(),
            EntityKind::Query => self.queries.as_ref(),
        }
    }
}

/// An owned copy of one model entity, as handed to hooks
#[derive(Debug, Clone, PartialEq)]
pub enum Entity {
    Table(Table),
    Enum(EnumType),
    Proc(Proc),
    Query(Query),
}

impl Entity {
    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::Table(_) => EntityKind::Table,
            Entity::Enum(_) => EntityKind::Enum,
            Entity::Proc(_) => EntityKind::Proc,
            Entity::Query(_) => EntityKind::Query,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Entity::Table(t) => &t.name,
            Entity::Enum(e) => &e.name,
            Entity::Proc(p) => &p.name,
            Entity::Query(q) => &q.name,
        }
    }
}

/// Caller-supplied transformation around each entity's rendering
///
/// Hooks only ever see copies; the model itself is never changed.
pub trait EntityHook: Send + Sync {
    /// Rewrite the entity, or return `None` to suppress it
    fn before(&self, entity: Entity) -> Result<Option<Entity>, TemplateError> {
        Ok(Some(entity))
    }

    /// Rewrite the rendered fragment
    fn after(&self, _entity: &Entity, rendered: String) -> Result<String, TemplateError> {
        Ok(rendered)
    }
}

/// One rendered entity waiting to be placed in a file
#[derive(Debug)]
struct Fragment {
    namespace: String,
    kind: EntityKind,
    label: String,
    file: String,
    text: String,
    imports: BTreeSet<String>,
    exports: Vec<String>,
}

#[derive(Debug)]
struct PendingFile {
    namespace: String,
    kind: EntityKind,
    owner: String,
    fragments: Vec<String>,
    imports: BTreeSet<String>,
    exports: Vec<String>,
}

pub struct Emitter<'s> {
    set: &'s TemplateSet,
    env: Environment<'s>,
    hooks: Vec<Arc<dyn EntityHook>>,
    policy: TemplatePolicy,
    sink: Arc<dyn DiagnosticSink>,
}

impl<'s> Emitter<'s> {
    /// Compile every template in `set`; a syntax error fails here, not mid-run
    pub fn new(set: &'s TemplateSet, sink: Arc<dyn DiagnosticSink>) -> Result<Self, SqlweaveError> {
        let mut env = Environment::new();
        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);
        env.set_keep_trailing_newline(true);

        let compile_error = |name: &str, e: minijinja::Error| TemplateError {
            entity: format!("{}/{}", set.name, name),
            message: format!("template error: {}", e),
        };
        for kind in EntityKind::ALL {
            let Some(templates) = set.kind(kind) else {
                continue;
            };
            let (fragment, wrapper, file) = kind.template_names();
            env.add_template(fragment, &templates.fragment)
                .map_err(|e| compile_error(fragment, e))?;
            env.add_template(file, &templates.file_id)
                .map_err(|e| compile_error(file, e))?;
            if let Some(source) = &templates.wrapper {
                env.add_template(wrapper, source)
                    .map_err(|e| compile_error(wrapper, e))?;
            }
        }
        if let Some(package) = &set.package {
            env.add_template("package", &package.source)
                .map_err(|e| compile_error("package", e))?;
            env.add_template("package.file", &package.file_id)
                .map_err(|e| compile_error("package.file", e))?;
        }

        Ok(Self {
            set,
            env,
            hooks: Vec::new(),
            policy: TemplatePolicy::default(),
            sink,
        })
    }

    pub fn with_hook(mut self, hook: Arc<dyn EntityHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn with_policy(mut self, policy: TemplatePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn emit(&self, model: &SchemaModel) -> Result<GeneratedFiles, SqlweaveError> {
        info!(templates = ?self.set.name, "Rendering model");

        let mut units: Vec<(&Namespace, Entity)> = Vec::new();
        for namespace in model.namespaces() {
            for kind in EntityKind::ALL {
                if self.set.kind(kind).is_some() {
                    units.extend(entities(namespace, kind).into_iter().map(|e| (namespace, e)));
                }
            }
        }
        debug!(entities = ?units.len(), "Collected entities");

        let rendered: Vec<Result<Option<Fragment>, TemplateError>> = units
            .into_par_iter()
            .map(|(namespace, entity)| self.render_entity(namespace, entity))
            .collect();

        let mut pending: BTreeMap<String, PendingFile> = BTreeMap::new();
        for result in rendered {
            let fragment = match result {
                Ok(Some(fragment)) => fragment,
                Ok(None) => continue,
                Err(e) => {
                    self.skip_or_abort(e)?;
                    continue;
                }
            };
            let granularity = self
                .set
                .kind(fragment.kind)
                .map(|t| t.granularity)
                .unwrap_or_default();
            match pending.get_mut(&fragment.file) {
                Some(file)
                    if file.kind == fragment.kind
                        && file.namespace == fragment.namespace
                        && granularity == Granularity::PerNamespace =>
                {
                    file.fragments.push(fragment.text);
                    file.imports.extend(fragment.imports);
                    file.exports.extend(fragment.exports);
                }
                Some(file) => {
                    return Err(SqlweaveError::OutputCollision {
                        file: fragment.file,
                        first: file.owner.clone(),
                        second: fragment.label,
                    });
                }
                None => {
                    pending.insert(
                        fragment.file,
                        PendingFile {
                            namespace: fragment.namespace,
                            kind: fragment.kind,
                            owner: fragment.label,
                            fragments: vec![fragment.text],
                            imports: fragment.imports,
                            exports: fragment.exports,
                        },
                    );
                }
            }
        }

        let mut files: BTreeMap<String, String> = BTreeMap::new();
        let mut modules: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        for (file, content) in pending {
            let body = match self.wrap(&file, &content) {
                Ok(body) => body,
                Err(e) => {
                    self.skip_or_abort(e)?;
                    continue;
                }
            };
            modules.entry(content.namespace.clone()).or_default().push(context! {
                file => &file,
                module => module_path(&content.namespace, &file),
                kind => content.kind.label(),
                exports => &content.exports,
            });
            files.insert(file, body);
        }

        if self.set.package.is_some() {
            for (namespace, modules) in modules {
                let (file, body) = self.render_package(&namespace, modules)?;
                if files.contains_key(&file) {
                    return Err(SqlweaveError::OutputCollision {
                        second: format!("package '{}'", namespace),
                        first: format!("a generated module of '{}'", namespace),
                        file,
                    });
                }
                files.insert(file, body);
            }
        }

        info!(files = ?files.len(), "Rendering complete");
        Ok(files.into_iter().map(|(k, v)| (k, v.into_bytes())).collect())
    }

    fn skip_or_abort(&self, err: TemplateError) -> Result<(), SqlweaveError> {
        match self.policy {
            TemplatePolicy::Abort => Err(err.into()),
            TemplatePolicy::Skip => {
                self.sink.report(Diagnostic::warning(
                    DiagnosticKind::SkippedEntity,
                    err.entity,
                    format!("skipped: {}", err.message),
                ));
                Ok(())
            }
        }
    }

    fn render(&self, template: &str, ctx: Value, entity: &str) -> Result<String, TemplateError> {
        self.env
            .get_template(template)
            .and_then(|t| t.render(ctx))
            .map_err(|e| TemplateError {
                entity: entity.to_string(),
                message: format!("render error: {}", e),
            })
    }

    fn file_id(&self, namespace: &str, kind: EntityKind, name: &str) -> Result<String, TemplateError> {
        let (_, _, file) = kind.template_names();
        let ctx = context! { namespace => namespace, kind => kind.label(), name => name };
        let id = self.render(file, ctx, &format!("{}.{}", namespace, name))?;
        Ok(id.trim().to_string())
    }

    fn render_entity(&self, namespace: &Namespace, entity: Entity) -> Result<Option<Fragment>, TemplateError> {
        let id = format!("{}.{}", namespace.name, entity.name());
        let mut entity = entity;
        for hook in &self.hooks {
            match hook.before(entity)? {
                Some(next) => entity = next,
                None => {
                    debug!(entity = ?id, "Entity suppressed by hook");
                    return Ok(None);
                }
            }
        }
        let kind = entity.kind();
        if self.set.kind(kind).is_none() {
            return Ok(None);
        }

        let file = self.file_id(&namespace.name, kind, entity.name())?;
        let mut scope = ContextScope {
            emitter: self,
            namespace,
            file: &file,
            imports: BTreeSet::new(),
        };
        let (value, exports) = match &entity {
            Entity::Table(table) => scope.table(table),
            Entity::Enum(enum_type) => scope.enum_type(enum_type),
            Entity::Proc(proc) => scope.proc(proc),
            Entity::Query(query) => scope.query(query),
        };
        let imports = scope.imports;

        let (fragment, _, _) = kind.template_names();
        let ctx = context! {
            namespace => &namespace.name,
            dialect => namespace.dialect.name(),
            entity => value,
        };
        let mut text = self.render(fragment, ctx, &id)?;
        for hook in &self.hooks {
            text = hook.after(&entity, text)?;
        }
        debug!(entity = ?id, file = ?file, "Rendered entity");

        Ok(Some(Fragment {
            namespace: namespace.name.clone(),
            kind,
            label: format!("{} '{}'", kind, id),
            file,
            text,
            imports,
            exports,
        }))
    }

    fn wrap(&self, file: &str, content: &PendingFile) -> Result<String, TemplateError> {
        let body = content.fragments.join("\n\n");
        let has_wrapper = self
            .set
            .kind(content.kind)
            .is_some_and(|t| t.wrapper.is_some());
        if !has_wrapper {
            return Ok(body);
        }
        let (_, wrapper, _) = content.kind.template_names();
        let ctx = context! {
            namespace => &content.namespace,
            kind => content.kind.label(),
            imports => content.imports.iter().collect::<Vec<_>>(),
            fragments => &content.fragments,
            body => body,
            exports => &content.exports,
        };
        self.render(wrapper, ctx, file)
    }

    fn render_package(&self, namespace: &str, modules: Vec<Value>) -> Result<(String, String), SqlweaveError> {
        let file = self
            .render("package.file", context! { namespace => namespace }, namespace)?
            .trim()
            .to_string();
        let body = self.render(
            "package",
            context! { namespace => namespace, modules => modules },
            &file,
        )?;
        Ok((file, body))
    }
}

/// Entities of one kind in model order
fn entities(namespace: &Namespace, kind: EntityKind) -> Vec<Entity> {
    match kind {
        EntityKind::Table => namespace.tables.iter().cloned().map(Entity::Table).collect(),
        EntityKind::Enum => namespace.enums.iter().cloned().map(Entity::Enum).collect(),
        EntityKind::Proc => namespace.procs.iter().cloned().map(Entity::Proc).collect(),
        EntityKind::Query => namespace.queries.iter().cloned().map(Entity::Query).collect(),
    }
}

/// `public/orders.py` in namespace `public` → `orders`
fn module_path(namespace: &str, file: &str) -> String {
    let relative = file
        .strip_prefix(namespace)
        .and_then(|f| f.strip_prefix('/'))
        .unwrap_or(file);
    let stem = match relative.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => relative,
    };
    stem.replace('/', ".")
}

/// `ProductByID` → `product_by_id`
pub fn to_snake_case(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(s.len() + 4);
    for (i, &c) in chars.iter().enumerate() {
        if c.is_uppercase() {
            let prev = i.checked_sub(1).map(|p| chars[p]);
            let next = chars.get(i + 1);
            let boundary = prev.is_some_and(|p| p.is_lowercase() || p.is_ascii_digit())
                || (prev.is_some_and(char::is_uppercase) && next.is_some_and(|n| n.is_lowercase()));
            if boundary && !out.ends_with('_') {
                out.push('_');
            }
            out.extend(c.to_lowercase());
        } else if c.is_alphanumeric() {
            out.push(c);
        } else if !out.is_empty() && !out.ends_with('_') {
            out.push('_');
        }
    }
    out.trim_end_matches('_').to_string()
}

/// Enum label → constant member name, e.g. `in progress` → `IN_PROGRESS`
fn constant_name(label: &str) -> String {
    let mut out: String = label
        .chars()
        .map(|c| if c.is_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    if out.is_empty() || out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

/// Backslash-escapes `\\` and `"` for use inside a double-quoted literal
fn escape_quoted(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Statement invoking a proc with the dialect's bind markers
fn call_sql(dialect: Dialect, proc: &Proc) -> String {
    let args: Vec<String> = (1..=proc.inputs().count()).map(|i| dialect.placeholder(i)).collect();
    let args = args.join(", ");
    match (dialect, proc.kind) {
        (Dialect::Postgres, ProcKind::Function) => format!("SELECT * FROM {}({})", proc.name, args),
        (Dialect::Oracle, ProcKind::Function) => format!("SELECT {}({}) FROM dual", proc.name, args),
        (Dialect::Oracle, ProcKind::Procedure) => format!("BEGIN {}({}); END;", proc.name, args),
        (Dialect::SqlServer, ProcKind::Function) => format!("SELECT dbo.{}({})", proc.name, args),
        (Dialect::SqlServer, ProcKind::Procedure) => format!("EXEC {} {}", proc.name, args).trim_end().to_string(),
        (_, ProcKind::Function) => format!("SELECT {}({})", proc.name, args),
        (_, ProcKind::Procedure) => format!("CALL {}({})", proc.name, args),
    }
}

/// Builds the language-neutral context values for one entity
struct ContextScope<'e, 's, 'n> {
    emitter: &'e Emitter<'s>,
    namespace: &'n Namespace,
    file: &'e str,
    imports: BTreeSet<String>,
}

impl ContextScope<'_, '_, '_> {
    fn syntax(&self) -> &TypeSyntax {
        &self.emitter.set.syntax
    }

    /// Import `name` from the module another entity is emitted into
    fn import_from(&mut self, kind: EntityKind, entity: &str, name: &str) {
        if self.emitter.set.kind(kind).is_none() {
            return;
        }
        let Ok(file) = self.emitter.file_id(&self.namespace.name, kind, entity) else {
            return;
        };
        if file == self.file {
            return;
        }
        let module = module_path(&self.namespace.name, &file);
        if let Some(import) = self.syntax().import(&module, name) {
            self.imports.insert(import);
        }
    }

    fn type_name(&mut self, ty: &TypeDescriptor) -> String {
        if let Some(import) = &ty.import {
            self.imports.insert(import.clone());
        }
        if let Some(enum_ref) = &ty.enum_ref {
            let target = ty.target.clone();
            self.import_from(EntityKind::Enum, enum_ref, &target);
        }
        self.syntax().spell(ty)
    }

    fn column(&mut self, column: &Column, placeholder: Option<usize>) -> Value {
        let type_name = self.type_name(&column.ty);
        let base_type = self.syntax().base(&column.ty);
        context! {
            name => &column.name,
            ident => self.syntax().escape(&column.name),
            type_name => type_name,
            base_type => base_type,
            native_type => &column.native_type,
            is_nullable => column.is_nullable,
            has_default => column.default.is_some(),
            is_generated => column.is_generated,
            is_fallback => column.ty.fallback,
            placeholder => placeholder.map(|i| self.namespace.dialect.placeholder(i)),
        }
    }

    fn columns(&mut self, columns: &[&Column], first_placeholder: Option<usize>) -> Vec<Value> {
        columns
            .iter()
            .enumerate()
            .map(|(i, c)| self.column(c, first_placeholder.map(|p| p + i)))
            .collect()
    }

    fn record_name(&self, table: &str) -> String {
        match self.namespace.table(table) {
            Some(t) => format!("{}Record", t.singular_class_name()),
            None => format!("{}Record", to_pascal_case(table)),
        }
    }

    fn table(&mut self, table: &Table) -> (Value, Vec<String>) {
        let record_name = self.record_name(&table.name);
        let all: Vec<&Column> = table.columns.iter().collect();
        let pk = table.primary_key_columns();
        let insert = table.insert_columns();
        let non_pk = table.non_pk_columns();

        let columns = self.columns(&all, None);
        let pk_columns = self.columns(&pk, Some(1));
        let insert_columns = self.columns(&insert, Some(1));
        let update_columns = self.columns(&non_pk, Some(1));
        let update_pk_columns = self.columns(&pk, Some(non_pk.len() + 1));

        let mut foreign_keys = Vec::with_capacity(table.foreign_keys.len());
        for fk in &table.foreign_keys {
            let local: Vec<&Column> = fk.columns.iter().filter_map(|c| table.column(c)).collect();
            let local = self.columns(&local, Some(1));
            let ref_record = self.record_name(&fk.ref_table);
            if fk.ref_namespace == self.namespace.name && fk.ref_table != table.name {
                self.import_from(EntityKind::Table, &fk.ref_table, &ref_record);
            }
            foreign_keys.push(context! {
                name => &fk.name,
                columns => local,
                column_names => &fk.columns,
                ref_namespace => &fk.ref_namespace,
                ref_table => &fk.ref_table,
                ref_columns => &fk.ref_columns,
                ref_record => ref_record,
                same_namespace => fk.ref_namespace == self.namespace.name,
            });
        }
        let indexes: Vec<Value> = table
            .indexes
            .iter()
            .map(|i| {
                context! {
                    name => &i.name,
                    columns => &i.columns,
                    is_unique => i.is_unique,
                    is_primary => i.is_primary,
                }
            })
            .collect();

        let value = context! {
            table_name => &table.name,
            record_name => &record_name,
            class_name => table.singular_class_name(),
            singular_name => table.singular_name(),
            is_view => table.kind == TableKind::View,
            columns => columns,
            pk_columns => pk_columns,
            insert_columns => insert_columns,
            update_columns => update_columns,
            update_pk_columns => update_pk_columns,
            foreign_keys => foreign_keys,
            indexes => indexes,
            has_pk => !pk.is_empty(),
            has_auto_generated_pk => table.has_auto_generated_pk(),
        };
        (value, vec![record_name])
    }

    fn enum_type(&mut self, enum_type: &EnumType) -> (Value, Vec<String>) {
        let name = to_pascal_case(&enum_type.name);
        let labels: Vec<Value> = enum_type
            .labels
            .iter()
            .map(|l| context! { member => constant_name(l), value => l, literal => escape_quoted(l) })
            .collect();
        let value = context! {
            name => &name,
            db_name => &enum_type.name,
            labels => labels,
        };
        (value, vec![name])
    }

    fn proc(&mut self, proc: &Proc) -> (Value, Vec<String>) {
        let namespace = self.namespace;
        let overloads: Vec<&Proc> = namespace
            .procs
            .iter()
            .filter(|p| p.name == proc.name)
            .collect();
        let mut function_name = to_snake_case(&proc.name);
        if overloads.len() > 1 {
            let position = overloads
                .iter()
                .position(|p| p.signature == proc.signature)
                .unwrap_or(0);
            function_name = format!("{}_{}", function_name, position + 1);
        }

        let mut inputs = Vec::new();
        for (i, param) in proc.inputs().enumerate() {
            let type_name = self.type_name(&param.ty);
            inputs.push(context! {
                name => &param.name,
                ident => self.syntax().escape(&to_snake_case(&param.name)),
                type_name => type_name,
                placeholder => namespace.dialect.placeholder(i + 1),
            });
        }
        let mut outputs = Vec::new();
        for param in proc.outputs() {
            let type_name = self.type_name(&param.ty);
            outputs.push(context! {
                name => &param.name,
                ident => self.syntax().escape(&to_snake_case(&param.name)),
                type_name => type_name,
            });
        }
        let return_type = proc.return_type.as_ref().map(|t| self.type_name(t));
        let row_class = (outputs.len() > 1).then(|| format!("{}Row", to_pascal_case(&function_name)));

        let mut exports = vec![function_name.clone()];
        exports.extend(row_class.clone());
        let value = context! {
            name => &proc.name,
            function_name => function_name,
            kind => match proc.kind {
                ProcKind::Function => "function",
                ProcKind::Procedure => "procedure",
            },
            signature => &proc.signature,
            call_sql => call_sql(namespace.dialect, proc),
            inputs => inputs,
            outputs => outputs,
            return_type => return_type,
            row_class => row_class,
        };
        (value, exports)
    }

    fn query(&mut self, query: &Query) -> (Value, Vec<String>) {
        let namespace = self.namespace;
        let function_name = self.syntax().escape(&to_snake_case(&query.name));
        let mut params = Vec::with_capacity(query.params.len());
        for param in &query.params {
            let type_name = self.type_name(&param.ty);
            params.push(context! {
                name => &param.name,
                ident => self.syntax().escape(&param.name),
                type_name => type_name,
                index => param.index,
            });
        }

        let own_row = format!("{}Row", to_pascal_case(&query.name));
        let mut row_columns: Vec<Value> = Vec::new();
        let mut first_type: Option<TypeDescriptor> = None;
        let (result_kind, row_class, defines_row) = match &query.result {
            ResultShape::None => ("none", None, false),
            ResultShape::Table(name) => {
                let record = self.record_name(name);
                self.import_from(EntityKind::Table, name, &record);
                if let Some(table) = namespace.table(name) {
                    first_type = table.columns.first().map(|c| c.ty.clone());
                    let all: Vec<&Column> = table.columns.iter().collect();
                    row_columns = self.columns(&all, None);
                }
                ("table", Some(record), false)
            }
            ResultShape::Proc(name) => {
                if let Some(proc) = namespace.procs.iter().find(|p| &p.name == name) {
                    let outputs: Vec<_> = proc.outputs().collect();
                    first_type = outputs
                        .first()
                        .map(|p| p.ty.clone())
                        .or_else(|| proc.return_type.clone());
                    if outputs.is_empty() {
                        if let Some(ty) = &proc.return_type {
                            let type_name = self.type_name(ty);
                            row_columns.push(context! { name => "value", ident => "value", type_name => type_name });
                        }
                    }
                    for param in outputs {
                        let type_name = self.type_name(&param.ty);
                        row_columns.push(context! {
                            name => &param.name,
                            ident => self.syntax().escape(&to_snake_case(&param.name)),
                            type_name => type_name,
                        });
                    }
                }
                ("proc", Some(own_row.clone()), true)
            }
            ResultShape::Inferred(columns) => {
                first_type = columns.first().map(|c| c.ty.clone());
                for column in columns {
                    let type_name = self.type_name(&column.ty);
                    row_columns.push(context! {
                        name => &column.name,
                        ident => self.syntax().escape(&column.name),
                        type_name => type_name,
                        positional => column.positional,
                    });
                }
                let defines = !columns.is_empty();
                ("inferred", defines.then(|| own_row.clone()), defines)
            }
        };
        // a scalar returns its single column's type
        let scalar_type = first_type
            .filter(|_| query.cardinality == Cardinality::Scalar)
            .map(|t| self.syntax().spell(&t.with_nullable(false)));

        let mut exports = vec![function_name.clone()];
        if defines_row && query.cardinality != Cardinality::Scalar {
            exports.extend(row_class.clone());
        }
        let sql = query.sql.trim_end_matches(|c: char| c == ';' || c.is_whitespace());
        let value = context! {
            name => &query.name,
            function_name => function_name,
            source => &query.source,
            line => query.line,
            sql => sql,
            sql_literal => escape_quoted(sql),
            cardinality => query.cardinality.tag().trim_start_matches(':'),
            doc => &query.doc,
            params => params,
            named_params => uses_named_placeholders(&query.sql, self.namespace.dialect),
            result_kind => result_kind,
            row_class => row_class,
            defines_row => defines_row && query.cardinality != Cardinality::Scalar,
            row_columns => row_columns,
            scalar_type => scalar_type,
        };
        (value, exports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::{Diagnostics, NullSink};
    use crate::schema::{Index, QueryParam, ResultColumn};
    use pretty_assertions::assert_eq;

    fn ty(target: &str, nullable: bool) -> TypeDescriptor {
        TypeDescriptor {
            target: target.to_string(),
            import: None,
            nullable,
            array: false,
            fallback: false,
            enum_ref: None,
        }
    }

    fn model() -> SchemaModel {
        let column = |name: &str, ordinal: u32, target: &str| Column {
            name: name.to_string(),
            ordinal,
            native_type: target.to_string(),
            ty: ty(target, false),
            is_nullable: false,
            default: None,
            is_generated: false,
        };
        let table = |name: &str| Table {
            name: name.to_string(),
            namespace: "public".to_string(),
            kind: TableKind::Table,
            columns: vec![column("id", 1, "int"), column("label", 2, "str")],
            indexes: vec![Index {
                name: format!("{}_pkey", name),
                table: name.to_string(),
                columns: vec!["id".to_string()],
                is_unique: true,
                is_primary: true,
            }],
            foreign_keys: vec![],
        };
        let query = Query {
            name: "CountItems".to_string(),
            source: "q.sql".to_string(),
            line: 1,
            sql: "SELECT count(*) FROM items WHERE id > $1".to_string(),
            cardinality: Cardinality::Scalar,
            params: vec![QueryParam {
                name: "id".to_string(),
                index: 1,
                native_type: Some("integer".to_string()),
                ty: ty("int", false),
            }],
            result: ResultShape::Inferred(vec![ResultColumn {
                name: "column1".to_string(),
                ty: ty("int", false),
                positional: true,
            }]),
            doc: None,
        };
        let namespace = Namespace {
            name: "public".to_string(),
            dialect: Dialect::Postgres,
            tables: vec![table("items"), table("tags")],
            enums: vec![],
            procs: vec![],
            queries: vec![query],
        };
        SchemaModel::from_namespaces(BTreeMap::from([("public".to_string(), namespace)]))
    }

    fn syntax() -> TypeSyntax {
        TypeSyntax {
            array: "list[{}]".to_string(),
            nullable: "{} | None".to_string(),
            local_import: Some("from .{module} import {name}".to_string()),
            reserved: vec!["class".to_string()],
        }
    }

    fn set(table_file: &str) -> TemplateSet {
        TemplateSet {
            name: "test".to_string(),
            syntax: syntax(),
            tables: Some(KindTemplates::new(
                "{{ entity.record_name }}:{% for c in entity.columns %}{{ c.name }} {% endfor %}",
                table_file,
                Granularity::PerEntity,
            )),
            enums: None,
            procs: None,
            queries: Some(
                KindTemplates::new(
                    "{{ entity.function_name }}->{{ entity.scalar_type }}",
                    "{{ namespace }}/queries.txt",
                    Granularity::PerNamespace,
                )
                .with_wrapper("{{ fragments|length }}|{{ body }}"),
            ),
            package: Some(PackageTemplate {
                source: "{% for m in modules %}{{ m.module }};{% endfor %}".to_string(),
                file_id: "{{ namespace }}/index.txt".to_string(),
            }),
        }
    }

    fn text(files: &GeneratedFiles, id: &str) -> String {
        String::from_utf8(files[id].clone()).unwrap()
    }

    #[test]
    fn test_renders_files_and_package() {
        let set = set("{{ namespace }}/{{ name }}.txt");
        let emitter = Emitter::new(&set, Arc::new(NullSink)).unwrap();
        let files = emitter.emit(&model()).unwrap();
        let ids: Vec<_> = files.keys().map(String::as_str).collect();
        assert_eq!(
            ids,
            vec!["public/index.txt", "public/items.txt", "public/queries.txt", "public/tags.txt"]
        );
        assert_eq!(text(&files, "public/items.txt"), "ItemRecord:id label ");
        assert_eq!(text(&files, "public/queries.txt"), "1|count_items->int");
        assert_eq!(text(&files, "public/index.txt"), "items;queries;tags;");
    }

    #[test]
    fn test_rendering_is_deterministic() {
        let set = set("{{ namespace }}/{{ name }}.txt");
        let emitter = Emitter::new(&set, Arc::new(NullSink)).unwrap();
        let model = model();
        assert_eq!(emitter.emit(&model).unwrap(), emitter.emit(&model).unwrap());
    }

    #[test]
    fn test_per_entity_collision_is_fatal() {
        let set = set("{{ namespace }}/tables.txt");
        let emitter = Emitter::new(&set, Arc::new(NullSink)).unwrap();
        match emitter.emit(&model()) {
            Err(SqlweaveError::OutputCollision { file, first, second }) => {
                assert_eq!(file, "public/tables.txt");
                assert_eq!(first, "table 'public.items'");
                assert_eq!(second, "table 'public.tags'");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_shared_file_across_namespaces_is_fatal() {
        let mut namespaces = BTreeMap::new();
        for name in ["a", "b"] {
            let mut namespace = model().namespace("public").unwrap().clone();
            namespace.name = name.to_string();
            namespaces.insert(name.to_string(), namespace);
        }
        let model = SchemaModel::from_namespaces(namespaces);

        let mut set = set("{{ namespace }}/{{ name }}.txt");
        set.queries = Some(KindTemplates::new(
            "{{ entity.function_name }}",
            "queries.txt",
            Granularity::PerNamespace,
        ));
        let emitter = Emitter::new(&set, Arc::new(NullSink)).unwrap();
        match emitter.emit(&model) {
            Err(SqlweaveError::OutputCollision { file, first, second }) => {
                assert_eq!(file, "queries.txt");
                assert!(first.contains("'a."));
                assert!(second.contains("'b."));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    struct Rename;

    impl EntityHook for Rename {
        fn before(&self, entity: Entity) -> Result<Option<Entity>, TemplateError> {
            match entity {
                Entity::Table(mut table) if table.name == "tags" => {
                    table.name = "labels".to_string();
                    Ok(Some(Entity::Table(table)))
                }
                Entity::Query(_) => Ok(None),
                other => Ok(Some(other)),
            }
        }

        fn after(&self, _entity: &Entity, rendered: String) -> Result<String, TemplateError> {
            Ok(rendered.trim_end().to_string())
        }
    }

    #[test]
    fn test_hooks_rewrite_and_suppress() {
        let set = set("{{ namespace }}/{{ name }}.txt");
        let model = model();
        let emitter = Emitter::new(&set, Arc::new(NullSink))
            .unwrap()
            .with_hook(Arc::new(Rename));
        let files = emitter.emit(&model).unwrap();
        assert!(files.contains_key("public/labels.txt"));
        assert!(!files.contains_key("public/queries.txt"));
        assert_eq!(text(&files, "public/items.txt"), "ItemRecord:id label");
        // the model itself is untouched
        assert!(model.namespace("public").unwrap().table("tags").is_some());
    }

    struct Failing;

    impl EntityHook for Failing {
        fn before(&self, entity: Entity) -> Result<Option<Entity>, TemplateError> {
            if entity.name() == "items" {
                return Err(TemplateError {
                    entity: "public.items".to_string(),
                    message: "no".to_string(),
                });
            }
            Ok(Some(entity))
        }
    }

    #[test]
    fn test_failing_hook_aborts_or_skips() {
        let set = set("{{ namespace }}/{{ name }}.txt");
        let emitter = Emitter::new(&set, Arc::new(NullSink))
            .unwrap()
            .with_hook(Arc::new(Failing));
        assert!(matches!(emitter.emit(&model()), Err(SqlweaveError::Template(_))));

        let sink = Diagnostics::new();
        let emitter = Emitter::new(&set, sink.clone())
            .unwrap()
            .with_hook(Arc::new(Failing))
            .with_policy(TemplatePolicy::Skip);
        let files = emitter.emit(&model()).unwrap();
        assert!(!files.contains_key("public/items.txt"));
        assert!(files.contains_key("public/tags.txt"));
        assert_eq!(sink.count(DiagnosticKind::SkippedEntity), 1);
    }

    #[test]
    fn test_bad_template_fails_at_construction() {
        let mut set = set("{{ namespace }}/{{ name }}.txt");
        set.tables = Some(KindTemplates::new("{% for %}", "x", Granularity::PerEntity));
        assert!(matches!(
            Emitter::new(&set, Arc::new(NullSink)),
            Err(SqlweaveError::Template(_))
        ));
    }

    #[test]
    fn test_type_syntax() {
        let syntax = syntax();
        let mut t = ty("int", true);
        t.array = true;
        assert_eq!(syntax.spell(&t), "list[int] | None");
        assert_eq!(syntax.base(&t), "list[int]");
        assert_eq!(syntax.escape("class"), "class_");
        assert_eq!(syntax.escape("id"), "id");
    }

    #[test]
    fn test_naming_helpers() {
        assert_eq!(to_snake_case("ProductByID"), "product_by_id");
        assert_eq!(to_snake_case("listHTTPRequests"), "list_http_requests");
        assert_eq!(to_snake_case("already_snake"), "already_snake");
        assert_eq!(constant_name("in progress"), "IN_PROGRESS");
        assert_eq!(constant_name("1st"), "_1ST");
        assert_eq!(module_path("public", "public/orders.py"), "orders");
        assert_eq!(module_path("public", "public/sub/__init__.py"), "sub.__init__");
    }
}
