use std::fmt;

use thiserror::Error;

use crate::dialect::Dialect;

/// sqlweave errors
#[derive(Error, Debug)]
pub enum SqlweaveError {
    #[error(transparent)]
    Loader(#[from] LoaderError),

    #[error(transparent)]
    Annotation(#[from] QueryAnnotationError),

    #[error("{} query file error(s): {}", .0.len(), join_errors(.0))]
    Annotations(Vec<QueryAnnotationError>),

    #[error(transparent)]
    TypeMapping(#[from] TypeMappingError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("Output file '{file}' is produced by both '{first}' and '{second}'")]
    OutputCollision {
        file: String,
        first: String,
        second: String,
    },

    #[error("Failed to write output: {0}")]
    Output(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

fn join_errors(errors: &[QueryAnnotationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Failure class reported by a catalog connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    Connectivity,
    Permission,
    Query,
}

/// Error returned by a [`CatalogConnection`](crate::introspect::CatalogConnection)
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct DriverError {
    pub kind: DriverErrorKind,
    pub message: String,
}

impl DriverError {
    pub fn new(kind: DriverErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Catalog introspection failure, fatal for the affected schema
#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("Failed to connect while introspecting schema '{schema}': {message}")]
    Connectivity { schema: String, message: String },

    #[error("Permission denied reading catalog of schema '{schema}' ({query}): {message}")]
    Permission {
        schema: String,
        query: String,
        message: String,
    },

    #[error("Catalog query '{query}' failed for schema '{schema}': {message}")]
    Query {
        schema: String,
        query: String,
        message: String,
    },

    #[error("Malformed row from catalog query '{query}' in schema '{schema}': {message}")]
    MalformedRow {
        schema: String,
        query: String,
        message: String,
    },

    #[error("Introspection of schema '{schema}' was cancelled")]
    Cancelled { schema: String },

    #[error("Connection speaks {connection} but the loader expects {loader}")]
    DialectMismatch { connection: Dialect, loader: Dialect },

    #[error("Worker pool for schema '{schema}' could not start: {message}")]
    WorkerPool { schema: String, message: String },
}

impl LoaderError {
    pub fn from_driver(schema: &str, query: &str, err: DriverError) -> Self {
        match err.kind {
            DriverErrorKind::Connectivity => LoaderError::Connectivity {
                schema: schema.to_string(),
                message: err.message,
            },
            DriverErrorKind::Permission => LoaderError::Permission {
                schema: schema.to_string(),
                query: query.to_string(),
                message: err.message,
            },
            DriverErrorKind::Query => LoaderError::Query {
                schema: schema.to_string(),
                query: query.to_string(),
                message: err.message,
            },
        }
    }
}

/// What went wrong inside an annotated query file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnnotationErrorKind {
    MalformedDirective(String),
    UnknownCardinality(String),
    ParameterMismatch { declared: usize, found: usize },
    DuplicateName { first_line: usize },
    /// Same query name in two files of one namespace
    DuplicateNameAcrossFiles { first_file: String, first_line: usize },
    MixedPlaceholders,
    UnknownParameter(String),
    EmptyBody,
    StrayStatement,
}

impl fmt::Display for AnnotationErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnnotationErrorKind::MalformedDirective(msg) => write!(f, "malformed directive: {}", msg),
            AnnotationErrorKind::UnknownCardinality(tag) => write!(f, "unknown cardinality '{}'", tag),
            AnnotationErrorKind::ParameterMismatch { declared, found } => write!(
                f,
                "parameter count mismatch (declared {}, found {})",
                declared, found
            ),
            AnnotationErrorKind::DuplicateName { first_line } => {
                write!(f, "duplicate query name (first defined on line {})", first_line)
            }
            AnnotationErrorKind::DuplicateNameAcrossFiles { first_file, first_line } => write!(
                f,
                "duplicate query name (first defined in {} on line {})",
                first_file, first_line
            ),
            AnnotationErrorKind::MixedPlaceholders => {
                f.write_str("positional and named placeholders cannot be mixed")
            }
            AnnotationErrorKind::UnknownParameter(name) => {
                write!(f, "declared parameter '{}' is not referenced", name)
            }
            AnnotationErrorKind::EmptyBody => f.write_str("query has no SQL body"),
            AnnotationErrorKind::StrayStatement => f.write_str("SQL found outside of a query block"),
        }
    }
}

/// Malformed directive, placeholder mismatch or duplicate query name
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{file}:{line}: {}{kind}", query_prefix(.query))]
pub struct QueryAnnotationError {
    pub file: String,
    pub line: usize,
    pub query: Option<String>,
    pub kind: AnnotationErrorKind,
}

fn query_prefix(query: &Option<String>) -> String {
    query
        .as_ref()
        .map(|q| format!("query '{}': ", q))
        .unwrap_or_default()
}

/// Why a native type could not be mapped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeMappingReason {
    Unmapped,
    Unparsable,
}

impl TypeMappingReason {
    fn label(self) -> &'static str {
        match self {
            TypeMappingReason::Unmapped => "unmapped",
            TypeMappingReason::Unparsable => "unparsable",
        }
    }
}

/// A native type with no explicit mapping; always resolved via fallback
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{} type: {native_type}", .reason.label())]
pub struct TypeMappingError {
    pub dialect: Dialect,
    pub native_type: String,
    pub reason: TypeMappingReason,
}

/// The catalog or queries are internally inconsistent
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("'{name}' is defined more than once in namespace '{namespace}' (as {first} and {second})")]
    DuplicateName {
        namespace: String,
        name: String,
        first: &'static str,
        second: &'static str,
    },

    #[error("Column '{column}' appears more than once in '{namespace}.{table}'")]
    DuplicateColumn {
        namespace: String,
        table: String,
        column: String,
    },

    #[error("Foreign key '{name}' on '{namespace}.{table}' references missing table '{ref_namespace}.{ref_table}'")]
    DanglingForeignKey {
        namespace: String,
        table: String,
        name: String,
        ref_namespace: String,
        ref_table: String,
    },

    #[error("Foreign key '{name}' on '{namespace}.{table}' references missing column '{ref_table}.{column}'")]
    DanglingForeignKeyColumn {
        namespace: String,
        table: String,
        name: String,
        ref_table: String,
        column: String,
    },

    #[error("Foreign key '{name}' on '{namespace}.{table}' pairs {local} column(s) with {referenced} referenced column(s)")]
    ForeignKeyArity {
        namespace: String,
        table: String,
        name: String,
        local: usize,
        referenced: usize,
    },

    #[error("Query '{query}' in namespace '{namespace}': parameter count mismatch (declared {declared}, found {found})")]
    ParameterMismatch {
        namespace: String,
        query: String,
        declared: usize,
        found: usize,
    },

    #[error("Query '{query}' in namespace '{namespace}' returns unknown entity '{entity}'")]
    UnknownResultType {
        namespace: String,
        query: String,
        entity: String,
    },

    #[error("Scalar query '{query}' in namespace '{namespace}' must return exactly one column, found {columns}")]
    ScalarShape {
        namespace: String,
        query: String,
        columns: usize,
    },

    #[error("Query file '{file}' targets namespace '{namespace}' which has no catalog")]
    UnknownNamespace { namespace: String, file: String },

    #[error("Catalog for namespace '{namespace}' was supplied twice")]
    DuplicateNamespace { namespace: String },
}

/// Extension-callback or rendering failure scoped to one entity
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Template error for '{entity}': {message}")]
pub struct TemplateError {
    pub entity: String,
    pub message: String,
}
