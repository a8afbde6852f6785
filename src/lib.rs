//! # sqlweave
//!
//! Generate typed data access code from database catalogs and annotated SQL
//!
//! This crate provides a CLI tool and library that introspect a database
//! schema, merge it with hand-written query files into one immutable model,
//! and render that model through a template set.

pub mod builder;
pub mod config;
pub mod diagnostics;
pub mod dialect;
pub mod emit;
pub mod error;
pub mod introspect;
pub mod pipeline;
pub mod query;
pub mod schema;
pub mod typemap;

pub mod prelude {
    pub use crate::builder::{BuildOptions, BuildOutput, SchemaModelBuilder};
    pub use crate::config::{DbConfig, RunOptions};
    pub use crate::diagnostics::{Diagnostic, DiagnosticKind, DiagnosticSink, Diagnostics, Severity, TracingSink};
    pub use crate::dialect::Dialect;
    pub use crate::emit::{python_templates, Emitter, Entity, EntityHook, GeneratedFiles, TemplatePolicy, TemplateSet};
    pub use crate::error::SqlweaveError;
    pub use crate::introspect::{CatalogConnection, CatalogLoader, ExecContext, LoaderRegistry, TableFilter};
    pub use crate::pipeline::{GenerationOutput, GenerationRun};
    pub use crate::query::{ErrorPolicy, QuerySource};
    pub use crate::schema::{Column, EnumType, Namespace, Query, SchemaModel, Table};
    pub use crate::typemap::{FallbackPolicy, TypeMapConfig, TypeMapper};
}

#[cfg(feature = "postgres")]
pub use introspect::driver::PostgresConnection;
#[cfg(feature = "sqlite")]
pub use introspect::driver::SqliteConnection;
