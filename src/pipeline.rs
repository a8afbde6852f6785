//! One generation run for one schema
//!
//! A run owns its worker pool and its diagnostics, so several runs can go on
//! side by side in one process without sharing anything mutable.

use std::sync::Arc;

use rayon::ThreadPoolBuilder;
use tracing::{debug, info};

use crate::builder::{BuildOptions, SchemaModelBuilder};
use crate::config::RunOptions;
use crate::diagnostics::{Diagnostic, DiagnosticKind, DiagnosticSink, Diagnostics, NullSink, Tee};
use crate::emit::{Emitter, EntityHook, GeneratedFiles, TemplateSet};
use crate::error::{LoaderError, QueryAnnotationError, SqlweaveError};
use crate::introspect::{load_catalog, CatalogConnection, ExecContext, LoaderRegistry, TableFilter};
use crate::query::{parse_query_files, QuerySource};
use crate::schema::SchemaModel;
use crate::typemap::TypeMapper;

/// Everything one successful run produced
#[derive(Debug)]
pub struct GenerationOutput {
    pub model: SchemaModel,
    pub files: GeneratedFiles,
    /// Every diagnostic reported during the run, in report order
    pub diagnostics: Vec<Diagnostic>,
    /// Query files dropped under the accumulate policy
    pub annotation_errors: Vec<QueryAnnotationError>,
}

impl GenerationOutput {
    pub fn count(&self, kind: DiagnosticKind) -> usize {
        self.diagnostics.iter().filter(|d| d.kind == kind).count()
    }
}

pub struct GenerationRun<'a> {
    registry: &'a LoaderRegistry,
    mapper: &'a TypeMapper,
    templates: &'a TemplateSet,
    options: RunOptions,
    hooks: Vec<Arc<dyn EntityHook>>,
    sink: Arc<dyn DiagnosticSink>,
    ctx: ExecContext,
}

impl<'a> GenerationRun<'a> {
    pub fn new(registry: &'a LoaderRegistry, mapper: &'a TypeMapper, templates: &'a TemplateSet) -> Self {
        Self {
            registry,
            mapper,
            templates,
            options: RunOptions::default(),
            hooks: Vec::new(),
            sink: Arc::new(NullSink),
            ctx: ExecContext::new(),
        }
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    /// Also forward diagnostics to `sink` as they are reported
    pub fn with_sink(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_hook(mut self, hook: Arc<dyn EntityHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn with_context(mut self, ctx: ExecContext) -> Self {
        self.ctx = ctx;
        self
    }

    /// Introspect `schema` over `db`, merge `queries` into it and render
    ///
    /// Any fatal error leaves nothing behind: no partial model, no files.
    pub fn run(
        &self,
        db: &dyn CatalogConnection,
        schema: &str,
        filter: &TableFilter,
        queries: &[QuerySource],
    ) -> Result<GenerationOutput, SqlweaveError> {
        self.options.validate()?;
        info!(schema = ?schema, dialect = ?db.dialect(), templates = ?self.templates.name, "Starting generation run");

        let collected = Diagnostics::new();
        let sink: Arc<dyn DiagnosticSink> = Arc::new(Tee::new(collected.clone(), self.sink.clone()));

        let loader = self.registry.get(db.dialect())?;
        let catalog = load_catalog(&self.ctx, loader, db, schema, filter, self.options.workers)?;

        let pool = ThreadPoolBuilder::new()
            .num_threads(self.options.workers)
            .thread_name(|i| format!("render-{}", i))
            .build()
            .map_err(|e| LoaderError::WorkerPool {
                schema: schema.to_string(),
                message: e.to_string(),
            })?;

        let parsed = pool.install(|| parse_query_files(queries, db.dialect(), self.options.annotation_policy))?;
        for error in &parsed.errors {
            sink.report(Diagnostic::warning(
                DiagnosticKind::SkippedEntity,
                error.file.clone(),
                format!("skipped: {}", error),
            ));
        }
        debug!(files = ?parsed.files.len(), dropped = ?parsed.errors.len(), "Parsed query files");

        let mut builder = SchemaModelBuilder::new(self.mapper, sink.clone()).with_options(BuildOptions {
            fallback_policy: self.options.fallback_policy,
        });
        builder.add_catalog(catalog);
        for file in parsed.files {
            builder.add_query_file(schema, file);
        }
        let built = builder.build()?;
        self.ctx.check(schema)?;

        let mut emitter = Emitter::new(self.templates, sink)?.with_policy(self.options.template_policy);
        for hook in &self.hooks {
            emitter = emitter.with_hook(hook.clone());
        }
        let files = pool.install(|| emitter.emit(&built.model))?;

        info!(schema = ?schema, files = ?files.len(), diagnostics = ?collected.len(), "Generation run complete");
        Ok(GenerationOutput {
            model: built.model,
            files,
            diagnostics: collected.snapshot(),
            annotation_errors: parsed.errors,
        })
    }
}
