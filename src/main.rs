use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;
use walkdir::WalkDir;

use sqlweave::config::{DbConfig, RunOptions};
use sqlweave::diagnostics::{DiagnosticKind, TracingSink};
use sqlweave::dialect::Dialect;
use sqlweave::emit::{python_templates, GeneratedFiles, TemplatePolicy};
use sqlweave::introspect::{CatalogConnection, LoaderRegistry, TableFilter};
use sqlweave::pipeline::{GenerationOutput, GenerationRun};
use sqlweave::query::{ErrorPolicy, QuerySource};
use sqlweave::typemap::{FallbackPolicy, TypeMapConfig, TypeMapper};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Database {
    Postgres,
    Sqlite,
    Mysql,
    Sqlserver,
    Oracle,
}

impl From<Database> for Dialect {
    fn from(database: Database) -> Self {
        match database {
            Database::Postgres => Dialect::Postgres,
            Database::Sqlite => Dialect::Sqlite,
            Database::Mysql => Dialect::Mysql,
            Database::Sqlserver => Dialect::SqlServer,
            Database::Oracle => Dialect::Oracle,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "sqlweave")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Target database type
    database: Database,

    /// Output directory
    #[arg(short, long, default_value = "./database")]
    output: PathBuf,

    /// Database schema to introspect; repeat for independent runs
    /// (default: public, main, dbo, the database name or the user, per dialect)
    #[arg(long)]
    schema: Vec<String>,

    /// Directory of annotated .sql files, merged into the first schema
    #[arg(long)]
    queries: Option<PathBuf>,

    /// TOML type mapping overlaid on the built-in tables
    #[arg(long)]
    type_map: Option<PathBuf>,

    /// Concurrent catalog calls and renders per schema
    #[arg(long, default_value_t = 4)]
    workers: usize,

    /// Treat any unmapped native type as an error
    #[arg(long)]
    fail_on_fallback: bool,

    /// Keep going past broken query files and report them all at the end
    #[arg(long)]
    accumulate_errors: bool,

    /// Skip entities whose templates or hooks fail instead of aborting
    #[arg(long)]
    skip_failed_entities: bool,

    /// Path to .env file for connection config
    #[arg(long, default_value = "./.env")]
    env_file: PathBuf,

    /// Comma-separated list of tables to include (default: all)
    #[arg(long, value_delimiter = ',')]
    tables: Option<Vec<String>>,

    /// Comma-separated list of tables to exclude
    #[arg(long, value_delimiter = ',')]
    exclude: Option<Vec<String>>,

    /// Verbose output (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn run_options(&self) -> RunOptions {
        RunOptions {
            workers: self.workers,
            fallback_policy: if self.fail_on_fallback {
                FallbackPolicy::Fail
            } else {
                FallbackPolicy::Warn
            },
            annotation_policy: if self.accumulate_errors {
                ErrorPolicy::Accumulate
            } else {
                ErrorPolicy::FailFast
            },
            template_policy: if self.skip_failed_entities {
                TemplatePolicy::Skip
            } else {
                TemplatePolicy::Abort
            },
        }
    }
}

fn main() {
    if let Err(e) = run() {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.verbose);

    let dialect = Dialect::from(cli.database);
    info!("sqlweave v{}", env!("CARGO_PKG_VERSION"));
    info!(
        dialect = ?dialect,
        output = ?cli.output,
        schemas = ?cli.schema,
        queries = ?cli.queries,
        "Starting code generation"
    );

    let options = cli.run_options();
    options.validate()?;

    let config = DbConfig::load(dialect, &cli.env_file).context("Failed to load database configuration")?;
    debug!(connection = ?config.redacted_connection_string(), "Loaded configuration");

    let mapper = match &cli.type_map {
        Some(path) => {
            let overlay = TypeMapConfig::load(path).context("Failed to load type map")?;
            TypeMapper::builtin().merge(&overlay)?
        }
        None => TypeMapper::builtin(),
    };

    let filter = TableFilter {
        include: cli.tables.clone(),
        exclude: cli.exclude.clone(),
    };
    if filter.include.is_some() || filter.exclude.is_some() {
        debug!(filter = ?filter, "Table filter configured");
    }

    let queries = match &cli.queries {
        Some(dir) => discover_queries(dir)?,
        None => Vec::new(),
    };
    debug!(files = ?queries.len(), "Discovered query files");

    let schemas = if cli.schema.is_empty() {
        vec![default_schema(dialect, &config)]
    } else {
        cli.schema.clone()
    };

    let db = open_connection(dialect, &config)?;
    let registry = LoaderRegistry::default();
    let templates = python_templates();
    let runner = GenerationRun::new(&registry, &mapper, &templates)
        .with_options(options)
        .with_sink(Arc::new(TracingSink));

    let mut failed = 0;
    let mut annotation_errors = 0;
    for (i, schema) in schemas.iter().enumerate() {
        let sources: &[QuerySource] = if i == 0 { &queries } else { &[] };
        match runner.run(db.as_ref(), schema, &filter, sources) {
            Ok(output) => {
                let written = write_files(&cli.output, &output.files)?;
                info!(schema = ?schema, files = ?output.files.len(), written = ?written, "Wrote output");
                summarize(schema, &output);
                annotation_errors += output.annotation_errors.len();
            }
            Err(e) => {
                // other schemas still run
                error!(schema = ?schema, "{}", e);
                failed += 1;
            }
        }
    }

    if failed > 0 {
        bail!("{} of {} schema run(s) failed", failed, schemas.len());
    }
    if annotation_errors > 0 {
        bail!("{} query file(s) could not be parsed", annotation_errors);
    }
    info!("Code generation complete");
    Ok(())
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}

/// The namespace a dialect's connections land in when none is named
fn default_schema(dialect: Dialect, config: &DbConfig) -> String {
    match dialect {
        Dialect::Postgres => "public".to_string(),
        Dialect::Sqlite => "main".to_string(),
        Dialect::SqlServer => "dbo".to_string(),
        Dialect::Mysql => config.database.clone(),
        Dialect::Oracle => config.user.to_uppercase(),
    }
}

fn summarize(schema: &str, output: &GenerationOutput) {
    let fallbacks = output.count(DiagnosticKind::FallbackType);
    let unnamed = output.count(DiagnosticKind::UnnamedColumn);
    let skipped = output.count(DiagnosticKind::SkippedEntity);
    if fallbacks > 0 {
        warn!(schema = ?schema, "{} types used fallback mapping", fallbacks);
    }
    if unnamed > 0 {
        info!(schema = ?schema, "{} result columns were named by position", unnamed);
    }
    if skipped > 0 {
        warn!(schema = ?schema, "{} entities or files were skipped", skipped);
    }
    for e in &output.annotation_errors {
        error!(schema = ?schema, "{}", e);
    }
}

/// Every `.sql` file under `dir`, ordered by path
fn discover_queries(dir: &Path) -> Result<Vec<QuerySource>> {
    let mut paths = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.with_context(|| format!("Failed to scan {}", dir.display()))?;
        let is_sql = entry
            .path()
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("sql"));
        if entry.file_type().is_file() && is_sql {
            paths.push(entry.into_path());
        }
    }
    paths.sort();

    paths
        .into_iter()
        .map(|path| {
            let text = fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path.display()))?;
            let id = path
                .strip_prefix(dir)
                .unwrap_or(&path)
                .to_string_lossy()
                .replace('\\', "/");
            Ok(QuerySource::new(id, text))
        })
        .collect()
}

/// Persist generated buffers under `out_dir`, skipping files whose contents are unchanged
fn write_files(out_dir: &Path, files: &GeneratedFiles) -> Result<usize> {
    let mut written = 0;
    for (id, contents) in files {
        let relative = Path::new(id);
        if !relative.components().all(|c| matches!(c, Component::Normal(_))) {
            bail!("Refusing to write '{}' outside the output directory", id);
        }
        let path = out_dir.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        if fs::read(&path).ok().as_deref() == Some(contents.as_slice()) {
            debug!(path = ?path, "Unchanged");
            continue;
        }
        fs::write(&path, contents).with_context(|| format!("Failed to write {}", path.display()))?;
        debug!(path = ?path, "Wrote file");
        written += 1;
    }
    Ok(written)
}

fn open_connection(dialect: Dialect, config: &DbConfig) -> Result<Box<dyn CatalogConnection>> {
    match dialect {
        Dialect::Postgres => open_postgres(config),
        Dialect::Sqlite => open_sqlite(config),
        other => bail!(
            "No bundled driver for {}; use the sqlweave library with your own CatalogConnection",
            other
        ),
    }
}

#[cfg(feature = "postgres")]
fn open_postgres(config: &DbConfig) -> Result<Box<dyn CatalogConnection>> {
    let conn = sqlweave::PostgresConnection::connect(config).with_context(|| {
        format!(
            "Failed to connect to PostgreSQL at {}",
            config.redacted_connection_string()
        )
    })?;
    info!("Connected to database");
    Ok(Box::new(conn))
}

#[cfg(not(feature = "postgres"))]
fn open_postgres(_config: &DbConfig) -> Result<Box<dyn CatalogConnection>> {
    bail!("PostgreSQL support not enabled. Rebuild with --features postgres")
}

#[cfg(feature = "sqlite")]
fn open_sqlite(config: &DbConfig) -> Result<Box<dyn CatalogConnection>> {
    let Some(path) = &config.path else {
        bail!("DB_PATH is required for sqlite");
    };
    let conn = sqlweave::SqliteConnection::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    Ok(Box::new(conn))
}

#[cfg(not(feature = "sqlite"))]
fn open_sqlite(_config: &DbConfig) -> Result<Box<dyn CatalogConnection>> {
    bail!("SQLite support not enabled. Rebuild with --features sqlite")
}
