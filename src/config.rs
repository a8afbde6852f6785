//! Configuration loading
//!
//! Loads database connection configuration from environment variables,
//! optionally reading from a .env file first, and the knobs that shape a
//! generation run.

use crate::dialect::Dialect;
use crate::emit::TemplatePolicy;
use crate::error::SqlweaveError;
use crate::query::ErrorPolicy;
use crate::typemap::FallbackPolicy;
use std::{env, path::Path, path::PathBuf};
use tracing::{debug, error, trace, warn};

/// Database connection configuration
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub dialect: Dialect,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    /// Database file, SQLite only
    pub path: Option<PathBuf>,
}

/// Default server port for a dialect, `None` for file databases
pub fn default_port(dialect: Dialect) -> Option<u16> {
    match dialect {
        Dialect::Postgres => Some(5432),
        Dialect::Mysql => Some(3306),
        Dialect::SqlServer => Some(1433),
        Dialect::Oracle => Some(1521),
        Dialect::Sqlite => None,
    }
}

impl DbConfig {
    /// Load configuration from environment variables
    ///
    /// Expected variables:
    /// - DB_PATH (required for sqlite, which ignores the others)
    /// - DB_HOST (default: localhost)
    /// - DB_PORT (default: the dialect's usual port)
    /// - DB_NAME (required)
    /// - DB_USER (required)
    /// - DB_PASSWORD (required)
    pub fn from_env(dialect: Dialect) -> Result<Self, SqlweaveError> {
        Self::from_lookup(dialect, |key| env::var(key).ok())
    }

    /// Same as [`DbConfig::from_env`] with variables read through `lookup`
    pub fn from_lookup(dialect: Dialect, lookup: impl Fn(&str) -> Option<String>) -> Result<Self, SqlweaveError> {
        debug!(dialect = ?dialect, "Loading database configuration from environment");

        let Some(default_port) = default_port(dialect) else {
            let path = lookup("DB_PATH").ok_or_else(|| {
                error!("DB_PATH environment variable is not set");
                SqlweaveError::Config("DB_PATH environment variable is required for sqlite".to_string())
            })?;
            debug!(path = ?path, "Configuration loaded");
            return Ok(Self {
                dialect,
                host: String::new(),
                port: 0,
                database: path.clone(),
                user: String::new(),
                password: String::new(),
                path: Some(PathBuf::from(path)),
            });
        };

        let host = lookup("DB_HOST").unwrap_or_else(|| {
            trace!("DB_HOST not set, using default");
            "localhost".to_string()
        });

        let port = match lookup("DB_PORT") {
            Some(port_str) => port_str.parse::<u16>().map_err(|e| {
                error!(port = ?port_str, error = ?e, "Invalid DB_PORT value");
                SqlweaveError::Config("DB_PORT must be a valid port number".to_string())
            })?,
            None => {
                trace!(port = ?default_port, "DB_PORT not set, using default");
                default_port
            }
        };

        let required = |key: &str| {
            lookup(key).ok_or_else(|| {
                error!(variable = ?key, "Required environment variable is not set");
                SqlweaveError::Config(format!("{} environment variable is required", key))
            })
        };
        let database = required("DB_NAME")?;
        let user = required("DB_USER")?;
        let password = required("DB_PASSWORD")?;

        debug!(host = ?host, port = ?port, database = ?database, user = ?user, "Configuration loaded");

        Ok(Self {
            dialect,
            host,
            port,
            database,
            user,
            password,
            path: None,
        })
    }

    /// Load a .env file and then read configuration from environment
    pub fn load(dialect: Dialect, env_file: &Path) -> Result<Self, SqlweaveError> {
        if env_file.exists() {
            debug!(path = ?env_file, "Loading environment file");
            dotenvy::from_path(env_file).map_err(|e| {
                error!(path = ?env_file, error = ?e, "Failed to load environment file");
                SqlweaveError::Config(format!("Failed to load {}: {}", env_file.display(), e))
            })?;
        } else {
            warn!(path = ?env_file, "Environment file not found, using existing environment");
        }

        Self::from_env(dialect)
    }

    /// Build a PostgreSQL connection string
    pub fn postgres_connection_string(&self) -> String {
        format!(
            "host={} port={} dbname={} user={} password={}",
            self.host, self.port, self.database, self.user, self.password
        )
    }

    /// Build a connection string with password redacted (for log and error messages)
    pub fn redacted_connection_string(&self) -> String {
        match &self.path {
            Some(path) => format!("path={}", path.display()),
            None => format!(
                "host={} port={} dbname={} user={} password=***",
                self.host, self.port, self.database, self.user
            ),
        }
    }
}

/// Options shared by every schema run of one invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    /// Upper bound on concurrent catalog calls and renders per schema
    pub workers: usize,
    pub fallback_policy: FallbackPolicy,
    pub annotation_policy: ErrorPolicy,
    pub template_policy: TemplatePolicy,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            fallback_policy: FallbackPolicy::default(),
            annotation_policy: ErrorPolicy::default(),
            template_policy: TemplatePolicy::default(),
        }
    }
}

impl RunOptions {
    pub fn validate(&self) -> Result<(), SqlweaveError> {
        if self.workers == 0 {
            return Err(SqlweaveError::Config("workers must be at least 1".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn required() -> Vec<(&'static str, &'static str)> {
        vec![("DB_NAME", "testdb"), ("DB_USER", "testuser"), ("DB_PASSWORD", "testpass")]
    }

    fn load(dialect: Dialect, pairs: &[(&str, &str)]) -> Result<DbConfig, SqlweaveError> {
        let vars = vars(pairs);
        DbConfig::from_lookup(dialect, |k| vars.get(k).cloned())
    }

    #[test]
    fn test_from_env_with_defaults() {
        let config = load(Dialect::Postgres, &required()).unwrap();

        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 5432);
        assert_eq!(config.database, "testdb");
        assert_eq!(config.user, "testuser");
        assert_eq!(config.password, "testpass");
        assert_eq!(config.path, None);
    }

    #[test]
    fn test_default_port_follows_dialect() {
        assert_eq!(load(Dialect::Mysql, &required()).unwrap().port, 3306);
        assert_eq!(load(Dialect::SqlServer, &required()).unwrap().port, 1433);
        assert_eq!(load(Dialect::Oracle, &required()).unwrap().port, 1521);
    }

    #[test]
    fn test_from_env_with_custom_values() {
        let mut pairs = required();
        pairs.push(("DB_HOST", "db.example.com"));
        pairs.push(("DB_PORT", "5433"));

        let config = load(Dialect::Postgres, &pairs).unwrap();

        assert_eq!(config.host, "db.example.com");
        assert_eq!(config.port, 5433);
    }

    #[test]
    fn test_from_env_missing_db_name() {
        let result = load(Dialect::Postgres, &[("DB_USER", "testuser"), ("DB_PASSWORD", "testpass")]);

        assert!(result.is_err());
        let err = result.unwrap_err();
        assert!(err.to_string().contains("DB_NAME"));
    }

    #[test]
    fn test_from_env_invalid_port() {
        let mut pairs = required();
        pairs.push(("DB_PORT", "not_a_number"));

        let result = load(Dialect::Postgres, &pairs);

        assert!(result.is_err());
        let err = result.unwrap_err();
        assert!(err.to_string().contains("DB_PORT"));
    }

    #[test]
    fn test_sqlite_reads_path_only() {
        let config = load(Dialect::Sqlite, &[("DB_PATH", "/tmp/shop.db")]).unwrap();
        assert_eq!(config.path, Some(PathBuf::from("/tmp/shop.db")));
        assert_eq!(config.redacted_connection_string(), "path=/tmp/shop.db");

        let err = load(Dialect::Sqlite, &required()).unwrap_err();
        assert!(err.to_string().contains("DB_PATH"));
    }

    #[test]
    fn test_postgres_connection_string() {
        let config = load(Dialect::Postgres, &[("DB_NAME", "mydb"), ("DB_USER", "myuser"), ("DB_PASSWORD", "secret")]).unwrap();

        let conn_str = config.postgres_connection_string();

        assert_eq!(
            conn_str,
            "host=localhost port=5432 dbname=mydb user=myuser password=secret"
        );
    }

    #[test]
    fn test_redacted_connection_string() {
        let config = load(Dialect::Postgres, &[("DB_NAME", "mydb"), ("DB_USER", "myuser"), ("DB_PASSWORD", "secret")]).unwrap();

        let conn_str = config.redacted_connection_string();

        assert!(!conn_str.contains("secret"));
        assert!(conn_str.contains("***"));
    }

    #[test]
    fn test_run_options_reject_zero_workers() {
        assert_eq!(RunOptions::default().workers, 4);
        assert!(RunOptions::default().validate().is_ok());
        let options = RunOptions {
            workers: 0,
            ..RunOptions::default()
        };
        assert!(matches!(options.validate(), Err(SqlweaveError::Config(_))));
    }
}
