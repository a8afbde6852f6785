//! Supported database dialects
//!
//! Dialect identity is a closed enumeration. Unknown names are rejected when
//! configuration is parsed, never at call time.

use std::fmt;
use std::str::FromStr;

use crate::error::SqlweaveError;

/// A database engine whose catalog we know how to read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Dialect {
    Postgres,
    Sqlite,
    Mysql,
    SqlServer,
    Oracle,
}

impl Dialect {
    pub const ALL: [Dialect; 5] = [
        Dialect::Postgres,
        Dialect::Sqlite,
        Dialect::Mysql,
        Dialect::SqlServer,
        Dialect::Oracle,
    ];

    /// Canonical lowercase name, as used in configuration files
    pub fn name(self) -> &'static str {
        match self {
            Dialect::Postgres => "postgres",
            Dialect::Sqlite => "sqlite",
            Dialect::Mysql => "mysql",
            Dialect::SqlServer => "sqlserver",
            Dialect::Oracle => "oracle",
        }
    }

    /// Whether two identifiers differing only in case name different objects
    ///
    /// PostgreSQL and Oracle store quoted identifiers verbatim. SQLite, MySQL
    /// (with default `lower_case_table_names`) and SQL Server (with the default
    /// collation) compare identifiers case-insensitively.
    pub fn identifiers_case_sensitive(self) -> bool {
        matches!(self, Dialect::Postgres | Dialect::Oracle)
    }

    /// Key used to compare identifiers under this dialect's convention
    pub fn fold_identifier(self, ident: &str) -> String {
        if self.identifiers_case_sensitive() {
            ident.to_string()
        } else {
            ident.to_lowercase()
        }
    }

    /// Whether `\` escapes the next character inside every string literal
    ///
    /// MySQL does so unless `NO_BACKSLASH_ESCAPES` is set. Elsewhere only
    /// PostgreSQL `E'...'` strings do, which the scanner recognizes by prefix.
    pub fn backslash_escapes(self) -> bool {
        matches!(self, Dialect::Mysql)
    }

    /// Bind marker for the 1-based parameter `index` in this dialect's own syntax
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Dialect::Postgres => format!("${}", index),
            Dialect::Sqlite | Dialect::Mysql => "?".to_string(),
            Dialect::SqlServer => format!("@p{}", index),
            Dialect::Oracle => format!(":{}", index),
        }
    }

    /// Native type used for LIMIT/OFFSET style integer parameters
    pub fn integer_type(self) -> &'static str {
        match self {
            Dialect::Postgres | Dialect::Mysql | Dialect::SqlServer => "bigint",
            Dialect::Sqlite => "integer",
            Dialect::Oracle => "number",
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Dialect {
    type Err = SqlweaveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Ok(Dialect::Postgres),
            "sqlite" | "sqlite3" => Ok(Dialect::Sqlite),
            "mysql" | "mariadb" => Ok(Dialect::Mysql),
            "sqlserver" | "mssql" => Ok(Dialect::SqlServer),
            "oracle" | "ora" => Ok(Dialect::Oracle),
            other => Err(SqlweaveError::Config(format!("unknown dialect '{}'", other))),
        }
    }
}
