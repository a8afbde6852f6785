//! Catalog connections backed by real database drivers
//!
//! Each adapter is behind the cargo feature of the same name. Drivers whose
//! clients need `&mut` access are serialized behind a mutex so the loader's
//! worker pool can share them.

#[cfg(feature = "postgres")]
pub use self::pg::PostgresConnection;
#[cfg(feature = "sqlite")]
pub use self::lite::SqliteConnection;

#[cfg(feature = "postgres")]
mod pg {
    use parking_lot::Mutex;
    use postgres::error::SqlState;
    use postgres::types::{ToSql, Type};
    use postgres::{Client, NoTls};
    use tracing::{debug, info};

    use crate::config::DbConfig;
    use crate::dialect::Dialect;
    use crate::error::{DriverError, DriverErrorKind};
    use crate::introspect::{CatalogConnection, CatalogQuery, CatalogRow, CatalogValue};

    /// A blocking `postgres` client shared by the worker pool
    pub struct PostgresConnection {
        client: Mutex<Client>,
    }

    impl PostgresConnection {
        pub fn connect(config: &DbConfig) -> Result<Self, DriverError> {
            info!(connection = ?config.redacted_connection_string(), "Connecting to PostgreSQL");
            let client = Client::connect(&config.postgres_connection_string(), NoTls)
                .map_err(|e| {
                    DriverError::new(
                        DriverErrorKind::Connectivity,
                        format!(
                            "failed to connect to PostgreSQL at {}: {}",
                            config.redacted_connection_string(),
                            e
                        ),
                    )
                })?;
            info!("Connected to database");
            Ok(Self::from_client(client))
        }

        pub fn from_client(client: Client) -> Self {
            Self {
                client: Mutex::new(client),
            }
        }
    }

    impl CatalogConnection for PostgresConnection {
        fn dialect(&self) -> Dialect {
            Dialect::Postgres
        }

        fn query(&self, query: &CatalogQuery, params: &[&str]) -> Result<Vec<CatalogRow>, DriverError> {
            let params: Vec<&(dyn ToSql + Sync)> =
                params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
            let rows = self
                .client
                .lock()
                .query(query.sql, &params)
                .map_err(lift_error)?;
            debug!(query = query.name, rows = ?rows.len(), "Catalog query returned");

            let mut result = Vec::with_capacity(rows.len());
            for row in rows {
                let mut out = CatalogRow::new();
                for (i, column) in row.columns().iter().enumerate() {
                    let ty = column.type_();
                    let value = if *ty == Type::BOOL {
                        row.try_get::<_, Option<bool>>(i).map(CatalogValue::from)
                    } else if *ty == Type::INT2 {
                        row.try_get::<_, Option<i16>>(i)
                            .map(|v| CatalogValue::from(v.map(i64::from)))
                    } else if *ty == Type::INT4 {
                        row.try_get::<_, Option<i32>>(i)
                            .map(|v| CatalogValue::from(v.map(i64::from)))
                    } else if *ty == Type::INT8 {
                        row.try_get::<_, Option<i64>>(i).map(CatalogValue::from)
                    } else if *ty == Type::OID {
                        row.try_get::<_, Option<u32>>(i)
                            .map(|v| CatalogValue::from(v.map(i64::from)))
                    } else {
                        row.try_get::<_, Option<String>>(i).map(CatalogValue::from)
                    }
                    .map_err(|e| {
                        DriverError::new(
                            DriverErrorKind::Query,
                            format!("column '{}': {}", column.name(), e),
                        )
                    })?;
                    out.push(column.name(), value);
                }
                result.push(out);
            }
            Ok(result)
        }
    }

    fn lift_error(e: postgres::Error) -> DriverError {
        let kind = if e.is_closed() {
            DriverErrorKind::Connectivity
        } else if e.code() == Some(&SqlState::INSUFFICIENT_PRIVILEGE) {
            DriverErrorKind::Permission
        } else {
            DriverErrorKind::Query
        };
        DriverError::new(kind, e.to_string())
    }
}

#[cfg(feature = "sqlite")]
mod lite {
    use std::path::Path;

    use parking_lot::Mutex;
    use rusqlite::types::ValueRef;
    use rusqlite::{params_from_iter, Connection, ErrorCode};
    use tracing::{debug, info};

    use crate::dialect::Dialect;
    use crate::error::{DriverError, DriverErrorKind};
    use crate::introspect::{CatalogConnection, CatalogQuery, CatalogRow, CatalogValue};

    /// A `rusqlite` connection shared by the worker pool
    pub struct SqliteConnection {
        conn: Mutex<Connection>,
    }

    impl SqliteConnection {
        pub fn open(path: &Path) -> Result<Self, DriverError> {
            info!(path = ?path, "Opening SQLite database");
            let conn = Connection::open(path).map_err(|e| {
                DriverError::new(
                    DriverErrorKind::Connectivity,
                    format!("failed to open {}: {}", path.display(), e),
                )
            })?;
            Ok(Self::from_connection(conn))
        }

        pub fn from_connection(conn: Connection) -> Self {
            Self {
                conn: Mutex::new(conn),
            }
        }
    }

    impl CatalogConnection for SqliteConnection {
        fn dialect(&self) -> Dialect {
            Dialect::Sqlite
        }

        fn query(&self, query: &CatalogQuery, params: &[&str]) -> Result<Vec<CatalogRow>, DriverError> {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare(query.sql).map_err(lift_error)?;
            let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

            let mut rows = stmt
                .query(params_from_iter(params.iter()))
                .map_err(lift_error)?;
            let mut result = Vec::new();
            while let Some(row) = rows.next().map_err(lift_error)? {
                let mut out = CatalogRow::new();
                for (i, name) in names.iter().enumerate() {
                    let value = match row.get_ref(i).map_err(lift_error)? {
                        ValueRef::Null => CatalogValue::Null,
                        ValueRef::Integer(v) => CatalogValue::Int(v),
                        ValueRef::Real(v) => CatalogValue::Text(v.to_string()),
                        ValueRef::Text(v) | ValueRef::Blob(v) => {
                            CatalogValue::Text(String::from_utf8_lossy(v).into_owned())
                        }
                    };
                    out.push(name, value);
                }
                result.push(out);
            }
            debug!(query = query.name, rows = ?result.len(), "Catalog query returned");
            Ok(result)
        }
    }

    fn lift_error(e: rusqlite::Error) -> DriverError {
        let kind = match &e {
            rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
                ErrorCode::CannotOpen | ErrorCode::NotADatabase => DriverErrorKind::Connectivity,
                ErrorCode::PermissionDenied | ErrorCode::AuthorizationForStatementDenied => {
                    DriverErrorKind::Permission
                }
                _ => DriverErrorKind::Query,
            },
            _ => DriverErrorKind::Query,
        };
        DriverError::new(kind, e.to_string())
    }
}
