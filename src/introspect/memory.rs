//! Canned catalog connection
//!
//! Answers catalog queries from rows registered up front, keyed by query name
//! and parameters. Unregistered queries return no rows.

use std::collections::HashMap;

use parking_lot::Mutex;

use super::{CatalogConnection, CatalogQuery, CatalogRow};
use crate::dialect::Dialect;
use crate::error::DriverError;

type Key = (String, Vec<String>);

#[derive(Debug)]
pub struct MemoryConnection {
    dialect: Dialect,
    rows: HashMap<Key, Vec<CatalogRow>>,
    failures: HashMap<String, DriverError>,
    log: Mutex<Vec<Key>>,
}

impl MemoryConnection {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            rows: HashMap::new(),
            failures: HashMap::new(),
            log: Mutex::new(Vec::new()),
        }
    }

    /// Register the rows returned for `query` with exactly these parameters
    pub fn with_rows(mut self, query: &str, params: &[&str], rows: Vec<CatalogRow>) -> Self {
        self.rows
            .entry(key(query, params))
            .or_default()
            .extend(rows);
        self
    }

    /// Make every call of `query` fail
    pub fn with_failure(mut self, query: &str, error: DriverError) -> Self {
        self.failures.insert(query.to_string(), error);
        self
    }

    /// Queries issued so far, in arrival order
    pub fn issued(&self) -> Vec<(String, Vec<String>)> {
        self.log.lock().clone()
    }
}

fn key(query: &str, params: &[&str]) -> Key {
    (
        query.to_string(),
        params.iter().map(|p| p.to_string()).collect(),
    )
}

impl CatalogConnection for MemoryConnection {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn query(&self, query: &CatalogQuery, params: &[&str]) -> Result<Vec<CatalogRow>, DriverError> {
        let key = key(query.name, params);
        self.log.lock().push(key.clone());
        if let Some(err) = self.failures.get(query.name) {
            return Err(err.clone());
        }
        Ok(self.rows.get(&key).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DriverErrorKind;

    const Q: CatalogQuery = CatalogQuery {
        name: "tables",
        sql: "SELECT 1",
    };

    #[test]
    fn test_rows_keyed_by_params() {
        let conn = MemoryConnection::new(Dialect::Sqlite).with_rows(
            "tables",
            &["main"],
            vec![CatalogRow::new().with("name", "users")],
        );
        assert_eq!(conn.query(&Q, &["main"]).unwrap().len(), 1);
        assert!(conn.query(&Q, &["other"]).unwrap().is_empty());
        assert_eq!(conn.issued().len(), 2);
    }

    #[test]
    fn test_failure() {
        let conn = MemoryConnection::new(Dialect::Sqlite)
            .with_failure("tables", DriverError::new(DriverErrorKind::Connectivity, "gone"));
        assert_eq!(conn.query(&Q, &[]).unwrap_err().kind, DriverErrorKind::Connectivity);
    }
}
