use tracing::trace;

use super::{
    group_foreign_keys, group_indexes, malformed, run_query, sort_columns, sort_tables,
    CatalogColumn, CatalogConnection, CatalogLoader, CatalogProc, CatalogQuery, CatalogTable,
    ExecContext, ForeignKeyMember, IndexMember,
};
use crate::dialect::Dialect;
use crate::error::LoaderError;
use crate::schema::{EnumType, ForeignKey, Index, TableKind};

/// SQLite catalog loader, reads `sqlite_master` and the table pragmas
///
/// SQLite has no enums or stored procedures; the schema name only labels the
/// namespace.
#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteLoader;

pub(crate) const TABLES: CatalogQuery = CatalogQuery {
    name: "sqlite_tables",
    sql: r#"
        SELECT name AS table_name, type AS table_kind
        FROM sqlite_master
        WHERE type IN ('table', 'view')
            AND name NOT LIKE 'sqlite_%'
        ORDER BY name
    "#,
};

pub(crate) const COLUMNS: CatalogQuery = CatalogQuery {
    name: "sqlite_columns",
    sql: r#"
        SELECT cid, name, type, "notnull" AS not_null, dflt_value, pk, hidden
        FROM pragma_table_xinfo(?1)
        WHERE hidden <> 1
        ORDER BY cid
    "#,
};

pub(crate) const INDEXES: CatalogQuery = CatalogQuery {
    name: "sqlite_indexes",
    sql: r#"
        SELECT il.name AS index_name, il."unique" AS is_unique, il.origin AS origin,
            ii.seqno AS position, ii.name AS column_name
        FROM pragma_index_list(?1) il
        JOIN pragma_index_info(il.name) ii
        WHERE ii.name IS NOT NULL
        ORDER BY il.name, ii.seqno
    "#,
};

pub(crate) const PRIMARY_KEY: CatalogQuery = CatalogQuery {
    name: "sqlite_primary_key",
    sql: r#"
        SELECT name AS column_name, pk AS position
        FROM pragma_table_info(?1)
        WHERE pk > 0
        ORDER BY pk
    "#,
};

pub(crate) const FOREIGN_KEYS: CatalogQuery = CatalogQuery {
    name: "sqlite_foreign_keys",
    sql: r#"
        SELECT id AS key_id, seq AS position, "table" AS ref_table_name,
            "from" AS column_name, "to" AS ref_column_name
        FROM pragma_foreign_key_list(?1)
        ORDER BY id, seq
    "#,
};

impl CatalogLoader for SqliteLoader {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn list_tables(
        &self,
        ctx: &ExecContext,
        db: &dyn CatalogConnection,
        schema: &str,
    ) -> Result<Vec<CatalogTable>, LoaderError> {
        let rows = run_query(ctx, db, schema, &TABLES, &[])?;
        let bad = malformed(schema, &TABLES);
        let mut tables = Vec::with_capacity(rows.len());
        for row in rows {
            let kind = match row.text("table_kind").map_err(&bad)?.as_str() {
                "view" => TableKind::View,
                _ => TableKind::Table,
            };
            tables.push(CatalogTable {
                name: row.text("table_name").map_err(&bad)?,
                kind,
            });
        }
        Ok(sort_tables(tables))
    }

    fn list_columns(
        &self,
        ctx: &ExecContext,
        db: &dyn CatalogConnection,
        schema: &str,
        table: &str,
    ) -> Result<Vec<CatalogColumn>, LoaderError> {
        let rows = run_query(ctx, db, schema, &COLUMNS, &[table])?;
        let bad = malformed(schema, &COLUMNS);

        let mut pk_count = 0;
        for row in &rows {
            if row.int("pk").map_err(&bad)? > 0 {
                pk_count += 1;
            }
        }

        let mut columns = Vec::with_capacity(rows.len());
        for row in rows {
            let native_type = row.opt_text("type").map_err(&bad)?.unwrap_or_default();
            let hidden = row.int("hidden").map_err(&bad)?;
            let is_pk = row.int("pk").map_err(&bad)? > 0;
            // INTEGER PRIMARY KEY aliases the rowid
            let rowid_alias = is_pk && pk_count == 1 && native_type.eq_ignore_ascii_case("integer");
            let column = CatalogColumn {
                name: row.text("name").map_err(&bad)?,
                ordinal: row
                    .ordinal("cid")
                    .map_err(&bad)?
                    .checked_add(1)
                    .ok_or_else(|| bad("column 'cid' is out of range".to_string()))?,
                native_type,
                is_nullable: !row.flag("not_null").map_err(&bad)? && !rowid_alias,
                default: row.opt_text("dflt_value").map_err(&bad)?,
                is_generated: rowid_alias || hidden == 2 || hidden == 3,
            };
            trace!(column = ?column.name, data_type = ?column.native_type, "Parsed column");
            columns.push(column);
        }
        Ok(sort_columns(columns))
    }

    fn list_indexes(
        &self,
        ctx: &ExecContext,
        db: &dyn CatalogConnection,
        schema: &str,
        table: &str,
    ) -> Result<Vec<Index>, LoaderError> {
        let rows = run_query(ctx, db, schema, &INDEXES, &[table])?;
        let bad = malformed(schema, &INDEXES);
        let mut members = Vec::with_capacity(rows.len());
        for row in rows {
            members.push(IndexMember {
                index: row.text("index_name").map_err(&bad)?,
                column: row.text("column_name").map_err(&bad)?,
                position: row.int("position").map_err(&bad)?,
                is_unique: row.flag("is_unique").map_err(&bad)?,
                is_primary: row.text("origin").map_err(&bad)? == "pk",
            });
        }
        let mut indexes = group_indexes(table, members);

        // a rowid-alias primary key has no index of its own
        if !indexes.iter().any(|i| i.is_primary) {
            let rows = run_query(ctx, db, schema, &PRIMARY_KEY, &[table])?;
            let bad = malformed(schema, &PRIMARY_KEY);
            let mut members = Vec::with_capacity(rows.len());
            for row in rows {
                members.push(IndexMember {
                    index: format!("{}_pkey", table),
                    column: row.text("column_name").map_err(&bad)?,
                    position: row.int("position").map_err(&bad)?,
                    is_unique: true,
                    is_primary: true,
                });
            }
            indexes.extend(group_indexes(table, members));
            indexes.sort_by(|a, b| a.name.cmp(&b.name));
        }
        Ok(indexes)
    }

    fn list_foreign_keys(
        &self,
        ctx: &ExecContext,
        db: &dyn CatalogConnection,
        schema: &str,
        table: &str,
    ) -> Result<Vec<ForeignKey>, LoaderError> {
        let rows = run_query(ctx, db, schema, &FOREIGN_KEYS, &[table])?;
        let bad = malformed(schema, &FOREIGN_KEYS);
        let mut members = Vec::with_capacity(rows.len());
        for row in rows {
            let id = row.int("key_id").map_err(&bad)?;
            members.push(ForeignKeyMember {
                name: format!("{}_fk{}", table, id),
                column: row.text("column_name").map_err(&bad)?,
                ref_namespace: schema.to_string(),
                ref_table: row.text("ref_table_name").map_err(&bad)?,
                ref_column: row.opt_text("ref_column_name").map_err(&bad)?,
                position: row.int("position").map_err(&bad)?,
            });
        }
        Ok(group_foreign_keys(table, members))
    }

    fn list_enums(
        &self,
        _ctx: &ExecContext,
        _db: &dyn CatalogConnection,
        _schema: &str,
    ) -> Result<Vec<EnumType>, LoaderError> {
        Ok(vec![])
    }

    fn list_procs(
        &self,
        _ctx: &ExecContext,
        _db: &dyn CatalogConnection,
        _schema: &str,
    ) -> Result<Vec<CatalogProc>, LoaderError> {
        Ok(vec![])
    }
}
