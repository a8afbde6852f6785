use super::{
    group_foreign_keys, group_indexes, group_procs, malformed, run_query, sort_columns, sort_tables,
    CatalogColumn, CatalogConnection, CatalogLoader, CatalogProc, CatalogProcParam, CatalogQuery,
    CatalogTable, ExecContext, ForeignKeyMember, IndexMember, ProcMember,
};
use crate::dialect::Dialect;
use crate::error::LoaderError;
use crate::schema::{EnumType, ForeignKey, Index, ParamMode, ProcKind, TableKind};

/// SQL Server catalog loader, reads the `sys` catalog views
#[derive(Debug, Default, Clone, Copy)]
pub struct SqlServerLoader;

pub(crate) const TABLES: CatalogQuery = CatalogQuery {
    name: "mssql_tables",
    sql: r#"
        SELECT o.name AS table_name,
            CASE WHEN o.type = 'V' THEN 'view' ELSE 'table' END AS table_kind
        FROM sys.objects o
        JOIN sys.schemas s ON s.schema_id = o.schema_id
        WHERE o.type IN ('U', 'V')
            AND o.is_ms_shipped = 0
            AND s.name = @P1
        ORDER BY o.name
    "#,
};

pub(crate) const COLUMNS: CatalogQuery = CatalogQuery {
    name: "mssql_columns",
    sql: r#"
        SELECT c.name AS column_name, c.column_id AS ordinal_position,
            t.name AS data_type,
            c.is_nullable AS is_nullable, dc.definition AS column_default,
            CAST(CASE WHEN c.is_identity = 1 OR c.is_computed = 1 THEN 1 ELSE 0 END AS bit) AS is_generated
        FROM sys.columns c
        JOIN sys.objects o ON o.object_id = c.object_id
        JOIN sys.schemas s ON s.schema_id = o.schema_id
        JOIN sys.types t ON t.user_type_id = c.user_type_id
        LEFT JOIN sys.default_constraints dc ON dc.object_id = c.default_object_id
        WHERE s.name = @P1 AND o.name = @P2
        ORDER BY c.column_id
    "#,
};

pub(crate) const INDEXES: CatalogQuery = CatalogQuery {
    name: "mssql_indexes",
    sql: r#"
        SELECT i.name AS index_name, i.is_unique AS is_unique,
            i.is_primary_key AS is_primary, ic.key_ordinal AS position,
            c.name AS column_name
        FROM sys.indexes i
        JOIN sys.objects o ON o.object_id = i.object_id
        JOIN sys.schemas s ON s.schema_id = o.schema_id
        JOIN sys.index_columns ic ON ic.object_id = i.object_id AND ic.index_id = i.index_id
        JOIN sys.columns c ON c.object_id = ic.object_id AND c.column_id = ic.column_id
        WHERE s.name = @P1 AND o.name = @P2
            AND i.name IS NOT NULL
            AND ic.key_ordinal > 0
        ORDER BY i.name, ic.key_ordinal
    "#,
};

pub(crate) const FOREIGN_KEYS: CatalogQuery = CatalogQuery {
    name: "mssql_foreign_keys",
    sql: r#"
        SELECT fk.name AS foreign_key_name, pc.name AS column_name,
            rs.name AS ref_schema, ro.name AS ref_table_name,
            rc.name AS ref_column_name, fkc.constraint_column_id AS position
        FROM sys.foreign_keys fk
        JOIN sys.objects o ON o.object_id = fk.parent_object_id
        JOIN sys.schemas s ON s.schema_id = o.schema_id
        JOIN sys.objects ro ON ro.object_id = fk.referenced_object_id
        JOIN sys.schemas rs ON rs.schema_id = ro.schema_id
        JOIN sys.foreign_key_columns fkc ON fkc.constraint_object_id = fk.object_id
        JOIN sys.columns pc ON pc.object_id = fkc.parent_object_id AND pc.column_id = fkc.parent_column_id
        JOIN sys.columns rc ON rc.object_id = fkc.referenced_object_id AND rc.column_id = fkc.referenced_column_id
        WHERE s.name = @P1 AND o.name = @P2
        ORDER BY fk.name, fkc.constraint_column_id
    "#,
};

pub(crate) const PROCS: CatalogQuery = CatalogQuery {
    name: "mssql_procs",
    sql: r#"
        SELECT o.name AS proc_name, CAST(o.object_id AS varchar(20)) AS proc_id,
            CASE WHEN o.type = 'P' THEN 'procedure' ELSE 'function' END AS proc_kind,
            rt.name AS return_type,
            p.name AS param_name, t.name AS param_type,
            p.is_output AS is_output, p.parameter_id AS position
        FROM sys.objects o
        JOIN sys.schemas s ON s.schema_id = o.schema_id
        LEFT JOIN sys.parameters p ON p.object_id = o.object_id AND p.parameter_id > 0
        LEFT JOIN sys.types t ON t.user_type_id = p.user_type_id
        LEFT JOIN sys.parameters r ON r.object_id = o.object_id AND r.parameter_id = 0
        LEFT JOIN sys.types rt ON rt.user_type_id = r.user_type_id
        WHERE o.type IN ('P', 'FN', 'IF', 'TF')
            AND s.name = @P1
        ORDER BY o.name, p.parameter_id
    "#,
};

impl CatalogLoader for SqlServerLoader {
    fn dialect(&self) -> Dialect {
        Dialect::SqlServer
    }

    fn list_tables(
        &self,
        ctx: &ExecContext,
        db: &dyn CatalogConnection,
        schema: &str,
    ) -> Result<Vec<CatalogTable>, LoaderError> {
        let rows = run_query(ctx, db, schema, &TABLES, &[schema])?;
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
        let rows = run_query(ctx, db, schema, &COLUMNS, &[schema, table])?;
        let bad = malformed(schema, &COLUMNS);
        let mut columns = Vec::with_capacity(rows.len());
        for row in rows {
            columns.push(CatalogColumn {
                name: row.text("column_name").map_err(&bad)?,
                ordinal: row.ordinal("ordinal_position").map_err(&bad)?,
                native_type: row.text("data_type").map_err(&bad)?,
                is_nullable: row.flag("is_nullable").map_err(&bad)?,
                default: row.opt_text("column_default").map_err(&bad)?,
                is_generated: row.flag("is_generated").map_err(&bad)?,
            });
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
        let rows = run_query(ctx, db, schema, &INDEXES, &[schema, table])?;
        let bad = malformed(schema, &INDEXES);
        let mut members = Vec::with_capacity(rows.len());
        for row in rows {
            members.push(IndexMember {
                index: row.text("index_name").map_err(&bad)?,
                column: row.text("column_name").map_err(&bad)?,
                position: row.int("position").map_err(&bad)?,
                is_unique: row.flag("is_unique").map_err(&bad)?,
                is_primary: row.flag("is_primary").map_err(&bad)?,
            });
        }
        Ok(group_indexes(table, members))
    }

    fn list_foreign_keys(
        &self,
        ctx: &ExecContext,
        db: &dyn CatalogConnection,
        schema: &str,
        table: &str,
    ) -> Result<Vec<ForeignKey>, LoaderError> {
        let rows = run_query(ctx, db, schema, &FOREIGN_KEYS, &[schema, table])?;
        let bad = malformed(schema, &FOREIGN_KEYS);
        let mut members = Vec::with_capacity(rows.len());
        for row in rows {
            members.push(ForeignKeyMember {
                name: row.text("foreign_key_name").map_err(&bad)?,
                column: row.text("column_name").map_err(&bad)?,
                ref_namespace: row.text("ref_schema").map_err(&bad)?,
                ref_table: row.text("ref_table_name").map_err(&bad)?,
                ref_column: Some(row.text("ref_column_name").map_err(&bad)?),
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
        ctx: &ExecContext,
        db: &dyn CatalogConnection,
        schema: &str,
    ) -> Result<Vec<CatalogProc>, LoaderError> {
        let rows = run_query(ctx, db, schema, &PROCS, &[schema])?;
        let bad = malformed(schema, &PROCS);
        let mut members = Vec::with_capacity(rows.len());
        for row in rows {
            let kind = match row.text("proc_kind").map_err(&bad)?.as_str() {
                "procedure" => ProcKind::Procedure,
                _ => ProcKind::Function,
            };
            let param = match row.opt_text("param_type").map_err(&bad)? {
                Some(native_type) => {
                    let position = row.int("position").map_err(&bad)?;
                    let name = row
                        .opt_text("param_name")
                        .map_err(&bad)?
                        .map(|n| n.trim_start_matches('@').to_string())
                        .unwrap_or_else(|| format!("p{}", position));
                    let mode = if row.flag("is_output").map_err(&bad)? {
                        ParamMode::InOut
                    } else {
                        ParamMode::In
                    };
                    Some((
                        position,
                        CatalogProcParam {
                            name,
                            mode,
                            native_type,
                        },
                    ))
                }
                None => None,
            };
            members.push(ProcMember {
                name: row.text("proc_name").map_err(&bad)?,
                overload: row.text("proc_id").map_err(&bad)?,
                kind,
                return_type: row.opt_text("return_type").map_err(&bad)?,
                param,
            });
        }
        Ok(group_procs(members))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::introspect::{CatalogRow, MemoryConnection};

    #[test]
    fn test_proc_output_params_strip_at_sign() {
        let conn = MemoryConnection::new(Dialect::SqlServer).with_rows(
            "mssql_procs",
            &["dbo"],
            vec![
                CatalogRow::new()
                    .with("proc_name", "get_total")
                    .with("proc_id", "1001")
                    .with("proc_kind", "procedure")
                    .with("return_type", None::<&str>)
                    .with("param_name", "@total")
                    .with("param_type", "money")
                    .with("is_output", true)
                    .with("position", 2i64),
                CatalogRow::new()
                    .with("proc_name", "get_total")
                    .with("proc_id", "1001")
                    .with("proc_kind", "procedure")
                    .with("return_type", None::<&str>)
                    .with("param_name", "@customer_id")
                    .with("param_type", "int")
                    .with("is_output", false)
                    .with("position", 1i64),
            ],
        );
        let procs = SqlServerLoader
            .list_procs(&ExecContext::new(), &conn, "dbo")
            .unwrap();
        assert_eq!(procs.len(), 1);
        assert_eq!(procs[0].params[0].name, "customer_id");
        assert_eq!(procs[0].params[1].mode, ParamMode::InOut);
        assert_eq!(procs[0].signature(), "int,money");
    }
}
