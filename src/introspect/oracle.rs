use super::{
    group_foreign_keys, group_indexes, group_procs, malformed, run_query, sort_columns, sort_tables,
    CatalogColumn, CatalogConnection, CatalogLoader, CatalogProc, CatalogProcParam, CatalogQuery,
    CatalogTable, ExecContext, ForeignKeyMember, IndexMember, ProcMember,
};
use crate::dialect::Dialect;
use crate::error::LoaderError;
use crate::schema::{EnumType, ForeignKey, Index, ParamMode, ProcKind, TableKind};

/// Oracle catalog loader, reads the `ALL_*` dictionary views for one owner
#[derive(Debug, Default, Clone, Copy)]
pub struct OracleLoader;

pub(crate) const TABLES: CatalogQuery = CatalogQuery {
    name: "oracle_tables",
    sql: r#"
        SELECT table_name, 'table' AS table_kind FROM all_tables
        WHERE owner = :1 AND nested = 'NO' AND secondary = 'N'
        UNION ALL
        SELECT view_name AS table_name, 'view' AS table_kind FROM all_views
        WHERE owner = :1
        ORDER BY 1
    "#,
};

pub(crate) const COLUMNS: CatalogQuery = CatalogQuery {
    name: "oracle_columns",
    sql: r#"
        SELECT column_name, column_id AS ordinal_position, data_type,
            nullable AS is_nullable, data_default AS column_default,
            identity_column AS is_identity, virtual_column AS is_virtual
        FROM all_tab_cols
        WHERE owner = :1 AND table_name = :2 AND hidden_column = 'NO'
        ORDER BY column_id
    "#,
};

pub(crate) const INDEXES: CatalogQuery = CatalogQuery {
    name: "oracle_indexes",
    sql: r#"
        SELECT i.index_name, i.uniqueness, ic.column_position AS position,
            ic.column_name,
            CASE WHEN c.constraint_type = 'P' THEN 'Y' ELSE 'N' END AS is_primary
        FROM all_indexes i
        JOIN all_ind_columns ic ON ic.index_owner = i.owner AND ic.index_name = i.index_name
        LEFT JOIN all_constraints c ON c.owner = i.table_owner
            AND c.index_name = i.index_name AND c.constraint_type = 'P'
        WHERE i.table_owner = :1 AND i.table_name = :2
        ORDER BY i.index_name, ic.column_position
    "#,
};

pub(crate) const FOREIGN_KEYS: CatalogQuery = CatalogQuery {
    name: "oracle_foreign_keys",
    sql: r#"
        SELECT c.constraint_name AS foreign_key_name, cc.column_name,
            rc.owner AS ref_schema, rc.table_name AS ref_table_name,
            rcc.column_name AS ref_column_name, cc.position
        FROM all_constraints c
        JOIN all_cons_columns cc ON cc.owner = c.owner AND cc.constraint_name = c.constraint_name
        JOIN all_constraints rc ON rc.owner = c.r_owner AND rc.constraint_name = c.r_constraint_name
        JOIN all_cons_columns rcc ON rcc.owner = rc.owner
            AND rcc.constraint_name = rc.constraint_name
            AND rcc.position = cc.position
        WHERE c.constraint_type = 'R' AND c.owner = :1 AND c.table_name = :2
        ORDER BY c.constraint_name, cc.position
    "#,
};

pub(crate) const PROCS: CatalogQuery = CatalogQuery {
    name: "oracle_procs",
    sql: r#"
        SELECT p.object_name AS proc_name,
            TO_CHAR(p.object_id) || ':' || NVL(p.overload, '0') AS proc_id,
            LOWER(p.object_type) AS proc_kind,
            (SELECT r.data_type FROM all_arguments r
                WHERE r.object_id = p.object_id AND NVL(r.overload, '0') = NVL(p.overload, '0')
                AND r.position = 0 AND r.data_level = 0) AS return_type,
            a.argument_name AS param_name, a.data_type AS param_type,
            a.in_out AS param_mode, a.position
        FROM all_procedures p
        LEFT JOIN all_arguments a ON a.object_id = p.object_id
            AND NVL(a.overload, '0') = NVL(p.overload, '0')
            AND a.position > 0 AND a.data_level = 0
        WHERE p.owner = :1
            AND p.object_type IN ('FUNCTION', 'PROCEDURE')
        ORDER BY p.object_name, p.overload, a.position
    "#,
};

impl CatalogLoader for OracleLoader {
    fn dialect(&self) -> Dialect {
        Dialect::Oracle
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
            let default = row
                .opt_text("column_default")
                .map_err(&bad)?
                .map(|d| d.trim().to_string())
                .filter(|d| !d.is_empty());
            columns.push(CatalogColumn {
                name: row.text("column_name").map_err(&bad)?,
                ordinal: row.ordinal("ordinal_position").map_err(&bad)?,
                native_type: row.text("data_type").map_err(&bad)?,
                is_nullable: row.flag("is_nullable").map_err(&bad)?,
                default,
                is_generated: row.flag("is_identity").map_err(&bad)?
                    || row.flag("is_virtual").map_err(&bad)?,
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
                is_unique: row.text("uniqueness").map_err(&bad)? == "UNIQUE",
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
                    let mode = match row.opt_text("param_mode").map_err(&bad)?.as_deref() {
                        Some("OUT") => ParamMode::Out,
                        Some("IN/OUT") => ParamMode::InOut,
                        _ => ParamMode::In,
                    };
                    let name = row
                        .opt_text("param_name")
                        .map_err(&bad)?
                        .unwrap_or_else(|| format!("p{}", position));
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
    fn test_yes_no_flags_and_identity() {
        let conn = MemoryConnection::new(Dialect::Oracle).with_rows(
            "oracle_columns",
            &["HR", "EMPLOYEES"],
            vec![
                CatalogRow::new()
                    .with("column_name", "NAME")
                    .with("ordinal_position", 2i64)
                    .with("data_type", "VARCHAR2")
                    .with("is_nullable", "Y")
                    .with("column_default", "  ")
                    .with("is_identity", "NO")
                    .with("is_virtual", "NO"),
                CatalogRow::new()
                    .with("column_name", "ID")
                    .with("ordinal_position", 1i64)
                    .with("data_type", "NUMBER")
                    .with("is_nullable", "N")
                    .with("column_default", None::<&str>)
                    .with("is_identity", "YES")
                    .with("is_virtual", "NO"),
            ],
        );
        let columns = OracleLoader
            .list_columns(&ExecContext::new(), &conn, "HR", "EMPLOYEES")
            .unwrap();
        assert_eq!(columns[0].name, "ID");
        assert!(columns[0].is_generated);
        assert!(!columns[0].is_nullable);
        assert!(columns[1].is_nullable);
        assert_eq!(columns[1].default, None);
    }
}
