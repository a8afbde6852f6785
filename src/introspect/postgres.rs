use tracing::trace;

use super::{
    group_enums, group_foreign_keys, group_indexes, group_procs, malformed, run_query, sort_columns,
    sort_tables, CatalogColumn, CatalogConnection, CatalogLoader, CatalogProc, CatalogProcParam,
    CatalogQuery, CatalogTable, ExecContext, ForeignKeyMember, IndexMember, ProcMember,
};
use crate::dialect::Dialect;
use crate::error::LoaderError;
use crate::schema::{EnumType, ForeignKey, Index, ParamMode, ProcKind, TableKind};

/// PostgreSQL catalog loader, reads `pg_catalog`
#[derive(Debug, Default, Clone, Copy)]
pub struct PostgresLoader;

pub(crate) const TABLES: CatalogQuery = CatalogQuery {
    name: "pg_tables",
    sql: r#"
        SELECT
            c.relname::text AS table_name,
            CASE WHEN c.relkind IN ('v', 'm') THEN 'view' ELSE 'table' END AS table_kind
        FROM pg_class c
        JOIN pg_namespace n ON n.oid = c.relnamespace
        WHERE c.relkind IN ('r', 'p', 'v', 'm')
            AND n.nspname = $1
        ORDER BY c.relname
    "#,
};

pub(crate) const COLUMNS: CatalogQuery = CatalogQuery {
    name: "pg_columns",
    sql: r#"
        SELECT
            a.attname::text AS column_name,
            format_type(a.atttypid, a.atttypmod) AS data_type,
            NOT a.attnotnull AS is_nullable,
            pg_get_expr(d.adbin, d.adrelid) AS default_value,
            (a.attidentity <> '' OR a.attgenerated <> '') AS is_identity,
            a.attnum::int8 AS ordinal_position
        FROM pg_attribute a
        JOIN pg_class c ON c.oid = a.attrelid
        JOIN pg_namespace n ON n.oid = c.relnamespace
        LEFT JOIN pg_attrdef d ON d.adrelid = c.oid AND d.adnum = a.attnum
        WHERE n.nspname = $1
            AND c.relname = $2
            AND a.attnum > 0
            AND NOT a.attisdropped
        ORDER BY a.attnum
    "#,
};

pub(crate) const INDEXES: CatalogQuery = CatalogQuery {
    name: "pg_indexes",
    sql: r#"
        SELECT
            ic.relname::text AS index_name,
            i.indisunique AS is_unique,
            i.indisprimary AS is_primary,
            a.attname::text AS column_name,
            k.ord::int8 AS position
        FROM pg_index i
        JOIN pg_class c ON c.oid = i.indrelid
        JOIN pg_namespace n ON n.oid = c.relnamespace
        JOIN pg_class ic ON ic.oid = i.indexrelid
        CROSS JOIN LATERAL unnest(i.indkey) WITH ORDINALITY AS k(attnum, ord)
        JOIN pg_attribute a ON a.attrelid = c.oid AND a.attnum = k.attnum
        WHERE n.nspname = $1
            AND c.relname = $2
        ORDER BY ic.relname, k.ord
    "#,
};

pub(crate) const FOREIGN_KEYS: CatalogQuery = CatalogQuery {
    name: "pg_foreign_keys",
    sql: r#"
        SELECT
            con.conname::text AS foreign_key_name,
            a.attname::text AS column_name,
            rn.nspname::text AS ref_schema,
            rc.relname::text AS ref_table_name,
            ra.attname::text AS ref_column_name,
            k.ord::int8 AS position
        FROM pg_constraint con
        JOIN pg_class c ON c.oid = con.conrelid
        JOIN pg_namespace n ON n.oid = c.relnamespace
        JOIN pg_class rc ON rc.oid = con.confrelid
        JOIN pg_namespace rn ON rn.oid = rc.relnamespace
        CROSS JOIN LATERAL unnest(con.conkey, con.confkey) WITH ORDINALITY AS k(attnum, refattnum, ord)
        JOIN pg_attribute a ON a.attrelid = con.conrelid AND a.attnum = k.attnum
        JOIN pg_attribute ra ON ra.attrelid = con.confrelid AND ra.attnum = k.refattnum
        WHERE con.contype = 'f'
            AND n.nspname = $1
            AND c.relname = $2
        ORDER BY con.conname, k.ord
    "#,
};

pub(crate) const ENUMS: CatalogQuery = CatalogQuery {
    name: "pg_enums",
    sql: r#"
        SELECT
            t.typname::text AS enum_name,
            e.enumlabel::text AS enum_value
        FROM pg_type t
        JOIN pg_enum e ON e.enumtypid = t.oid
        JOIN pg_namespace n ON n.oid = t.typnamespace
        WHERE n.nspname = $1
        ORDER BY t.typname, e.enumsortorder
    "#,
};

pub(crate) const PROCS: CatalogQuery = CatalogQuery {
    name: "pg_procs",
    sql: r#"
        SELECT
            p.proname::text AS proc_name,
            p.oid::int8 AS proc_id,
            CASE WHEN p.prokind = 'p' THEN 'procedure' ELSE 'function' END AS proc_kind,
            CASE WHEN p.prokind = 'p' THEN NULL ELSE format_type(p.prorettype, NULL) END AS return_type,
            COALESCE(a.name, '') AS param_name,
            format_type(a.type, NULL) AS param_type,
            COALESCE(a.mode, 'i') AS param_mode,
            a.ord::int8 AS position
        FROM pg_proc p
        JOIN pg_namespace n ON n.oid = p.pronamespace
        LEFT JOIN LATERAL unnest(
            COALESCE(p.proallargtypes, p.proargtypes::oid[]),
            p.proargmodes::text[],
            p.proargnames
        ) WITH ORDINALITY AS a(type, mode, name, ord) ON true
        WHERE n.nspname = $1
            AND p.prokind IN ('f', 'p')
        ORDER BY p.proname, p.oid, a.ord
    "#,
};

impl CatalogLoader for PostgresLoader {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
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
        trace!(tables = ?tables, "Tables found");
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
            let default = row.opt_text("default_value").map_err(&bad)?;
            let is_generated =
                row.flag("is_identity").map_err(&bad)? || is_auto_generated_column(&default);
            let column = CatalogColumn {
                name: row.text("column_name").map_err(&bad)?,
                ordinal: row.ordinal("ordinal_position").map_err(&bad)?,
                native_type: row.text("data_type").map_err(&bad)?,
                is_nullable: row.flag("is_nullable").map_err(&bad)?,
                default,
                is_generated,
            };
            trace!(
                column = ?column.name,
                data_type = ?column.native_type,
                is_nullable = ?column.is_nullable,
                is_generated = ?column.is_generated,
                "Parsed column"
            );
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
        ctx: &ExecContext,
        db: &dyn CatalogConnection,
        schema: &str,
    ) -> Result<Vec<EnumType>, LoaderError> {
        let rows = run_query(ctx, db, schema, &ENUMS, &[schema])?;
        let bad = malformed(schema, &ENUMS);
        let mut pairs = Vec::with_capacity(rows.len());
        for row in rows {
            pairs.push((
                row.text("enum_name").map_err(&bad)?,
                row.text("enum_value").map_err(&bad)?,
            ));
        }
        Ok(group_enums(schema, pairs))
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
                    let name = row.opt_text("param_name").map_err(&bad)?.unwrap_or_default();
                    let mode = param_mode(&row.text("param_mode").map_err(&bad)?);
                    Some((
                        position,
                        CatalogProcParam {
                            name: if name.is_empty() {
                                format!("p{}", position)
                            } else {
                                name
                            },
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
                return_type: row
                    .opt_text("return_type")
                    .map_err(&bad)?
                    .filter(|t| t != "void"),
                param,
            });
        }
        Ok(group_procs(members))
    }
}

/// `proargmodes` letters; table-function columns (`t`) behave as outputs
fn param_mode(mode: &str) -> ParamMode {
    match mode {
        "o" | "t" => ParamMode::Out,
        "b" => ParamMode::InOut,
        _ => ParamMode::In,
    }
}

/// Check if a column is auto-generated (SERIAL, BIGSERIAL, IDENTITY)
fn is_auto_generated_column(default_value: &Option<String>) -> bool {
    match default_value {
        Some(default) => {
            let lower = default.to_lowercase();
            // SERIAL/BIGSERIAL columns have nextval('sequence_name') as default
            lower.contains("nextval(")
                // IDENTITY columns
                || lower.contains("generated")
        }
        None => false,
    }
}
