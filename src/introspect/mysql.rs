use super::{
    group_enums, group_foreign_keys, group_indexes, group_procs, malformed, run_query, sort_columns,
    sort_tables, CatalogColumn, CatalogConnection, CatalogLoader, CatalogProc, CatalogProcParam,
    CatalogQuery, CatalogTable, ExecContext, ForeignKeyMember, IndexMember, ProcMember,
};
use crate::dialect::Dialect;
use crate::error::LoaderError;
use crate::schema::{EnumType, ForeignKey, Index, ParamMode, ProcKind, TableKind};

/// MySQL / MariaDB catalog loader, reads `information_schema`
///
/// MySQL enums are column-local. Each `enum(...)` column contributes an enum
/// named `<table>_<column>`, and that column's native type is the enum name.
#[derive(Debug, Default, Clone, Copy)]
pub struct MysqlLoader;

pub(crate) const TABLES: CatalogQuery = CatalogQuery {
    name: "mysql_tables",
    sql: r#"
        SELECT table_name AS table_name,
            CASE WHEN table_type = 'VIEW' THEN 'view' ELSE 'table' END AS table_kind
        FROM information_schema.tables
        WHERE table_schema = ?
        ORDER BY table_name
    "#,
};

pub(crate) const COLUMNS: CatalogQuery = CatalogQuery {
    name: "mysql_columns",
    sql: r#"
        SELECT column_name AS column_name, ordinal_position AS ordinal_position,
            data_type AS data_type, column_type AS column_type,
            is_nullable AS is_nullable, column_default AS column_default, extra AS extra
        FROM information_schema.columns
        WHERE table_schema = ? AND table_name = ?
        ORDER BY ordinal_position
    "#,
};

pub(crate) const INDEXES: CatalogQuery = CatalogQuery {
    name: "mysql_indexes",
    sql: r#"
        SELECT index_name AS index_name, non_unique AS non_unique,
            seq_in_index AS position, column_name AS column_name
        FROM information_schema.statistics
        WHERE table_schema = ? AND table_name = ? AND column_name IS NOT NULL
        ORDER BY index_name, seq_in_index
    "#,
};

pub(crate) const FOREIGN_KEYS: CatalogQuery = CatalogQuery {
    name: "mysql_foreign_keys",
    sql: r#"
        SELECT constraint_name AS foreign_key_name, column_name AS column_name,
            referenced_table_schema AS ref_schema, referenced_table_name AS ref_table_name,
            referenced_column_name AS ref_column_name, ordinal_position AS position
        FROM information_schema.key_column_usage
        WHERE table_schema = ? AND table_name = ? AND referenced_table_name IS NOT NULL
        ORDER BY constraint_name, ordinal_position
    "#,
};

pub(crate) const ENUMS: CatalogQuery = CatalogQuery {
    name: "mysql_enums",
    sql: r#"
        SELECT table_name AS table_name, column_name AS column_name, column_type AS column_type
        FROM information_schema.columns
        WHERE table_schema = ? AND data_type = 'enum'
        ORDER BY table_name, ordinal_position
    "#,
};

pub(crate) const PROCS: CatalogQuery = CatalogQuery {
    name: "mysql_procs",
    sql: r#"
        SELECT r.routine_name AS proc_name, r.specific_name AS proc_id,
            r.routine_type AS proc_kind, r.dtd_identifier AS return_type,
            p.parameter_name AS param_name, p.dtd_identifier AS param_type,
            p.parameter_mode AS param_mode, p.ordinal_position AS position
        FROM information_schema.routines r
        LEFT JOIN information_schema.parameters p
            ON p.specific_schema = r.routine_schema
            AND p.specific_name = r.specific_name
            AND p.ordinal_position > 0
        WHERE r.routine_schema = ?
        ORDER BY r.routine_name, p.ordinal_position
    "#,
};

impl CatalogLoader for MysqlLoader {
    fn dialect(&self) -> Dialect {
        Dialect::Mysql
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
            let name = row.text("column_name").map_err(&bad)?;
            let data_type = row.text("data_type").map_err(&bad)?;
            let native_type = if data_type.eq_ignore_ascii_case("enum") {
                enum_name(table, &name)
            } else {
                row.text("column_type").map_err(&bad)?
            };
            let extra = row
                .opt_text("extra")
                .map_err(&bad)?
                .unwrap_or_default()
                .to_lowercase();
            columns.push(CatalogColumn {
                ordinal: row.ordinal("ordinal_position").map_err(&bad)?,
                native_type,
                is_nullable: row.flag("is_nullable").map_err(&bad)?,
                default: row.opt_text("column_default").map_err(&bad)?,
                is_generated: extra.contains("auto_increment") || extra.contains("generated"),
                name,
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
            let index = row.text("index_name").map_err(&bad)?;
            members.push(IndexMember {
                is_primary: index == "PRIMARY",
                is_unique: !row.flag("non_unique").map_err(&bad)?,
                column: row.text("column_name").map_err(&bad)?,
                position: row.int("position").map_err(&bad)?,
                index,
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
                ref_column: row.opt_text("ref_column_name").map_err(&bad)?,
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
        let mut pairs = Vec::new();
        for row in rows {
            let name = enum_name(
                &row.text("table_name").map_err(&bad)?,
                &row.text("column_name").map_err(&bad)?,
            );
            let column_type = row.text("column_type").map_err(&bad)?;
            for label in parse_enum_labels(&column_type).map_err(&bad)? {
                pairs.push((name.clone(), label));
            }
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
            let kind = match row.text("proc_kind").map_err(&bad)?.to_uppercase().as_str() {
                "PROCEDURE" => ProcKind::Procedure,
                _ => ProcKind::Function,
            };
            let param = match row.opt_text("param_type").map_err(&bad)? {
                Some(native_type) => {
                    let position = row.int("position").map_err(&bad)?;
                    let mode = match row
                        .opt_text("param_mode")
                        .map_err(&bad)?
                        .unwrap_or_default()
                        .to_uppercase()
                        .as_str()
                    {
                        "OUT" => ParamMode::Out,
                        "INOUT" => ParamMode::InOut,
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
                return_type: match kind {
                    ProcKind::Function => row.opt_text("return_type").map_err(&bad)?,
                    ProcKind::Procedure => None,
                },
                kind,
                param,
            });
        }
        Ok(group_procs(members))
    }
}

fn enum_name(table: &str, column: &str) -> String {
    format!("{}_{}", table, column)
}

/// Labels of `enum('a','it''s','c')`, quotes undoubled
fn parse_enum_labels(column_type: &str) -> Result<Vec<String>, String> {
    let inner = column_type
        .trim()
        .strip_prefix("enum(")
        .or_else(|| column_type.trim().strip_prefix("ENUM("))
        .and_then(|s| s.strip_suffix(')'))
        .ok_or_else(|| format!("not an enum column type: {}", column_type))?;

    let mut labels = Vec::new();
    let mut chars = inner.chars().peekable();
    loop {
        match chars.next() {
            None => break,
            Some('\'') => {
                let mut label = String::new();
                loop {
                    match chars.next() {
                        Some('\'') if chars.peek() == Some(&'\'') => {
                            chars.next();
                            label.push('\'');
                        }
                        Some('\'') => break,
                        Some(c) => label.push(c),
                        None => return Err(format!("unterminated enum label in {}", column_type)),
                    }
                }
                labels.push(label);
            }
            Some(',') | Some(' ') => {}
            Some(c) => return Err(format!("unexpected '{}' in {}", c, column_type)),
        }
    }
    Ok(labels)
}
