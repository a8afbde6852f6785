//! Native type → target type mapping
//!
//! The mapping table is keyed by `(dialect, normalized native type)` and holds
//! scalar types only. Array-ness and nullability are layered on top of the
//! scalar entry. Every dialect carries a wildcard fallback so lookups are
//! total.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::Deserialize;
use tracing::{debug, error, trace};

use crate::dialect::Dialect;
use crate::error::{SqlweaveError, TypeMappingError, TypeMappingReason};
use crate::schema::TypeDescriptor;

/// Key for the per-dialect fallback entry
pub const WILDCARD: &str = "*";

/// What to do when a native type falls back
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FallbackPolicy {
    /// Resolve to the fallback and record a diagnostic
    #[default]
    Warn,
    /// Treat the first fallback as a fatal error
    Fail,
}

/// A target type and the import it needs
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TargetType {
    #[serde(rename = "type")]
    pub name: String,
    #[serde(default)]
    pub import: Option<String>,
}

impl TargetType {
    pub fn new(name: &str, import: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            import: import.map(str::to_string),
        }
    }
}

/// Externally supplied mapping table, `[dialect] native = { type, import }`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct TypeMapConfig {
    pub dialects: BTreeMap<String, BTreeMap<String, TargetType>>,
}

impl TypeMapConfig {
    pub fn from_toml_str(source: &str) -> Result<Self, SqlweaveError> {
        toml::from_str(source).map_err(|e| {
            error!(error = ?e, "Failed to parse type map");
            SqlweaveError::Config(format!("invalid type map: {}", e))
        })
    }

    pub fn load(path: &Path) -> Result<Self, SqlweaveError> {
        debug!(path = ?path, "Loading type map");
        let source = std::fs::read_to_string(path).map_err(|e| {
            SqlweaveError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&source)
    }
}

/// Outcome of one lookup: always a descriptor, plus the reason if it fell back
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub descriptor: TypeDescriptor,
    pub error: Option<TypeMappingError>,
}

/// Read-only mapping table for one run
#[derive(Debug, Clone)]
pub struct TypeMapper {
    entries: HashMap<Dialect, HashMap<String, TargetType>>,
    fallbacks: HashMap<Dialect, TargetType>,
}

impl TypeMapper {
    /// Built-in tables targeting Python type annotations
    pub fn builtin() -> Self {
        let mut mapper = Self {
            entries: HashMap::new(),
            fallbacks: HashMap::new(),
        };
        for dialect in Dialect::ALL {
            let table = mapper.entries.entry(dialect).or_default();
            for (native, target, import) in builtin_entries(dialect) {
                table.insert((*native).to_string(), TargetType::new(target, *import));
            }
            mapper
                .fallbacks
                .insert(dialect, TargetType::new("Any", Some("from typing import Any")));
        }
        mapper
    }

    /// Build strictly from configuration; each configured dialect needs `"*"`
    pub fn from_config(config: &TypeMapConfig) -> Result<Self, SqlweaveError> {
        let mut mapper = Self {
            entries: HashMap::new(),
            fallbacks: HashMap::new(),
        };
        mapper.apply(config, true)?;
        Ok(mapper)
    }

    /// Overlay a partial configuration on top of this mapper
    pub fn merge(mut self, config: &TypeMapConfig) -> Result<Self, SqlweaveError> {
        self.apply(config, false)?;
        Ok(self)
    }

    fn apply(&mut self, config: &TypeMapConfig, require_wildcard: bool) -> Result<(), SqlweaveError> {
        for (dialect_name, natives) in &config.dialects {
            let dialect: Dialect = dialect_name.parse()?;
            let table = self.entries.entry(dialect).or_default();
            for (native, target) in natives {
                if native == WILDCARD {
                    self.fallbacks.insert(dialect, target.clone());
                    continue;
                }
                let key = normalize(dialect, native)
                    .map(|n| n.base)
                    .map_err(|_| SqlweaveError::Config(format!("unparsable native type '{}'", native)))?;
                trace!(dialect = ?dialect, native = ?key, target = ?target.name, "Type map entry");
                table.insert(key, target.clone());
            }
            if require_wildcard && !self.fallbacks.contains_key(&dialect) {
                return Err(SqlweaveError::Config(format!(
                    "type map for {} has no '{}' fallback entry",
                    dialect, WILDCARD
                )));
            }
        }
        Ok(())
    }

    /// Resolve a native type. Never fails; unmapped types use the fallback.
    pub fn resolve(&self, dialect: Dialect, native: &str, nullable: bool) -> Resolved {
        match normalize(dialect, native) {
            Ok(norm) => match self.entries.get(&dialect).and_then(|t| t.get(&norm.base)) {
                Some(target) => Resolved {
                    descriptor: descriptor(target, nullable, norm.array, false),
                    error: None,
                },
                None => Resolved {
                    descriptor: descriptor(self.fallback(dialect), nullable, norm.array, true),
                    error: Some(TypeMappingError {
                        dialect,
                        native_type: norm.base,
                        reason: TypeMappingReason::Unmapped,
                    }),
                },
            },
            Err(()) => Resolved {
                descriptor: descriptor(self.fallback(dialect), nullable, false, true),
                error: Some(TypeMappingError {
                    dialect,
                    native_type: native.to_string(),
                    reason: TypeMappingReason::Unparsable,
                }),
            },
        }
    }

    /// The generic "untyped" representation for a dialect
    pub fn fallback(&self, dialect: Dialect) -> &TargetType {
        static ANY: std::sync::OnceLock<TargetType> = std::sync::OnceLock::new();
        self.fallbacks
            .get(&dialect)
            .unwrap_or_else(|| ANY.get_or_init(|| TargetType::new("Any", None)))
    }

    /// Fallback descriptor for values whose native type is unknown
    pub fn untyped(&self, dialect: Dialect, nullable: bool) -> TypeDescriptor {
        descriptor(self.fallback(dialect), nullable, false, true)
    }
}

impl Default for TypeMapper {
    fn default() -> Self {
        Self::builtin()
    }
}

fn descriptor(target: &TargetType, nullable: bool, array: bool, fallback: bool) -> TypeDescriptor {
    TypeDescriptor {
        target: target.name.clone(),
        import: target.import.clone(),
        nullable,
        array,
        fallback,
        enum_ref: None,
    }
}

/// A native type with modifiers stripped
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct NativeType {
    pub base: String,
    pub array: bool,
}

/// Lowercase, drop length/precision modifiers, schema qualifiers and quotes,
/// and peel array markers
///
/// `character varying(255)[]` → `character varying` (array),
/// `timestamp(3) with time zone` → `timestamp with time zone`,
/// `_int4` (postgres udt name) → `int4` (array).
pub(crate) fn normalize(dialect: Dialect, native: &str) -> Result<NativeType, ()> {
    let lower = native.trim().to_lowercase().replace('"', "");

    let mut stripped = String::with_capacity(lower.len());
    let mut depth = 0usize;
    for c in lower.chars() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.checked_sub(1).ok_or(())?,
            c if depth == 0 => stripped.push(c),
            _ => {}
        }
    }
    if depth != 0 {
        return Err(());
    }

    let mut base = stripped.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut array = false;
    while let Some(inner) = base.strip_suffix("[]") {
        array = true;
        base = inner.trim_end().to_string();
    }
    if dialect == Dialect::Postgres {
        if let Some(inner) = base.strip_prefix('_') {
            array = true;
            base = inner.to_string();
        }
        if let Some(inner) = base.strip_suffix(" array") {
            array = true;
            base = inner.to_string();
        }
    }
    if let Some((_, unqualified)) = base.rsplit_once('.') {
        base = unqualified.to_string();
    }

    if base.is_empty() {
        return Err(());
    }
    Ok(NativeType { base, array })
}

/// Strip quotes and schema qualification, keeping case
pub(crate) fn bare_type_name(native: &str) -> String {
    let unquoted = native.trim().replace('"', "");
    let unarrayed = unquoted.trim_end_matches("[]");
    unarrayed
        .rsplit_once('.')
        .map(|(_, n)| n)
        .unwrap_or(unarrayed)
        .to_string()
}

type Entry = (&'static str, &'static str, Option<&'static str>);

const DECIMAL: Option<&str> = Some("from decimal import Decimal");
const DATETIME: Option<&str> = Some("from datetime import datetime");
const DATE: Option<&str> = Some("from datetime import date");
const TIME: Option<&str> = Some("from datetime import time");
const TIMEDELTA: Option<&str> = Some("from datetime import timedelta");
const UUID: Option<&str> = Some("from uuid import UUID");
const ANY: Option<&str> = Some("from typing import Any");

fn builtin_entries(dialect: Dialect) -> &'static [Entry] {
    match dialect {
        Dialect::Postgres => &[
            ("smallint", "int", None),
            ("int2", "int", None),
            ("integer", "int", None),
            ("int", "int", None),
            ("int4", "int", None),
            ("bigint", "int", None),
            ("int8", "int", None),
            ("smallserial", "int", None),
            ("serial", "int", None),
            ("bigserial", "int", None),
            ("oid", "int", None),
            ("boolean", "bool", None),
            ("bool", "bool", None),
            ("text", "str", None),
            ("character varying", "str", None),
            ("varchar", "str", None),
            ("character", "str", None),
            ("char", "str", None),
            ("bpchar", "str", None),
            ("name", "str", None),
            ("citext", "str", None),
            ("real", "float", None),
            ("float4", "float", None),
            ("double precision", "float", None),
            ("float8", "float", None),
            ("numeric", "Decimal", DECIMAL),
            ("decimal", "Decimal", DECIMAL),
            ("money", "Decimal", DECIMAL),
            ("timestamp", "datetime", DATETIME),
            ("timestamp without time zone", "datetime", DATETIME),
            ("timestamp with time zone", "datetime", DATETIME),
            ("timestamptz", "datetime", DATETIME),
            ("date", "date", DATE),
            ("time", "time", TIME),
            ("time without time zone", "time", TIME),
            ("time with time zone", "time", TIME),
            ("timetz", "time", TIME),
            ("interval", "timedelta", TIMEDELTA),
            ("uuid", "UUID", UUID),
            ("json", "dict[str, Any]", ANY),
            ("jsonb", "dict[str, Any]", ANY),
            ("bytea", "bytes", None),
        ],
        Dialect::Sqlite => &[
            ("integer", "int", None),
            ("int", "int", None),
            ("tinyint", "int", None),
            ("smallint", "int", None),
            ("mediumint", "int", None),
            ("bigint", "int", None),
            ("int8", "int", None),
            ("boolean", "bool", None),
            ("bool", "bool", None),
            ("text", "str", None),
            ("varchar", "str", None),
            ("character varying", "str", None),
            ("char", "str", None),
            ("character", "str", None),
            ("nvarchar", "str", None),
            ("nchar", "str", None),
            ("clob", "str", None),
            ("real", "float", None),
            ("double", "float", None),
            ("double precision", "float", None),
            ("float", "float", None),
            ("numeric", "Decimal", DECIMAL),
            ("decimal", "Decimal", DECIMAL),
            ("date", "date", DATE),
            ("datetime", "datetime", DATETIME),
            ("timestamp", "datetime", DATETIME),
            ("blob", "bytes", None),
            ("json", "dict[str, Any]", ANY),
        ],
        Dialect::Mysql => &[
            ("tinyint", "int", None),
            ("smallint", "int", None),
            ("mediumint", "int", None),
            ("int", "int", None),
            ("integer", "int", None),
            ("bigint", "int", None),
            ("tinyint unsigned", "int", None),
            ("smallint unsigned", "int", None),
            ("mediumint unsigned", "int", None),
            ("int unsigned", "int", None),
            ("bigint unsigned", "int", None),
            ("year", "int", None),
            ("bit", "bool", None),
            ("bool", "bool", None),
            ("boolean", "bool", None),
            ("char", "str", None),
            ("varchar", "str", None),
            ("tinytext", "str", None),
            ("text", "str", None),
            ("mediumtext", "str", None),
            ("longtext", "str", None),
            ("float", "float", None),
            ("double", "float", None),
            ("real", "float", None),
            ("decimal", "Decimal", DECIMAL),
            ("numeric", "Decimal", DECIMAL),
            ("date", "date", DATE),
            ("datetime", "datetime", DATETIME),
            ("timestamp", "datetime", DATETIME),
            ("time", "time", TIME),
            ("json", "dict[str, Any]", ANY),
            ("binary", "bytes", None),
            ("varbinary", "bytes", None),
            ("tinyblob", "bytes", None),
            ("blob", "bytes", None),
            ("mediumblob", "bytes", None),
            ("longblob", "bytes", None),
        ],
        Dialect::SqlServer => &[
            ("tinyint", "int", None),
            ("smallint", "int", None),
            ("int", "int", None),
            ("bigint", "int", None),
            ("bit", "bool", None),
            ("char", "str", None),
            ("varchar", "str", None),
            ("nchar", "str", None),
            ("nvarchar", "str", None),
            ("text", "str", None),
            ("ntext", "str", None),
            ("real", "float", None),
            ("float", "float", None),
            ("decimal", "Decimal", DECIMAL),
            ("numeric", "Decimal", DECIMAL),
            ("money", "Decimal", DECIMAL),
            ("smallmoney", "Decimal", DECIMAL),
            ("date", "date", DATE),
            ("time", "time", TIME),
            ("datetime", "datetime", DATETIME),
            ("datetime2", "datetime", DATETIME),
            ("smalldatetime", "datetime", DATETIME),
            ("datetimeoffset", "datetime", DATETIME),
            ("uniqueidentifier", "UUID", UUID),
            ("binary", "bytes", None),
            ("varbinary", "bytes", None),
            ("image", "bytes", None),
        ],
        Dialect::Oracle => &[
            ("integer", "int", None),
            ("smallint", "int", None),
            ("number", "Decimal", DECIMAL),
            ("float", "float", None),
            ("binary_float", "float", None),
            ("binary_double", "float", None),
            ("char", "str", None),
            ("nchar", "str", None),
            ("varchar2", "str", None),
            ("nvarchar2", "str", None),
            ("clob", "str", None),
            ("nclob", "str", None),
            ("long", "str", None),
            ("date", "datetime", DATETIME),
            ("timestamp", "datetime", DATETIME),
            ("timestamp with time zone", "datetime", DATETIME),
            ("timestamp with local time zone", "datetime", DATETIME),
            ("blob", "bytes", None),
            ("raw", "bytes", None),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_modifiers() {
        let n = normalize(Dialect::Postgres, "character varying(255)").unwrap();
        assert_eq!(n.base, "character varying");
        assert!(!n.array);

        let n = normalize(Dialect::Postgres, "timestamp(3) with time zone").unwrap();
        assert_eq!(n.base, "timestamp with time zone");

        let n = normalize(Dialect::Mysql, "INT(11) UNSIGNED").unwrap();
        assert_eq!(n.base, "int unsigned");
    }

    #[test]
    fn test_normalize_arrays() {
        let n = normalize(Dialect::Postgres, "character varying(255)[]").unwrap();
        assert_eq!(n.base, "character varying");
        assert!(n.array);

        let n = normalize(Dialect::Postgres, "_int4").unwrap();
        assert_eq!(n.base, "int4");
        assert!(n.array);
    }

    #[test]
    fn test_normalize_unparsable() {
        assert!(normalize(Dialect::Postgres, "numeric(10,2").is_err());
        assert!(normalize(Dialect::Postgres, "  ").is_err());
    }

    #[test]
    fn test_resolve_mapped() {
        let mapper = TypeMapper::builtin();
        let r = mapper.resolve(Dialect::Postgres, "varchar(20)", true);
        assert_eq!(r.descriptor.target, "str");
        assert!(r.descriptor.nullable);
        assert!(!r.descriptor.fallback);
        assert!(r.error.is_none());
    }

    #[test]
    fn test_resolve_array_wraps_scalar() {
        let mapper = TypeMapper::builtin();
        let r = mapper.resolve(Dialect::Postgres, "integer[]", false);
        assert_eq!(r.descriptor.target, "int");
        assert!(r.descriptor.array);
    }

    #[test]
    fn test_resolve_unmapped_falls_back() {
        let mapper = TypeMapper::builtin();
        let r = mapper.resolve(Dialect::Postgres, "point", false);
        assert!(r.descriptor.fallback);
        assert_eq!(r.descriptor.target, "Any");
        assert_eq!(r.error.unwrap().to_string(), "unmapped type: point");
    }

    #[test]
    fn test_unparsable_falls_back() {
        let mapper = TypeMapper::builtin();
        let r = mapper.resolve(Dialect::Sqlite, "decimal(10", false);
        assert!(r.descriptor.fallback);
        assert_eq!(r.error.unwrap().reason, TypeMappingReason::Unparsable);
    }

    #[test]
    fn test_every_dialect_is_total() {
        let mapper = TypeMapper::builtin();
        for dialect in Dialect::ALL {
            let r = mapper.resolve(dialect, "definitely_not_a_type", false);
            assert!(!r.descriptor.target.is_empty());
        }
    }

    #[test]
    fn test_config_requires_wildcard() {
        let config = TypeMapConfig::from_toml_str(
            r#"
            [postgres]
            integer = { type = "i32" }
            "#,
        )
        .unwrap();
        let err = TypeMapper::from_config(&config).unwrap_err();
        assert!(err.to_string().contains("fallback"));
    }

    #[test]
    fn test_config_strict_and_merge() {
        let config = TypeMapConfig::from_toml_str(
            r#"
            [postgres]
            "*" = { type = "serde_json::Value" }
            integer = { type = "i32" }
            point = { type = "Point", import = "from geo import Point" }
            "#,
        )
        .unwrap();

        let strict = TypeMapper::from_config(&config).unwrap();
        assert_eq!(strict.resolve(Dialect::Postgres, "int4", false).descriptor.target, "serde_json::Value");
        assert_eq!(strict.resolve(Dialect::Postgres, "integer", false).descriptor.target, "i32");

        let merged = TypeMapper::builtin().merge(&config).unwrap();
        let point = merged.resolve(Dialect::Postgres, "point", false);
        assert_eq!(point.descriptor.target, "Point");
        assert_eq!(point.descriptor.import.as_deref(), Some("from geo import Point"));
        assert_eq!(merged.resolve(Dialect::Postgres, "text", false).descriptor.target, "str");
    }

    #[test]
    fn test_config_rejects_unknown_dialect() {
        let config = TypeMapConfig::from_toml_str(
            r#"
            [db2]
            "*" = { type = "Any" }
            "#,
        )
        .unwrap();
        assert!(TypeMapper::builtin().merge(&config).is_err());
    }

    #[test]
    fn test_bare_type_name() {
        assert_eq!(bare_type_name("public.\"Mood\""), "Mood");
        assert_eq!(bare_type_name("mood[]"), "mood");
    }
}
