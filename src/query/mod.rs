//! Annotated SQL query files
//!
//! A query file is ordinary SQL in which directive comments open named query
//! blocks:
//!
//! ```sql
//! -- name: ProductByID :one
//! -- param: id integer
//! SELECT * FROM products WHERE product_id = $1;
//! ```
//!
//! A block runs until the next `-- name:` line or the end of the file. The
//! `param`, `returns` and `doc` metadata lines are stripped from the captured
//! SQL; every other comment stays in the body. Directives are only recognized
//! in real line comments that start their line, never inside strings, quoted
//! identifiers or block comments.

use std::collections::HashMap;

use rayon::prelude::*;
use tracing::{debug, trace};

use crate::dialect::Dialect;
use crate::error::{AnnotationErrorKind, QueryAnnotationError, SqlweaveError};
use crate::schema::Cardinality;

pub(crate) mod infer;
pub(crate) mod lexer;

pub use lexer::Placeholder;

use lexer::{tokenize, Token, TokenKind};

/// One query file's text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuerySource {
    /// Logical identifier, used for ordering and error messages
    pub path: String,
    pub text: String,
}

impl QuerySource {
    pub fn new(path: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            text: text.into(),
        }
    }
}

/// How annotation failures affect the remaining files
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Abort on the first failing file
    #[default]
    FailFast,
    /// Drop failing files, keep parsing the rest and report every failure
    Accumulate,
}

/// A query parameter as written or as implied by a placeholder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamSpec {
    pub name: String,
    /// Native type from a `param` line
    pub native_type: Option<String>,
    /// Named by a `param` line or a named placeholder rather than generated
    pub explicit_name: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderStyle {
    Positional,
    Named,
}

/// Placeholders referenced by a query body
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlaceholderSet {
    pub style: Option<PlaceholderStyle>,
    /// Highest positional index, or the number of distinct names
    pub count: usize,
    /// Distinct named placeholders in first-appearance order
    pub names: Vec<String>,
}

/// A query block before it is checked against the catalog
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedQuery {
    pub name: String,
    pub cardinality: Cardinality,
    pub sql: String,
    /// 1-based line of the `name` directive
    pub line: usize,
    /// One entry per placeholder slot, in slot order
    pub params: Vec<ParamSpec>,
    pub placeholders: PlaceholderSet,
    /// Entity named by a `returns` directive
    pub returns: Option<String>,
    pub doc: Option<String>,
}

/// Queries parsed from one file, in appearance order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFile {
    pub path: String,
    pub queries: Vec<ParsedQuery>,
}

/// Result of parsing a batch of files
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedFiles {
    /// Successfully parsed files, sorted by path
    pub files: Vec<ParsedFile>,
    /// Failures of dropped files under [`ErrorPolicy::Accumulate`]
    pub errors: Vec<QueryAnnotationError>,
}

/// Map each 1-based slot to the name a placeholder occupies
pub(crate) fn slot_of(placeholder: &Placeholder, anonymous_seen: &mut usize, names: &[String]) -> Option<usize> {
    match placeholder {
        Placeholder::Positional(n) => Some(*n),
        Placeholder::Anonymous => {
            *anonymous_seen += 1;
            Some(*anonymous_seen)
        }
        Placeholder::Named(name) => names.iter().position(|n| n == name).map(|i| i + 1),
    }
}

/// Whether a statement binds its parameters by name
pub fn uses_named_placeholders(sql: &str, dialect: Dialect) -> bool {
    tokenize(sql, dialect)
        .iter()
        .any(|t| matches!(t.kind, TokenKind::Placeholder(Placeholder::Named(_))))
}

/// Parse many files concurrently; results are ordered by path
pub fn parse_query_files(
    sources: &[QuerySource],
    dialect: Dialect,
    policy: ErrorPolicy,
) -> Result<ParsedFiles, SqlweaveError> {
    let mut results: Vec<(String, Result<Vec<ParsedQuery>, QueryAnnotationError>)> = sources
        .par_iter()
        .map(|s| (s.path.clone(), parse_query_file(&s.path, &s.text, dialect)))
        .collect();
    results.sort_by(|a, b| a.0.cmp(&b.0));

    let mut parsed = ParsedFiles::default();
    for (path, result) in results {
        match result {
            Ok(queries) => parsed.files.push(ParsedFile { path, queries }),
            Err(e) => match policy {
                ErrorPolicy::FailFast => return Err(e.into()),
                ErrorPolicy::Accumulate => {
                    debug!(file = ?path, error = %e, "Dropping query file");
                    parsed.errors.push(e);
                }
            },
        }
    }
    Ok(parsed)
}

enum Directive {
    Name { name: String, cardinality: Cardinality },
    Param(ParamSpec),
    Returns(String),
    Doc(String),
}

/// A directive comment and the byte span of its whole line
struct DirectiveLine {
    directive: Directive,
    line: usize,
    start: usize,
    end: usize,
}

/// Parse one annotated file, scanning strings the way `dialect` does
pub fn parse_query_file(
    file: &str,
    text: &str,
    dialect: Dialect,
) -> Result<Vec<ParsedQuery>, QueryAnnotationError> {
    let line_starts = line_starts(text);
    let line_of = |offset: usize| line_starts.partition_point(|&s| s <= offset);
    let err = |line: usize, query: Option<&str>, kind: AnnotationErrorKind| QueryAnnotationError {
        file: file.to_string(),
        line,
        query: query.map(str::to_string),
        kind,
    };

    let tokens = tokenize(text, dialect);
    let mut directives: Vec<DirectiveLine> = Vec::new();
    for token in &tokens {
        if token.kind != TokenKind::LineComment || !starts_line(text, token.offset) {
            continue;
        }
        let line = line_of(token.offset);
        let directive = match parse_directive(token.text) {
            Ok(Some(d)) => d,
            Ok(None) => continue,
            Err(kind) => return Err(err(line, None, kind)),
        };
        let start = line_starts[line - 1];
        let end = line_starts.get(line).copied().unwrap_or(text.len());
        directives.push(DirectiveLine {
            directive,
            line,
            start,
            end,
        });
    }

    // nothing but comments may precede the first block
    let first_block = directives
        .iter()
        .find(|d| matches!(d.directive, Directive::Name { .. }))
        .map(|d| d.start)
        .unwrap_or(text.len());
    if let Some(stray) = tokens
        .iter()
        .find(|t| t.offset < first_block && !t.is_trivia())
    {
        return Err(err(line_of(stray.offset), None, AnnotationErrorKind::StrayStatement));
    }

    let mut queries: Vec<ParsedQuery> = Vec::new();
    let mut first_lines: HashMap<String, usize> = HashMap::new();
    let mut i = 0;
    while i < directives.len() {
        let (name, cardinality) = match &directives[i].directive {
            Directive::Name { name, cardinality } => (name.clone(), *cardinality),
            Directive::Param(_) => {
                return Err(err(directives[i].line, None, outside_block("param")));
            }
            Directive::Returns(_) => {
                return Err(err(directives[i].line, None, outside_block("returns")));
            }
            Directive::Doc(_) => {
                return Err(err(directives[i].line, None, outside_block("doc")));
            }
        };
        let line = directives[i].line;
        if let Some(first_line) = first_lines.get(&name) {
            return Err(err(
                line,
                Some(&name),
                AnnotationErrorKind::DuplicateName { first_line: *first_line },
            ));
        }
        first_lines.insert(name.clone(), line);

        let mut declared: Vec<ParamSpec> = Vec::new();
        let mut returns: Option<String> = None;
        let mut doc: Vec<String> = Vec::new();
        let mut sql = String::new();
        let mut cursor = directives[i].end;
        i += 1;
        while i < directives.len() {
            let d = &directives[i];
            match &d.directive {
                Directive::Name { .. } => break,
                Directive::Param(p) => {
                    if declared.iter().any(|q| q.name == p.name) {
                        return Err(err(
                            d.line,
                            Some(&name),
                            AnnotationErrorKind::MalformedDirective(format!(
                                "parameter '{}' declared twice",
                                p.name
                            )),
                        ));
                    }
                    declared.push(p.clone());
                }
                Directive::Returns(entity) => {
                    if returns.is_some() {
                        return Err(err(
                            d.line,
                            Some(&name),
                            AnnotationErrorKind::MalformedDirective("more than one returns directive".to_string()),
                        ));
                    }
                    returns = Some(entity.clone());
                }
                Directive::Doc(text) => doc.push(text.clone()),
            }
            sql.push_str(&text[cursor..d.start]);
            cursor = d.end;
            i += 1;
        }
        let block_end = directives.get(i).map(|d| d.start).unwrap_or(text.len());
        sql.push_str(&text[cursor..block_end]);
        let sql = sql.trim().to_string();

        let body = tokenize(&sql, dialect);
        if body.iter().all(|t| t.is_trivia()) {
            return Err(err(line, Some(&name), AnnotationErrorKind::EmptyBody));
        }
        let placeholders = collect_placeholders(&body).map_err(|kind| err(line, Some(&name), kind))?;
        let params = reconcile_params(declared, &placeholders).map_err(|kind| err(line, Some(&name), kind))?;
        trace!(query = ?name, cardinality = ?cardinality, params = ?params.len(), "Parsed query");

        queries.push(ParsedQuery {
            name,
            cardinality,
            sql,
            line,
            params,
            placeholders,
            returns,
            doc: if doc.is_empty() { None } else { Some(doc.join("\n")) },
        });
    }

    debug!(file = ?file, queries = ?queries.len(), "Parsed query file");
    Ok(queries)
}

fn outside_block(directive: &str) -> AnnotationErrorKind {
    AnnotationErrorKind::MalformedDirective(format!("'{}' outside of a query block", directive))
}

/// Byte offsets at which each line starts
fn line_starts(text: &str) -> Vec<usize> {
    std::iter::once(0)
        .chain(text.match_indices('\n').map(|(i, _)| i + 1))
        .collect()
}

/// Only whitespace precedes `offset` on its line
fn starts_line(text: &str, offset: usize) -> bool {
    text[..offset]
        .rsplit('\n')
        .next()
        .is_some_and(|prefix| prefix.trim().is_empty())
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    chars
        .next()
        .is_some_and(|c| c.is_alphabetic() || c == '_')
        && chars.all(|c| c.is_alphanumeric() || c == '_')
}

/// Recognize a directive in a `--` comment; ordinary comments give `None`
fn parse_directive(comment: &str) -> Result<Option<Directive>, AnnotationErrorKind> {
    let content = comment.trim_start_matches('-').trim();
    let (key, rest) = match content.split_once(':') {
        Some((key, rest)) => (key.trim(), rest.trim()),
        None => return Ok(None),
    };

    match key {
        "name" => {
            let mut parts = rest.split_whitespace();
            let (name, tag) = match (parts.next(), parts.next(), parts.next()) {
                (Some(name), Some(tag), None) => (name, tag),
                _ => {
                    return Err(AnnotationErrorKind::MalformedDirective(format!(
                        "expected 'name: <Name> :<cardinality>', got '{}'",
                        rest
                    )))
                }
            };
            if !is_identifier(name) {
                return Err(AnnotationErrorKind::MalformedDirective(format!(
                    "'{}' is not a valid query name",
                    name
                )));
            }
            let cardinality =
                Cardinality::from_tag(tag).ok_or_else(|| AnnotationErrorKind::UnknownCardinality(tag.to_string()))?;
            Ok(Some(Directive::Name {
                name: name.to_string(),
                cardinality,
            }))
        }
        "param" => {
            let (name, native_type) = match rest.split_once(char::is_whitespace) {
                Some((name, ty)) => (name, Some(ty.trim().to_string())),
                None => (rest, None),
            };
            if !is_identifier(name) {
                return Err(AnnotationErrorKind::MalformedDirective(format!(
                    "'{}' is not a valid parameter name",
                    name
                )));
            }
            Ok(Some(Directive::Param(ParamSpec {
                name: name.to_string(),
                native_type,
                explicit_name: true,
            })))
        }
        "returns" => {
            if rest.is_empty() || rest.contains(char::is_whitespace) {
                return Err(AnnotationErrorKind::MalformedDirective(format!(
                    "expected 'returns: <entity>', got '{}'",
                    rest
                )));
            }
            Ok(Some(Directive::Returns(rest.to_string())))
        }
        "doc" => Ok(Some(Directive::Doc(rest.to_string()))),
        _ => Ok(None),
    }
}

fn collect_placeholders(tokens: &[Token<'_>]) -> Result<PlaceholderSet, AnnotationErrorKind> {
    let mut set = PlaceholderSet::default();
    let mut anonymous = 0;
    for token in tokens {
        let placeholder = match &token.kind {
            TokenKind::Placeholder(p) => p,
            _ => continue,
        };
        let style = match placeholder {
            Placeholder::Named(_) => PlaceholderStyle::Named,
            _ => PlaceholderStyle::Positional,
        };
        if set.style.is_some_and(|s| s != style) {
            return Err(AnnotationErrorKind::MixedPlaceholders);
        }
        set.style = Some(style);
        match placeholder {
            Placeholder::Positional(n) => set.count = set.count.max(*n),
            Placeholder::Anonymous => {
                anonymous += 1;
                set.count = set.count.max(anonymous);
            }
            Placeholder::Named(name) => {
                if !set.names.contains(name) {
                    set.names.push(name.clone());
                    set.count = set.names.len();
                }
            }
        }
    }
    Ok(set)
}

/// Check declared parameters against the placeholders, or derive them
fn reconcile_params(declared: Vec<ParamSpec>, placeholders: &PlaceholderSet) -> Result<Vec<ParamSpec>, AnnotationErrorKind> {
    if declared.is_empty() {
        return Ok(match placeholders.style {
            Some(PlaceholderStyle::Named) => placeholders
                .names
                .iter()
                .map(|n| ParamSpec {
                    name: n.clone(),
                    native_type: None,
                    explicit_name: true,
                })
                .collect(),
            _ => (1..=placeholders.count)
                .map(|i| ParamSpec {
                    name: format!("p{}", i),
                    native_type: None,
                    explicit_name: false,
                })
                .collect(),
        });
    }

    if declared.len() != placeholders.count {
        return Err(AnnotationErrorKind::ParameterMismatch {
            declared: declared.len(),
            found: placeholders.count,
        });
    }
    if placeholders.style == Some(PlaceholderStyle::Named) {
        // named binds take their slot from the declaration order
        if let Some(unknown) = declared.iter().find(|p| !placeholders.names.contains(&p.name)) {
            return Err(AnnotationErrorKind::UnknownParameter(unknown.name.clone()));
        }
    }
    Ok(declared)
}
