//! Result-shape and parameter-type inference
//!
//! Only as much SQL is understood as it takes to pair select-list items and
//! placeholders with catalog columns. Anything unrecognised is reported as
//! unknown and left for the caller to type with the fallback.

use crate::dialect::Dialect;
use crate::schema::{Column, Proc, Table};

use super::lexer::{tokenize, Token, TokenKind};
use super::slot_of;

/// Words that can never be a table or column alias
const RESERVED: &[&str] = &[
    "all", "and", "as", "asc", "between", "by", "case", "cross", "default", "desc", "distinct",
    "else", "end", "except", "false", "fetch", "for", "from", "full", "group", "having", "ilike",
    "in", "inner", "intersect", "into", "is", "join", "lateral", "left", "like", "limit", "natural",
    "not", "null", "offset", "on", "or", "order", "outer", "output", "returning", "right",
    "select", "set", "then", "true", "union", "using", "values", "when", "where", "window", "with",
];

/// Words that end a SELECT list at its own depth
const LIST_END: &[&str] = &[
    "from", "into", "where", "group", "having", "order", "limit", "offset", "fetch", "union",
    "except", "intersect", "window", "for",
];

const COMPARISON: &[&str] = &["=", "<>", "!=", "<", ">", "<=", ">="];

fn is_reserved(token: &Token<'_>) -> bool {
    token.kind == TokenKind::Word && RESERVED.iter().any(|k| token.text.eq_ignore_ascii_case(k))
}

fn is_name(token: &Token<'_>) -> bool {
    matches!(token.kind, TokenKind::Word | TokenKind::QuotedIdent) && !is_reserved(token)
}

fn is_comparison(token: &Token<'_>) -> bool {
    (token.kind == TokenKind::Operator && COMPARISON.contains(&token.text))
        || token.is_keyword("like")
        || token.is_keyword("ilike")
}

/// Tables and procs a query can refer to
pub(crate) struct Scope<'m> {
    pub dialect: Dialect,
    pub tables: &'m [Table],
    pub procs: &'m [Proc],
}

impl<'m> Scope<'m> {
    fn same(&self, a: &str, b: &str) -> bool {
        self.dialect.fold_identifier(a) == self.dialect.fold_identifier(b)
    }

    fn table(&self, name: &str) -> Option<&'m Table> {
        self.tables.iter().find(|t| self.same(&t.name, name))
    }

    fn column(&self, table: &'m Table, name: &str) -> Option<&'m Column> {
        table.columns.iter().find(|c| self.same(&c.name, name))
    }
}

/// A table named in FROM, JOIN, UPDATE or INTO
#[derive(Debug)]
struct TableRef<'m> {
    name: String,
    alias: Option<String>,
    table: Option<&'m Table>,
    depth: usize,
    /// Right side of a LEFT or FULL join
    nullable: bool,
    /// `name(...)`, a table function
    call: bool,
    /// Introduced by FROM or JOIN rather than UPDATE or INTO
    source: bool,
}

/// Where a result column's type comes from
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ColumnSource<'m> {
    Column { column: &'m Column, nullable: bool },
    Native { native_type: String, nullable: bool },
    Unknown,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct OutputColumn<'m> {
    pub name: Option<String>,
    pub source: ColumnSource<'m>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum InferredShape<'m> {
    Columns(Vec<OutputColumn<'m>>),
    /// `SELECT * FROM table`
    Table(String),
    /// `SELECT * FROM proc(...)`
    Proc(String),
    Unknown,
}

/// What a placeholder slot was compared with or assigned to
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ParamHint<'m> {
    Column(&'m Column),
    /// LIMIT / OFFSET style count
    Integer(&'static str),
}

/// Analysed form of one statement
pub(crate) struct Statement<'s> {
    sql: &'s str,
    tokens: Vec<Token<'s>>,
    depths: Vec<usize>,
}

impl<'s> Statement<'s> {
    pub fn new(sql: &'s str, dialect: Dialect) -> Self {
        let tokens: Vec<Token<'s>> = tokenize(sql, dialect).into_iter().filter(|t| !t.is_trivia()).collect();
        let mut depths = Vec::with_capacity(tokens.len());
        let mut depth = 0usize;
        for t in &tokens {
            if t.is_punct(')') {
                depth = depth.saturating_sub(1);
            }
            depths.push(depth);
            if t.is_punct('(') {
                depth += 1;
            }
        }
        Self { sql, tokens, depths }
    }

    /// Source text spanning tokens `from..to`
    fn text(&self, from: usize, to: usize) -> &'s str {
        match (self.tokens.get(from), to.checked_sub(1).and_then(|i| self.tokens.get(i))) {
            (Some(a), Some(b)) if from < to => &self.sql[a.offset..b.offset + b.text.len()],
            _ => "",
        }
    }

    /// Index of the `)` closing the `(` at `open`
    fn closing(&self, open: usize) -> Option<usize> {
        let depth = self.depths[open];
        (open + 1..self.tokens.len()).find(|&i| self.tokens[i].is_punct(')') && self.depths[i] == depth)
    }

    fn table_refs<'m>(&self, scope: &Scope<'m>) -> Vec<TableRef<'m>> {
        let toks = &self.tokens;
        let mut refs = Vec::new();
        for i in 0..toks.len() {
            let t = &toks[i];
            let from = t.is_keyword("from");
            let join = t.is_keyword("join");
            if !(from || join || t.is_keyword("update") || t.is_keyword("into")) {
                continue;
            }
            let source = from || join;
            let nullable = join && {
                let mut k = i;
                if k > 0 && toks[k - 1].is_keyword("outer") {
                    k -= 1;
                }
                k > 0 && (toks[k - 1].is_keyword("left") || toks[k - 1].is_keyword("full"))
            };

            let mut j = i + 1;
            loop {
                let Some(first) = toks.get(j).filter(|t| is_name(t)) else {
                    break;
                };
                let mut name = first.ident().unwrap_or_default();
                let depth = self.depths[j];
                j += 1;
                while j + 1 < toks.len() && toks[j].is_punct('.') && is_name(&toks[j + 1]) {
                    name = toks[j + 1].ident().unwrap_or_default();
                    j += 2;
                }
                let mut call = false;
                if source && toks.get(j).is_some_and(|t| t.is_punct('(')) {
                    call = true;
                    j = self.closing(j).map(|c| c + 1).unwrap_or(toks.len());
                }
                let mut alias = None;
                if toks.get(j).is_some_and(|t| t.is_keyword("as")) {
                    alias = toks.get(j + 1).and_then(|t| t.ident());
                    j += 2;
                } else if let Some(t) = toks.get(j).filter(|t| is_name(t)) {
                    alias = t.ident();
                    j += 1;
                }
                refs.push(TableRef {
                    table: if call { None } else { scope.table(&name) },
                    name,
                    alias,
                    depth,
                    nullable,
                    call,
                    source,
                });
                if from && toks.get(j).is_some_and(|t| t.is_punct(',')) {
                    j += 1;
                    continue;
                }
                break;
            }
        }
        refs
    }

    /// `name`, `q.name` or `s.q.name` spanning exactly `from..to`
    fn column_ref(&self, from: usize, to: usize) -> Option<(Option<String>, String)> {
        let toks = &self.tokens[from..to];
        match toks {
            [c] if is_name(c) => Some((None, c.ident()?)),
            [q, dot, c] if is_name(q) && dot.is_punct('.') && is_name(c) => Some((Some(q.ident()?), c.ident()?)),
            [_, d1, q, d2, c] if d1.is_punct('.') && is_name(q) && d2.is_punct('.') && is_name(c) => {
                Some((Some(q.ident()?), c.ident()?))
            }
            _ => None,
        }
    }

    /// Column reference ending just before `end`, longest form first
    fn column_ref_before(&self, end: usize) -> Option<(Option<String>, String)> {
        if end >= 3 {
            if let Some(r @ (Some(_), _)) = self.column_ref(end - 3, end) {
                return Some(r);
            }
        }
        if end >= 1 && !(end >= 2 && self.tokens[end - 2].is_punct('.')) {
            return self.column_ref(end - 1, end);
        }
        None
    }

    /// Column reference starting at `start`, longest form first
    fn column_ref_after(&self, start: usize) -> Option<(Option<String>, String)> {
        if start + 3 <= self.tokens.len() {
            if let Some(r @ (Some(_), _)) = self.column_ref(start, start + 3) {
                return Some(r);
            }
        }
        if start < self.tokens.len() && !self.tokens.get(start + 1).is_some_and(|t| t.is_punct('.')) {
            return self.column_ref(start, start + 1);
        }
        None
    }
}

fn resolve<'m>(
    scope: &Scope<'m>,
    refs: &[TableRef<'m>],
    qualifier: Option<&str>,
    name: &str,
) -> Option<(&'m Column, bool)> {
    match qualifier {
        Some(q) => {
            let r = refs.iter().find(|r| match &r.alias {
                Some(alias) => scope.same(alias, q),
                None => scope.same(&r.name, q),
            })?;
            let table = r.table?;
            scope.column(table, name).map(|c| (c, r.nullable))
        }
        None => refs
            .iter()
            .filter_map(|r| Some((r, r.table?)))
            .find_map(|(r, table)| scope.column(table, name).map(|c| (c, r.nullable))),
    }
}

/// Infer a result row shape from the SELECT or RETURNING list
///
/// A bare star over one table yields that table's shape; other stars expand
/// in FROM order, each table's columns in catalog ordinal order.
pub(crate) fn infer_result<'m>(sql: &str, scope: &Scope<'m>) -> InferredShape<'m> {
    let stmt = Statement::new(sql, scope.dialect);
    let refs = stmt.table_refs(scope);
    let toks = &stmt.tokens;

    let head = match toks.first() {
        Some(t) if t.is_keyword("with") => (1..toks.len()).find(|&i| {
            stmt.depths[i] == 0
                && ["select", "insert", "update", "delete"]
                    .iter()
                    .any(|k| toks[i].is_keyword(k))
        }),
        Some(_) => Some(0),
        None => None,
    };
    let Some(head) = head else {
        return InferredShape::Unknown;
    };

    let writes = ["insert", "update", "delete"].iter().any(|k| toks[head].is_keyword(k));
    let (start, end) = if writes {
        let Some(ret) = (head..toks.len()).find(|&i| stmt.depths[i] == 0 && toks[i].is_keyword("returning")) else {
            return InferredShape::Unknown;
        };
        let end = (ret..toks.len()).find(|&i| toks[i].is_punct(';')).unwrap_or(toks.len());
        (ret + 1, end)
    } else {
        let Some(select) = (head..toks.len()).find(|&i| stmt.depths[i] == 0 && toks[i].is_keyword("select")) else {
            return InferredShape::Unknown;
        };
        let end = (select + 1..toks.len())
            .find(|&i| {
                stmt.depths[i] == 0
                    && (toks[i].is_punct(';') || LIST_END.iter().any(|k| toks[i].is_keyword(k)))
            })
            .unwrap_or(toks.len());
        (skip_quantifiers(&stmt, select + 1, end), end)
    };

    // a bare star over a single source is that source's row
    let sources: Vec<&TableRef<'m>> = refs
        .iter()
        .filter(|r| r.depth == 0 && (writes || r.source))
        .collect();
    if end == start + 1 && toks[start].is_operator("*") {
        if let [only] = sources.as_slice() {
            if only.call && scope.procs.iter().any(|p| scope.same(&p.name, &only.name)) {
                return InferredShape::Proc(only.name.clone());
            }
            if let Some(table) = only.table {
                return InferredShape::Table(table.name.clone());
            }
        }
    }

    let mut items = Vec::new();
    let mut item_start = start;
    for i in start..=end {
        if i == end || (toks[i].is_punct(',') && stmt.depths[i] == 0) {
            if item_start < i {
                items.push((item_start, i));
            }
            item_start = i + 1;
        }
    }

    let mut columns = Vec::new();
    for (from, to) in items {
        match infer_item(&stmt, scope, &refs, &sources, from, to) {
            Some(mut cols) => columns.append(&mut cols),
            None => return InferredShape::Unknown,
        }
    }
    InferredShape::Columns(columns)
}

/// Skip DISTINCT, DISTINCT ON (...), ALL and TOP n
fn skip_quantifiers(stmt: &Statement<'_>, mut i: usize, end: usize) -> usize {
    let toks = &stmt.tokens;
    while i < end {
        if toks[i].is_keyword("distinct") {
            i += 1;
            if toks.get(i).is_some_and(|t| t.is_keyword("on")) && toks.get(i + 1).is_some_and(|t| t.is_punct('(')) {
                i = stmt.closing(i + 1).map(|c| c + 1).unwrap_or(end);
            }
        } else if toks[i].is_keyword("all") {
            i += 1;
        } else if toks[i].is_keyword("top") {
            i += 1;
            if toks.get(i).is_some_and(|t| t.is_punct('(')) {
                i = stmt.closing(i).map(|c| c + 1).unwrap_or(end);
            } else {
                i += 1;
            }
        } else {
            break;
        }
    }
    i.min(end)
}

/// One select-list item; `None` when a star cannot be expanded
fn infer_item<'m>(
    stmt: &Statement<'_>,
    scope: &Scope<'m>,
    refs: &[TableRef<'m>],
    sources: &[&TableRef<'m>],
    from: usize,
    to: usize,
) -> Option<Vec<OutputColumn<'m>>> {
    let toks = &stmt.tokens;
    let expand = |r: &TableRef<'m>| -> Option<Vec<OutputColumn<'m>>> {
        let table = r.table?;
        Some(
            table
                .columns
                .iter()
                .map(|c| OutputColumn {
                    name: Some(c.name.clone()),
                    source: ColumnSource::Column {
                        column: c,
                        nullable: c.is_nullable || r.nullable,
                    },
                })
                .collect(),
        )
    };

    if to == from + 1 && toks[from].is_operator("*") {
        let mut out = Vec::new();
        for r in sources {
            out.append(&mut expand(*r)?);
        }
        return Some(out);
    }
    if to == from + 3 && toks[from + 1].is_punct('.') && toks[from + 2].is_operator("*") {
        let q = toks[from].ident()?;
        let r = refs.iter().find(|r| match &r.alias {
            Some(alias) => scope.same(alias, &q),
            None => scope.same(&r.name, &q),
        })?;
        return expand(r);
    }

    // alias
    let (expr_end, alias) = if to - from >= 2 && toks[to - 2].is_keyword("as") {
        (to - 2, toks[to - 1].ident())
    } else if to - from >= 2
        && is_name(&toks[to - 1])
        && (is_name(&toks[to - 2])
            || toks[to - 2].is_punct(')')
            || matches!(toks[to - 2].kind, TokenKind::String | TokenKind::Number))
    {
        (to - 1, toks[to - 1].ident())
    } else {
        (to, None)
    };

    let column_source = |from: usize, to: usize| -> Option<(&'m Column, bool)> {
        let (q, name) = stmt.column_ref(from, to)?;
        resolve(scope, refs, q.as_deref(), &name)
    };

    let (name, source) = if let Some((column, nullable)) = column_source(from, expr_end) {
        (
            Some(column.name.clone()),
            ColumnSource::Column {
                column,
                nullable: column.is_nullable || nullable,
            },
        )
    } else if let Some(cast) = (from..expr_end)
        .rev()
        .find(|&i| toks[i].is_operator("::") && stmt.depths[i] == stmt.depths[from])
    {
        let inner = column_source(from, cast);
        cast_column(stmt.text(cast + 1, expr_end), inner)
    } else if toks[from].is_keyword("cast")
        && toks.get(from + 1).is_some_and(|t| t.is_punct('('))
        && stmt.closing(from + 1) == Some(expr_end - 1)
    {
        let depth = stmt.depths[from] + 1;
        match (from + 2..expr_end - 1).find(|&i| toks[i].is_keyword("as") && stmt.depths[i] == depth) {
            Some(as_at) => {
                let inner = column_source(from + 2, as_at);
                cast_column(stmt.text(as_at + 1, expr_end - 1), inner)
            }
            None => (None, ColumnSource::Unknown),
        }
    } else if toks[from].is_keyword("count")
        && toks.get(from + 1).is_some_and(|t| t.is_punct('('))
        && stmt.closing(from + 1) == Some(expr_end - 1)
    {
        (
            None,
            ColumnSource::Native {
                native_type: scope.dialect.integer_type().to_string(),
                nullable: false,
            },
        )
    } else {
        (None, ColumnSource::Unknown)
    };

    Some(vec![OutputColumn {
        name: alias.or(name),
        source,
    }])
}

fn cast_column<'m>(native_type: &str, inner: Option<(&'m Column, bool)>) -> (Option<String>, ColumnSource<'m>) {
    let source = ColumnSource::Native {
        native_type: native_type.to_string(),
        nullable: inner.map(|(c, n)| c.is_nullable || n).unwrap_or(true),
    };
    (inner.map(|(c, _)| c.name.clone()), source)
}

/// Pair placeholder slots with the columns they are compared with, assigned
/// to or inserted into. Index 0 of the result is slot 1.
pub(crate) fn infer_params<'m>(
    sql: &str,
    scope: &Scope<'m>,
    slots: usize,
    names: &[String],
) -> Vec<Option<ParamHint<'m>>> {
    let stmt = Statement::new(sql, scope.dialect);
    let refs = stmt.table_refs(scope);
    let toks = &stmt.tokens;
    let mut hints: Vec<Option<ParamHint<'m>>> = vec![None; slots];
    let inserted = insert_targets(&stmt, scope, &refs);

    let mut anonymous = 0;
    for p in 0..toks.len() {
        let TokenKind::Placeholder(placeholder) = &toks[p].kind else {
            continue;
        };
        let Some(slot) = slot_of(placeholder, &mut anonymous, names) else {
            continue;
        };
        if slot == 0 || slot > slots || hints[slot - 1].is_some() {
            continue;
        }
        hints[slot - 1] = param_hint(&stmt, scope, &refs, &inserted, p);
    }
    hints
}

fn param_hint<'m>(
    stmt: &Statement<'_>,
    scope: &Scope<'m>,
    refs: &[TableRef<'m>],
    inserted: &[(usize, &'m Column)],
    p: usize,
) -> Option<ParamHint<'m>> {
    let toks = &stmt.tokens;
    let column = |r: Option<(Option<String>, String)>| -> Option<ParamHint<'m>> {
        let (q, name) = r?;
        resolve(scope, refs, q.as_deref(), &name).map(|(c, _)| ParamHint::Column(c))
    };

    if let Some((_, c)) = inserted.iter().find(|(i, _)| *i == p) {
        return Some(ParamHint::Column(c));
    }
    let prev = p.checked_sub(1).map(|i| &toks[i]);
    if let Some(prev) = prev {
        if prev.is_keyword("limit") || prev.is_keyword("top") {
            return Some(ParamHint::Integer("limit"));
        }
        if prev.is_keyword("offset") {
            return Some(ParamHint::Integer("offset"));
        }
        if (prev.is_keyword("first") || prev.is_keyword("next")) && p >= 2 && toks[p - 2].is_keyword("fetch") {
            return Some(ParamHint::Integer("limit"));
        }
        if is_comparison(prev) {
            if let Some(hint) = column(stmt.column_ref_before(p - 1)) {
                return Some(hint);
            }
        }
        if prev.is_keyword("between") {
            return column(stmt.column_ref_before(p - 1));
        }
        if prev.is_keyword("and") && p >= 3 && toks[p - 3].is_keyword("between") {
            return column(stmt.column_ref_before(p - 3));
        }
    }
    if toks.get(p + 1).is_some_and(is_comparison) {
        if let Some(hint) = column(stmt.column_ref_after(p + 2)) {
            return Some(hint);
        }
    }

    // IN ( ..., p, ... )
    let depth = stmt.depths[p];
    if depth > 0 {
        let open = (0..p).rev().find(|&i| toks[i].is_punct('(') && stmt.depths[i] == depth - 1)?;
        if open >= 1 && toks[open - 1].is_keyword("in") {
            let end = if open >= 2 && toks[open - 2].is_keyword("not") { open - 2 } else { open - 1 };
            return column(stmt.column_ref_before(end));
        }
    }
    None
}

/// `INSERT INTO t (a, b) VALUES ($1, $2), ...`: placeholder index → column
fn insert_targets<'m>(stmt: &Statement<'_>, scope: &Scope<'m>, refs: &[TableRef<'m>]) -> Vec<(usize, &'m Column)> {
    let toks = &stmt.tokens;
    let mut out = Vec::new();
    let Some(into) = (0..toks.len()).find(|&i| toks[i].is_keyword("into") && i > 0 && toks[i - 1].is_keyword("insert")) else {
        return out;
    };
    let Some(table) = refs.iter().find(|r| !r.source).and_then(|r| r.table) else {
        return out;
    };
    let Some(open) = (into + 1..toks.len()).find(|&i| toks[i].is_punct('(')) else {
        return out;
    };
    let Some(close) = stmt.closing(open) else {
        return out;
    };
    let columns: Vec<Option<&'m Column>> = toks[open + 1..close]
        .iter()
        .filter(|t| !t.is_punct(','))
        .map(|t| t.ident().and_then(|name| scope.column(table, &name)))
        .collect();

    let Some(values) = (close + 1..toks.len()).find(|&i| toks[i].is_keyword("values")) else {
        return out;
    };
    let mut i = values + 1;
    while i < toks.len() && toks[i].is_punct('(') {
        let Some(tuple_end) = stmt.closing(i) else {
            break;
        };
        let depth = stmt.depths[i] + 1;
        let mut position = 0;
        let mut item_start = i + 1;
        for k in i + 1..=tuple_end {
            if k == tuple_end || (toks[k].is_punct(',') && stmt.depths[k] == depth) {
                if k == item_start + 1 && matches!(toks[item_start].kind, TokenKind::Placeholder(_)) {
                    if let Some(Some(column)) = columns.get(position) {
                        out.push((item_start, *column));
                    }
                }
                position += 1;
                item_start = k + 1;
            }
        }
        i = tuple_end + 1;
        if toks.get(i).is_some_and(|t| t.is_punct(',')) {
            i += 1;
        }
    }
    out
}
