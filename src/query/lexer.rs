//! Quote- and comment-aware SQL scanner
//!
//! The scanner only needs to be precise about where strings, quoted
//! identifiers, comments and placeholders begin and end. Everything else is
//! split into words, numbers, operator runs and single punctuation characters.

use crate::dialect::Dialect;

/// A bind marker found outside strings, identifiers and comments
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placeholder {
    /// `$N`, `?N` or `:N`
    Positional(usize),
    /// Bare `?`, numbered by appearance
    Anonymous,
    /// `:name` or `@name`
    Named(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TokenKind {
    Whitespace,
    LineComment,
    BlockComment,
    String,
    QuotedIdent,
    Word,
    Number,
    Placeholder(Placeholder),
    Operator,
    Punct,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Token<'a> {
    pub kind: TokenKind,
    pub text: &'a str,
    /// Byte offset into the scanned source
    pub offset: usize,
}

impl Token<'_> {
    pub fn is_trivia(&self) -> bool {
        matches!(
            self.kind,
            TokenKind::Whitespace | TokenKind::LineComment | TokenKind::BlockComment
        )
    }

    /// Identifier value of a word or quoted identifier, quotes removed
    pub fn ident(&self) -> Option<String> {
        match self.kind {
            TokenKind::Word => Some(self.text.to_string()),
            TokenKind::QuotedIdent => {
                let close = match self.text.chars().next() {
                    Some('"') => "\"",
                    Some('`') => "`",
                    _ => "]",
                };
                let inner = &self.text[1..];
                let inner = inner.strip_suffix(close).unwrap_or(inner);
                Some(inner.replace(&close.repeat(2), close))
            }
            _ => None,
        }
    }

    /// Case-insensitive keyword comparison for words
    pub fn is_keyword(&self, keyword: &str) -> bool {
        self.kind == TokenKind::Word && self.text.eq_ignore_ascii_case(keyword)
    }

    pub fn is_punct(&self, c: char) -> bool {
        self.kind == TokenKind::Punct && self.text.len() == c.len_utf8() && self.text.starts_with(c)
    }

    pub fn is_operator(&self, op: &str) -> bool {
        self.kind == TokenKind::Operator && self.text == op
    }
}

const OPERATOR_CHARS: &str = "=<>!~|&+-*/%^#";

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

/// Split `src` into tokens covering every byte
pub(crate) fn tokenize(src: &str, dialect: Dialect) -> Vec<Token<'_>> {
    let mut lexer = Lexer {
        src,
        pos: 0,
        backslash_escapes: dialect.backslash_escapes(),
    };
    let mut tokens = Vec::new();
    while lexer.pos < src.len() {
        let start = lexer.pos;
        let kind = lexer.next_kind(tokens.last());
        tokens.push(Token {
            kind,
            text: &src[start..lexer.pos],
            offset: start,
        });
    }
    tokens
}

struct Lexer<'a> {
    src: &'a str,
    pos: usize,
    /// `\` escapes the next character in every string literal
    backslash_escapes: bool,
}

impl<'a> Lexer<'a> {
    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn peek(&self, n: usize) -> Option<char> {
        self.rest().chars().nth(n)
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.rest().chars().next()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn bump_while(&mut self, pred: impl Fn(char) -> bool) {
        while let Some(c) = self.peek(0) {
            if !pred(c) {
                break;
            }
            self.bump();
        }
    }

    /// Character immediately before the current position
    fn prev_char(&self) -> Option<char> {
        self.src[..self.pos].chars().next_back()
    }

    fn next_kind(&mut self, prev: Option<&Token<'_>>) -> TokenKind {
        let c = match self.peek(0) {
            Some(c) => c,
            None => return TokenKind::Whitespace,
        };
        let next = self.peek(1);

        if c.is_whitespace() {
            self.bump_while(char::is_whitespace);
            return TokenKind::Whitespace;
        }
        if c == '-' && next == Some('-') {
            self.bump_while(|c| c != '\n');
            return TokenKind::LineComment;
        }
        if c == '/' && next == Some('*') {
            self.block_comment();
            return TokenKind::BlockComment;
        }
        match c {
            '\'' => {
                self.quoted('\'', self.backslash_escapes);
                TokenKind::String
            }
            '"' => {
                self.quoted('"', self.backslash_escapes);
                TokenKind::QuotedIdent
            }
            '`' => {
                self.quoted('`', false);
                TokenKind::QuotedIdent
            }
            // E'...' escape string
            'e' | 'E' if next == Some('\'') => {
                self.bump();
                self.quoted('\'', true);
                TokenKind::String
            }
            // [ident] quoting, but not array subscripts such as arr[$1]
            '[' if next.is_some_and(|n| is_ident_start(n) || n == ' ')
                && !prev.is_some_and(|t| {
                    matches!(t.kind, TokenKind::Word | TokenKind::QuotedIdent)
                        || t.is_punct(')')
                        || t.is_punct(']')
                }) =>
            {
                self.bump();
                self.bump_while(|c| c != ']');
                self.bump();
                TokenKind::QuotedIdent
            }
            '$' => self.dollar(),
            '?' => self.question(),
            ':' => self.colon(),
            '@' if next.is_some_and(is_ident_start) && self.prev_char() != Some('@') => {
                self.bump();
                let start = self.pos;
                self.bump_while(is_ident_char);
                TokenKind::Placeholder(Placeholder::Named(self.src[start..self.pos].to_string()))
            }
            c if is_ident_start(c) => {
                self.bump_while(is_ident_char);
                TokenKind::Word
            }
            c if c.is_ascii_digit() => {
                self.bump_while(|c| c.is_alphanumeric() || c == '.' || c == '_');
                TokenKind::Number
            }
            c if OPERATOR_CHARS.contains(c) => {
                self.bump();
                while let Some(c) = self.peek(0) {
                    let starts_comment = matches!(
                        (c, self.peek(1)),
                        ('-', Some('-')) | ('/', Some('*'))
                    );
                    if !OPERATOR_CHARS.contains(c) || starts_comment {
                        break;
                    }
                    self.bump();
                }
                TokenKind::Operator
            }
            _ => {
                self.bump();
                TokenKind::Punct
            }
        }
    }

    /// Quoted run closed by `quote`, doubled quotes escape
    fn quoted(&mut self, quote: char, backslash: bool) {
        self.bump();
        while let Some(c) = self.bump() {
            if backslash && c == '\\' {
                self.bump();
            } else if c == quote {
                if self.peek(0) == Some(quote) {
                    self.bump();
                } else {
                    return;
                }
            }
        }
    }

    /// Nested `/* */` comment
    fn block_comment(&mut self) {
        self.bump();
        self.bump();
        let mut depth = 1;
        while depth > 0 {
            match (self.bump(), self.peek(0)) {
                (None, _) => return,
                (Some('*'), Some('/')) => {
                    self.bump();
                    depth -= 1;
                }
                (Some('/'), Some('*')) => {
                    self.bump();
                    depth += 1;
                }
                _ => {}
            }
        }
    }

    /// `$N` placeholder or `$tag$ ... $tag$` dollar-quoted string
    fn dollar(&mut self) -> TokenKind {
        if self.peek(1).is_some_and(|c| c.is_ascii_digit()) {
            self.bump();
            let start = self.pos;
            self.bump_while(|c| c.is_ascii_digit());
            return positional(&self.src[start..self.pos]);
        }

        let tag_len = self.rest()[1..]
            .char_indices()
            .find(|&(i, c)| if i == 0 { !is_ident_start(c) } else { !is_ident_char(c) || c == '$' })
            .map(|(i, _)| i);
        if let Some(len) = tag_len {
            if self.rest()[1 + len..].starts_with('$') {
                let tag = &self.rest()[..len + 2];
                let body_start = self.pos + tag.len();
                self.pos = match self.src[body_start..].find(tag) {
                    Some(end) => body_start + end + tag.len(),
                    None => self.src.len(),
                };
                return TokenKind::String;
            }
        }
        self.bump();
        TokenKind::Punct
    }

    fn question(&mut self) -> TokenKind {
        self.bump();
        match self.peek(0) {
            Some(c) if c.is_ascii_digit() => {
                let start = self.pos;
                self.bump_while(|c| c.is_ascii_digit());
                positional(&self.src[start..self.pos])
            }
            // jsonb ?| and ?& operators
            Some('|') | Some('&') => {
                self.bump();
                TokenKind::Operator
            }
            _ => TokenKind::Placeholder(Placeholder::Anonymous),
        }
    }

    fn colon(&mut self) -> TokenKind {
        if self.peek(1) == Some(':') {
            self.bump();
            self.bump();
            return TokenKind::Operator;
        }
        let after_value = self
            .prev_char()
            .is_some_and(|p| is_ident_char(p) || matches!(p, ']' | ')' | '\'' | '"'));
        self.bump();
        match self.peek(0) {
            // array slices such as a[1:2] are not binds
            Some(c) if c.is_ascii_digit() && !after_value => {
                let start = self.pos;
                self.bump_while(|c| c.is_ascii_digit());
                positional(&self.src[start..self.pos])
            }
            Some(c) if is_ident_start(c) && !after_value => {
                let start = self.pos;
                self.bump_while(|c| c.is_alphanumeric() || c == '_');
                TokenKind::Placeholder(Placeholder::Named(self.src[start..self.pos].to_string()))
            }
            Some('=') => {
                self.bump();
                TokenKind::Operator
            }
            _ => TokenKind::Punct,
        }
    }
}

fn positional(digits: &str) -> TokenKind {
    match digits.parse() {
        Ok(n) => TokenKind::Placeholder(Placeholder::Positional(n)),
        Err(_) => TokenKind::Number,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn placeholders(src: &str) -> Vec<Placeholder> {
        placeholders_in(src, Dialect::Postgres)
    }

    fn placeholders_in(src: &str, dialect: Dialect) -> Vec<Placeholder> {
        tokenize(src, dialect)
            .into_iter()
            .filter_map(|t| match t.kind {
                TokenKind::Placeholder(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_tokens_cover_source() {
        let src = "SELECT 'a''b', \"x\"\"y\" -- c\n/* d /* e */ */ FROM t";
        let joined: String = tokenize(src, Dialect::Postgres).iter().map(|t| t.text).collect();
        assert_eq!(joined, src);
    }

    #[test]
    fn test_placeholders_inside_strings_ignored() {
        let src = "SELECT '$1', \"?\", $$ :x $$ FROM t WHERE a = $1 -- $2\n AND b = /* $3 */ $2";
        assert_eq!(
            placeholders(src),
            vec![Placeholder::Positional(1), Placeholder::Positional(2)]
        );
    }

    #[test]
    fn test_casts_and_operators_are_not_binds() {
        let src = "SELECT a::int, b @> c, d ?| e, f[1:2], x := 1 FROM t WHERE g = :name AND h = @id";
        assert_eq!(
            placeholders(src),
            vec![
                Placeholder::Named("name".to_string()),
                Placeholder::Named("id".to_string())
            ]
        );
    }

    #[test]
    fn test_question_marks() {
        assert_eq!(
            placeholders("VALUES (?, ?2, ?)"),
            vec![
                Placeholder::Anonymous,
                Placeholder::Positional(2),
                Placeholder::Anonymous
            ]
        );
    }

    #[test]
    fn test_tagged_dollar_quote() {
        let tokens = tokenize("SELECT $fn$ it's $1 $fn$, $1", Dialect::Postgres);
        assert_eq!(tokens[2].kind, TokenKind::String);
        assert_eq!(tokens[2].text, "$fn$ it's $1 $fn$");
        assert_eq!(
            tokens.last().map(|t| t.kind.clone()),
            Some(TokenKind::Placeholder(Placeholder::Positional(1)))
        );
    }

    #[test]
    fn test_quoted_ident_values() {
        let tokens: Vec<_> = tokenize("\"Order\"\"s\" [dbo] `tick`", Dialect::SqlServer)
            .into_iter()
            .filter(|t| !t.is_trivia())
            .collect();
        assert_eq!(tokens[0].ident().as_deref(), Some("Order\"s"));
        assert_eq!(tokens[1].ident().as_deref(), Some("dbo"));
        assert_eq!(tokens[2].ident().as_deref(), Some("tick"));
    }

    #[test]
    fn test_escape_string_backslash_quote() {
        let src = "SELECT E'it\\'s $1', e'\\\\' FROM t WHERE a = $1";
        let tokens: Vec<_> = tokenize(src, Dialect::Postgres)
            .into_iter()
            .filter(|t| !t.is_trivia())
            .collect();
        assert_eq!(tokens[1].kind, TokenKind::String);
        assert_eq!(tokens[1].text, "E'it\\'s $1'");
        assert_eq!(tokens[3].text, "e'\\\\'");
        assert_eq!(placeholders(src), vec![Placeholder::Positional(1)]);
    }

    #[test]
    fn test_standard_strings_keep_backslash_literal() {
        // 'a\' closes at the quote in standard SQL strings
        assert_eq!(
            placeholders("SELECT 'a\\' FROM t WHERE b = $1"),
            vec![Placeholder::Positional(1)]
        );
    }

    #[test]
    fn test_mysql_strings_honour_backslash_escapes() {
        let src = "SELECT 'It\\'s ?', \"say \\\"?\\\"\" FROM t WHERE id = ?";
        assert_eq!(placeholders_in(src, Dialect::Mysql), vec![Placeholder::Anonymous]);
    }
}
