//! Shallow lexical statement classification and the auto row-cap rewrite.
//!
//! This is not a parser. The lexer only knows enough SQL to step over
//! comments, string literals, quoted identifiers and dollar-quoted bodies,
//! and to track parenthesis depth. Anything it does not recognise is
//! classified as a write.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatementKind {
    Read,
    Write,
}

impl StatementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatementKind::Read => "read",
            StatementKind::Write => "write",
        }
    }
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Classification {
    pub kind: StatementKind,
    /// Upper-cased leading keyword of the deciding statement, empty when
    /// the text holds no statement at all.
    pub keyword: String,
}

const READ_KEYWORDS: &[&str] = &["SELECT", "WITH", "EXPLAIN", "SHOW", "VALUES", "TABLE"];
const DML_KEYWORDS: &[&str] = &["INSERT", "UPDATE", "DELETE", "MERGE"];
const CAPPABLE_KEYWORDS: &[&str] = &["SELECT", "WITH", "VALUES", "TABLE"];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TokenKind {
    Word,
    Quoted,
    Literal,
    Punct,
}

#[derive(Clone, Copy, Debug)]
struct Token<'a> {
    kind: TokenKind,
    text: &'a str,
    depth: u32,
    end: usize,
}

impl Token<'_> {
    fn is_word(&self, word: &str) -> bool {
        self.kind == TokenKind::Word && self.text.eq_ignore_ascii_case(word)
    }

    fn is_punct(&self, c: char) -> bool {
        self.kind == TokenKind::Punct && self.text.len() == 1 && self.text.starts_with(c)
    }
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b >= 0x80
}

fn skip_block_comment(bytes: &[u8], start: usize) -> usize {
    let mut depth = 0usize;
    let mut i = start;
    while i < bytes.len() {
        if bytes[i] == b'/' && bytes.get(i + 1) == Some(&b'*') {
            depth += 1;
            i += 2;
        } else if bytes[i] == b'*' && bytes.get(i + 1) == Some(&b'/') {
            depth -= 1;
            i += 2;
            if depth == 0 {
                return i;
            }
        } else {
            i += 1;
        }
    }
    bytes.len()
}

/// Returns the index just past the closing quote. A doubled quote is an
/// escaped quote; with `backslash` set, `\x` escapes too.
fn skip_quoted(bytes: &[u8], start: usize, quote: u8, backslash: bool) -> usize {
    let mut i = start + 1;
    while i < bytes.len() {
        let b = bytes[i];
        if backslash && b == b'\\' {
            i += 2;
            continue;
        }
        if b == quote {
            if bytes.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    bytes.len()
}

/// `$tag$ ... $tag$`; `None` when `$` does not open a dollar quote (e.g. `$1`).
fn skip_dollar_quoted(bytes: &[u8], start: usize) -> Option<usize> {
    let mut i = start + 1;
    if bytes.get(i).is_some_and(|b| b.is_ascii_digit()) {
        return None;
    }
    while i < bytes.len() && is_word_byte(bytes[i]) {
        i += 1;
    }
    if bytes.get(i) != Some(&b'$') {
        return None;
    }
    let tag = &bytes[start..=i];
    let body = i + 1;
    let close = bytes[body..]
        .windows(tag.len())
        .position(|window| window == tag)
        .map(|offset| body + offset + tag.len());
    Some(close.unwrap_or(bytes.len()))
}

fn tokenize(sql: &str) -> Vec<Token<'_>> {
    let bytes = sql.as_bytes();
    let mut tokens = Vec::new();
    let mut depth = 0u32;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b.is_ascii_whitespace() {
            i += 1;
            continue;
        }
        if b == b'-' && bytes.get(i + 1) == Some(&b'-') {
            while i < bytes.len() && bytes[i] != b'\n' {
                i += 1;
            }
            continue;
        }
        if b == b'/' && bytes.get(i + 1) == Some(&b'*') {
            i = skip_block_comment(bytes, i);
            continue;
        }
        let start = i;
        let kind = match b {
            b'\'' => {
                i = skip_quoted(bytes, i, b'\'', false);
                TokenKind::Literal
            }
            b'"' => {
                i = skip_quoted(bytes, i, b'"', false);
                TokenKind::Quoted
            }
            b'$' => match skip_dollar_quoted(bytes, i) {
                Some(end) => {
                    i = end;
                    TokenKind::Literal
                }
                None => {
                    i += 1;
                    while i < bytes.len() && bytes[i].is_ascii_digit() {
                        i += 1;
                    }
                    TokenKind::Literal
                }
            },
            b'(' => {
                tokens.push(Token {
                    kind: TokenKind::Punct,
                    text: &sql[i..i + 1],
                    depth,
                    end: i + 1,
                });
                depth += 1;
                i += 1;
                continue;
            }
            b')' => {
                depth = depth.saturating_sub(1);
                i += 1;
                TokenKind::Punct
            }
            c if is_word_byte(c) => {
                while i < bytes.len() && is_word_byte(bytes[i]) {
                    i += 1;
                }
                // E'...' strings take backslash escapes.
                if i - start == 1 && (c == b'E' || c == b'e') && bytes.get(i) == Some(&b'\'') {
                    i = skip_quoted(bytes, i, b'\'', true);
                    TokenKind::Literal
                } else {
                    TokenKind::Word
                }
            }
            _ => {
                i += 1;
                TokenKind::Punct
            }
        };
        tokens.push(Token {
            kind,
            text: &sql[start..i],
            depth,
            end: i,
        });
    }
    tokens
}

/// Splits at top-level `;`, dropping empty statements.
fn statements<'t, 'a>(tokens: &'t [Token<'a>]) -> Vec<&'t [Token<'a>]> {
    tokens
        .split(|token| token.depth == 0 && token.is_punct(';'))
        .filter(|statement| !statement.is_empty())
        .collect()
}

fn leading_keyword<'t, 'a>(statement: &'t [Token<'a>]) -> Option<(usize, &'t Token<'a>)> {
    statement
        .iter()
        .enumerate()
        .find(|(_, token)| !token.is_punct('('))
        .filter(|(_, token)| token.kind == TokenKind::Word)
}

/// Where the statement under an `EXPLAIN` starts, and whether it would be
/// executed (`ANALYZE`).
fn explain_target(statement: &[Token<'_>], after: usize) -> (usize, bool) {
    let mut i = after;
    let mut analyze = false;
    if statement.get(i).is_some_and(|t| t.is_punct('(')) {
        let depth = statement[i].depth;
        i += 1;
        while i < statement.len() && !(statement[i].is_punct(')') && statement[i].depth == depth) {
            let token = &statement[i];
            if token.is_word("ANALYZE") || token.is_word("ANALYSE") {
                let disabled = statement.get(i + 1).is_some_and(|next| {
                    next.is_word("FALSE") || next.is_word("OFF") || next.text == "0"
                });
                analyze = analyze || !disabled;
            }
            i += 1;
        }
        return (i + 1, analyze);
    }
    while let Some(token) = statement.get(i) {
        if token.is_word("ANALYZE") || token.is_word("ANALYSE") {
            analyze = true;
        } else if !token.is_word("VERBOSE") {
            break;
        }
        i += 1;
    }
    (i, analyze)
}

fn classify_statement(statement: &[Token<'_>]) -> Classification {
    let Some((index, first)) = leading_keyword(statement) else {
        return Classification {
            kind: StatementKind::Write,
            keyword: String::new(),
        };
    };
    let keyword = first.text.to_ascii_uppercase();
    if !READ_KEYWORDS.contains(&keyword.as_str()) {
        return Classification {
            kind: StatementKind::Write,
            keyword,
        };
    }
    if keyword == "EXPLAIN" {
        let (start, analyze) = explain_target(statement, index + 1);
        if analyze {
            let inner = classify_statement(statement.get(start..).unwrap_or(&[]));
            if inner.kind == StatementKind::Write {
                return inner;
            }
        }
        return Classification {
            kind: StatementKind::Read,
            keyword,
        };
    }
    let rest = &statement[index..];
    // Data-modifying CTEs; a `FOR UPDATE` inside one errs toward write too.
    if keyword == "WITH" {
        if let Some(dml) = rest
            .iter()
            .find(|t| DML_KEYWORDS.iter().any(|k| t.is_word(k)))
        {
            return Classification {
                kind: StatementKind::Write,
                keyword: dml.text.to_ascii_uppercase(),
            };
        }
    }
    // SELECT ... INTO creates a table.
    if (keyword == "SELECT" || keyword == "WITH")
        && rest.iter().any(|t| t.depth == first.depth && t.is_word("INTO"))
    {
        return Classification {
            kind: StatementKind::Write,
            keyword: "SELECT INTO".to_string(),
        };
    }
    Classification {
        kind: StatementKind::Read,
        keyword,
    }
}

/// Number of non-empty statements in `sql`, ignoring `;` inside quotes,
/// comments and parentheses.
pub fn statement_count(sql: &str) -> usize {
    statements(&tokenize(sql)).len()
}

/// Classifies `sql`. A batch is a read only if every statement in it is.
pub fn classify(sql: &str) -> Classification {
    let tokens = tokenize(sql);
    let statements = statements(&tokens);
    let mut first_read = None;
    for statement in &statements {
        let classification = classify_statement(statement);
        if classification.kind == StatementKind::Write {
            return classification;
        }
        first_read.get_or_insert(classification);
    }
    first_read.unwrap_or(Classification {
        kind: StatementKind::Write,
        keyword: String::new(),
    })
}

/// How a row cap applies to a read.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RowCap {
    /// The statement rewritten to request at most `limit + 1` rows.
    Rewritten(String),
    /// Sent as written; the result is trimmed after the fact.
    TrimOnly,
    /// The statement carries its own `LIMIT n` or `FETCH`.
    SelfLimited,
}

/// Decides how an unlimited read is capped at `limit` rows.
///
/// A single plain query gets ` LIMIT limit+1` appended (after any top-level
/// locking clause), and `LIMIT ALL` / `LIMIT NULL` get their argument
/// replaced. Batches and other reads are trimmed once the rows are back.
pub fn apply_row_cap(sql: &str, limit: u32) -> RowCap {
    let tokens = tokenize(sql);
    let statements = statements(&tokens);
    let [statement] = statements.as_slice() else {
        return RowCap::TrimOnly;
    };
    let Some((_, first)) = leading_keyword(statement) else {
        return RowCap::TrimOnly;
    };
    if !CAPPABLE_KEYWORDS.iter().any(|k| first.is_word(k))
        || classify_statement(statement).kind != StatementKind::Read
    {
        return RowCap::TrimOnly;
    }
    let capped = u64::from(limit) + 1;
    for (i, token) in statement.iter().enumerate() {
        if token.depth != 0 {
            continue;
        }
        if token.is_word("FETCH") {
            return RowCap::SelfLimited;
        }
        if token.is_word("LIMIT") {
            return match statement.get(i + 1) {
                Some(arg) if arg.is_word("ALL") || arg.is_word("NULL") => {
                    let start = arg.end - arg.text.len();
                    RowCap::Rewritten(format!("{}{capped}{}", &sql[..start], &sql[arg.end..]))
                }
                _ => RowCap::SelfLimited,
            };
        }
    }
    match statement.last() {
        Some(last) => RowCap::Rewritten(format!("{} LIMIT {capped}", &sql[..last.end])),
        None => RowCap::TrimOnly,
    }
}
