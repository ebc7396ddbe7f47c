#![forbid(unsafe_code)]

//! Row filters written as text, e.g. `price > 3.5 and (region == "east" or qty != null)`.
//!
//! `and` binds tighter than `or`; parentheses group. A comparison is always
//! `column op value` where the value is a number, a quoted string, `nan` or
//! `null`. Keywords are case-insensitive; names that are not plain identifiers
//! go in backticks.

use std::fmt;
use std::iter::Peekable;
use std::str::CharIndices;

use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tf_columnar::{ComparisonOp, Series};
use tf_frame::{DataFrame, FrameError};
use tf_types::{ErrorKind, ErrorRecord, Scalar, format_f64};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Literal {
    Int(i64),
    Float(f64),
    Nan,
    Null,
    Str(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Expr {
    Or {
        left: Box<Expr>,
        right: Box<Expr>,
    },
    And {
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Compare {
        column: String,
        op: ComparisonOp,
        value: Literal,
    },
}

impl Expr {
    /// Referenced column names in source order, repeats included.
    #[must_use]
    pub fn columns(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Self::Or { left, right } | Self::And { left, right } => {
                left.collect_columns(out);
                right.collect_columns(out);
            }
            Self::Compare { column, .. } => out.push(column),
        }
    }
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("expected {expected} at byte {offset}, found {found}")]
    Syntax {
        offset: usize,
        expected: &'static str,
        found: String,
    },
    #[error("unterminated {what} starting at byte {offset}")]
    Unterminated { offset: usize, what: &'static str },
    #[error("invalid number '{text}' at byte {offset}")]
    Number { offset: usize, text: String },
    #[error("unknown column '{0}' in query")]
    UnknownColumn(String),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

impl QueryError {
    /// Byte offset of the construct that could not be consumed.
    #[must_use]
    pub fn offset(&self) -> Option<usize> {
        match self {
            Self::Syntax { offset, .. }
            | Self::Unterminated { offset, .. }
            | Self::Number { offset, .. } => Some(*offset),
            _ => None,
        }
    }
}

impl ErrorRecord for QueryError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Frame(err) => err.kind(),
            _ => ErrorKind::InvalidArgument,
        }
    }
}

// ── Lexer ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    Op(ComparisonOp),
    And,
    Or,
    Nan,
    Null,
    LeftParen,
    RightParen,
    Eof,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ident(name) => write!(f, "column `{name}`"),
            Self::Int(v) => write!(f, "number {v}"),
            Self::Float(v) => write!(f, "number {}", format_f64(*v)),
            Self::Str(v) => write!(f, "string {v:?}"),
            Self::Op(op) => write!(f, "'{}'", op.symbol()),
            Self::And => f.write_str("'and'"),
            Self::Or => f.write_str("'or'"),
            Self::Nan => f.write_str("'nan'"),
            Self::Null => f.write_str("'null'"),
            Self::LeftParen => f.write_str("'('"),
            Self::RightParen => f.write_str("')'"),
            Self::Eof => f.write_str("end of input"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Spanned {
    token: Token,
    offset: usize,
}

struct Lexer<'a> {
    input: &'a str,
    chars: Peekable<CharIndices<'a>>,
}

impl<'a> Lexer<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input,
            chars: input.char_indices().peekable(),
        }
    }

    fn tokenize(mut self) -> Result<Vec<Spanned>, QueryError> {
        let mut tokens = Vec::new();
        loop {
            let spanned = self.next_token()?;
            let done = spanned.token == Token::Eof;
            tokens.push(spanned);
            if done {
                return Ok(tokens);
            }
        }
    }

    fn peek_char(&mut self) -> Option<char> {
        self.chars.peek().map(|&(_, ch)| ch)
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.peek_char() == Some(expected) {
            self.chars.next();
            true
        } else {
            false
        }
    }

    fn next_token(&mut self) -> Result<Spanned, QueryError> {
        while self.peek_char().is_some_and(char::is_whitespace) {
            self.chars.next();
        }
        let Some(&(offset, ch)) = self.chars.peek() else {
            return Ok(Spanned {
                token: Token::Eof,
                offset: self.input.len(),
            });
        };
        let token = match ch {
            '(' => {
                self.chars.next();
                Token::LeftParen
            }
            ')' => {
                self.chars.next();
                Token::RightParen
            }
            '=' | '!' => {
                self.chars.next();
                if !self.eat('=') {
                    return Err(QueryError::Syntax {
                        offset,
                        expected: "a comparison operator",
                        found: format!("'{ch}'"),
                    });
                }
                Token::Op(if ch == '=' {
                    ComparisonOp::Eq
                } else {
                    ComparisonOp::Ne
                })
            }
            '<' => {
                self.chars.next();
                Token::Op(if self.eat('=') {
                    ComparisonOp::Le
                } else {
                    ComparisonOp::Lt
                })
            }
            '>' => {
                self.chars.next();
                Token::Op(if self.eat('=') {
                    ComparisonOp::Ge
                } else {
                    ComparisonOp::Gt
                })
            }
            '\'' | '"' => self.read_string(offset, ch)?,
            '`' => self.read_backtick(offset)?,
            '-' | '.' | '0'..='9' => self.read_number(offset)?,
            c if c.is_alphabetic() || c == '_' => self.read_word(offset),
            other => {
                return Err(QueryError::Syntax {
                    offset,
                    expected: "a column, value or operator",
                    found: format!("'{other}'"),
                });
            }
        };
        Ok(Spanned { token, offset })
    }

    fn read_string(&mut self, offset: usize, quote: char) -> Result<Token, QueryError> {
        self.chars.next();
        let mut value = String::new();
        while let Some((_, ch)) = self.chars.next() {
            match ch {
                c if c == quote => return Ok(Token::Str(value)),
                '\\' => match self.chars.next() {
                    Some((_, 'n')) => value.push('\n'),
                    Some((_, 't')) => value.push('\t'),
                    Some((_, 'r')) => value.push('\r'),
                    Some((_, escaped)) => value.push(escaped),
                    None => break,
                },
                c => value.push(c),
            }
        }
        Err(QueryError::Unterminated {
            offset,
            what: "string literal",
        })
    }

    fn read_backtick(&mut self, offset: usize) -> Result<Token, QueryError> {
        self.chars.next();
        let mut name = String::new();
        for (_, ch) in self.chars.by_ref() {
            if ch == '`' {
                return Ok(Token::Ident(name));
            }
            name.push(ch);
        }
        Err(QueryError::Unterminated {
            offset,
            what: "quoted column name",
        })
    }

    fn read_number(&mut self, offset: usize) -> Result<Token, QueryError> {
        let mut text = String::new();
        let mut integral = true;
        if self.eat('-') {
            text.push('-');
        }
        while let Some(ch) = self.peek_char() {
            match ch {
                '0'..='9' => text.push(ch),
                '.' => {
                    integral = false;
                    text.push(ch);
                }
                'e' | 'E' => {
                    integral = false;
                    text.push(ch);
                    self.chars.next();
                    if let Some(sign @ ('+' | '-')) = self.peek_char() {
                        text.push(sign);
                    } else {
                        continue;
                    }
                }
                _ => break,
            }
            self.chars.next();
        }
        let invalid = || QueryError::Number {
            offset,
            text: text.clone(),
        };
        if integral && let Ok(value) = text.parse::<i64>() {
            return Ok(Token::Int(value));
        }
        match text.parse::<f64>() {
            Ok(value) if value.is_finite() => Ok(Token::Float(value)),
            _ => Err(invalid()),
        }
    }

    fn read_word(&mut self, offset: usize) -> Token {
        let mut end = offset;
        while let Some(&(idx, ch)) = self.chars.peek() {
            if ch.is_alphanumeric() || ch == '_' {
                end = idx + ch.len_utf8();
                self.chars.next();
            } else {
                break;
            }
        }
        let word = &self.input[offset..end];
        match word.to_ascii_lowercase().as_str() {
            "and" => Token::And,
            "or" => Token::Or,
            "nan" => Token::Nan,
            "null" => Token::Null,
            _ => Token::Ident(word.to_owned()),
        }
    }
}

// ── Parser ─────────────────────────────────────────────────────────────

struct Parser {
    tokens: Vec<Spanned>,
    position: usize,
}

impl Parser {
    fn peek(&self) -> &Spanned {
        // The token stream always ends with Eof, and `advance` never moves past it.
        &self.tokens[self.position.min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> Spanned {
        let token = self.peek().clone();
        if token.token != Token::Eof {
            self.position += 1;
        }
        token
    }

    fn unexpected(&self, expected: &'static str) -> QueryError {
        let at = self.peek();
        QueryError::Syntax {
            offset: at.offset,
            expected,
            found: at.token.to_string(),
        }
    }

    fn parse_query(&mut self) -> Result<Expr, QueryError> {
        let expr = self.parse_or()?;
        if self.peek().token != Token::Eof {
            return Err(self.unexpected("'and', 'or' or end of input"));
        }
        Ok(expr)
    }

    fn parse_or(&mut self) -> Result<Expr, QueryError> {
        let mut left = self.parse_and()?;
        while self.peek().token == Token::Or {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::Or {
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, QueryError> {
        let mut left = self.parse_term()?;
        while self.peek().token == Token::And {
            self.advance();
            let right = self.parse_term()?;
            left = Expr::And {
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_term(&mut self) -> Result<Expr, QueryError> {
        if self.peek().token == Token::LeftParen {
            self.advance();
            let inner = self.parse_or()?;
            if self.peek().token != Token::RightParen {
                return Err(self.unexpected("')'"));
            }
            self.advance();
            return Ok(inner);
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, QueryError> {
        let Token::Ident(column) = self.peek().token.clone() else {
            return Err(self.unexpected("a column name or '('"));
        };
        self.advance();
        let Token::Op(op) = self.peek().token else {
            return Err(self.unexpected("a comparison operator"));
        };
        self.advance();
        let value = match self.peek().token.clone() {
            Token::Int(v) => Literal::Int(v),
            Token::Float(v) => Literal::Float(v),
            Token::Str(v) => Literal::Str(v),
            Token::Nan => Literal::Nan,
            Token::Null => Literal::Null,
            _ => return Err(self.unexpected("a number, string, 'nan' or 'null'")),
        };
        self.advance();
        Ok(Expr::Compare { column, op, value })
    }
}

/// Parse query text into an expression tree.
pub fn parse(text: &str) -> Result<Expr, QueryError> {
    let tokens = Lexer::new(text).tokenize()?;
    Parser {
        tokens,
        position: 0,
    }
    .parse_query()
}

// ── Evaluation ─────────────────────────────────────────────────────────

fn compare_literal(series: &Series, op: ComparisonOp, value: &Literal) -> Vec<bool> {
    let rows = 0..series.len();
    match value {
        Literal::Null => match op {
            ComparisonOp::Eq => series.isna(),
            ComparisonOp::Ne => series.notna(),
            _ => vec![false; series.len()],
        },
        // Utf8 cells read as None here, so `!= nan` never selects strings.
        Literal::Nan => rows
            .map(|row| match (op, series.get_f64(row)) {
                (ComparisonOp::Eq, Some(v)) => v.is_nan(),
                (ComparisonOp::Ne, Some(v)) => !v.is_nan(),
                _ => false,
            })
            .collect(),
        Literal::Int(v) => series.compare_scalar(op, &Scalar::Int64(*v)),
        Literal::Float(v) => series.compare_scalar(op, &Scalar::Float64(*v)),
        Literal::Str(v) => series.compare_scalar(op, &Scalar::Utf8(v.clone())),
    }
}

/// Evaluate `expr` to one boolean per row of `frame`.
pub fn evaluate(frame: &DataFrame, expr: &Expr) -> Result<Vec<bool>, QueryError> {
    match expr {
        Expr::Compare { column, op, value } => {
            let series = frame
                .column(column)
                .map_err(|_| QueryError::UnknownColumn(column.clone()))?;
            Ok(compare_literal(series, *op, value))
        }
        Expr::And { left, right } => {
            let mut mask = evaluate(frame, left)?;
            for (keep, other) in mask.iter_mut().zip(evaluate(frame, right)?) {
                *keep &= other;
            }
            Ok(mask)
        }
        Expr::Or { left, right } => {
            let mut mask = evaluate(frame, left)?;
            for (keep, other) in mask.iter_mut().zip(evaluate(frame, right)?) {
                *keep |= other;
            }
            Ok(mask)
        }
    }
}

/// Matches `df.query(text)`: the rows of `frame` for which `text` holds.
pub fn query(frame: &DataFrame, text: &str) -> Result<DataFrame, QueryError> {
    let expr = parse(text)?;
    let mask = evaluate(frame, &expr)?;
    let kept = mask.iter().filter(|keep| **keep).count();
    debug!("query {text:?} kept {kept} of {} rows", frame.num_rows());
    Ok(frame.filter_mask(&mask)?)
}

// ── Rendering ──────────────────────────────────────────────────────────

fn is_plain_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let starts_well = chars
        .next()
        .is_some_and(|c| c.is_alphabetic() || c == '_');
    starts_well
        && chars.all(|c| c.is_alphanumeric() || c == '_')
        && !matches!(
            name.to_ascii_lowercase().as_str(),
            "and" | "or" | "nan" | "null"
        )
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => f.write_str(&format_f64(*v)),
            Self::Nan => f.write_str("nan"),
            Self::Null => f.write_str("null"),
            Self::Str(v) => {
                f.write_str("\"")?;
                for ch in v.chars() {
                    match ch {
                        '"' => f.write_str("\\\"")?,
                        '\\' => f.write_str("\\\\")?,
                        '\n' => f.write_str("\\n")?,
                        '\t' => f.write_str("\\t")?,
                        '\r' => f.write_str("\\r")?,
                        c => write!(f, "{c}")?,
                    }
                }
                f.write_str("\"")
            }
        }
    }
}

/// Canonical text form; parsing it yields an equal tree.
impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compare { column, op, value } => {
                if is_plain_identifier(column) {
                    write!(f, "{column} {} {value}", op.symbol())
                } else {
                    write!(f, "`{column}` {} {value}", op.symbol())
                }
            }
            Self::And { left, right } => {
                let wrap = |e: &Expr| matches!(e, Expr::Or { .. });
                write_operand(f, left, wrap(left))?;
                f.write_str(" and ")?;
                write_operand(f, right, !matches!(**right, Expr::Compare { .. }))
            }
            Self::Or { left, right } => {
                write!(f, "{left} or ")?;
                write_operand(f, right, matches!(**right, Expr::Or { .. }))
            }
        }
    }
}

fn write_operand(f: &mut fmt::Formatter<'_>, expr: &Expr, parenthesize: bool) -> fmt::Result {
    if parenthesize {
        write!(f, "({expr})")
    } else {
        write!(f, "{expr}")
    }
}

#[cfg(test)]
mod tests {
    use tf_columnar::{ComparisonOp, Series};
    use tf_frame::DataFrame;
    use tf_types::{ErrorKind, ErrorRecord};

    use super::{Expr, Literal, QueryError, evaluate, parse, query};

    fn frame() -> DataFrame {
        DataFrame::from_series(vec![
            Series::from_i64("id", [Some(1), Some(2), Some(3), None, Some(9_007_199_254_740_993)]),
            Series::from_f64(
                "score",
                [Some(98.5), Some(f64::NAN), None, Some(73.25), Some(10.0)],
            ),
            Series::from_strs(
                "unit name",
                [Some("kg"), Some("it's"), Some("lb"), None, Some("kg")],
            ),
        ])
        .expect("frame")
    }

    fn mask(text: &str) -> Vec<bool> {
        evaluate(&frame(), &parse(text).expect("parse")).expect("evaluate")
    }

    #[test]
    fn and_binds_tighter_than_or() {
        let expr = parse("id == 1 or id == 2 and id == 3").expect("parse");
        let Expr::Or { right, .. } = &expr else {
            panic!("expected or at the root, got {expr:?}");
        };
        assert!(matches!(**right, Expr::And { .. }));
        assert_eq!(mask("id == 1 or id == 2 and id == 3"), vec![true, false, false, false, false]);
        assert_eq!(mask("(id == 1 or id == 2) and id == 2"), vec![false, true, false, false, false]);
    }

    #[test]
    fn null_literal_selects_by_validity() {
        assert_eq!(mask("score == null"), vec![false, false, true, false, false]);
        assert_eq!(mask("score != null"), vec![true, true, false, true, true]);
        assert_eq!(mask("score < null"), vec![false; 5]);
        assert_eq!(mask("`unit name` == NULL"), vec![false, false, false, true, false]);
    }

    #[test]
    fn nan_is_present_but_unordered() {
        assert_eq!(mask("score == nan"), vec![false, true, false, false, false]);
        assert_eq!(mask("score != NaN"), vec![true, false, false, true, true]);
        assert_eq!(mask("score > 0"), vec![true, false, false, true, true]);
        assert_eq!(mask("score != 10"), vec![true, true, false, true, false]);
        assert_eq!(mask("id != nan"), vec![true, true, true, false, true]);
        assert_eq!(mask("`unit name` != nan"), vec![false; 5]);
    }

    #[test]
    fn integer_literals_compare_exactly() {
        // 2^53 + 1 is not representable as f64.
        assert_eq!(mask("id == 9007199254740993"), vec![false, false, false, false, true]);
        assert_eq!(mask("id == 9007199254740992"), vec![false; 5]);
        assert_eq!(mask("id >= 2.5"), vec![false, false, true, false, true]);
        assert_eq!(mask("score <= -1e3"), vec![false; 5]);
    }

    #[test]
    fn strings_compare_with_escapes_and_mismatches_are_false() {
        assert_eq!(mask(r#"`unit name` == 'it\'s'"#), vec![false, true, false, false, false]);
        assert_eq!(mask(r#"`unit name` == "kg""#), vec![true, false, false, false, true]);
        assert_eq!(mask("`unit name` > 'kg'"), vec![false, false, true, false, false]);
        assert_eq!(mask("id == 'kg'"), vec![false; 5]);
        assert_eq!(mask("`unit name` != 1"), vec![false; 5]);
    }

    #[test]
    fn query_filters_rows() {
        let out = query(&frame(), "score > 50 and id != null").expect("query");
        assert_eq!(out.num_rows(), 1);
        assert_eq!(out.get_i64(0, "id").expect("id"), Some(1));
        let again = query(&out, "score > 50 and id != null").expect("again");
        assert!(again.semantic_eq(&out));
    }

    #[test]
    fn syntax_errors_report_the_offset() {
        let err = parse("id == 1 and").expect_err("dangling and");
        assert_eq!(err.offset(), Some(11));
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        let err = parse("id = 1").expect_err("single equals");
        assert_eq!(err.offset(), Some(3));
        let err = parse("(id == 1").expect_err("missing paren");
        assert!(matches!(err, QueryError::Syntax { expected: "')'", offset: 8, .. }));
        let err = parse("id == 1 id == 2").expect_err("trailing");
        assert_eq!(err.offset(), Some(8));
        let err = parse("1 == id").expect_err("literal first");
        assert_eq!(err.offset(), Some(0));
        assert!(matches!(
            parse("name == 'open"),
            Err(QueryError::Unterminated { offset: 8, .. })
        ));
        assert!(matches!(parse("x > 1e999"), Err(QueryError::Number { .. })));
        assert!(matches!(parse("x > -"), Err(QueryError::Number { offset: 4, .. })));
        assert!(parse("").is_err());
    }

    #[test]
    fn unknown_columns_fail_at_evaluation() {
        let err = query(&frame(), "missing > 1").expect_err("unknown");
        assert!(matches!(&err, QueryError::UnknownColumn(name) if name == "missing"));
        assert_eq!(err.offset(), None);
    }

    #[test]
    fn parse_builds_typed_literals() {
        let expr = parse("Price >= -2.5E1").expect("parse");
        assert_eq!(
            expr,
            Expr::Compare {
                column: "Price".to_owned(),
                op: ComparisonOp::Ge,
                value: Literal::Float(-25.0),
            }
        );
        assert_eq!(expr.columns(), vec!["Price"]);
        let expr = parse("a < 1 OR b == null AND c != nan").expect("parse");
        assert_eq!(expr.columns(), vec!["a", "b", "c"]);
    }

    #[test]
    fn display_round_trips() {
        for text in [
            "a == 1",
            "(a == 1 or b != null) and `unit name` == \"x\\\"y\"",
            "a < 1.5 or b > -3 and c == nan",
            "a == 1 and (b == 2 and c == 3)",
        ] {
            let expr = parse(text).expect("parse");
            let rendered = expr.to_string();
            assert_eq!(parse(&rendered).expect("reparse"), expr, "{rendered}");
        }
    }

    #[test]
    fn expr_serializes_as_tagged_json() {
        let expr = parse("a == 'x'").expect("parse");
        let json = serde_json::to_string(&expr).expect("json");
        assert_eq!(
            json,
            r#"{"kind":"compare","column":"a","op":"eq","value":{"kind":"str","value":"x"}}"#
        );
        let back: Expr = serde_json::from_str(&json).expect("back");
        assert_eq!(back, expr);
    }
}
