//! Parses a single `consul.service.<name>` label value written in a small
//! block-structured configuration language (spec §4.1):
//!
//! ```text
//! service {
//!   name = "api"
//!   port = 8080
//!   tags = ["primary", "v2"]
//!   connect {
//!     sidecar_service {
//!       auto = true
//!     }
//!   }
//! }
//! ```
//!
//! Exactly one top-level `service` block is required; its body becomes the
//! nested mapping the payload normalizer consumes. Nested blocks of the
//! same type at the same nesting level overwrite earlier siblings rather
//! than merging — a documented limitation, not a bug.

use thiserror::Error;

use crate::model::{Map, Value};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("unterminated string literal")]
    UnterminatedString,
    #[error("invalid integer literal {0:?}")]
    InvalidInteger(String),
    #[error("unexpected character {0:?}")]
    UnexpectedChar(char),
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("expected identifier, found {0}")]
    ExpectedIdent(String),
    #[error("expected {{, found {0}")]
    ExpectedLBrace(String),
    #[error("expected }}, found {0}")]
    ExpectedRBrace(String),
    #[error("no top-level `service` block found")]
    MissingServiceBlock,
    #[error("more than one top-level `service` block")]
    DuplicateServiceBlock,
    #[error("unexpected top-level block of type `{0}`, only `service` is allowed")]
    UnexpectedTopLevelBlock(String),
}

/// Parse a `consul.service.<name>` label's raw source and return the body
/// of its single top-level `service` block as a nested [`Value::Object`].
pub fn parse_service_block(source: &str) -> Result<Value, ParseError> {
    let tokens = lex(source)?;
    let mut parser = Parser::new(tokens);

    let mut service_body: Option<Map> = None;
    while !parser.at_eof() {
        let (block_type, _label, body) = parser.parse_block()?;
        if block_type == "service" {
            if service_body.is_some() {
                return Err(ParseError::DuplicateServiceBlock);
            }
            service_body = Some(body);
        } else {
            return Err(ParseError::UnexpectedTopLevelBlock(block_type));
        }
    }

    service_body
        .map(Value::Object)
        .ok_or(ParseError::MissingServiceBlock)
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Str(String),
    Int(i64),
    True,
    False,
    Null,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Equals,
    Comma,
}

impl std::fmt::Display for Tok {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tok::Ident(s) => write!(f, "identifier {s:?}"),
            Tok::Str(s) => write!(f, "string {s:?}"),
            Tok::Int(i) => write!(f, "integer {i}"),
            Tok::True => write!(f, "true"),
            Tok::False => write!(f, "false"),
            Tok::Null => write!(f, "null"),
            Tok::LBrace => write!(f, "{{"),
            Tok::RBrace => write!(f, "}}"),
            Tok::LBracket => write!(f, "["),
            Tok::RBracket => write!(f, "]"),
            Tok::Equals => write!(f, "="),
            Tok::Comma => write!(f, ","),
        }
    }
}

fn lex(source: &str) -> Result<Vec<Tok>, ParseError> {
    let mut chars = source.chars().peekable();
    let mut tokens = Vec::new();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '#' => {
                for c in chars.by_ref() {
                    if c == '\n' {
                        break;
                    }
                }
            }
            '/' => {
                chars.next();
                match chars.peek() {
                    Some('/') => {
                        for c in chars.by_ref() {
                            if c == '\n' {
                                break;
                            }
                        }
                    }
                    _ => return Err(ParseError::UnexpectedChar('/')),
                }
            }
            '{' => {
                chars.next();
                tokens.push(Tok::LBrace);
            }
            '}' => {
                chars.next();
                tokens.push(Tok::RBrace);
            }
            '[' => {
                chars.next();
                tokens.push(Tok::LBracket);
            }
            ']' => {
                chars.next();
                tokens.push(Tok::RBracket);
            }
            '=' => {
                chars.next();
                tokens.push(Tok::Equals);
            }
            ',' => {
                chars.next();
                tokens.push(Tok::Comma);
            }
            '"' => {
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some('"') => s.push('"'),
                            Some('\\') => s.push('\\'),
                            Some('n') => s.push('\n'),
                            Some('t') => s.push('\t'),
                            Some(other) => s.push(other),
                            None => return Err(ParseError::UnterminatedString),
                        },
                        Some(other) => s.push(other),
                        None => return Err(ParseError::UnterminatedString),
                    }
                }
                tokens.push(Tok::Str(s));
            }
            c if c == '-' || c.is_ascii_digit() => {
                let mut s = String::new();
                s.push(c);
                chars.next();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_digit() {
                        s.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let value = s.parse::<i64>().map_err(|_| ParseError::InvalidInteger(s))?;
                tokens.push(Tok::Int(value));
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut s = String::new();
                s.push(c);
                chars.next();
                while let Some(&c) = chars.peek() {
                    if c.is_alphanumeric() || c == '_' || c == '-' {
                        s.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(match s.as_str() {
                    "true" => Tok::True,
                    "false" => Tok::False,
                    "null" => Tok::Null,
                    _ => Tok::Ident(s),
                });
            }
            other => return Err(ParseError::UnexpectedChar(other)),
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Tok>,
    pos: usize,
}

impl Parser {
    fn new(tokens: Vec<Tok>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn at_eof(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Result<Tok, ParseError> {
        let tok = self.tokens.get(self.pos).cloned().ok_or(ParseError::UnexpectedEof)?;
        self.pos += 1;
        Ok(tok)
    }

    fn check(&self, tok: &Tok) -> bool {
        self.peek() == Some(tok)
    }

    fn expect(&mut self, expected: Tok) -> Result<(), ParseError> {
        let got = self.advance()?;
        if got == expected {
            Ok(())
        } else {
            match expected {
                Tok::LBrace => Err(ParseError::ExpectedLBrace(got.to_string())),
                Tok::RBrace => Err(ParseError::ExpectedRBrace(got.to_string())),
                _ => Err(ParseError::ExpectedIdent(got.to_string())),
            }
        }
    }

    fn expect_ident(&mut self) -> Result<String, ParseError> {
        match self.advance()? {
            Tok::Ident(s) => Ok(s),
            other => Err(ParseError::ExpectedIdent(other.to_string())),
        }
    }

    /// Parses `type "label"? { body }`, returning the block's type, its
    /// optional label, and its body as a mapping.
    fn parse_block(&mut self) -> Result<(String, Option<String>, Map), ParseError> {
        let block_type = self.expect_ident()?;
        let label = match self.peek() {
            Some(Tok::Str(_)) => match self.advance()? {
                Tok::Str(s) => Some(s),
                _ => unreachable!(),
            },
            _ => None,
        };
        self.expect(Tok::LBrace)?;
        let body = self.parse_block_body()?;
        self.expect(Tok::RBrace)?;
        Ok((block_type, label, body))
    }

    fn parse_block_body(&mut self) -> Result<Map, ParseError> {
        let mut map = Map::new();
        while !self.check(&Tok::RBrace) {
            if self.at_eof() {
                return Err(ParseError::UnexpectedEof);
            }
            let ident = self.expect_ident()?;
            if self.check(&Tok::Equals) {
                self.advance()?;
                let value = self.parse_value()?;
                map.insert(ident, value);
            } else {
                // A nested block: `ident "label"? { ... }`. Overwrites any
                // earlier sibling of the same type (spec §4.1). The block
                // label itself has no spec-defined destination in the
                // mapping, so it is consumed here and discarded rather
                // than materialized as a fabricated field in the body.
                if let Some(Tok::Str(_)) = self.peek() {
                    self.advance()?;
                }
                self.expect(Tok::LBrace)?;
                let nested = self.parse_block_body()?;
                self.expect(Tok::RBrace)?;
                map.insert(ident, Value::Object(nested));
            }
            if self.check(&Tok::Comma) {
                self.advance()?;
            }
        }
        Ok(map)
    }

    fn parse_value(&mut self) -> Result<Value, ParseError> {
        match self.advance()? {
            Tok::Str(s) => Ok(Value::String(s)),
            Tok::Int(i) => Ok(Value::Integer(i)),
            Tok::True => Ok(Value::Bool(true)),
            Tok::False => Ok(Value::Bool(false)),
            Tok::Null => Ok(Value::Null),
            Tok::LBracket => self.parse_array(),
            Tok::LBrace => self.parse_object_literal(),
            // Unrecognized literal shapes degrade to an explicit null
            // rather than a syntax error (spec §4.1: "Unknown or null
            // values become an explicit null").
            Tok::Ident(_) => Ok(Value::Null),
            other => Err(ParseError::ExpectedIdent(other.to_string())),
        }
    }

    fn parse_array(&mut self) -> Result<Value, ParseError> {
        let mut items = Vec::new();
        while !self.check(&Tok::RBracket) {
            items.push(self.parse_value()?);
            if self.check(&Tok::Comma) {
                self.advance()?;
            }
        }
        self.expect(Tok::RBracket)?;
        Ok(Value::Array(items))
    }

    fn parse_object_literal(&mut self) -> Result<Value, ParseError> {
        let mut map = Map::new();
        while !self.check(&Tok::RBrace) {
            let ident = self.expect_ident()?;
            self.expect(Tok::Equals)?;
            let value = self.parse_value()?;
            map.insert(ident, value);
            if self.check(&Tok::Comma) {
                self.advance()?;
            }
        }
        self.expect(Tok::RBrace)?;
        Ok(Value::Object(map))
    }
}
