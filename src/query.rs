//! Reader for client operation documents.
//!
//! Accepts the subset clients send for this API: an optional `query` or
//! `subscription` keyword (with optional name and variable definitions), a
//! single root field with optional alias and arguments, and a flat selection
//! of scalar sub-fields.
//!
//! ```text
//! subscription OnCreate { readingCreated { timestamp value unit } }
//! ```

use crate::error::{FeedError, Result};

/// Whether the document asks for one result or a stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationKind {
    Query,
    Subscription,
}

/// A literal or variable passed as a field argument.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ArgValue {
    Int(i64),
    Str(String),
    Variable(String),
    /// Enum values, `true`, `false`, `null`.
    Name(String),
}

/// The single root field of an operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RootField {
    pub name: String,
    pub alias: Option<String>,
    pub arguments: Vec<(String, ArgValue)>,
    /// Selected sub-fields; empty when the document has no selection set.
    pub selection: Vec<String>,
}

impl RootField {
    /// Key the result is reported under.
    pub fn response_key(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

/// A parsed operation document.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Operation {
    pub kind: OperationKind,
    pub name: Option<String>,
    pub field: RootField,
}

impl Operation {
    pub fn parse(source: &str) -> Result<Self> {
        let tokens = tokenize(source)?;
        Parser { tokens, pos: 0 }.operation()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Token {
    Punct(char),
    Name(String),
    Int(i64),
    Str(String),
}

fn invalid(msg: impl Into<String>) -> FeedError {
    FeedError::InvalidOperation(msg.into())
}

fn tokenize(source: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = source.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            // Commas are insignificant
            c if c.is_whitespace() || c == ',' => {
                chars.next();
            }
            '#' => {
                while let Some(c) = chars.next() {
                    if c == '\n' {
                        break;
                    }
                }
            }
            '{' | '}' | '(' | ')' | ':' | '$' | '!' | '[' | ']' | '=' | '@' => {
                tokens.push(Token::Punct(c));
                chars.next();
            }
            '"' => {
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some('n') => s.push('\n'),
                            Some('t') => s.push('\t'),
                            Some(other) => s.push(other),
                            None => return Err(invalid("unterminated string")),
                        },
                        Some(other) => s.push(other),
                        None => return Err(invalid("unterminated string")),
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c == '-' || c.is_ascii_digit() => {
                let mut s = String::new();
                s.push(c);
                chars.next();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() {
                        s.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let n = s
                    .parse::<i64>()
                    .map_err(|_| invalid(format!("bad integer {:?}", s)))?;
                tokens.push(Token::Int(n));
            }
            c if c == '_' || c.is_ascii_alphabetic() => {
                let mut s = String::new();
                while let Some(&d) = chars.peek() {
                    if d == '_' || d.is_ascii_alphanumeric() {
                        s.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Name(s));
            }
            other => return Err(invalid(format!("unexpected character {:?}", other))),
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn at_punct(&self, p: char) -> bool {
        matches!(self.peek(), Some(Token::Punct(c)) if *c == p)
    }

    fn expect_punct(&mut self, p: char) -> Result<()> {
        match self.bump() {
            Some(Token::Punct(c)) if c == p => Ok(()),
            other => Err(invalid(format!("expected {:?}, found {:?}", p, other))),
        }
    }

    fn name(&mut self) -> Result<String> {
        match self.bump() {
            Some(Token::Name(n)) => Ok(n),
            other => Err(invalid(format!("expected a name, found {:?}", other))),
        }
    }

    fn operation(&mut self) -> Result<Operation> {
        let mut kind = OperationKind::Query;
        let mut name = None;

        if let Some(Token::Name(keyword)) = self.peek() {
            kind = match keyword.as_str() {
                "query" => OperationKind::Query,
                "subscription" => OperationKind::Subscription,
                "mutation" => return Err(invalid("mutations are not supported")),
                other => return Err(invalid(format!("unknown operation {:?}", other))),
            };
            self.bump();

            if let Some(Token::Name(_)) = self.peek() {
                name = Some(self.name()?);
            }
            if self.at_punct('(') {
                self.skip_balanced('(', ')')?;
            }
        }

        self.expect_punct('{')?;
        let field = self.root_field()?;
        if !self.at_punct('}') {
            return Err(invalid("exactly one root field is supported"));
        }
        self.expect_punct('}')?;

        if self.peek().is_some() {
            return Err(invalid("only one operation per document is supported"));
        }

        Ok(Operation { kind, name, field })
    }

    fn root_field(&mut self) -> Result<RootField> {
        let first = self.name()?;
        let (alias, name) = if self.at_punct(':') {
            self.bump();
            (Some(first), self.name()?)
        } else {
            (None, first)
        };

        let mut arguments = Vec::new();
        if self.at_punct('(') {
            self.bump();
            while !self.at_punct(')') {
                let arg = self.name()?;
                self.expect_punct(':')?;
                arguments.push((arg, self.value()?));
            }
            self.expect_punct(')')?;
        }

        let mut selection = Vec::new();
        if self.at_punct('{') {
            self.bump();
            while !self.at_punct('}') {
                let field = self.name()?;
                if self.at_punct('{') || self.at_punct('(') || self.at_punct(':') {
                    return Err(invalid(format!(
                        "field {:?} takes no arguments, alias or sub-selection",
                        field
                    )));
                }
                if !selection.contains(&field) {
                    selection.push(field);
                }
            }
            self.expect_punct('}')?;
            if selection.is_empty() {
                return Err(invalid("empty selection set"));
            }
        }

        Ok(RootField {
            name,
            alias,
            arguments,
            selection,
        })
    }

    fn value(&mut self) -> Result<ArgValue> {
        match self.bump() {
            Some(Token::Int(n)) => Ok(ArgValue::Int(n)),
            Some(Token::Str(s)) => Ok(ArgValue::Str(s)),
            Some(Token::Name(n)) => Ok(ArgValue::Name(n)),
            Some(Token::Punct('$')) => Ok(ArgValue::Variable(self.name()?)),
            other => Err(invalid(format!("expected a value, found {:?}", other))),
        }
    }

    fn skip_balanced(&mut self, open: char, close: char) -> Result<()> {
        let mut depth = 0usize;
        loop {
            match self.bump() {
                Some(Token::Punct(c)) if c == open => depth += 1,
                Some(Token::Punct(c)) if c == close => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(());
                    }
                }
                Some(_) => {}
                None => return Err(invalid(format!("unclosed {:?}", open))),
            }
        }
    }
}
