// Copyright 2021 Datafuse Labs
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The klogs filter language.
//!
//! A query is a boolean expression over comparisons such as
//! `namespace='bookinfo' _and_ (status >= 500 _or_ _exists_ trace_id)`.
//! [`QueryParser`] turns the text into an [`Expr`], and [`to_sql`] lowers it
//! into a ClickHouse `WHERE` fragment against the logs table.

mod lexer;
mod lower;
mod parser;

use std::fmt::{self, Display};

use thiserror::Error;

use crate::{clickhouse::LogsSchema, fields::FieldSnapshot};

pub use lexer::{Keyword, Operator};
pub use lower::lower;

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Predicate(Predicate),
    Junction {
        lhs: Box<Expr>,
        op: Junction,
        rhs: Box<Expr>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Comparison(Comparison),
    Not(Box<Predicate>),
    Exists(String),
    Group(Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Comparison {
    pub lhs: Value,
    pub op: Operator,
    pub rhs: Value,
}

/// Operand of a comparison. Literals keep their source text, so string
/// literals still carry their quotes and escape sequences.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Ident(String),
    Number(String),
    Str(String),
}

impl Value {
    pub fn is_ident(&self) -> bool {
        matches!(self, Value::Ident(_))
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Ident(text) | Value::Number(text) | Value::Str(text) => f.write_str(text),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Junction {
    And,
    Or,
}

impl Junction {
    pub fn sql(self) -> &'static str {
        match self {
            Junction::And => "AND",
            Junction::Or => "OR",
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum QueryError {
    #[error("Failed to parse query: {message} at position {position} (near `{fragment}`)")]
    Lex {
        message: String,
        position: usize,
        fragment: String,
    },
    #[error("Failed to parse query: {message} (near `{fragment}`)")]
    Parse { message: String, fragment: String },
    #[error("failed to convert query to SQL: {}", details.join("; "))]
    Semantic {
        details: Vec<String>,
        fragment: String,
    },
}

impl QueryError {
    pub fn details(&self) -> &[String] {
        match self {
            QueryError::Semantic { details, .. } => details,
            _ => &[],
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct QueryParser;

impl QueryParser {
    pub fn parse(&self, input: &str) -> Result<Expr, QueryError> {
        let tokens = lexer::tokenize(input)?;
        parser::parse_tokens(input, &tokens)
    }
}

/// Parses `input` and lowers it into a `WHERE` fragment. An empty query
/// yields an empty fragment.
pub fn to_sql(input: &str, schema: &LogsSchema, fields: &FieldSnapshot) -> Result<String, QueryError> {
    if input.trim().is_empty() {
        return Ok(String::new());
    }
    let expr = QueryParser.parse(input)?;
    lower(&expr, schema, fields)
}

/// Identifier rule shared by the lexer and by every place that splices a
/// user supplied field name into SQL.
pub fn is_identifier(text: &str) -> bool {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) if lexer::is_ident_start(first) => chars.all(lexer::is_ident_char),
        _ => false,
    }
}
