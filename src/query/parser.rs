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

use super::{
    Comparison, Expr, Junction, Predicate, QueryError, Value,
    lexer::{Keyword, Token, TokenKind},
};

/// Deepest allowed nesting of groups and `_not_`.
const MAX_DEPTH: usize = 256;
/// Most junctions allowed in one query.
const MAX_JUNCTIONS: usize = 1024;

pub(crate) fn parse_tokens(input: &str, tokens: &[Token]) -> Result<Expr, QueryError> {
    let mut parser = Parser {
        input,
        tokens,
        pos: 0,
        depth: 0,
        junctions: 0,
    };
    let expr = parser.expression()?;
    let token = parser.peek();
    match token.kind {
        TokenKind::Eof => Ok(expr),
        TokenKind::RParen => Err(parser.error(token, "unexpected `)` without matching `(`")),
        _ => Err(parser.error(
            token,
            &format!("expected `_and_` or `_or_` but found {}", token.kind),
        )),
    }
}

struct Parser<'a> {
    input: &'a str,
    tokens: &'a [Token],
    pos: usize,
    depth: usize,
    junctions: usize,
}

impl<'a> Parser<'a> {
    /// `Predicate (Junction Predicate)*`, folded to the left so that
    /// `a _and_ b _or_ c` groups as `(a AND b) OR c`.
    fn expression(&mut self) -> Result<Expr, QueryError> {
        let mut expr = Expr::Predicate(self.predicate()?);
        while let Some(op) = self.junction() {
            let token = self.advance();
            self.junctions += 1;
            if self.junctions > MAX_JUNCTIONS {
                return Err(self.error(token, "too many conditions"));
            }
            let rhs = Expr::Predicate(self.predicate()?);
            expr = Expr::Junction {
                lhs: Box::new(expr),
                op,
                rhs: Box::new(rhs),
            };
        }
        Ok(expr)
    }

    fn junction(&self) -> Option<Junction> {
        match self.peek().kind {
            TokenKind::Keyword(Keyword::And) => Some(Junction::And),
            TokenKind::Keyword(Keyword::Or) => Some(Junction::Or),
            _ => None,
        }
    }

    fn predicate(&mut self) -> Result<Predicate, QueryError> {
        let token = self.advance();
        match &token.kind {
            TokenKind::LParen => {
                let expr = self.nested(token, Self::expression)?;
                let closing = self.advance();
                match closing.kind {
                    TokenKind::RParen => Ok(Predicate::Group(Box::new(expr))),
                    TokenKind::Eof => Err(self.error(token, "missing closing parenthesis")),
                    _ => Err(self.error(
                        closing,
                        &format!("expected `)` but found {}", closing.kind),
                    )),
                }
            }
            TokenKind::Keyword(Keyword::Not) => {
                let inner = self.nested(token, Self::predicate)?;
                Ok(Predicate::Not(Box::new(inner)))
            }
            TokenKind::Keyword(Keyword::Exists) => {
                let field = self.advance();
                match &field.kind {
                    TokenKind::Ident(name) => Ok(Predicate::Exists(name.clone())),
                    other => Err(self.error(
                        field,
                        &format!("expected a field after `_exists_` but found {other}"),
                    )),
                }
            }
            _ => {
                let lhs = self.value(token)?;
                let op_token = self.advance();
                let op = match op_token.kind {
                    TokenKind::Op(op) => op,
                    _ => {
                        return Err(self.error(
                            op_token,
                            &format!("expected an operator after `{lhs}` but found {}", op_token.kind),
                        ));
                    }
                };
                let rhs_token = self.advance();
                if matches!(rhs_token.kind, TokenKind::Eof) {
                    return Err(self.error(token, &format!("missing value after operator `{op}`")));
                }
                let rhs = self.value(rhs_token)?;
                Ok(Predicate::Comparison(Comparison { lhs, op, rhs }))
            }
        }
    }

    fn nested<T>(
        &mut self,
        token: &Token,
        parse: impl FnOnce(&mut Self) -> Result<T, QueryError>,
    ) -> Result<T, QueryError> {
        if self.depth >= MAX_DEPTH {
            return Err(self.error(token, "expression nested too deeply"));
        }
        self.depth += 1;
        let result = parse(self);
        self.depth -= 1;
        result
    }

    fn value(&self, token: &Token) -> Result<Value, QueryError> {
        match &token.kind {
            TokenKind::Ident(text) => Ok(Value::Ident(text.clone())),
            TokenKind::Number(text) => Ok(Value::Number(text.clone())),
            TokenKind::Str(text) => Ok(Value::Str(text.clone())),
            other => Err(self.error(
                token,
                &format!("expected a field, number or string but found {other}"),
            )),
        }
    }

    fn peek(&self) -> &'a Token {
        let tokens = self.tokens;
        &tokens[self.pos.min(tokens.len() - 1)]
    }

    fn advance(&mut self) -> &'a Token {
        let token = self.peek();
        if !matches!(token.kind, TokenKind::Eof) {
            self.pos += 1;
        }
        token
    }

    fn error(&self, token: &Token, message: &str) -> QueryError {
        let fragment = self.input.get(token.position..).unwrap_or_default().trim();
        QueryError::Parse {
            message: message.to_string(),
            fragment: if fragment.is_empty() {
                self.input.trim().to_string()
            } else {
                fragment.to_string()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{Operator, QueryParser};

    fn parse(input: &str) -> Result<Expr, QueryError> {
        QueryParser.parse(input)
    }

    fn cmp(field: &str, op: Operator, rhs: Value) -> Expr {
        Expr::Predicate(Predicate::Comparison(Comparison {
            lhs: Value::Ident(field.into()),
            op,
            rhs,
        }))
    }

    #[test]
    fn junctions_fold_left() {
        let expr = parse("a = 1 _and_ b = 2 _or_ c = 3").unwrap();
        let expected = Expr::Junction {
            lhs: Box::new(Expr::Junction {
                lhs: Box::new(cmp("a", Operator::Eq, Value::Number("1".into()))),
                op: Junction::And,
                rhs: Box::new(cmp("b", Operator::Eq, Value::Number("2".into()))),
            }),
            op: Junction::Or,
            rhs: Box::new(cmp("c", Operator::Eq, Value::Number("3".into()))),
        };
        assert_eq!(expr, expected);
    }

    #[test]
    fn keyword_case_does_not_change_ast() {
        let lower = parse("_not_ a = 'x' _and_ _exists_ b _or_ c = 1").unwrap();
        let upper = parse("_NOT_ a = 'x' _AND_ _EXISTS_ b _OR_ c = 1").unwrap();
        let mixed = parse("_Not_ a = 'x' _And_ _Exists_ b _oR_ c = 1").unwrap();
        assert_eq!(lower, upper);
        assert_eq!(lower, mixed);
    }

    #[test]
    fn not_binds_to_single_predicate() {
        let expr = parse("_not_ a = 'x' _and_ b = 'y'").unwrap();
        match expr {
            Expr::Junction { lhs, op, .. } => {
                assert_eq!(op, Junction::And);
                assert!(matches!(*lhs, Expr::Predicate(Predicate::Not(_))));
            }
            other => panic!("unexpected expression: {other:?}"),
        }
    }

    #[test]
    fn nested_groups() {
        let expr = parse("((a = 'x'))").unwrap();
        match expr {
            Expr::Predicate(Predicate::Group(inner)) => {
                assert!(matches!(*inner, Expr::Predicate(Predicate::Group(_))));
            }
            other => panic!("unexpected expression: {other:?}"),
        }
    }

    #[test]
    fn missing_closing_parenthesis() {
        let err = parse("(namespace = 'a'").unwrap_err();
        match &err {
            QueryError::Parse { message, fragment } => {
                assert_eq!(message, "missing closing parenthesis");
                assert_eq!(fragment, "(namespace = 'a'");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.to_string().starts_with("Failed to parse query:"));
    }

    #[test]
    fn missing_right_hand_side() {
        let err = parse("namespace =").unwrap_err();
        assert!(err.to_string().contains("missing value after operator `=`"));
    }

    #[test]
    fn missing_junction_between_predicates() {
        let err = parse("a = 'x' b = 'y'").unwrap_err();
        match err {
            QueryError::Parse { fragment, .. } => assert_eq!(fragment, "b = 'y'"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn exists_requires_identifier() {
        assert!(parse("_exists_ 'foo'").is_err());
        assert_eq!(
            parse("_exists_ foo").unwrap(),
            Expr::Predicate(Predicate::Exists("foo".into()))
        );
    }

    #[test]
    fn stray_closing_parenthesis() {
        let err = parse("a = 1)").unwrap_err();
        assert!(err.to_string().contains("without matching"));
    }

    #[test]
    fn lone_identifier_is_rejected() {
        assert!(parse("foo").is_err());
        assert!(parse("").is_err());
    }

    #[test]
    fn deep_parenthesis_nesting_is_rejected() {
        let depth = 200_000;
        let input = format!("{}a = 1{}", "(".repeat(depth), ")".repeat(depth));
        let err = parse(&input).unwrap_err();
        assert!(err.to_string().starts_with("Failed to parse query: expression nested too deeply"));

        let input = format!("{}a = 1{}", "(".repeat(MAX_DEPTH), ")".repeat(MAX_DEPTH));
        assert!(parse(&input).is_ok());
    }

    #[test]
    fn repeated_not_is_rejected() {
        let input = format!("{}a = 1", "_not_ ".repeat(100_000));
        let err = parse(&input).unwrap_err();
        assert!(err.to_string().contains("expression nested too deeply"));
    }

    #[test]
    fn long_junction_chains_are_bounded() {
        let within = vec!["a = 1"; MAX_JUNCTIONS + 1].join(" _or_ ");
        assert!(parse(&within).is_ok());

        let beyond = vec!["a = 1"; 100_000].join(" _or_ ");
        let err = parse(&beyond).unwrap_err();
        assert!(err.to_string().contains("too many conditions"));
    }
}
