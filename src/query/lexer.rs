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

use std::fmt::{self, Display};

use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::{tag, take_while, take_while1},
    character::complete::{anychar, char, digit1, multispace0, none_of, one_of},
    combinator::{cut, map, opt, recognize, value},
    error::{Error as NomError, context},
    multi::fold_many0,
    sequence::{pair, preceded, terminated},
};

use super::QueryError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyword {
    And,
    Or,
    Not,
    Exists,
}

impl Keyword {
    fn from_word(word: &str) -> Option<Self> {
        match word.to_ascii_lowercase().as_str() {
            "_and_" => Some(Keyword::And),
            "_or_" => Some(Keyword::Or),
            "_not_" => Some(Keyword::Not),
            "_exists_" => Some(Keyword::Exists),
            _ => None,
        }
    }
}

impl Display for Keyword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Keyword::And => f.write_str("_and_"),
            Keyword::Or => f.write_str("_or_"),
            Keyword::Not => f.write_str("_not_"),
            Keyword::Exists => f.write_str("_exists_"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    NotEq,
    Lt,
    Lte,
    Gt,
    Gte,
    Regex,
    ILike,
    NotILike,
}

impl Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Operator::Eq => "=",
            Operator::NotEq => "!=",
            Operator::Lt => "<",
            Operator::Lte => "<=",
            Operator::Gt => ">",
            Operator::Gte => ">=",
            Operator::Regex => "~",
            Operator::ILike => "=~",
            Operator::NotILike => "!~",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TokenKind {
    Keyword(Keyword),
    Ident(String),
    Number(String),
    Str(String),
    Op(Operator),
    LParen,
    RParen,
    Eof,
}

impl Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Keyword(keyword) => write!(f, "keyword `{keyword}`"),
            TokenKind::Ident(text) => write!(f, "field `{text}`"),
            TokenKind::Number(text) => write!(f, "number `{text}`"),
            TokenKind::Str(text) => write!(f, "string {text}"),
            TokenKind::Op(op) => write!(f, "operator `{op}`"),
            TokenKind::LParen => f.write_str("`(`"),
            TokenKind::RParen => f.write_str("`)`"),
            TokenKind::Eof => f.write_str("end of input"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Token {
    pub(crate) kind: TokenKind,
    pub(crate) position: usize,
}

type NomResult<'a, T> = IResult<&'a str, T, NomError<&'a str>>;

/// Splits `input` into tokens. The last token is always [`TokenKind::Eof`].
pub(crate) fn tokenize(input: &str) -> Result<Vec<Token>, QueryError> {
    let mut tokens = Vec::new();
    let mut rest = input;
    loop {
        let (next, _) = multispace0::<_, NomError<&str>>(rest)
            .map_err(|_| lex_error(input, rest, "invalid whitespace"))?;
        rest = next;
        let position = input.len() - rest.len();
        if rest.is_empty() {
            tokens.push(Token {
                kind: TokenKind::Eof,
                position,
            });
            return Ok(tokens);
        }
        match token(rest) {
            Ok((next, kind)) => {
                tokens.push(Token { kind, position });
                rest = next;
            }
            Err(nom::Err::Failure(_)) => {
                return Err(lex_error(input, rest, "unterminated string literal"));
            }
            Err(_) => {
                let illegal = rest.chars().next().unwrap_or_default();
                return Err(lex_error(
                    input,
                    rest,
                    &format!("illegal character `{illegal}`"),
                ));
            }
        }
    }
}

fn lex_error(input: &str, rest: &str, message: &str) -> QueryError {
    QueryError::Lex {
        message: message.to_string(),
        position: input.len() - rest.len(),
        fragment: rest.to_string(),
    }
}

fn token(input: &str) -> NomResult<'_, TokenKind> {
    alt((string_literal, number, operator, word)).parse(input)
}

fn string_literal(input: &str) -> NomResult<'_, TokenKind> {
    context(
        "string literal",
        map(
            recognize(preceded(
                char('\''),
                cut(terminated(
                    fold_many0(
                        alt((recognize(pair(char('\\'), anychar)), recognize(none_of("\\'")))),
                        || (),
                        |_, _| (),
                    ),
                    char('\''),
                )),
            )),
            |raw: &str| TokenKind::Str(raw.to_string()),
        ),
    )
    .parse(input)
}

fn number(input: &str) -> NomResult<'_, TokenKind> {
    context(
        "number",
        map(
            recognize((
                opt(one_of("+-")),
                digit1,
                opt(pair(char('.'), digit1)),
                opt((one_of("eE"), opt(one_of("+-")), digit1)),
            )),
            |raw: &str| TokenKind::Number(raw.to_string()),
        ),
    )
    .parse(input)
}

fn operator(input: &str) -> NomResult<'_, TokenKind> {
    context(
        "operator",
        alt((
            value(TokenKind::Op(Operator::NotEq), tag("!=")),
            value(TokenKind::Op(Operator::Lte), tag("<=")),
            value(TokenKind::Op(Operator::Gte), tag(">=")),
            value(TokenKind::Op(Operator::ILike), tag("=~")),
            value(TokenKind::Op(Operator::NotILike), tag("!~")),
            value(TokenKind::LParen, char('(')),
            value(TokenKind::RParen, char(')')),
            value(TokenKind::Op(Operator::Eq), char('=')),
            value(TokenKind::Op(Operator::Lt), char('<')),
            value(TokenKind::Op(Operator::Gt), char('>')),
            value(TokenKind::Op(Operator::Regex), char('~')),
        )),
    )
    .parse(input)
}

fn word(input: &str) -> NomResult<'_, TokenKind> {
    context(
        "identifier",
        map(
            recognize(pair(take_while1(is_ident_start), take_while(is_ident_char))),
            |word: &str| match Keyword::from_word(word) {
                Some(keyword) => TokenKind::Keyword(keyword),
                None => TokenKind::Ident(word.to_string()),
            },
        ),
    )
    .parse(input)
}

pub(crate) fn is_ident_start(ch: char) -> bool {
    ch.is_ascii_alphabetic() || ch == '_'
}

pub(crate) fn is_ident_char(ch: char) -> bool {
    is_ident_start(ch) || ch.is_ascii_digit() || ch == '/'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(input: &str) -> Vec<TokenKind> {
        tokenize(input)
            .unwrap()
            .into_iter()
            .map(|token| token.kind)
            .collect()
    }

    #[test]
    fn lexes_comparison_with_positions() {
        let tokens = tokenize("status >= 500").unwrap();
        assert_eq!(tokens.len(), 4);
        assert_eq!(tokens[0].kind, TokenKind::Ident("status".into()));
        assert_eq!(tokens[1].kind, TokenKind::Op(Operator::Gte));
        assert_eq!(tokens[1].position, 7);
        assert_eq!(tokens[2].kind, TokenKind::Number("500".into()));
        assert_eq!(tokens[3].kind, TokenKind::Eof);
        assert_eq!(tokens[3].position, 13);
    }

    #[test]
    fn keywords_are_case_insensitive() {
        assert_eq!(
            kinds("_AND_ _or_ _Not_ _EXISTS_"),
            vec![
                TokenKind::Keyword(Keyword::And),
                TokenKind::Keyword(Keyword::Or),
                TokenKind::Keyword(Keyword::Not),
                TokenKind::Keyword(Keyword::Exists),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn keyword_prefix_stays_identifier() {
        assert_eq!(
            kinds("_and_foo"),
            vec![TokenKind::Ident("_and_foo".into()), TokenKind::Eof]
        );
    }

    #[test]
    fn two_character_operators_win() {
        assert_eq!(
            kinds("a=~'x' b!~'y' c!=1 d~'z'"),
            vec![
                TokenKind::Ident("a".into()),
                TokenKind::Op(Operator::ILike),
                TokenKind::Str("'x'".into()),
                TokenKind::Ident("b".into()),
                TokenKind::Op(Operator::NotILike),
                TokenKind::Str("'y'".into()),
                TokenKind::Ident("c".into()),
                TokenKind::Op(Operator::NotEq),
                TokenKind::Number("1".into()),
                TokenKind::Ident("d".into()),
                TokenKind::Op(Operator::Regex),
                TokenKind::Str("'z'".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn numbers_with_sign_fraction_and_exponent() {
        assert_eq!(
            kinds("-1.5e+3 42 +7E2"),
            vec![
                TokenKind::Number("-1.5e+3".into()),
                TokenKind::Number("42".into()),
                TokenKind::Number("+7E2".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn string_escapes_are_kept_verbatim() {
        assert_eq!(
            kinds(r"'it\'s \%done\%'"),
            vec![TokenKind::Str(r"'it\'s \%done\%'".into()), TokenKind::Eof]
        );
    }

    #[test]
    fn identifiers_may_contain_slashes() {
        assert_eq!(
            kinds("kubernetes_label_app/name"),
            vec![TokenKind::Ident("kubernetes_label_app/name".into()), TokenKind::Eof]
        );
    }

    #[test]
    fn illegal_character_reports_position() {
        let err = tokenize("namespace = 'a' & app = 'b'").unwrap_err();
        match err {
            QueryError::Lex {
                position, fragment, ..
            } => {
                assert_eq!(position, 16);
                assert!(fragment.starts_with('&'));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn unterminated_string_is_lex_error() {
        let err = tokenize("namespace = 'abc").unwrap_err();
        assert!(err.to_string().starts_with("Failed to parse query: unterminated"));
    }
}
