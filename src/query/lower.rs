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

use crate::{
    clickhouse::{LogsSchema, TypeContext},
    fields::FieldSnapshot,
};

use super::{Comparison, Expr, Operator, Predicate, QueryError, Value};

/// Lowers `expr` into a ClickHouse boolean expression.
///
/// Semantic problems do not stop the walk: all of them are collected and
/// returned together with the best-effort fragment, which must not be
/// executed.
pub fn lower(expr: &Expr, schema: &LogsSchema, fields: &FieldSnapshot) -> Result<String, QueryError> {
    let mut lowerer = Lowerer {
        schema,
        fields,
        errors: Vec::new(),
    };
    let mut sql = String::new();
    lowerer.expression(expr, &mut sql);
    if lowerer.errors.is_empty() {
        Ok(sql)
    } else {
        Err(QueryError::Semantic {
            details: lowerer.errors,
            fragment: sql,
        })
    }
}

struct Lowerer<'a> {
    schema: &'a LogsSchema,
    fields: &'a FieldSnapshot,
    errors: Vec<String>,
}

impl Lowerer<'_> {
    fn expression(&mut self, expr: &Expr, out: &mut String) {
        match expr {
            Expr::Predicate(predicate) => self.predicate(predicate, out),
            Expr::Junction { lhs, op, rhs } => {
                self.expression(lhs, out);
                out.push(' ');
                out.push_str(op.sql());
                out.push(' ');
                self.expression(rhs, out);
            }
        }
    }

    fn predicate(&mut self, predicate: &Predicate, out: &mut String) {
        match predicate {
            Predicate::Comparison(comparison) => self.comparison(comparison, out),
            Predicate::Not(inner) => {
                out.push_str("NOT ( ");
                self.predicate(inner, out);
                out.push_str(" )");
            }
            Predicate::Group(inner) => {
                out.push_str("( ");
                self.expression(inner, out);
                out.push_str(" )");
            }
            Predicate::Exists(field) => out.push_str(&self.schema.exists_clause(field)),
        }
    }

    fn comparison(&mut self, comparison: &Comparison, out: &mut String) {
        let Comparison { lhs, op, rhs } = comparison;
        let (lhs_sql, rhs_sql) = match (lhs, rhs) {
            (Value::Ident(left), Value::Ident(right)) => {
                self.errors.push(format!(
                    "comparison between two fields `{left}` and `{right}` is not supported"
                ));
                (left.clone(), right.clone())
            }
            (Value::Ident(field), constant) => {
                (self.operand(field, constant), constant.to_string())
            }
            (constant, Value::Ident(field)) => {
                (constant.to_string(), self.operand(field, constant))
            }
            (left, right) => {
                self.errors.push(format!(
                    "comparison between two constants `{left}` and `{right}` is not supported"
                ));
                (left.to_string(), right.to_string())
            }
        };

        match op {
            Operator::Regex => out.push_str(&format!("match({lhs_sql}, {rhs_sql})")),
            Operator::ILike => out.push_str(&format!("{lhs_sql} ILIKE {rhs_sql}")),
            Operator::NotILike => out.push_str(&format!("{lhs_sql} NOT ILIKE {rhs_sql}")),
            Operator::Eq
            | Operator::NotEq
            | Operator::Lt
            | Operator::Lte
            | Operator::Gt
            | Operator::Gte => out.push_str(&format!("{lhs_sql} {op} {rhs_sql}")),
        }
    }

    fn operand(&self, field: &str, constant: &Value) -> String {
        let context = match constant {
            Value::Number(_) => TypeContext::Number,
            Value::Str(_) => TypeContext::String,
            Value::Ident(_) => TypeContext::Unknown,
        };
        self.schema.resolve(field, context, self.fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::QueryParser;

    fn lower_with(input: &str, columns: &[&str], fields: &FieldSnapshot) -> Result<String, QueryError> {
        let schema = LogsSchema::new("logs", columns.iter().map(|c| c.to_string()).collect());
        let expr = QueryParser.parse(input).unwrap();
        lower(&expr, &schema, fields)
    }

    fn lower_str(input: &str) -> String {
        lower_with(input, &[], &FieldSnapshot::default()).unwrap()
    }

    #[test]
    fn operator_templates() {
        let cases = [
            ("namespace = 'a'", "namespace = 'a'"),
            ("namespace != 'a'", "namespace != 'a'"),
            ("namespace < 'a'", "namespace < 'a'"),
            ("namespace <= 'a'", "namespace <= 'a'"),
            ("namespace > 'a'", "namespace > 'a'"),
            ("namespace >= 'a'", "namespace >= 'a'"),
            ("namespace ~ 'a.*'", "match(namespace, 'a.*')"),
            ("namespace =~ '%a%'", "namespace ILIKE '%a%'"),
            ("namespace !~ '%a%'", "namespace NOT ILIKE '%a%'"),
        ];
        for (input, expected) in cases {
            assert_eq!(lower_str(input), expected, "input: {input}");
        }
    }

    #[test]
    fn map_routing_follows_literal_type() {
        assert_eq!(lower_str("status = 'ok'"), "fields_string['status'] = 'ok'");
        assert_eq!(lower_str("status = 0"), "fields_number['status'] = 0");
        assert_eq!(lower_str("duration >= 1.5e3"), "fields_number['duration'] >= 1.5e3");
    }

    #[test]
    fn constant_on_the_left_keeps_order() {
        assert_eq!(lower_str("500 <= status"), "500 <= fields_number['status']");
    }

    #[test]
    fn not_and_group_templates() {
        assert_eq!(
            lower_str("_not_ namespace = 'a'"),
            "NOT ( namespace = 'a' )"
        );
        assert_eq!(
            lower_str("_not_ (namespace = 'a' _or_ app = 'b')"),
            "NOT ( ( namespace = 'a' OR app = 'b' ) )"
        );
    }

    #[test]
    fn exists_on_fixed_and_materialized_columns() {
        assert_eq!(lower_str("_exists_ pod_name"), "pod_name IS NOT NULL");
        assert_eq!(
            lower_with("_exists_ level", &["level"], &FieldSnapshot::default()).unwrap(),
            "level IS NOT NULL"
        );
    }

    #[test]
    fn materialized_column_shadows_map_keys() {
        let fields = FieldSnapshot::new(vec!["level".into()], vec!["level".into()]);
        assert_eq!(
            lower_with("level = 3", &["level"], &fields).unwrap(),
            "level = 3"
        );
    }

    #[test]
    fn two_fields_is_semantic_error() {
        let err = lower_with("namespace = app", &[], &FieldSnapshot::default()).unwrap_err();
        match err {
            QueryError::Semantic { details, fragment } => {
                assert_eq!(details.len(), 1);
                assert_eq!(fragment, "namespace = app");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn every_semantic_error_is_collected() {
        let err = lower_with("1 = 2 _and_ a = b", &[], &FieldSnapshot::default()).unwrap_err();
        assert_eq!(err.details().len(), 2);
        assert!(err.to_string().starts_with("failed to convert query to SQL"));
    }
}
