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

use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

use crate::{
    clickhouse::{Executor, LogsSchema, SETTINGS_CLAUSE, TypeContext, from_unixtime},
    error::AppError,
    fields::FieldSnapshot,
    logs::time_span,
    query::{is_identifier, to_sql},
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AggregationError {
    #[error("invalid chart type")]
    InvalidChart,
    #[error("slice by field is required")]
    SliceByRequired,
    #[error("invalid size by operation")]
    InvalidSizeByOperation,
    #[error("size by field is required")]
    SizeByFieldRequired,
    #[error("horizontal axis field is required")]
    HorizontalAxisFieldRequired,
    #[error("invalid horizontal axis limit")]
    InvalidHorizontalAxisLimit,
    #[error("invalid vertical axis operation")]
    InvalidVerticalAxisOperation,
    #[error("vertical axis field is required")]
    VerticalAxisFieldRequired,
    #[error("invalid break down filter")]
    InvalidBreakDownFilter,
    #[error("field name `{0}` is reserved")]
    ReservedField(String),
    #[error("invalid aggregation")]
    Invalid,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Aggregation {
    pub query: String,
    pub chart: String,
    pub times: AggregationTimes,
    pub options: AggregationOptions,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AggregationTimes {
    pub time_start: i64,
    pub time_end: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AggregationOptions {
    pub slice_by: String,
    pub size_by_operation: String,
    pub size_by_field: String,
    pub horizontal_axis_operation: String,
    pub horizontal_axis_field: String,
    pub horizontal_axis_order: String,
    pub horizontal_axis_limit: String,
    pub vertical_axis_operation: String,
    pub vertical_axis_field: String,
    pub break_down_by_fields: Vec<String>,
    pub break_down_by_filters: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chart {
    Pie,
    Bar,
    Line,
    Area,
}

impl Chart {
    fn parse(raw: &str) -> Result<Self, AggregationError> {
        match raw {
            "pie" => Ok(Chart::Pie),
            "bar" => Ok(Chart::Bar),
            "line" => Ok(Chart::Line),
            "area" => Ok(Chart::Area),
            _ => Err(AggregationError::InvalidChart),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Count,
    Min,
    Max,
    Sum,
    Avg,
}

impl Operation {
    const ALL: [Operation; 5] = [
        Operation::Count,
        Operation::Min,
        Operation::Max,
        Operation::Sum,
        Operation::Avg,
    ];

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "count" => Some(Operation::Count),
            "min" => Some(Operation::Min),
            "max" => Some(Operation::Max),
            "sum" => Some(Operation::Sum),
            "avg" => Some(Operation::Avg),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Operation::Count => "count",
            Operation::Min => "min",
            Operation::Max => "max",
            Operation::Sum => "sum",
            Operation::Avg => "avg",
        }
    }
}

/// SQL fragments of an aggregation; `order_by` and `limit` may be empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregationPlan {
    pub select: String,
    pub group_by: String,
    pub order_by: String,
    pub limit: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AggregationResult {
    pub rows: Vec<Map<String, JsonValue>>,
    pub columns: Vec<String>,
}

/// Builds the clauses of an aggregation over a range of `span` seconds.
/// Pure: nothing is executed.
pub fn plan(
    aggregation: &Aggregation,
    span: i64,
    schema: &LogsSchema,
    fields: &FieldSnapshot,
) -> Result<AggregationPlan, AggregationError> {
    Planner {
        options: &aggregation.options,
        schema,
        fields,
    }
    .plan(Chart::parse(&aggregation.chart)?, span)
}

struct Planner<'a> {
    options: &'a AggregationOptions,
    schema: &'a LogsSchema,
    fields: &'a FieldSnapshot,
}

impl Planner<'_> {
    fn plan(&self, chart: Chart, span: i64) -> Result<AggregationPlan, AggregationError> {
        let operation = self.options.horizontal_axis_operation.as_str();
        match (chart, operation) {
            (Chart::Pie, _) => self.pie(),
            (Chart::Bar, "top") => self.bar_top(),
            (Chart::Bar | Chart::Line | Chart::Area, "time") => self.time_series(span),
            _ => Err(AggregationError::Invalid),
        }
    }

    fn pie(&self) -> Result<AggregationPlan, AggregationError> {
        let slice_by = self.options.slice_by.trim();
        if slice_by.is_empty() {
            return Err(AggregationError::SliceByRequired);
        }
        let operation = Operation::parse(&self.options.size_by_operation)
            .ok_or(AggregationError::InvalidSizeByOperation)?;
        let size_by = match (operation, self.options.size_by_field.trim()) {
            (Operation::Count, "") => slice_by,
            (_, "") => return Err(AggregationError::SizeByFieldRequired),
            (_, field) => field,
        };

        let slice = self.column(slice_by)?;
        let size = self.aggregate_field(operation, size_by)?;
        Ok(AggregationPlan {
            select: format!("{}, {}({size}) as {}_data", slice.select, operation.name(), operation.name()),
            group_by: slice.group,
            ..AggregationPlan::default()
        })
    }

    fn bar_top(&self) -> Result<AggregationPlan, AggregationError> {
        let horizontal = self.options.horizontal_axis_field.trim();
        if horizontal.is_empty() {
            return Err(AggregationError::HorizontalAxisFieldRequired);
        }
        let operation = self.vertical_operation()?;
        let limit = self.limit()?;
        let horizontal = self.column(horizontal)?;
        let break_downs = self.break_down_fields()?;

        let mut select = vec![horizontal.select];
        let mut group_by = vec![horizontal.group];
        for field in break_downs {
            select.push(field.select);
            group_by.push(field.group);
        }

        let filters = self.break_down_filters()?;
        let order_by = if filters.is_empty() {
            select.push(self.single_aggregate(operation)?);
            let direction = if self.options.horizontal_axis_order == "descending" {
                "DESC"
            } else {
                "ASC"
            };
            format!("{}_data {direction}", operation.name())
        } else {
            select.extend(self.filter_aggregates(operation, &filters)?);
            String::new()
        };

        Ok(AggregationPlan {
            select: select.join(", "),
            group_by: group_by.join(", "),
            order_by,
            limit,
        })
    }

    fn time_series(&self, span: i64) -> Result<AggregationPlan, AggregationError> {
        let operation = self.vertical_operation()?;
        let interval = time_interval(span);

        let mut select = vec![format!(
            "toStartOfInterval(timestamp, INTERVAL {interval} second) AS time"
        )];
        let mut group_by = vec!["time".to_string()];
        for field in self.break_down_fields()? {
            select.push(field.select);
            group_by.push(field.group);
        }

        let filters = self.break_down_filters()?;
        if filters.is_empty() {
            select.push(self.single_aggregate(operation)?);
        } else {
            select.extend(self.filter_aggregates(operation, &filters)?);
        }

        Ok(AggregationPlan {
            select: select.join(", "),
            group_by: group_by.join(", "),
            order_by: "time".to_string(),
            limit: String::new(),
        })
    }

    fn vertical_operation(&self) -> Result<Operation, AggregationError> {
        let operation = Operation::parse(&self.options.vertical_axis_operation)
            .ok_or(AggregationError::InvalidVerticalAxisOperation)?;
        if operation != Operation::Count && self.options.vertical_axis_field.trim().is_empty() {
            return Err(AggregationError::VerticalAxisFieldRequired);
        }
        Ok(operation)
    }

    fn single_aggregate(&self, operation: Operation) -> Result<String, AggregationError> {
        let field = self.options.vertical_axis_field.trim();
        let argument = if operation == Operation::Count {
            "*".to_string()
        } else {
            self.aggregate_field(operation, field)?
        };
        Ok(format!("{}({argument}) as {}_data", operation.name(), operation.name()))
    }

    fn filter_aggregates(
        &self,
        operation: Operation,
        filters: &[String],
    ) -> Result<Vec<String>, AggregationError> {
        let name = operation.name();
        if operation == Operation::Count {
            return Ok(filters
                .iter()
                .enumerate()
                .map(|(idx, filter)| format!("countIf({filter}) as count_data_filter{idx}"))
                .collect());
        }
        let field = self.aggregate_field(operation, self.options.vertical_axis_field.trim())?;
        Ok(filters
            .iter()
            .enumerate()
            .map(|(idx, filter)| format!("{name}If({field}, {filter}) as {name}_data_filter{idx}"))
            .collect())
    }

    fn break_down_fields(&self) -> Result<Vec<SelectedColumn>, AggregationError> {
        self.options
            .break_down_by_fields
            .iter()
            .map(|field| field.trim())
            .filter(|field| !field.is_empty())
            .map(|field| self.column(field))
            .collect()
    }

    fn break_down_filters(&self) -> Result<Vec<String>, AggregationError> {
        self.options
            .break_down_by_filters
            .iter()
            .map(|filter| match to_sql(filter, self.schema, self.fields) {
                Ok(sql) if !sql.is_empty() => Ok(sql),
                Ok(_) => Err(AggregationError::InvalidBreakDownFilter),
                Err(err) => {
                    debug!("break down filter `{filter}` rejected: {err}");
                    Err(AggregationError::InvalidBreakDownFilter)
                }
            })
            .collect()
    }

    fn limit(&self) -> Result<String, AggregationError> {
        let limit = self.options.horizontal_axis_limit.trim();
        if limit.is_empty() {
            return Ok(String::new());
        }
        limit
            .parse::<u64>()
            .map(|value| value.to_string())
            .map_err(|_| AggregationError::InvalidHorizontalAxisLimit)
    }

    /// Grouping column, aliased to the quoted field name when it lives in a
    /// map.
    fn column(&self, field: &str) -> Result<SelectedColumn, AggregationError> {
        if !is_identifier(field) {
            return Err(AggregationError::Invalid);
        }
        if is_reserved_alias(field) {
            return Err(AggregationError::ReservedField(field.to_string()));
        }
        let resolved = self.schema.resolve(field, TypeContext::Unknown, self.fields);
        let select = if resolved == field {
            resolved.clone()
        } else {
            format!("{resolved} AS `{field}`")
        };
        Ok(SelectedColumn {
            select,
            group: resolved,
        })
    }

    /// min, max, sum and avg only make sense on numbers.
    fn aggregate_field(&self, operation: Operation, field: &str) -> Result<String, AggregationError> {
        if !is_identifier(field) {
            return Err(AggregationError::Invalid);
        }
        let context = match operation {
            Operation::Count => TypeContext::Unknown,
            _ => TypeContext::Number,
        };
        Ok(self.schema.resolve(field, context, self.fields))
    }
}

/// Names the planner gives its own result columns: `time`, `<op>_data`
/// and `<op>_data_filter<n>`.
fn is_reserved_alias(field: &str) -> bool {
    if field == "time" {
        return true;
    }
    Operation::ALL.iter().any(|operation| {
        field
            .strip_prefix(operation.name())
            .and_then(|rest| rest.strip_prefix("_data"))
            .is_some_and(|rest| match rest.strip_prefix("_filter") {
                Some(index) => !index.is_empty() && index.bytes().all(|b| b.is_ascii_digit()),
                None => rest.is_empty(),
            })
    })
}

struct SelectedColumn {
    select: String,
    group: String,
}

/// Width of a time-series bucket, in seconds, for a span of `span` seconds.
pub fn time_interval(span: i64) -> i64 {
    let divisor = match span {
        s if s <= 2 => 1,
        s if s <= 10 => 5,
        s if s <= 30 => 15,
        s if s <= 60 => 30,
        s if s <= 120 => 60,
        _ => 100,
    };
    (span / divisor).max(1)
}

pub async fn run_aggregation(
    executor: &dyn Executor,
    schema: &LogsSchema,
    fields: &FieldSnapshot,
    aggregation: &Aggregation,
) -> Result<AggregationResult, AppError> {
    let AggregationTimes {
        time_start,
        time_end,
    } = aggregation.times;
    let conds = to_sql(&aggregation.query, schema, fields)?;
    let span = time_span(time_start, time_end)?;
    let plan = plan(aggregation, span, schema, fields)?;
    let sql = aggregation_sql(schema, &plan, time_start, time_end, &conds);
    debug!("aggregation query (chart={}): {sql}", aggregation.chart);

    let mut rows = executor.query(&sql).await?;
    let columns = rows.columns().to_vec();
    let mut result = AggregationResult {
        rows: Vec::new(),
        columns: columns.clone(),
    };
    while let Some(row) = rows.next_row().await? {
        let mut entry = Map::new();
        for (column, value) in columns.iter().zip(row.into_values()) {
            if value.is_non_finite() {
                continue;
            }
            entry.insert(column.clone(), value.to_json());
        }
        result.rows.push(entry);
    }
    Ok(result)
}

fn aggregation_sql(
    schema: &LogsSchema,
    plan: &AggregationPlan,
    time_start: i64,
    time_end: i64,
    conds: &str,
) -> String {
    let mut sql = format!(
        "SELECT {} FROM {} WHERE timestamp >= {} AND timestamp <= {}",
        plan.select,
        schema.table(),
        from_unixtime(time_start),
        from_unixtime(time_end)
    );
    if !conds.is_empty() {
        sql.push_str(&format!(" AND ({conds})"));
    }
    sql.push_str(&format!(" GROUP BY {}", plan.group_by));
    if !plan.order_by.is_empty() {
        sql.push_str(&format!(" ORDER BY {}", plan.order_by));
    }
    if !plan.limit.is_empty() {
        sql.push_str(&format!(" LIMIT {}", plan.limit));
    }
    sql.push(' ');
    sql.push_str(SETTINGS_CLAUSE);
    sql
}
