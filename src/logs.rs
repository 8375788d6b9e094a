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

//! Logs search: a histogram query over the requested range, then a row
//! query restricted to the buckets that can contribute to the first page.

use std::time::Instant;

use log::debug;
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};

use crate::{
    clickhouse::{
        Executor, FIXED_COLUMNS, LogsSchema, Row, SETTINGS_CLAUSE, SortDirection, Value,
        from_unixtime,
    },
    error::AppError,
    fields::{FieldSnapshot, KeySet},
    query::{is_identifier, to_sql},
};

const ROW_COLUMNS: &str =
    "timestamp, cluster, namespace, app, pod_name, container_name, host, fields_string, fields_number, log";
const BUCKET_COUNT: i64 = 30;

#[derive(Debug, Clone, Default)]
pub struct LogsRequest {
    pub query: String,
    pub order: String,
    pub order_by: String,
    pub limit: u64,
    pub time_start: i64,
    pub time_end: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Bucket {
    pub interval: i64,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogsResult {
    pub documents: Vec<Map<String, JsonValue>>,
    pub fields: Vec<String>,
    pub count: i64,
    pub took: i64,
    pub buckets: Vec<Bucket>,
}

/// Resolved `ORDER BY` of the row query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogsOrder {
    field: String,
    direction: SortDirection,
    clause: String,
}

impl LogsOrder {
    pub fn parse(schema: &LogsSchema, order: &str, order_by: &str) -> Result<Self, AppError> {
        let order_by = order_by.trim();
        let (field, direction) = if order.is_empty() || order_by.is_empty() {
            ("timestamp", SortDirection::Desc)
        } else if order == "ascending" {
            (order_by, SortDirection::Asc)
        } else {
            (order_by, SortDirection::Desc)
        };
        if !is_identifier(field) {
            return Err(AppError::BadRequest("invalid order by field".into()));
        }
        Ok(Self {
            field: field.to_string(),
            direction,
            clause: schema.order_clause(field, direction),
        })
    }

    pub fn clause(&self) -> &str {
        &self.clause
    }

    fn by_time(&self) -> Option<SortDirection> {
        (self.field == "timestamp").then_some(self.direction)
    }
}

/// Length in seconds of a requested time range, which must end after it
/// starts.
pub fn time_span(time_start: i64, time_end: i64) -> Result<i64, AppError> {
    if time_end <= time_start {
        return Err(AppError::InvalidTimeRange);
    }
    time_end
        .checked_sub(time_start)
        .ok_or_else(|| AppError::BadRequest("time range is too large".into()))
}

/// Bucket width in seconds for a histogram of roughly thirty buckets over
/// `span` seconds.
pub fn bucket_interval(span: i64) -> i64 {
    (span / BUCKET_COUNT).max(1)
}

/// Clips the bucket starting at `bucket_start` to `[time_start, time_end]`.
pub fn bucket_times(interval: i64, bucket_start: i64, time_start: i64, time_end: i64) -> (i64, i64) {
    let bucket_end = bucket_start.saturating_add(interval);
    if bucket_start < time_start {
        (time_start, bucket_end)
    } else if bucket_end > time_end {
        (bucket_start, time_end)
    } else {
        (bucket_start, bucket_end)
    }
}

pub async fn get_logs(
    executor: &dyn Executor,
    schema: &LogsSchema,
    fields: &FieldSnapshot,
    request: &LogsRequest,
) -> Result<LogsResult, AppError> {
    let started = Instant::now();
    let conds = to_sql(&request.query, schema, fields)?;
    let order = LogsOrder::parse(schema, &request.order, &request.order_by)?;
    let span = time_span(request.time_start, request.time_end)?;

    let interval = bucket_interval(span);
    let sql = histogram_sql(schema, request, interval, &conds);
    debug!("logs histogram query (query={:?}): {sql}", request.query);
    let buckets = fetch_buckets(executor, &sql).await?;

    let (time_conditions, count) = time_predicate(&buckets, interval, request, &order);
    if count == 0 || request.limit == 0 || time_conditions.is_empty() {
        return Ok(LogsResult {
            documents: Vec::new(),
            fields: default_fields().into_vec(),
            count,
            took: elapsed_ms(started),
            buckets,
        });
    }

    let sql = format!(
        "SELECT {ROW_COLUMNS} FROM {} WHERE ({time_conditions}){} ORDER BY {} LIMIT {} {SETTINGS_CLAUSE}",
        schema.table(),
        and_conds(&conds),
        order.clause(),
        request.limit
    );
    debug!("logs row query (order={}, limit={}): {sql}", order.clause(), request.limit);

    let mut rows = executor.query(&sql).await?;
    let columns = rows.columns().to_vec();
    let mut documents = Vec::new();
    let mut fields = default_fields();
    while let Some(row) = rows.next_row().await? {
        documents.push(assemble_document(&columns, row, &mut fields));
    }
    let mut fields = fields.into_vec();
    fields.sort();

    Ok(LogsResult {
        documents,
        fields,
        count,
        took: elapsed_ms(started),
        buckets,
    })
}

fn histogram_sql(schema: &LogsSchema, request: &LogsRequest, interval: i64, conds: &str) -> String {
    let start = from_unixtime(request.time_start);
    let end = from_unixtime(request.time_end);
    format!(
        "SELECT toStartOfInterval(timestamp, INTERVAL {interval} second) AS interval_data, count(*) AS count_data \
         FROM {} WHERE timestamp >= {start} AND timestamp <= {end}{} \
         GROUP BY interval_data ORDER BY interval_data \
         WITH FILL FROM toStartOfInterval({start}, INTERVAL {interval} second) \
         TO toStartOfInterval({end}, INTERVAL {interval} second) STEP {interval} \
         {SETTINGS_CLAUSE}",
        schema.table(),
        and_conds(conds),
    )
}

async fn fetch_buckets(executor: &dyn Executor, sql: &str) -> Result<Vec<Bucket>, AppError> {
    let mut rows = executor.query(sql).await?;
    let mut buckets = Vec::new();
    while let Some(row) = rows.next_row().await? {
        let interval = row.expect_value(0, "interval_data")?;
        let interval = interval
            .as_timestamp()
            .map(|ts| ts.timestamp())
            .or_else(|| interval.as_i64())
            .ok_or_else(|| AppError::Internal(format!("unexpected interval_data {interval:?}")))?;
        let count = row
            .expect_value(1, "count_data")?
            .as_i64()
            .ok_or_else(|| AppError::Internal("unexpected count_data".into()))?;
        buckets.push(Bucket { interval, count });
    }
    buckets.sort_by_key(|bucket| bucket.interval);
    Ok(buckets)
}

/// Builds the OR-ed time ranges of the row query and the total count.
///
/// For time ordered queries only the buckets needed to fill `limit`
/// documents are kept, walking from the end the ordering starts at.
fn time_predicate(
    buckets: &[Bucket],
    interval: i64,
    request: &LogsRequest,
    order: &LogsOrder,
) -> (String, i64) {
    let walk: Vec<&Bucket> = match order.by_time() {
        Some(SortDirection::Desc) => buckets.iter().rev().collect(),
        _ => buckets.iter().collect(),
    };
    let limited = order.by_time().is_some();
    let limit = i64::try_from(request.limit).unwrap_or(i64::MAX);

    let mut ranges = Vec::new();
    let mut total = 0i64;
    for bucket in walk {
        if bucket.count > 0 && (!limited || total < limit) {
            let (start, end) =
                bucket_times(interval, bucket.interval, request.time_start, request.time_end);
            ranges.push(format!(
                "(timestamp >= {} AND timestamp <= {})",
                from_unixtime(start),
                from_unixtime(end)
            ));
        }
        total = total.saturating_add(bucket.count);
    }
    (ranges.join(" OR "), total)
}

/// Turns a row into a document: fixed columns first, then every
/// `fields_number` entry, then every `fields_string` entry, so string
/// values win for keys present in both maps.
fn assemble_document(columns: &[String], row: Row, fields: &mut KeySet) -> Map<String, JsonValue> {
    let mut document = Map::new();
    let mut numbers = Vec::new();
    let mut strings = Vec::new();
    for (column, value) in columns.iter().zip(row.into_values()) {
        match (column.as_str(), value) {
            ("fields_number", Value::Map(entries)) => numbers = entries,
            ("fields_string", Value::Map(entries)) => strings = entries,
            ("fields_string" | "fields_number", _) => {}
            (_, value) => {
                document.insert(column.clone(), value.to_json());
            }
        }
    }
    for (key, value) in numbers.into_iter().chain(strings) {
        fields.insert(&key);
        document.insert(key, value.to_json());
    }
    document
}

fn default_fields() -> KeySet {
    let mut fields = KeySet::new();
    fields.extend(FIXED_COLUMNS);
    fields
}

fn and_conds(conds: &str) -> String {
    if conds.is_empty() {
        String::new()
    } else {
        format!(" AND ({conds})")
    }
}

fn elapsed_ms(started: Instant) -> i64 {
    i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Utc};

    use super::*;
    use crate::clickhouse::{ExecutorError, RecordingExecutor};

    const START: i64 = 1_699_999_200;
    const HOUR: i64 = 3_600;

    fn ts(secs: i64) -> Value {
        Value::Timestamp(DateTime::<Utc>::from_timestamp(secs, 0).unwrap())
    }

    fn histogram(counts: &[(i64, u64)]) -> Vec<Vec<Value>> {
        counts
            .iter()
            .map(|(start, count)| vec![ts(*start), Value::UInt(*count)])
            .collect()
    }

    fn request(order: &str, order_by: &str, limit: u64) -> LogsRequest {
        LogsRequest {
            query: String::new(),
            order: order.into(),
            order_by: order_by.into(),
            limit,
            time_start: START,
            time_end: START + HOUR,
        }
    }

    fn range(start: i64, end: i64) -> String {
        format!("(timestamp >= FROM_UNIXTIME({start}) AND timestamp <= FROM_UNIXTIME({end}))")
    }

    fn log_row(namespace: &str) -> Vec<Value> {
        vec![
            ts(START + 10),
            Value::String("prod".into()),
            Value::String(namespace.into()),
            Value::String("reviews".into()),
            Value::String("reviews-1".into()),
            Value::String("reviews".into()),
            Value::String("node-1".into()),
            Value::Map(vec![("user".into(), Value::String("alice".into()))]),
            Value::Map(vec![
                ("duration".into(), Value::Float(1.5)),
                ("ratio".into(), Value::Float(f64::NAN)),
            ]),
            Value::String("GET /reviews".into()),
        ]
    }

    fn row_columns() -> Vec<&'static str> {
        ROW_COLUMNS.split(", ").collect()
    }

    fn three_buckets(interval: i64) -> Vec<Vec<Value>> {
        histogram(&[(START, 16), (START + interval, 0), (START + 2 * interval, 16)])
    }

    #[test]
    fn clips_buckets_to_range() {
        assert_eq!(bucket_times(60, 100, 130, 1_000), (130, 160));
        assert_eq!(bucket_times(60, 960, 130, 1_000), (960, 1_000));
        assert_eq!(bucket_times(60, 300, 130, 1_000), (300, 360));
    }

    #[test]
    fn interval_is_at_least_one_second() {
        assert_eq!(bucket_interval(HOUR), 120);
        assert_eq!(bucket_interval(10), 1);
    }

    #[test]
    fn parses_order() {
        let schema = LogsSchema::new("logs", Vec::new());
        assert_eq!(LogsOrder::parse(&schema, "", "").unwrap().clause(), "timestamp DESC");
        assert_eq!(
            LogsOrder::parse(&schema, "ascending", "timestamp").unwrap().clause(),
            "timestamp ASC"
        );
        assert_eq!(
            LogsOrder::parse(&schema, "descending", "duration").unwrap().clause(),
            "fields_string['duration'] DESC, fields_number['duration'] DESC"
        );
        assert!(matches!(
            LogsOrder::parse(&schema, "ascending", "a;DROP"),
            Err(AppError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn descending_walk_keeps_newest_non_empty_buckets() {
        let interval = bucket_interval(HOUR);
        let executor = RecordingExecutor::new()
            .respond(&["interval_data", "count_data"], three_buckets(interval))
            .respond(&row_columns(), vec![log_row("bookinfo")]);
        let schema = LogsSchema::new("logs", Vec::new());
        let result = get_logs(&executor, &schema, &FieldSnapshot::default(), &request("", "", 128))
            .await
            .unwrap();

        let statements = executor.statements();
        assert_eq!(statements.len(), 2);
        assert!(statements[0].contains("WITH FILL FROM toStartOfInterval"));
        let expected = format!(
            "WHERE ({} OR {}) ORDER BY timestamp DESC LIMIT 128",
            range(START + 2 * interval, START + 3 * interval),
            range(START, START + interval)
        );
        assert!(statements[1].contains(&expected), "{}", statements[1]);

        assert_eq!(result.count, 32);
        assert_eq!(result.buckets.iter().map(|b| b.count).sum::<i64>(), result.count);
        assert_eq!(result.documents.len(), 1);
    }

    #[tokio::test]
    async fn limit_shortcut_follows_sort_direction() {
        let interval = bucket_interval(HOUR);
        let schema = LogsSchema::new("logs", Vec::new());

        let executor = RecordingExecutor::new()
            .respond(&["interval_data", "count_data"], three_buckets(interval))
            .respond(&row_columns(), Vec::new());
        get_logs(&executor, &schema, &FieldSnapshot::default(), &request("descending", "timestamp", 10))
            .await
            .unwrap();
        let newest = format!("WHERE ({}) ORDER BY", range(START + 2 * interval, START + 3 * interval));
        assert!(executor.statements()[1].contains(&newest));

        let executor = RecordingExecutor::new()
            .respond(&["interval_data", "count_data"], three_buckets(interval))
            .respond(&row_columns(), Vec::new());
        get_logs(&executor, &schema, &FieldSnapshot::default(), &request("ascending", "timestamp", 10))
            .await
            .unwrap();
        let oldest = format!("WHERE ({}) ORDER BY timestamp ASC", range(START, START + interval));
        assert!(executor.statements()[1].contains(&oldest));
    }

    #[tokio::test]
    async fn non_time_order_uses_every_non_empty_bucket() {
        let interval = bucket_interval(HOUR);
        let executor = RecordingExecutor::new()
            .respond(&["interval_data", "count_data"], three_buckets(interval))
            .respond(&row_columns(), Vec::new());
        let schema = LogsSchema::new("logs", Vec::new());
        get_logs(&executor, &schema, &FieldSnapshot::default(), &request("ascending", "duration", 1))
            .await
            .unwrap();
        let expected = format!(
            "WHERE ({} OR {}) ORDER BY fields_string['duration'] ASC, fields_number['duration'] ASC LIMIT 1",
            range(START, START + interval),
            range(START + 2 * interval, START + 3 * interval)
        );
        assert!(executor.statements()[1].contains(&expected));
    }

    #[tokio::test]
    async fn assembles_documents_and_fields() {
        let interval = bucket_interval(HOUR);
        let executor = RecordingExecutor::new()
            .respond(&["interval_data", "count_data"], histogram(&[(START, 1)]))
            .respond(&row_columns(), vec![log_row("bookinfo")]);
        let schema = LogsSchema::new("logs", Vec::new());
        let mut req = request("", "", 100);
        req.query = "namespace = 'bookinfo'".into();
        let result = get_logs(&executor, &schema, &FieldSnapshot::default(), &req)
            .await
            .unwrap();

        let statements = executor.statements();
        assert!(statements[0].contains(
            "timestamp <= FROM_UNIXTIME(1700002800) AND (namespace = 'bookinfo') GROUP BY interval_data"
        ));
        assert!(statements[1].contains(&format!(
            "WHERE ({}) AND (namespace = 'bookinfo')",
            range(START, START + interval)
        )));

        let doc = &result.documents[0];
        assert_eq!(doc["namespace"], "bookinfo");
        assert_eq!(doc["user"], "alice");
        assert_eq!(doc["duration"], 1.5);
        assert_eq!(doc["ratio"], JsonValue::Null);
        assert!(doc.get("fields_string").is_none());
        assert!(doc["timestamp"].as_str().unwrap().starts_with("2023-11-14T22:00:10"));

        let mut expected = default_fields().into_vec();
        expected.extend(["duration", "ratio", "user"].map(String::from));
        expected.sort();
        assert_eq!(result.fields, expected);
    }

    #[tokio::test]
    async fn empty_histogram_skips_row_query() {
        let executor = RecordingExecutor::new().respond(
            &["interval_data", "count_data"],
            histogram(&[(START, 0), (START + 120, 0)]),
        );
        let schema = LogsSchema::new("logs", Vec::new());
        let result = get_logs(&executor, &schema, &FieldSnapshot::default(), &request("", "", 100))
            .await
            .unwrap();
        assert_eq!(executor.statements().len(), 1);
        assert_eq!(result.count, 0);
        assert_eq!(result.buckets.len(), 2);
        assert_eq!(result.fields, default_fields().into_vec());
    }

    #[tokio::test]
    async fn zero_limit_returns_no_documents() {
        let executor = RecordingExecutor::new()
            .respond(&["interval_data", "count_data"], histogram(&[(START, 5)]));
        let schema = LogsSchema::new("logs", Vec::new());
        let result = get_logs(&executor, &schema, &FieldSnapshot::default(), &request("", "", 0))
            .await
            .unwrap();
        assert_eq!(executor.statements().len(), 1);
        assert!(result.documents.is_empty());
        assert_eq!(result.count, 5);
    }

    #[tokio::test]
    async fn rejects_empty_time_range_before_querying() {
        let executor = RecordingExecutor::new();
        let schema = LogsSchema::new("logs", Vec::new());
        let mut req = request("", "", 100);
        req.time_end = req.time_start;
        let err = get_logs(&executor, &schema, &FieldSnapshot::default(), &req)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "invalid time range");
        assert!(executor.statements().is_empty());
    }

    #[tokio::test]
    async fn rejects_overflowing_time_range() {
        let executor = RecordingExecutor::new();
        let schema = LogsSchema::new("logs", Vec::new());
        let mut req = request("", "", 10);
        req.time_start = i64::MIN;
        req.time_end = 1;
        let err = get_logs(&executor, &schema, &FieldSnapshot::default(), &req)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
        assert_eq!(err.to_string(), "time range is too large");
        assert!(executor.statements().is_empty());

        req.time_start = i64::MAX;
        req.time_end = i64::MIN;
        let err = get_logs(&executor, &schema, &FieldSnapshot::default(), &req)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidTimeRange));
    }

    #[test]
    fn string_values_win_over_number_values() {
        let columns: Vec<String> = row_columns().into_iter().map(String::from).collect();
        let mut values = log_row("bookinfo");
        values[7] = Value::Map(vec![("status".into(), Value::String("ok".into()))]);
        values[8] = Value::Map(vec![
            ("status".into(), Value::Float(200.0)),
            ("duration".into(), Value::Float(1.5)),
        ]);
        let mut fields = default_fields();
        let document = assemble_document(&columns, Row::new(values), &mut fields);
        assert_eq!(document["status"], "ok");
        assert_eq!(document["duration"], 1.5);
        let dynamic: Vec<&String> = fields.as_slice().iter().skip(FIXED_COLUMNS.len()).collect();
        assert_eq!(dynamic, ["status", "duration"]);
    }

    #[tokio::test]
    async fn parse_errors_short_circuit() {
        let executor = RecordingExecutor::new();
        let schema = LogsSchema::new("logs", Vec::new());
        let mut req = request("", "", 100);
        req.query = "(namespace = 'a'".into();
        let err = get_logs(&executor, &schema, &FieldSnapshot::default(), &req)
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("Failed to parse query:"));
        assert!(executor.statements().is_empty());
    }

    #[tokio::test]
    async fn executor_errors_propagate() {
        let executor = RecordingExecutor::new().fail(ExecutorError::Status {
            status: 500,
            body: "Code: 60. DB::Exception: Table logs.logs doesn't exist".into(),
        });
        let schema = LogsSchema::new("logs", Vec::new());
        let err = get_logs(&executor, &schema, &FieldSnapshot::default(), &request("", "", 100))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Executor(_)));
        assert!(err.to_string().contains("doesn't exist"));
    }
}
