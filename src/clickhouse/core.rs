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

use std::collections::VecDeque;

use async_trait::async_trait;
use thiserror::Error;

use super::Value;

pub const SETTINGS_CLAUSE: &str = "SETTINGS skip_unavailable_shards = 1";

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("clickhouse request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("clickhouse returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid clickhouse response: {0}")]
    Decode(String),
    #[error("clickhouse connection pool is closed")]
    Closed,
}

/// Runs SQL against the column store.
///
/// Implementations must be safe to share between concurrent requests.
/// Dropping the returned [`Rows`] releases the underlying response; dropping
/// the future returned by `query` cancels the statement.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn query(&self, sql: &str) -> Result<Rows, ExecutorError>;
}

/// Streaming cursor over a result set.
#[async_trait]
pub trait RowStream: Send {
    fn columns(&self) -> &[String];

    async fn next_row(&mut self) -> Result<Option<Row>, ExecutorError>;
}

pub type Rows = Box<dyn RowStream>;

#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    values: Vec<Value>,
}

impl Row {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    pub(crate) fn expect_value(&self, idx: usize, column: &str) -> Result<&Value, ExecutorError> {
        self.values.get(idx).ok_or_else(|| {
            ExecutorError::Decode(format!("row is missing column `{column}` at position {idx}"))
        })
    }
}

/// Result set held in memory, used for canned results and tests.
pub struct MemoryRows {
    columns: Vec<String>,
    rows: VecDeque<Row>,
}

impl MemoryRows {
    pub fn new(columns: Vec<String>, rows: Vec<Row>) -> Self {
        Self {
            columns,
            rows: rows.into(),
        }
    }

    pub fn boxed(self) -> Rows {
        Box::new(self)
    }
}

#[async_trait]
impl RowStream for MemoryRows {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    async fn next_row(&mut self) -> Result<Option<Row>, ExecutorError> {
        Ok(self.rows.pop_front())
    }
}

/// Drains a result set into memory.
pub async fn collect_rows(mut rows: Rows) -> Result<(Vec<String>, Vec<Row>), ExecutorError> {
    let columns = rows.columns().to_vec();
    let mut collected = Vec::new();
    while let Some(row) = rows.next_row().await? {
        collected.push(row);
    }
    Ok((columns, collected))
}

pub fn from_unixtime(secs: i64) -> String {
    format!("FROM_UNIXTIME({secs})")
}

/// Fake executor answering queries with canned result sets, in order, and
/// recording every statement it receives.
#[cfg(test)]
pub(crate) struct RecordingExecutor {
    responses: std::sync::Mutex<VecDeque<Result<MemoryRows, ExecutorError>>>,
    statements: std::sync::Mutex<Vec<String>>,
}

#[cfg(test)]
impl RecordingExecutor {
    pub(crate) fn new() -> Self {
        Self {
            responses: std::sync::Mutex::new(VecDeque::new()),
            statements: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn respond(self, columns: &[&str], rows: Vec<Vec<Value>>) -> Self {
        let columns = columns.iter().map(|c| c.to_string()).collect();
        let rows = rows.into_iter().map(Row::new).collect();
        self.responses
            .lock()
            .unwrap()
            .push_back(Ok(MemoryRows::new(columns, rows)));
        self
    }

    pub(crate) fn fail(self, err: ExecutorError) -> Self {
        self.responses.lock().unwrap().push_back(Err(err));
        self
    }

    pub(crate) fn statements(&self) -> Vec<String> {
        self.statements.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[async_trait]
impl Executor for RecordingExecutor {
    async fn query(&self, sql: &str) -> Result<Rows, ExecutorError> {
        self.statements.lock().unwrap().push(sql.to_string());
        match self.responses.lock().unwrap().pop_front() {
            Some(Ok(rows)) => Ok(rows.boxed()),
            Some(Err(err)) => Err(err),
            None => Err(ExecutorError::Decode(format!("unexpected query: {sql}"))),
        }
    }
}
