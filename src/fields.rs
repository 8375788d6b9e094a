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

//! Cache of the dynamic keys seen in `fields_string` and `fields_number`.
//!
//! The cache only ever grows. A background task merges the keys observed
//! during the last hour into it once per day; readers take a snapshot and
//! never block the writer for longer than a pointer swap.

use std::{
    collections::HashSet,
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use chrono::Utc;
use log::{debug, info, warn};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{Instant, interval_at, timeout},
};

use crate::{
    clickhouse::{
        Executor, FIXED_COLUMNS, LogsSchema, SETTINGS_CLAUSE, collect_rows, from_unixtime,
    },
    error::AppError,
};

pub const REFRESH_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
pub const REFRESH_TIMEOUT: Duration = Duration::from_secs(60);
const LOOKBACK_SECS: i64 = 3_600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Number,
}

impl FieldKind {
    fn map_column(self) -> &'static str {
        match self {
            FieldKind::String => "fields_string",
            FieldKind::Number => "fields_number",
        }
    }
}

/// Which keys the autocomplete asks for; `All` is the empty `fieldType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Number,
    All,
}

impl FieldType {
    pub fn parse(raw: Option<&str>) -> Result<Self, AppError> {
        match raw.map(str::trim).unwrap_or_default() {
            "" => Ok(FieldType::All),
            "string" => Ok(FieldType::String),
            "number" => Ok(FieldType::Number),
            other => Err(AppError::BadRequest(format!("invalid field type `{other}`"))),
        }
    }
}

/// Keys without duplicates, in first-seen order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeySet {
    order: Vec<String>,
    seen: HashSet<String>,
}

impl KeySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `key` unless it is already present; returns whether it was new.
    pub fn insert(&mut self, key: &str) -> bool {
        if self.seen.contains(key) {
            return false;
        }
        self.seen.insert(key.to_string());
        self.order.push(key.to_string());
        true
    }

    pub fn contains(&self, key: &str) -> bool {
        self.seen.contains(key)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.order
    }

    pub fn into_vec(self) -> Vec<String> {
        self.order
    }
}

impl<S: AsRef<str>> Extend<S> for KeySet {
    fn extend<I: IntoIterator<Item = S>>(&mut self, keys: I) {
        for key in keys {
            self.insert(key.as_ref());
        }
    }
}

/// Known map keys, each list without duplicates and in first-seen order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldSnapshot {
    string: KeySet,
    number: KeySet,
}

impl FieldSnapshot {
    pub fn new(string: Vec<String>, number: Vec<String>) -> Self {
        let mut snapshot = Self::default();
        snapshot.extend(FieldKind::String, string);
        snapshot.extend(FieldKind::Number, number);
        snapshot
    }

    pub fn string_keys(&self) -> &[String] {
        self.string.as_slice()
    }

    pub fn number_keys(&self) -> &[String] {
        self.number.as_slice()
    }

    pub fn has_number(&self, key: &str) -> bool {
        self.number.contains(key)
    }

    pub fn has_string(&self, key: &str) -> bool {
        self.string.contains(key)
    }

    /// Returns a copy extended with the keys it does not know yet.
    pub fn merged(&self, string: Vec<String>, number: Vec<String>) -> Self {
        let mut next = self.clone();
        next.extend(FieldKind::String, string);
        next.extend(FieldKind::Number, number);
        next
    }

    fn extend(&mut self, kind: FieldKind, keys: Vec<String>) {
        let target = match kind {
            FieldKind::String => &mut self.string,
            FieldKind::Number => &mut self.number,
        };
        target.extend(keys.iter().filter(|key| !key.is_empty()));
    }
}

#[derive(Debug, Default)]
pub struct FieldCache {
    current: RwLock<Arc<FieldSnapshot>>,
}

impl FieldCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Arc<FieldSnapshot> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn merge(&self, string: Vec<String>, number: Vec<String>) -> Arc<FieldSnapshot> {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let next = Arc::new(current.merged(string, number));
        *current = next.clone();
        next
    }

    /// Autocomplete lookup. String lookups also offer the fixed and
    /// materialized columns after the cached string keys.
    pub fn get_fields(&self, schema: &LogsSchema, filter: &str, field_type: FieldType) -> Vec<String> {
        let snapshot = self.snapshot();
        let mut result = KeySet::new();
        let mut push = |name: &str| {
            if name.contains(filter) {
                result.insert(name);
            }
        };

        if matches!(field_type, FieldType::String | FieldType::All) {
            snapshot.string_keys().iter().for_each(|key| push(key.as_str()));
            FIXED_COLUMNS.iter().for_each(|column| push(*column));
            schema
                .materialized_columns()
                .iter()
                .for_each(|column| push(column.as_str()));
        }
        if matches!(field_type, FieldType::Number | FieldType::All) {
            snapshot.number_keys().iter().for_each(|key| push(key.as_str()));
        }
        result.into_vec()
    }
}

/// Periodically merges freshly observed map keys into a [`FieldCache`].
#[derive(Clone)]
pub struct FieldRefresher {
    executor: Arc<dyn Executor>,
    schema: Arc<LogsSchema>,
    cache: Arc<FieldCache>,
}

impl FieldRefresher {
    pub fn new(executor: Arc<dyn Executor>, schema: Arc<LogsSchema>, cache: Arc<FieldCache>) -> Self {
        Self {
            executor,
            schema,
            cache,
        }
    }

    /// Runs the initial fetch in place, then keeps refreshing in the
    /// background until `shutdown` fires or its sender is dropped.
    pub async fn start(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        self.refresh_logged().await;
        tokio::spawn(self.run(shutdown))
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval_at(Instant::now() + REFRESH_INTERVAL, REFRESH_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.refresh_logged().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("field cache refresher stopped");
                        return;
                    }
                }
            }
        }
    }

    async fn refresh_logged(&self) {
        match self.refresh().await {
            Ok(snapshot) => info!(
                "field cache refreshed: {} string keys, {} number keys",
                snapshot.string_keys().len(),
                snapshot.number_keys().len()
            ),
            Err(err) => warn!("field cache refresh failed, keeping previous keys: {err}"),
        }
    }

    /// One bounded fetch of both key lists.
    pub async fn refresh(&self) -> Result<Arc<FieldSnapshot>, AppError> {
        let fetch = async {
            let string = self.fetch_keys(FieldKind::String).await?;
            let number = self.fetch_keys(FieldKind::Number).await?;
            Ok::<_, AppError>((string, number))
        };
        let (string, number) = timeout(REFRESH_TIMEOUT, fetch)
            .await
            .map_err(|_| AppError::Cancelled("field cache refresh timed out".into()))??;
        Ok(self.cache.merge(string, number))
    }

    async fn fetch_keys(&self, kind: FieldKind) -> Result<Vec<String>, AppError> {
        let now = Utc::now().timestamp();
        let sql = fields_sql(&self.schema, kind, now);
        debug!("field cache query: {sql}");
        let (_, rows) = collect_rows(self.executor.query(&sql).await?).await?;
        let mut keys = Vec::with_capacity(rows.len());
        for row in rows {
            if let Some(key) = row.expect_value(0, "key")?.as_str() {
                keys.push(key.to_string());
            }
        }
        Ok(keys)
    }
}

pub(crate) fn fields_sql(schema: &LogsSchema, kind: FieldKind, now: i64) -> String {
    format!(
        "SELECT DISTINCT arrayJoin(mapKeys({})) FROM {} WHERE timestamp >= {} AND timestamp <= {} {SETTINGS_CLAUSE}",
        kind.map_column(),
        schema.table(),
        from_unixtime(now - LOOKBACK_SECS),
        from_unixtime(now),
    )
}
