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

use std::sync::Arc;

use log::{info, warn};
use tokio::sync::watch;

use crate::{
    aggregation::{Aggregation, AggregationResult, run_aggregation},
    clickhouse::{ClickHouseClient, Executor, LogsSchema},
    config::{ClickHouseConfig, MAX_LIMIT},
    error::AppError,
    fields::{FieldCache, FieldRefresher, FieldType},
    logs::{LogsRequest, LogsResult, get_logs},
};

#[derive(Clone)]
pub struct AppState {
    executor: Arc<dyn Executor>,
    schema: Arc<LogsSchema>,
    fields: Arc<FieldCache>,
    default_limit: u64,
    // Dropping the last clone stops the field cache refresher.
    _shutdown: Arc<watch::Sender<bool>>,
}

pub struct AppConfig {
    pub clickhouse: ClickHouseConfig,
    pub default_limit: u64,
}

impl AppState {
    pub async fn bootstrap(config: AppConfig) -> Result<Self, AppError> {
        let AppConfig {
            clickhouse,
            default_limit,
        } = config;
        info!("connecting to clickhouse at {}", clickhouse.address);
        let client = ClickHouseClient::new(clickhouse.clone())?;
        verify_connection(&client).await;

        let schema = LogsSchema::new(clickhouse.database, clickhouse.materialized_columns);
        let state = Self::new(Arc::new(client), schema, default_limit);

        info!("loading field cache");
        let (shutdown, rx) = watch::channel(false);
        FieldRefresher::new(state.executor.clone(), state.schema.clone(), state.fields.clone())
            .start(rx)
            .await;
        Ok(Self {
            _shutdown: Arc::new(shutdown),
            ..state
        })
    }

    /// State without a background refresher; the field cache stays empty
    /// until merged into explicitly.
    pub fn new(executor: Arc<dyn Executor>, schema: LogsSchema, default_limit: u64) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            executor,
            schema: Arc::new(schema),
            fields: Arc::new(FieldCache::new()),
            default_limit,
            _shutdown: Arc::new(shutdown),
        }
    }

    pub fn schema(&self) -> &LogsSchema {
        &self.schema
    }

    pub fn field_cache(&self) -> &FieldCache {
        &self.fields
    }

    pub fn clamp_limit(&self, requested: Option<u64>) -> u64 {
        requested
            .map(|value| value.min(MAX_LIMIT))
            .unwrap_or(self.default_limit)
    }

    pub async fn logs(&self, request: &LogsRequest) -> Result<LogsResult, AppError> {
        let fields = self.fields.snapshot();
        get_logs(self.executor.as_ref(), &self.schema, &fields, request).await
    }

    pub async fn aggregate(&self, aggregation: &Aggregation) -> Result<AggregationResult, AppError> {
        let fields = self.fields.snapshot();
        run_aggregation(self.executor.as_ref(), &self.schema, &fields, aggregation).await
    }

    pub fn list_fields(&self, filter: &str, field_type: FieldType) -> Vec<String> {
        self.fields.get_fields(&self.schema, filter, field_type)
    }
}

async fn verify_connection(client: &ClickHouseClient) {
    match client.version().await {
        Ok(version) => info!("connected to ClickHouse {version}"),
        Err(err) => warn!("server version unavailable: {err}"),
    }
}
