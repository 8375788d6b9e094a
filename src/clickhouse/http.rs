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

use std::{
    pin::Pin,
    sync::{Arc, PoisonError, RwLock},
    time::Instant,
};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use log::{debug, info};
use reqwest::{Client, header};
use serde_json::Value as JsonValue;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use url::Url;

use crate::{config::ClickHouseConfig, error::AppError};

use super::{Executor, ExecutorError, Row, RowStream, Rows, Value};

const OUTPUT_FORMAT: &str = "JSONCompactEachRowWithNamesAndTypes";

/// [`Executor`] speaking the ClickHouse HTTP protocol.
#[derive(Clone)]
pub struct ClickHouseClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    cfg: ClickHouseConfig,
    endpoint: Url,
    pool: RwLock<PooledClient>,
    permits: Option<Arc<Semaphore>>,
}

#[derive(Clone)]
struct PooledClient {
    client: Client,
    created_at: Instant,
}

impl ClickHouseClient {
    pub fn new(cfg: ClickHouseConfig) -> Result<Self, AppError> {
        let endpoint = Url::parse(&cfg.address)
            .map_err(|err| AppError::Config(format!("invalid clickhouse address {}: {err}", cfg.address)))?;
        let client = build_http_client(&cfg).map_err(|err| {
            AppError::Config(format!("failed to construct clickhouse http client: {err}"))
        })?;
        let permits = (cfg.max_open_conns > 0).then(|| Arc::new(Semaphore::new(cfg.max_open_conns)));
        info!(
            "clickhouse client configured for {} (database={}, max_open_conns={}, max_idle_conns={})",
            endpoint, cfg.database, cfg.max_open_conns, cfg.max_idle_conns
        );
        Ok(Self {
            inner: Arc::new(ClientInner {
                endpoint,
                pool: RwLock::new(PooledClient {
                    client,
                    created_at: Instant::now(),
                }),
                permits,
                cfg,
            }),
        })
    }

    pub fn config(&self) -> &ClickHouseConfig {
        &self.inner.cfg
    }

    pub async fn version(&self) -> Result<String, ExecutorError> {
        let mut rows = self.query("SELECT version() AS version").await?;
        let row = rows
            .next_row()
            .await?
            .ok_or_else(|| ExecutorError::Decode("missing version in response".into()))?;
        row.expect_value(0, "version")?
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ExecutorError::Decode("version is not a string".into()))
    }

    /// Hands out the pooled HTTP client, rebuilding it once it is older than
    /// `conn_max_lifetime` so that every pooled connection gets recycled.
    fn http_client(&self) -> Result<Client, ExecutorError> {
        let Some(max_lifetime) = self.inner.cfg.conn_max_lifetime else {
            return Ok(self.read_pool().client);
        };
        let pooled = self.read_pool();
        if pooled.created_at.elapsed() < max_lifetime {
            return Ok(pooled.client);
        }
        let mut pool = self
            .inner
            .pool
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if pool.created_at.elapsed() >= max_lifetime {
            debug!("recycling clickhouse connections after {:?}", max_lifetime);
            *pool = PooledClient {
                client: build_http_client(&self.inner.cfg)?,
                created_at: Instant::now(),
            };
        }
        Ok(pool.client.clone())
    }

    fn read_pool(&self) -> PooledClient {
        self.inner
            .pool
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn query_url(&self) -> Url {
        let mut url = self.inner.endpoint.clone();
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("database", &self.inner.cfg.database);
            pairs.append_pair("default_format", OUTPUT_FORMAT);
            pairs.append_pair("date_time_output_format", "iso");
            pairs.append_pair("output_format_json_quote_denormals", "1");
            for (key, value) in &self.inner.cfg.settings {
                pairs.append_pair(key, value);
            }
        }
        url
    }
}

fn build_http_client(cfg: &ClickHouseConfig) -> Result<Client, ExecutorError> {
    let mut headers = header::HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    let client = Client::builder()
        .connect_timeout(cfg.dial_timeout)
        .pool_max_idle_per_host(cfg.max_idle_conns)
        .default_headers(headers)
        .build()?;
    Ok(client)
}

#[async_trait]
impl Executor for ClickHouseClient {
    async fn query(&self, sql: &str) -> Result<Rows, ExecutorError> {
        let permit = match &self.inner.permits {
            Some(permits) => Some(
                permits
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| ExecutorError::Closed)?,
            ),
            None => None,
        };
        let cfg = &self.inner.cfg;
        let response = self
            .http_client()?
            .post(self.query_url())
            .basic_auth(&cfg.username, Some(&cfg.password))
            .body(sql.to_string())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unavailable>".to_string());
            return Err(ExecutorError::Status {
                status: status.as_u16(),
                body: body.trim().to_string(),
            });
        }

        let mut rows = HttpRows {
            stream: Box::pin(response.bytes_stream()),
            buffer: Vec::new(),
            columns: Vec::new(),
            types: Vec::new(),
            finished: false,
            _permit: permit,
        };
        rows.read_header().await?;
        Ok(Box::new(rows))
    }
}

type ByteStream = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

/// Line-delimited `JSONCompactEachRowWithNamesAndTypes` body: column names,
/// column types, then one JSON array per row.
struct HttpRows {
    stream: ByteStream,
    buffer: Vec<u8>,
    columns: Vec<String>,
    types: Vec<String>,
    finished: bool,
    _permit: Option<OwnedSemaphorePermit>,
}

impl HttpRows {
    async fn read_header(&mut self) -> Result<(), ExecutorError> {
        let names = self
            .next_line()
            .await?
            .ok_or_else(|| ExecutorError::Decode("response is missing column names".into()))?;
        let types = self
            .next_line()
            .await?
            .ok_or_else(|| ExecutorError::Decode("response is missing column types".into()))?;
        self.columns = parse_string_array(&names)?;
        self.types = parse_string_array(&types)?;
        if self.columns.len() != self.types.len() {
            return Err(ExecutorError::Decode(format!(
                "response announced {} columns but {} types",
                self.columns.len(),
                self.types.len()
            )));
        }
        Ok(())
    }

    async fn next_line(&mut self) -> Result<Option<String>, ExecutorError> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|byte| *byte == b'\n') {
                let line: Vec<u8> = self.buffer.drain(..=pos).collect();
                let text = String::from_utf8_lossy(&line[..pos]).trim().to_string();
                if text.is_empty() {
                    continue;
                }
                return Ok(Some(text));
            }
            if self.finished {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                let text = String::from_utf8_lossy(&self.buffer).trim().to_string();
                self.buffer.clear();
                return Ok((!text.is_empty()).then_some(text));
            }
            match self.stream.next().await {
                Some(chunk) => self.buffer.extend_from_slice(&chunk?),
                None => self.finished = true,
            }
        }
    }
}

#[async_trait]
impl RowStream for HttpRows {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    async fn next_row(&mut self) -> Result<Option<Row>, ExecutorError> {
        let Some(line) = self.next_line().await? else {
            return Ok(None);
        };
        decode_row(&line, &self.types).map(Some)
    }
}

fn decode_row(line: &str, types: &[String]) -> Result<Row, ExecutorError> {
    // Errors raised after the first bytes were sent arrive in-band.
    if line.starts_with("Code:") {
        return Err(ExecutorError::Status {
            status: 500,
            body: line.to_string(),
        });
    }
    let cells: Vec<JsonValue> = serde_json::from_str(line)
        .map_err(|err| ExecutorError::Decode(format!("invalid row `{line}`: {err}")))?;
    if cells.len() != types.len() {
        return Err(ExecutorError::Decode(format!(
            "row has {} values but {} columns were announced",
            cells.len(),
            types.len()
        )));
    }
    cells
        .into_iter()
        .zip(types)
        .map(|(cell, data_type)| Value::decode(cell, data_type))
        .collect::<Result<Vec<_>, _>>()
        .map(Row::new)
}

fn parse_string_array(line: &str) -> Result<Vec<String>, ExecutorError> {
    serde_json::from_str(line)
        .map_err(|err| ExecutorError::Decode(format!("invalid header `{line}`: {err}")))
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, time::Duration};

    use futures_util::stream;

    use super::*;

    fn rows_from_chunks(chunks: Vec<&'static str>) -> HttpRows {
        let chunks: Vec<reqwest::Result<Bytes>> = chunks
            .into_iter()
            .map(|chunk| Ok(Bytes::from_static(chunk.as_bytes())))
            .collect();
        HttpRows {
            stream: Box::pin(stream::iter(chunks)),
            buffer: Vec::new(),
            columns: Vec::new(),
            types: Vec::new(),
            finished: false,
            _permit: None,
        }
    }

    fn config() -> ClickHouseConfig {
        ClickHouseConfig {
            address: "http://localhost:8123".into(),
            username: "default".into(),
            password: String::new(),
            database: "logs".into(),
            materialized_columns: Vec::new(),
            dial_timeout: Duration::from_secs(10),
            conn_max_lifetime: None,
            max_idle_conns: 5,
            max_open_conns: 10,
            settings: BTreeMap::from([("max_execution_time".to_string(), "60".to_string())]),
        }
    }

    #[tokio::test]
    async fn streams_rows_split_across_chunks() {
        let mut rows = rows_from_chunks(vec![
            "[\"interval_data\",\"count_data\"]\n[\"DateTime\",",
            "\"UInt64\"]\n[\"2024-05-01T10:00:00Z\",\"16\"]\n",
            "[\"2024-05-01T10:02:00Z\",\"0\"]",
        ]);
        rows.read_header().await.unwrap();
        assert_eq!(rows.columns(), ["interval_data", "count_data"]);
        let first = rows.next_row().await.unwrap().unwrap();
        assert_eq!(first.get(1), Some(&Value::UInt(16)));
        let second = rows.next_row().await.unwrap().unwrap();
        assert_eq!(second.get(1), Some(&Value::UInt(0)));
        assert!(rows.next_row().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn in_band_exception_is_surfaced() {
        let mut rows = rows_from_chunks(vec![
            "[\"log\"]\n[\"String\"]\n",
            "Code: 241. DB::Exception: Memory limit exceeded\n",
        ]);
        rows.read_header().await.unwrap();
        let err = rows.next_row().await.unwrap_err();
        assert!(err.to_string().contains("Memory limit exceeded"));
    }

    #[tokio::test]
    async fn missing_header_is_decode_error() {
        let mut rows = rows_from_chunks(vec![]);
        assert!(matches!(
            rows.read_header().await,
            Err(ExecutorError::Decode(_))
        ));
    }

    #[test]
    fn query_url_carries_format_and_settings() {
        let client = ClickHouseClient::new(config()).unwrap();
        let url = client.query_url();
        let pairs: BTreeMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs.get("database").map(String::as_str), Some("logs"));
        assert_eq!(pairs.get("default_format").map(String::as_str), Some(OUTPUT_FORMAT));
        assert_eq!(pairs.get("max_execution_time").map(String::as_str), Some("60"));
    }

    #[test]
    fn rejects_invalid_address() {
        let mut cfg = config();
        cfg.address = "not a url".into();
        assert!(matches!(ClickHouseClient::new(cfg), Err(AppError::Config(_))));
    }
}
