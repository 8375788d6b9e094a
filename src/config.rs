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

use std::{collections::BTreeMap, net::SocketAddr, time::Duration};

use clap::Parser;
use log::warn;

use crate::{error::AppError, query::is_identifier};

pub const DEFAULT_LIMIT: u64 = 100;
pub const MAX_LIMIT: u64 = 10_000;

#[derive(Debug, Clone, Parser)]
#[command(author, version, about, disable_help_subcommand = true)]
pub struct Args {
    /// ClickHouse HTTP endpoint, e.g. http://localhost:8123
    #[arg(long, env = "KLOGS_ADDRESS", default_value = "http://localhost:8123")]
    pub address: String,
    #[arg(long, env = "KLOGS_USERNAME", default_value = "default")]
    pub username: String,
    #[arg(long, env = "KLOGS_PASSWORD", default_value = "", hide_env_values = true)]
    pub password: String,
    /// Database holding the `logs` table
    #[arg(long, env = "KLOGS_DATABASE", default_value = "logs")]
    pub database: String,
    /// Columns promoted out of the field maps, comma separated
    #[arg(
        long = "materialized-columns",
        env = "KLOGS_MATERIALIZED_COLUMNS",
        value_delimiter = ','
    )]
    pub materialized_columns: Vec<String>,
    #[arg(long = "dial-timeout", env = "KLOGS_DIAL_TIMEOUT", default_value = "10s", value_parser = parse_duration)]
    pub dial_timeout: Duration,
    /// Recycle pooled connections older than this
    #[arg(long = "conn-max-lifetime", env = "KLOGS_CONN_MAX_LIFETIME", value_parser = parse_duration)]
    pub conn_max_lifetime: Option<Duration>,
    #[arg(long = "max-idle-conns", env = "KLOGS_MAX_IDLE_CONNS", default_value_t = 5)]
    pub max_idle_conns: usize,
    /// Upper bound of concurrently running queries, 0 disables the limit
    #[arg(long = "max-open-conns", env = "KLOGS_MAX_OPEN_CONNS", default_value_t = 10)]
    pub max_open_conns: usize,
    /// ClickHouse setting forwarded with every query, as key=value
    #[arg(
        long = "setting",
        env = "KLOGS_SETTINGS",
        value_delimiter = ',',
        value_parser = parse_setting
    )]
    pub settings: Vec<(String, String)>,
    /// HTTP bind address for the API server
    #[arg(long = "bind", env = "KLOGS_BIND", default_value = "0.0.0.0:8080")]
    pub bind: SocketAddr,
    /// Documents returned by the logs endpoint when no limit is requested
    #[arg(long = "default-limit", env = "KLOGS_DEFAULT_LIMIT", default_value_t = DEFAULT_LIMIT)]
    pub default_limit: u64,
}

/// Connection parameters of the ClickHouse executor.
#[derive(Debug, Clone)]
pub struct ClickHouseConfig {
    pub address: String,
    pub username: String,
    pub password: String,
    pub database: String,
    pub materialized_columns: Vec<String>,
    pub dial_timeout: Duration,
    pub conn_max_lifetime: Option<Duration>,
    pub max_idle_conns: usize,
    pub max_open_conns: usize,
    pub settings: BTreeMap<String, String>,
}

impl Args {
    pub fn clickhouse_config(&self) -> Result<ClickHouseConfig, AppError> {
        let database = self.database.trim();
        if database.is_empty() {
            return Err(AppError::Config("database must not be empty".into()));
        }
        if !is_identifier(database) {
            return Err(AppError::Config(format!("invalid database name `{database}`")));
        }

        let mut materialized_columns: Vec<String> = Vec::new();
        for column in self.materialized_columns.iter().map(|c| c.trim()) {
            if column.is_empty() {
                continue;
            }
            if !is_identifier(column) {
                return Err(AppError::Config(format!(
                    "invalid materialized column `{column}`"
                )));
            }
            if !materialized_columns.iter().any(|known| known == column) {
                materialized_columns.push(column.to_string());
            }
        }

        let mut settings = BTreeMap::new();
        for (key, value) in &self.settings {
            if settings.insert(key.clone(), value.clone()).is_some() {
                warn!("clickhouse setting `{key}` given more than once, keeping the last value");
            }
        }

        if self.conn_max_lifetime.is_some_and(|lifetime| lifetime.is_zero()) {
            return Err(AppError::Config("conn-max-lifetime must be positive".into()));
        }

        Ok(ClickHouseConfig {
            address: self.address.trim().to_string(),
            username: self.username.clone(),
            password: self.password.clone(),
            database: database.to_string(),
            materialized_columns,
            dial_timeout: self.dial_timeout,
            conn_max_lifetime: self.conn_max_lifetime,
            max_idle_conns: self.max_idle_conns,
            max_open_conns: self.max_open_conns,
            settings,
        })
    }

    pub fn default_limit(&self) -> Result<u64, AppError> {
        if self.default_limit == 0 || self.default_limit > MAX_LIMIT {
            return Err(AppError::Config(format!(
                "default-limit must be between 1 and {MAX_LIMIT}"
            )));
        }
        Ok(self.default_limit)
    }
}

/// Parses durations such as `500ms`, `10s`, `5m`, `1h` or `1h30m`. A bare
/// number is taken as seconds.
pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err("duration cannot be empty".into());
    }
    if let Ok(seconds) = trimmed.parse::<u64>() {
        return Ok(Duration::from_secs(seconds));
    }

    let mut total = Duration::ZERO;
    let mut rest = trimmed;
    while !rest.is_empty() {
        let digits = rest
            .find(|ch: char| !ch.is_ascii_digit())
            .unwrap_or(rest.len());
        if digits == 0 {
            return Err(format!("invalid duration `{raw}`: expected a number"));
        }
        let amount: u64 = rest[..digits]
            .parse()
            .map_err(|err| format!("invalid duration `{raw}`: {err}"))?;
        rest = &rest[digits..];
        let unit_len = rest
            .find(|ch: char| ch.is_ascii_digit())
            .unwrap_or(rest.len());
        let overflow = || format!("invalid duration `{raw}`: out of range");
        let unit = match &rest[..unit_len] {
            "ms" => Duration::from_millis(amount),
            "s" => Duration::from_secs(amount),
            "m" => Duration::from_secs(amount.checked_mul(60).ok_or_else(overflow)?),
            "h" => Duration::from_secs(amount.checked_mul(3_600).ok_or_else(overflow)?),
            "" => return Err(format!("invalid duration `{raw}`: missing unit")),
            other => return Err(format!("invalid duration `{raw}`: unknown unit `{other}`")),
        };
        total = total.checked_add(unit).ok_or_else(overflow)?;
        rest = &rest[unit_len..];
    }
    Ok(total)
}

pub fn parse_setting(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("invalid setting `{raw}`: expected key=value"))?;
    let key = key.trim();
    if key.is_empty() || !key.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '_') {
        return Err(format!("invalid setting key `{key}`"));
    }
    Ok((key.to_string(), value.trim().to_string()))
}
