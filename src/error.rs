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

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::{aggregation::AggregationError, clickhouse::ExecutorError, query::QueryError};

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error(transparent)]
    Aggregation(#[from] AggregationError),
    #[error("invalid time range")]
    InvalidTimeRange,
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error("{0}")]
    Config(String),
    #[error("request cancelled: {0}")]
    Cancelled(String),
    #[error("{0}")]
    Internal(String),
}

impl AppError {
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::BadRequest(_) | Self::InvalidTimeRange => "bad_data",
            Self::Query(_) => "bad_query",
            Self::Aggregation(_) => "bad_aggregation",
            Self::Executor(_) => "clickhouse_error",
            Self::Config(_) => "config",
            Self::Cancelled(_) => "cancelled",
            Self::Internal(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) | Self::InvalidTimeRange | Self::Query(_) | Self::Aggregation(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::Executor(_) => StatusCode::BAD_GATEWAY,
            Self::Cancelled(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Config(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn details(&self) -> Vec<String> {
        match self {
            Self::Query(err) => err.details().to_vec(),
            _ => Vec::new(),
        }
    }

    pub(crate) fn body(&self) -> ErrorBody {
        ErrorBody {
            error: self.to_string(),
            error_type: self.error_type(),
            details: self.details(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.body())).into_response()
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct ErrorBody {
    pub(crate) error: String,
    #[serde(rename = "errorType")]
    pub(crate) error_type: &'static str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub(crate) details: Vec<String>,
}
