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

use std::time::Instant;

use axum::{
    Json, Router,
    body::Body,
    extract::{Query, State},
    http::Request,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;

use crate::{
    aggregation::{Aggregation, AggregationResult},
    error::AppError,
    fields::FieldType,
    logs::LogsRequest,
};

use super::{
    responses::{KEEPALIVE_INTERVAL, with_keepalive},
    state::AppState,
};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/logs", get(logs))
        .route("/api/aggregation", post(aggregation))
        .route("/api/fields", get(fields))
        .with_state(state)
        .layer(middleware::from_fn(log_requests))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogsQueryParams {
    #[serde(default)]
    query: String,
    #[serde(default)]
    order: String,
    #[serde(default)]
    order_by: String,
    limit: Option<u64>,
    time_start: Option<i64>,
    time_end: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FieldsQueryParams {
    #[serde(default)]
    filter: String,
    field_type: Option<String>,
}

async fn logs(State(state): State<AppState>, Query(params): Query<LogsQueryParams>) -> Response {
    let request = match logs_request(&state, params) {
        Ok(request) => request,
        Err(err) => return err.into_response(),
    };
    with_keepalive(
        async move { state.logs(&request).await },
        KEEPALIVE_INTERVAL,
    )
    .await
}

fn logs_request(state: &AppState, params: LogsQueryParams) -> Result<LogsRequest, AppError> {
    let time_start = params
        .time_start
        .ok_or_else(|| AppError::BadRequest("timeStart is required".into()))?;
    let time_end = params
        .time_end
        .ok_or_else(|| AppError::BadRequest("timeEnd is required".into()))?;
    Ok(LogsRequest {
        query: params.query,
        order: params.order,
        order_by: params.order_by,
        limit: state.clamp_limit(params.limit),
        time_start,
        time_end,
    })
}

async fn aggregation(
    State(state): State<AppState>,
    Json(request): Json<Aggregation>,
) -> Result<Json<AggregationResult>, AppError> {
    let result = state.aggregate(&request).await?;
    Ok(Json(result))
}

async fn fields(
    State(state): State<AppState>,
    Query(params): Query<FieldsQueryParams>,
) -> Result<Json<Vec<String>>, AppError> {
    let field_type = FieldType::parse(params.field_type.as_deref())?;
    Ok(Json(state.list_fields(&params.filter, field_type)))
}

async fn log_requests(req: Request<Body>, next: Next) -> Response {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let start = Instant::now();
    let response = next.run(req).await;
    let status = response.status();
    let elapsed = start.elapsed();
    log::info!(
        "method={} path={} status={} duration_ms={:.3}",
        method,
        uri.path(),
        status.as_u16(),
        elapsed.as_secs_f64() * 1000.0
    );
    response
}
