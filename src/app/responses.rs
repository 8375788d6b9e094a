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

use std::{convert::Infallible, future::Future, time::Duration};

use axum::{
    Json,
    body::Body,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures_util::stream;
use log::{debug, warn};
use serde::Serialize;
use tokio::{
    sync::mpsc,
    time::{Instant, interval_at, sleep},
};

use crate::error::AppError;

pub(crate) const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Answers with `work`'s result, writing a newline every `period` while it
/// is still running so proxies keep the connection open.
///
/// Results ready within the first period are sent as ordinary responses.
/// Later ones are appended to the already started `200` stream, errors as
/// a JSON error object.
pub(crate) async fn with_keepalive<T, F>(work: F, period: Duration) -> Response
where
    T: Serialize + Send + 'static,
    F: Future<Output = Result<T, AppError>> + Send + 'static,
{
    let mut work = Box::pin(work);
    tokio::select! {
        result = &mut work => return json_response(result),
        _ = sleep(period) => {}
    }

    let (tx, rx) = mpsc::channel::<Bytes>(4);
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now(), period);
        let result = loop {
            tokio::select! {
                result = &mut work => break result,
                _ = ticker.tick() => {
                    if tx.send(Bytes::from_static(b"\n")).await.is_err() {
                        debug!("client went away, dropping request");
                        return;
                    }
                }
                _ = tx.closed() => {
                    debug!("client went away, dropping request");
                    return;
                }
            }
        };
        let payload = match result {
            Ok(value) => serde_json::to_vec(&value),
            Err(err) => {
                warn!("request failed after streaming started: {err}");
                serde_json::to_vec(&err.body())
            }
        };
        match payload {
            Ok(payload) => {
                let _ = tx.send(Bytes::from(payload)).await;
            }
            Err(err) => warn!("failed to encode response: {err}"),
        }
    });

    let body = stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (Ok::<_, Infallible>(chunk), rx))
    });
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        Body::from_stream(body),
    )
        .into_response()
}

pub(crate) fn json_response<T: Serialize>(result: Result<T, AppError>) -> Response {
    match result {
        Ok(value) => Json(value).into_response(),
        Err(err) => err.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use axum::body::to_bytes;
    use serde_json::{Value as JsonValue, json};

    use super::*;

    async fn body_text(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn fast_results_are_plain_json() {
        let response = with_keepalive(async { Ok(json!({"count": 1})) }, Duration::from_secs(10)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, r#"{"count":1}"#);
    }

    #[tokio::test]
    async fn fast_errors_keep_their_status() {
        let response = with_keepalive(
            async { Err::<JsonValue, _>(AppError::InvalidTimeRange) },
            Duration::from_secs(10),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_text(response).await.contains("invalid time range"));
    }

    #[tokio::test]
    async fn slow_results_are_preceded_by_newlines() {
        let work = async {
            sleep(Duration::from_millis(80)).await;
            Ok(json!({"count": 2}))
        };
        let response = with_keepalive(work, Duration::from_millis(20)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let text = body_text(response).await;
        assert!(text.starts_with('\n'));
        let payload: JsonValue = serde_json::from_str(text.trim_start()).unwrap();
        assert_eq!(payload["count"], 2);
    }

    #[tokio::test]
    async fn slow_errors_are_written_as_json() {
        let work = async {
            sleep(Duration::from_millis(50)).await;
            Err::<JsonValue, _>(AppError::Internal("boom".into()))
        };
        let response = with_keepalive(work, Duration::from_millis(10)).await;
        let payload: JsonValue = serde_json::from_str(body_text(response).await.trim_start()).unwrap();
        assert_eq!(payload["error"], "boom");
        assert_eq!(payload["errorType"], "internal");
    }
}
