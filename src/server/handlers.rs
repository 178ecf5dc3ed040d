//! Request handlers for the collector.

use super::AppState;
use crate::core::{MetricBatch, MetricKind, MetricQuery, MetricRecord, MetricValue, MonitorError};
use crate::storage::MetricStorage;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Json, Response},
};
use serde::de::DeserializeOwned;

/// Upper bound on records written in one storage batch.
pub const BATCH_SIZE: usize = 1000;

const PAGE_HEAD: &str = "<!DOCTYPE html>\n<html>\n<head>\n<title>Metrics</title>\n</head>\n<body>\n";
const PAGE_FOOT: &str = "</body>\n</html>\n";

/// Handler failure, rendered as a plain-text status response.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, "metric not found")
    }
}

impl From<MonitorError> for ApiError {
    fn from(error: MonitorError) -> Self {
        let status = match &error {
            MonitorError::InvalidMetric(_) | MonitorError::Serialization(_) => StatusCode::BAD_REQUEST,
            MonitorError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => {
                tracing::error!(category = error.category(), error = %error, "Request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            },
        };
        Self::new(status, error.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, self.message).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// JSON endpoints only answer JSON requests.
fn json_body<T: DeserializeOwned>(headers: &HeaderMap, body: &[u8]) -> ApiResult<T> {
    let is_json = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map_or(false, |value| value.starts_with("application/json"));
    if !is_json {
        return Err(ApiError::not_found());
    }
    Ok(serde_json::from_slice(body).map_err(MonitorError::from)?)
}

/// `POST /update/:kind/:name/:value`
pub async fn update_legacy(
    State(state): State<AppState>,
    Path((kind, name, value)): Path<(String, String, String)>,
) -> ApiResult<StatusCode> {
    let kind: MetricKind = kind.parse()?;
    if name.is_empty() {
        return Err(ApiError::not_found());
    }
    let invalid = || ApiError::new(StatusCode::BAD_REQUEST, format!("invalid {} value '{}'", kind, value));

    match kind {
        MetricKind::Gauge => {
            let value = value.parse().map_err(|_| invalid())?;
            state.storage.set_gauge(&name, value).await?;
        },
        MetricKind::Counter => {
            let delta = value.parse().map_err(|_| invalid())?;
            state.storage.add_counter(&name, delta).await?;
        },
    }
    Ok(StatusCode::OK)
}

/// `POST /update/`: one JSON record. A counter answer carries the new total.
pub async fn update(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<MetricRecord>> {
    let record: MetricRecord = json_body(&headers, &body)?;
    let storage = &state.storage;

    let response = match record.value {
        MetricValue::Gauge(value) => {
            storage.set_gauge(&record.id, value).await?;
            record
        },
        MetricValue::Counter(delta) => {
            storage.add_counter(&record.id, delta).await?;
            let total = storage.get_counter(&record.id).await?.unwrap_or(delta);
            MetricRecord::counter(record.id, total)
        },
    };
    Ok(Json(response))
}

/// `POST /updates/`: a JSON array of records.
pub async fn updates(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> ApiResult<StatusCode> {
    let batch: MetricBatch = json_body(&headers, &body)?;
    store_batch(state.storage.as_ref(), batch).await?;
    Ok(StatusCode::OK)
}

/// Split a mixed batch by kind and write it in bounded chunks, preserving
/// order within each kind.
pub async fn store_batch(storage: &dyn MetricStorage, batch: MetricBatch) -> crate::core::Result<()> {
    let (gauges, counters): (MetricBatch, MetricBatch) =
        batch.into_iter().partition(|record| record.kind() == MetricKind::Gauge);

    for chunk in gauges.chunks(BATCH_SIZE) {
        storage.set_gauge_batch(chunk).await?;
    }
    for chunk in counters.chunks(BATCH_SIZE) {
        storage.add_counter_batch(chunk).await?;
    }
    tracing::debug!(gauges = gauges.len(), counters = counters.len(), "Stored batch");
    Ok(())
}

/// `GET /value/:kind/:name`
pub async fn value_legacy(
    State(state): State<AppState>,
    Path((kind, name)): Path<(String, String)>,
) -> ApiResult<String> {
    match kind.parse::<MetricKind>()? {
        MetricKind::Gauge => state
            .storage
            .get_gauge(&name)
            .await?
            .map(|value| value.to_string())
            .ok_or_else(ApiError::not_found),
        MetricKind::Counter => state
            .storage
            .get_counter(&name)
            .await?
            .map(|value| value.to_string())
            .ok_or_else(ApiError::not_found),
    }
}

/// `POST /value/`: look up a record by id and type.
pub async fn value(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<MetricRecord>> {
    let query: MetricQuery = json_body(&headers, &body)?;
    if query.id.is_empty() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "metric id must not be empty"));
    }

    let record = match query.kind {
        MetricKind::Gauge => state
            .storage
            .get_gauge(&query.id)
            .await?
            .map(|value| MetricRecord::gauge(query.id, value)),
        MetricKind::Counter => state
            .storage
            .get_counter(&query.id)
            .await?
            .map(|delta| MetricRecord::counter(query.id, delta)),
    };
    record.map(Json).ok_or_else(ApiError::not_found)
}

/// `GET /`: every metric on one HTML page.
pub async fn index(State(state): State<AppState>) -> ApiResult<Html<Vec<u8>>> {
    let mut page = Vec::from(PAGE_HEAD);
    page.extend_from_slice(b"<h1>Gauge metrics</h1>\n");
    state.storage.render_all_gauges(&mut page).await?;
    page.extend_from_slice(b"<h1>Counter metrics</h1>\n");
    state.storage.render_all_counters(&mut page).await?;
    page.extend_from_slice(PAGE_FOOT.as_bytes());
    Ok(Html(page))
}

/// `GET /ping`
pub async fn ping(State(state): State<AppState>) -> ApiResult<StatusCode> {
    state.storage.health_check().await?;
    Ok(StatusCode::OK)
}
