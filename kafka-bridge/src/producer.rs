//! Handlers publishing records, under `/topics`.
use axum::extract::rejection::{PathRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use serde::Deserialize;
use tracing::field::Empty;
use tracing::instrument;

use crate::api::{BridgeError, OffsetResult, ProduceResponse};
use crate::converter::EmbeddedFormat;
use crate::kafka::DeliveryMode;
use crate::request;
use crate::router;

#[derive(Debug, Default, Deserialize)]
pub struct ProduceParams {
    /// Skip waiting for the broker acknowledgments
    #[serde(default, rename = "async")]
    pub fire_and_forget: bool,
}

async fn publish(
    state: &router::State,
    topic: &str,
    partition: Option<i32>,
    params: Result<Query<ProduceParams>, QueryRejection>,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Response, BridgeError> {
    let Query(params) = params.map_err(|e| BridgeError::RequestParsingError(e.body_text()))?;
    let format = headers
        .get(header::CONTENT_TYPE)
        .and_then(|content_type| content_type.to_str().ok())
        .map(EmbeddedFormat::from_content_type)
        .unwrap_or_default();
    let mode = if params.fire_and_forget {
        DeliveryMode::Unacknowledged
    } else {
        DeliveryMode::Acknowledged
    };

    let request = request::produce(topic, partition, format, mode, body)?;
    let source = state.source.read().await;

    match source.handle(request).await? {
        None => Ok(StatusCode::NO_CONTENT.into_response()),
        Some(results) => Ok(Json(ProduceResponse {
            offsets: results.into_iter().map(OffsetResult::from).collect(),
        })
        .into_response()),
    }
}

#[instrument(skip_all, fields(topic = %topic))]
pub async fn send(
    State(state): State<router::State>,
    Path(topic): Path<String>,
    params: Result<Query<ProduceParams>, QueryRejection>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, BridgeError> {
    publish(&state, &topic, None, params, &headers, &body).await
}

#[instrument(skip_all, fields(topic = Empty, partition = Empty))]
pub async fn send_to_partition(
    State(state): State<router::State>,
    path: Result<Path<(String, i32)>, PathRejection>,
    params: Result<Query<ProduceParams>, QueryRejection>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, BridgeError> {
    let Path((topic, partition)) =
        path.map_err(|e| BridgeError::RequestParsingError(e.body_text()))?;
    tracing::Span::current()
        .record("topic", topic.as_str())
        .record("partition", partition);

    publish(&state, &topic, Some(partition), params, &headers, &body).await
}
