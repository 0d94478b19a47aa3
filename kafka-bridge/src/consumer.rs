//! Handlers for consumer instances, under `/consumers`.
use axum::extract::rejection::QueryRejection;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use tracing::{debug, instrument};

use crate::api::{BridgeError, CreateConsumerResponse, ErrorCode};
use crate::endpoint::sink::{SinkEndpoint, SinkResponse};
use crate::request::{self, CreateConsumerRequest, PollParams, SinkRequest};
use crate::router;

impl IntoResponse for SinkResponse {
    fn into_response(self) -> Response {
        match self {
            SinkResponse::NoContent | SinkResponse::Deleted => {
                ErrorCode::NoContent.status().into_response()
            }
            SinkResponse::Committed => StatusCode::OK.into_response(),
            SinkResponse::Records { format, body } => (
                StatusCode::OK,
                [(header::CONTENT_TYPE, format.content_type())],
                body,
            )
                .into_response(),
        }
    }
}

/// Absolute URI of the instance, built from the URI the client reached us with.
fn base_uri(headers: &HeaderMap, uri: &Uri, instance_id: &str) -> String {
    let host = headers
        .get(header::HOST)
        .and_then(|host| host.to_str().ok())
        .or_else(|| uri.authority().map(|authority| authority.as_str()))
        .unwrap_or("localhost");
    let path = uri.path();
    let separator = if path.ends_with('/') { "" } else { "/" };

    format!("http://{}{}{}instances/{}", host, path, separator, instance_id)
}

#[instrument(skip_all, fields(group_id = %group_id))]
pub async fn create(
    State(state): State<router::State>,
    Path(group_id): Path<String>,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> Result<Response, BridgeError> {
    let CreateConsumerRequest {
        name,
        format,
        settings,
    } = CreateConsumerRequest::from_body(&body)?;

    let (instance_id, _) = state.registry.create(name, |id| {
        SinkEndpoint::new(
            id.to_string(),
            group_id,
            format,
            settings,
            state.kafka.clone(),
            &state.consumer,
        )
    })?;

    let base_uri = base_uri(&headers, &uri, &instance_id);
    debug!("consumer instance {} reachable at {}", instance_id, base_uri);

    Ok((
        [(header::LOCATION, base_uri.clone())],
        Json(CreateConsumerResponse {
            instance_id,
            base_uri,
        }),
    )
        .into_response())
}

async fn dispatch(
    state: &router::State,
    name: &str,
    request: SinkRequest,
) -> Result<SinkResponse, BridgeError> {
    let endpoint = state.registry.lookup(name)?;
    let mut endpoint = endpoint.lock().await;
    endpoint.handle(request).await
}

#[instrument(skip_all, fields(group_id = %group_id, name = %name))]
pub async fn delete(
    State(state): State<router::State>,
    Path((group_id, name)): Path<(String, String)>,
) -> Result<SinkResponse, BridgeError> {
    dispatch(&state, &name, SinkRequest::Delete).await
}

#[instrument(skip_all, fields(group_id = %group_id, name = %name))]
pub async fn subscribe(
    State(state): State<router::State>,
    Path((group_id, name)): Path<(String, String)>,
    body: Bytes,
) -> Result<SinkResponse, BridgeError> {
    dispatch(&state, &name, request::subscribe(&body)?).await
}

#[instrument(skip_all, fields(group_id = %group_id, name = %name))]
pub async fn unsubscribe(
    State(state): State<router::State>,
    Path((group_id, name)): Path<(String, String)>,
) -> Result<SinkResponse, BridgeError> {
    dispatch(&state, &name, SinkRequest::Unsubscribe).await
}

#[instrument(skip_all, fields(group_id = %group_id, name = %name))]
pub async fn assign(
    State(state): State<router::State>,
    Path((group_id, name)): Path<(String, String)>,
    body: Bytes,
) -> Result<SinkResponse, BridgeError> {
    dispatch(&state, &name, request::assign(&body)?).await
}

#[instrument(skip_all, fields(group_id = %group_id, name = %name))]
pub async fn poll(
    State(state): State<router::State>,
    Path((group_id, name)): Path<(String, String)>,
    params: Result<Query<PollParams>, QueryRejection>,
) -> Result<SinkResponse, BridgeError> {
    let Query(params) = params.map_err(|e| BridgeError::RequestParsingError(e.body_text()))?;
    dispatch(&state, &name, SinkRequest::Poll(params)).await
}

#[instrument(skip_all, fields(group_id = %group_id, name = %name))]
pub async fn commit(
    State(state): State<router::State>,
    Path((group_id, name)): Path<(String, String)>,
    body: Bytes,
) -> Result<SinkResponse, BridgeError> {
    dispatch(&state, &name, request::commit(&body)?).await
}

#[instrument(skip_all, fields(group_id = %group_id, name = %name))]
pub async fn seek(
    State(state): State<router::State>,
    Path((group_id, name)): Path<(String, String)>,
    body: Bytes,
) -> Result<SinkResponse, BridgeError> {
    dispatch(&state, &name, request::seek(&body)?).await
}

#[instrument(skip_all, fields(group_id = %group_id, name = %name))]
pub async fn seek_to_beginning(
    State(state): State<router::State>,
    Path((group_id, name)): Path<(String, String)>,
    body: Bytes,
) -> Result<SinkResponse, BridgeError> {
    dispatch(&state, &name, request::seek_to_beginning(&body)?).await
}

#[instrument(skip_all, fields(group_id = %group_id, name = %name))]
pub async fn seek_to_end(
    State(state): State<router::State>,
    Path((group_id, name)): Path<(String, String)>,
    body: Bytes,
) -> Result<SinkResponse, BridgeError> {
    dispatch(&state, &name, request::seek_to_end(&body)?).await
}
