use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use rdkafka::error::KafkaError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Codes reported to clients. Five digit codes refine an HTTP status, which
/// is given by their first three digits (40401 is a 404).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    NoContent = 204,
    BadRequest = 400,
    NotFound = 404,
    TopicNotFound = 40401,
    PartitionNotFound = 40402,
    ConsumerNotFound = 40403,
    Conflict = 409,
    ConsumerAlreadyExists = 40902,
    UnprocessableEntity = 422,
    InternalServerError = 500,
}

impl ErrorCode {
    pub fn value(self) -> u32 {
        self as u32
    }

    pub fn status(self) -> StatusCode {
        let value = self.value();
        let status = if value >= 10_000 { value / 100 } else { value };

        u16::try_from(status)
            .ok()
            .and_then(|status| StatusCode::from_u16(status).ok())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("failed to parse request: {0}")]
    RequestParsingError(String),
    #[error("failed to decode record: {0}")]
    RecordDecodingError(String),
    #[error("request holds no record")]
    EmptyBatch,

    #[error("subscription must specify either topics or a topic_pattern")]
    MissingSubscription,
    #[error("subscription cannot specify both topics and a topic_pattern")]
    ConflictingSubscription,
    #[error("assignment must specify at least one partition")]
    MissingAssignment,
    #[error("consumer instance is already subscribed or assigned")]
    AlreadySubscribed,
    #[error("consumer instance is not subscribed to any topic or assigned any partition")]
    NotSubscribed,

    #[error("no resource matches {0}")]
    RouteNotFound(String),
    #[error("consumer instance with the specified name already exists")]
    ConsumerAlreadyExists,
    #[error("the specified consumer instance was not found")]
    ConsumerNotFound,

    #[error("topic {0} not found")]
    TopicNotFound(String),
    #[error("partition {partition} of topic {topic} not found")]
    PartitionNotFound { topic: String, partition: i32 },

    #[error("response exceeds the maximum number of bytes the consumer can receive")]
    ResponseTooLarge,

    #[error("endpoint is not open")]
    EndpointClosed,
    #[error("broker operation did not complete")]
    OperationAborted,
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
}

impl BridgeError {
    pub fn code(&self) -> ErrorCode {
        match self {
            BridgeError::RequestParsingError(_)
            | BridgeError::EmptyBatch
            | BridgeError::MissingSubscription
            | BridgeError::MissingAssignment => ErrorCode::BadRequest,

            BridgeError::ConflictingSubscription
            | BridgeError::AlreadySubscribed
            | BridgeError::NotSubscribed => ErrorCode::Conflict,

            BridgeError::RouteNotFound(_) => ErrorCode::NotFound,
            BridgeError::ConsumerAlreadyExists => ErrorCode::ConsumerAlreadyExists,
            BridgeError::ConsumerNotFound => ErrorCode::ConsumerNotFound,
            BridgeError::TopicNotFound(_) => ErrorCode::TopicNotFound,
            BridgeError::PartitionNotFound { .. } => ErrorCode::PartitionNotFound,

            BridgeError::RecordDecodingError(_) | BridgeError::ResponseTooLarge => {
                ErrorCode::UnprocessableEntity
            }

            BridgeError::EndpointClosed
            | BridgeError::OperationAborted
            | BridgeError::Kafka(_) => ErrorCode::InternalServerError,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct ErrorResponse {
    pub error_code: u32,
    pub message: String,
}

impl IntoResponse for BridgeError {
    fn into_response(self) -> Response {
        let code = self.code();
        let body = ErrorResponse {
            error_code: code.value(),
            message: self.to_string(),
        };

        (code.status(), Json(body)).into_response()
    }
}

#[derive(Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct CreateConsumerResponse {
    pub instance_id: String,
    pub base_uri: String,
}

/// Outcome of one record of a publish request, reported in request order.
#[derive(Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum OffsetResult {
    Delivered { partition: i32, offset: i64 },
    Failed { error_code: u32, error: String },
}

impl From<Result<crate::types::RecordMetadata, BridgeError>> for OffsetResult {
    fn from(result: Result<crate::types::RecordMetadata, BridgeError>) -> Self {
        match result {
            Ok(metadata) => OffsetResult::Delivered {
                partition: metadata.partition,
                offset: metadata.offset,
            },
            Err(err) => OffsetResult::Failed {
                error_code: err.code().value(),
                error: err.to_string(),
            },
        }
    }
}

#[derive(Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct ProduceResponse {
    pub offsets: Vec<OffsetResult>,
}
