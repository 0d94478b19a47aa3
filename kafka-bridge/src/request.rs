//! Payloads decoded from HTTP requests, and the operations they are turned into.
use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use crate::api::BridgeError;
use crate::converter::EmbeddedFormat;
use crate::kafka::{ConsumerSettings, DeliveryMode};
use crate::types::{OffsetAndMetadata, PartitionAssignment, ProducerRecord, TopicPartition};

/// Operations a consumer instance accepts once it exists.
#[derive(Debug, Clone, PartialEq)]
pub enum SinkRequest {
    Subscribe(SubscribeRequest),
    Unsubscribe,
    Assign(Vec<PartitionAssignment>),
    Poll(PollParams),
    /// `None` commits the positions the consumer has reached
    Commit(Option<HashMap<TopicPartition, OffsetAndMetadata>>),
    Seek(Vec<(TopicPartition, i64)>),
    SeekToBeginning(Vec<TopicPartition>),
    SeekToEnd(Vec<TopicPartition>),
    Delete,
}

impl SinkRequest {
    pub fn name(&self) -> &'static str {
        match self {
            SinkRequest::Subscribe(_) => "subscribe",
            SinkRequest::Unsubscribe => "unsubscribe",
            SinkRequest::Assign(_) => "assign",
            SinkRequest::Poll(_) => "poll",
            SinkRequest::Commit(_) => "commit",
            SinkRequest::Seek(_) => "seek",
            SinkRequest::SeekToBeginning(_) => "seek_to_beginning",
            SinkRequest::SeekToEnd(_) => "seek_to_end",
            SinkRequest::Delete => "delete",
        }
    }
}

/// Publish request for a single topic.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRequest {
    pub records: Vec<ProducerRecord>,
    pub mode: DeliveryMode,
}

fn from_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, BridgeError> {
    serde_json::from_slice(body).map_err(|e| BridgeError::RequestParsingError(e.to_string()))
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateConsumerRequest {
    pub name: Option<String>,
    #[serde(default)]
    pub format: EmbeddedFormat,
    #[serde(flatten)]
    pub settings: ConsumerSettings,
}

impl CreateConsumerRequest {
    pub fn from_body(body: &[u8]) -> Result<Self, BridgeError> {
        if body.is_empty() {
            return Ok(Self::default());
        }
        let request: Self = from_body(body)?;
        if request.name.as_deref().is_some_and(str::is_empty) {
            return Err(BridgeError::RequestParsingError(
                "consumer name cannot be empty".to_string(),
            ));
        }
        Ok(request)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SubscribeRequest {
    pub topics: Option<Vec<String>>,
    pub topic_pattern: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct PollParams {
    pub timeout: Option<u64>,
    pub max_bytes: Option<usize>,
}

#[derive(Deserialize)]
struct PartitionEntry {
    topic: String,
    partition: i32,
    offset: Option<i64>,
}

#[derive(Deserialize)]
struct PartitionsBody {
    partitions: Vec<PartitionEntry>,
}

#[derive(Deserialize)]
struct OffsetEntry {
    topic: String,
    partition: i32,
    offset: i64,
    metadata: Option<String>,
}

#[derive(Deserialize)]
struct OffsetsBody {
    offsets: Option<Vec<OffsetEntry>>,
}

#[derive(Deserialize)]
struct RecordEntry {
    key: Option<Value>,
    value: Option<Value>,
    partition: Option<i32>,
}

#[derive(Deserialize)]
struct RecordsBody {
    records: Vec<RecordEntry>,
}

pub fn subscribe(body: &[u8]) -> Result<SinkRequest, BridgeError> {
    Ok(SinkRequest::Subscribe(from_body(body)?))
}

pub fn assign(body: &[u8]) -> Result<SinkRequest, BridgeError> {
    let body: PartitionsBody = from_body(body)?;
    let partitions = body
        .partitions
        .into_iter()
        .map(|entry| PartitionAssignment {
            partition: TopicPartition::new(entry.topic, entry.partition),
            offset: entry.offset,
        })
        .collect();
    Ok(SinkRequest::Assign(partitions))
}

pub fn commit(body: &[u8]) -> Result<SinkRequest, BridgeError> {
    if body.is_empty() {
        return Ok(SinkRequest::Commit(None));
    }
    let body: OffsetsBody = from_body(body)?;
    let offsets = body.offsets.map(|entries| {
        entries
            .into_iter()
            .map(|entry| {
                (
                    TopicPartition::new(entry.topic, entry.partition),
                    OffsetAndMetadata {
                        offset: entry.offset,
                        metadata: entry.metadata,
                    },
                )
            })
            .collect()
    });
    Ok(SinkRequest::Commit(offsets))
}

pub fn seek(body: &[u8]) -> Result<SinkRequest, BridgeError> {
    let body: OffsetsBody = from_body(body)?;
    let offsets = body
        .offsets
        .ok_or_else(|| BridgeError::RequestParsingError("missing field `offsets`".to_string()))?;
    Ok(SinkRequest::Seek(
        offsets
            .into_iter()
            .map(|entry| (TopicPartition::new(entry.topic, entry.partition), entry.offset))
            .collect(),
    ))
}

fn topic_partitions(body: &[u8]) -> Result<Vec<TopicPartition>, BridgeError> {
    let body: PartitionsBody = from_body(body)?;
    Ok(body
        .partitions
        .into_iter()
        .map(|entry| TopicPartition::new(entry.topic, entry.partition))
        .collect())
}

pub fn seek_to_beginning(body: &[u8]) -> Result<SinkRequest, BridgeError> {
    Ok(SinkRequest::SeekToBeginning(topic_partitions(body)?))
}

pub fn seek_to_end(body: &[u8]) -> Result<SinkRequest, BridgeError> {
    Ok(SinkRequest::SeekToEnd(topic_partitions(body)?))
}

/// Decodes a publish request. A partition from the path wins over the one given per record.
pub fn produce(
    topic: &str,
    partition: Option<i32>,
    format: EmbeddedFormat,
    mode: DeliveryMode,
    body: &[u8],
) -> Result<SourceRequest, BridgeError> {
    let body: RecordsBody = from_body(body)?;
    if body.records.is_empty() {
        return Err(BridgeError::EmptyBatch);
    }

    let records = body
        .records
        .into_iter()
        .map(|entry| {
            Ok(ProducerRecord {
                topic: topic.to_string(),
                partition: partition.or(entry.partition),
                key: entry.key.map(|key| format.to_bytes(&key)).transpose()?,
                value: entry.value.map(|value| format.to_bytes(&value)).transpose()?,
            })
        })
        .collect::<Result<Vec<_>, BridgeError>>()?;

    Ok(SourceRequest { records, mode })
}
