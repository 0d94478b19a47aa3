//! Conversion between the embedded formats exposed over HTTP and raw Kafka bytes.
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rdkafka::message::{Message, OwnedMessage};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::api::BridgeError;

pub const JSON_CONTENT_TYPE: &str = "application/vnd.kafka.json.v2+json";
pub const BINARY_CONTENT_TYPE: &str = "application/vnd.kafka.binary.v2+json";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddedFormat {
    /// Keys and values are JSON documents
    #[default]
    Json,
    /// Keys and values are base64 encoded bytes
    Binary,
}

impl EmbeddedFormat {
    pub fn from_content_type(content_type: &str) -> Self {
        if content_type.starts_with(BINARY_CONTENT_TYPE) {
            EmbeddedFormat::Binary
        } else {
            EmbeddedFormat::Json
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            EmbeddedFormat::Json => JSON_CONTENT_TYPE,
            EmbeddedFormat::Binary => BINARY_CONTENT_TYPE,
        }
    }

    pub fn to_bytes(&self, value: &Value) -> Result<Vec<u8>, BridgeError> {
        match self {
            EmbeddedFormat::Json => serde_json::to_vec(value)
                .map_err(|e| BridgeError::RecordDecodingError(e.to_string())),
            EmbeddedFormat::Binary => {
                let Value::String(encoded) = value else {
                    return Err(BridgeError::RecordDecodingError(
                        "binary data must be a base64 string".to_string(),
                    ));
                };
                STANDARD
                    .decode(encoded)
                    .map_err(|e| BridgeError::RecordDecodingError(e.to_string()))
            }
        }
    }

    pub fn to_value(&self, bytes: &[u8]) -> Value {
        match self {
            // Payloads written by other clients may not be JSON at all
            EmbeddedFormat::Json => serde_json::from_slice(bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned())),
            EmbeddedFormat::Binary => Value::String(STANDARD.encode(bytes)),
        }
    }

    /// Serializes a poll batch as the JSON array returned to the client.
    pub fn to_messages(&self, messages: &[OwnedMessage]) -> Result<Vec<u8>, BridgeError> {
        let records: Vec<ConsumerRecord> = messages
            .iter()
            .map(|message| ConsumerRecord {
                topic: message.topic().to_string(),
                key: message.key().map(|key| self.to_value(key)),
                value: message.payload().map(|payload| self.to_value(payload)),
                partition: message.partition(),
                offset: message.offset(),
            })
            .collect();

        serde_json::to_vec(&records).map_err(|e| BridgeError::RecordDecodingError(e.to_string()))
    }
}

#[derive(Debug, PartialEq, Deserialize, Serialize)]
pub struct ConsumerRecord {
    pub topic: String,
    pub key: Option<Value>,
    pub value: Option<Value>,
    pub partition: i32,
    pub offset: i64,
}

#[cfg(test)]
mod tests {
    use rdkafka::message::{OwnedMessage, Timestamp};
    use serde_json::{json, Value};

    use super::{ConsumerRecord, EmbeddedFormat};
    use crate::api::BridgeError;

    #[test]
    fn format_follows_content_type() {
        assert_eq!(
            EmbeddedFormat::from_content_type("application/vnd.kafka.binary.v2+json"),
            EmbeddedFormat::Binary
        );
        assert_eq!(
            EmbeddedFormat::from_content_type("application/vnd.kafka.json.v2+json"),
            EmbeddedFormat::Json
        );
        assert_eq!(
            EmbeddedFormat::from_content_type("application/json"),
            EmbeddedFormat::Json
        );
    }

    #[test]
    fn json_values_are_stored_as_documents() {
        let bytes = EmbeddedFormat::Json
            .to_bytes(&json!({"event": "pageview"}))
            .unwrap();
        assert_eq!(bytes, br#"{"event":"pageview"}"#.to_vec());
        assert_eq!(
            EmbeddedFormat::Json.to_value(&bytes),
            json!({"event": "pageview"})
        );
    }

    #[test]
    fn foreign_payloads_render_as_strings() {
        assert_eq!(
            EmbeddedFormat::Json.to_value(b"plain text"),
            Value::String("plain text".to_string())
        );
    }

    #[test]
    fn binary_values_are_base64() {
        let bytes = EmbeddedFormat::Binary
            .to_bytes(&Value::String("aGVsbG8=".to_string()))
            .unwrap();
        assert_eq!(bytes, b"hello".to_vec());
        assert_eq!(
            EmbeddedFormat::Binary.to_value(b"hello"),
            Value::String("aGVsbG8=".to_string())
        );

        match EmbeddedFormat::Binary.to_bytes(&json!(12)) {
            Err(BridgeError::RecordDecodingError(_)) => {}
            other => panic!("unexpected result {:?}", other),
        }
        match EmbeddedFormat::Binary.to_bytes(&Value::String("not base64!".to_string())) {
            Err(BridgeError::RecordDecodingError(_)) => {}
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn batches_serialize_as_record_arrays() {
        let message = OwnedMessage::new(
            Some(br#"{"n":1}"#.to_vec()),
            Some(br#""key-1""#.to_vec()),
            "events".to_string(),
            Timestamp::NotAvailable,
            2,
            17,
            None,
        );

        let body = EmbeddedFormat::Json.to_messages(&[message]).unwrap();
        let records: Vec<ConsumerRecord> = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            records,
            vec![ConsumerRecord {
                topic: "events".to_string(),
                key: Some(json!("key-1")),
                value: Some(json!({"n": 1})),
                partition: 2,
                offset: 17,
            }]
        );

        assert_eq!(EmbeddedFormat::Json.to_messages(&[]).unwrap(), b"[]".to_vec());
    }
}
