#![allow(dead_code)]

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::{Arc, Once};

use axum::body::Body;
use axum::http::{header, HeaderMap, Method, Request, StatusCode};
use axum::Router;
use bytes::Bytes;
use http_body_util::BodyExt;
use once_cell::sync::Lazy;
use rand::distributions::Alphanumeric;
use rand::Rng;
use rdkafka::mocking::MockCluster;
use rdkafka::producer::DefaultProducerContext;
use rdkafka::types::{RDKafkaApiKey, RDKafkaRespErr};
use serde_json::Value;
use tokio::sync::RwLock;
use tower::ServiceExt;

use kafka_bridge::config::{Config, ConsumerDefaults, KafkaConfig};
use kafka_bridge::endpoint::source::SourceEndpoint;
use kafka_bridge::endpoint::BridgeEndpoint;
use kafka_bridge::registry::SessionRegistry;
use kafka_bridge::router::{router, State};

pub static DEFAULT_CONFIG: Lazy<Config> = Lazy::new(|| Config {
    address: SocketAddr::from_str("127.0.0.1:0").unwrap(),
    export_prometheus: false,
    kafka: KafkaConfig {
        kafka_hosts: "localhost:1".to_string(), // Nothing listens there
        kafka_tls: false,
        kafka_producer_acks: "all".to_string(),
        kafka_producer_linger_ms: 0, // Send messages as soon as possible
        kafka_message_timeout_ms: 10000,
        kafka_compression_codec: "none".to_string(),
        kafka_producer_auto_create_topics: false,
    },
    consumer: ConsumerDefaults {
        consumer_poll_timeout_ms: 100,
        consumer_max_bytes: None,
        consumer_max_poll_records: 100,
    },
});

static TRACING_INIT: Once = Once::new();
pub fn setup_tracing() {
    TRACING_INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_writer(tracing_subscriber::fmt::TestWriter::new())
            .init()
    });
}

pub fn random_string(prefix: &str, length: usize) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(Alphanumeric)
        .take(length)
        .map(char::from)
        .collect();
    format!("{}{}", prefix, suffix)
}

/// In-process Kafka cluster, torn down on drop.
pub struct MockKafka {
    cluster: MockCluster<'static, DefaultProducerContext>,
}

impl MockKafka {
    pub fn new() -> Self {
        let cluster = MockCluster::new(1).expect("failed to create mock brokers");
        Self { cluster }
    }

    pub fn create_topic(&self, partitions: i32) -> String {
        let topic = random_string("events_", 12);
        self.cluster
            .create_topic(&topic, partitions, 1)
            .expect("failed to create topic");
        topic
    }

    pub fn config(&self) -> Config {
        let mut config = DEFAULT_CONFIG.clone();
        config.kafka.kafka_hosts = self.cluster.bootstrap_servers();
        config.consumer.consumer_poll_timeout_ms = 1000;
        config
    }

    /// Makes the next `count` offset commits fail on the broker side.
    pub fn fail_commits(&self, count: usize) {
        self.cluster.clear_request_errors(RDKafkaApiKey::OffsetCommit);
        let err = vec![RDKafkaRespErr::RD_KAFKA_RESP_ERR_GROUP_AUTHORIZATION_FAILED; count];
        self.cluster.request_errors(RDKafkaApiKey::OffsetCommit, &err);
    }
}

/// Router and its state, with the source endpoint opened only when asked to.
pub fn bridge(config: &Config, open_source: bool) -> (Router, State) {
    let mut source = SourceEndpoint::new(config.kafka.clone());
    if open_source {
        source.open().expect("failed to open source endpoint");
    }

    let state = State {
        registry: SessionRegistry::new(),
        source: Arc::new(RwLock::new(source)),
        kafka: config.kafka.clone(),
        consumer: config.consumer.clone(),
    };
    (router(state.clone(), None), state)
}

pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TestResponse {
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).expect("body is not json")
    }
}

pub async fn call(
    router: &Router,
    method: Method,
    uri: &str,
    content_type: Option<&str>,
    body: Option<Value>,
) -> TestResponse {
    let mut request = Request::builder().method(method).uri(uri);
    if let Some(content_type) = content_type {
        request = request.header(header::CONTENT_TYPE, content_type);
    }
    let body = body.map_or_else(Body::empty, |body| Body::from(body.to_string()));

    let response = router
        .clone()
        .oneshot(request.body(body).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let headers = response.headers().clone();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    TestResponse {
        status,
        headers,
        body,
    }
}

pub async fn post(router: &Router, uri: &str, body: Value) -> TestResponse {
    call(
        router,
        Method::POST,
        uri,
        Some("application/vnd.kafka.json.v2+json"),
        Some(body),
    )
    .await
}
