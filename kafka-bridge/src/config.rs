use std::net::SocketAddr;
use std::time::Duration;

use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(default = "127.0.0.1:8080")]
    pub address: SocketAddr,
    #[envconfig(default = "true")]
    pub export_prometheus: bool,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(nested = true)]
    pub consumer: ConsumerDefaults,
}

#[derive(Envconfig, Clone)]
pub struct KafkaConfig {
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,
    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    // Only applies to the acknowledged producer, the other one always runs with acks=0
    #[envconfig(default = "all")]
    pub kafka_producer_acks: String,
    #[envconfig(default = "0")]
    pub kafka_producer_linger_ms: u32, // Maximum time between producer batches during low traffic
    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32, // Time before we stop retrying producing a message
    #[envconfig(default = "none")]
    pub kafka_compression_codec: String, // none, gzip, snappy, lz4, zstd
    #[envconfig(default = "false")]
    pub kafka_producer_auto_create_topics: bool,
}

impl KafkaConfig {
    /// Upper bound for the blocking broker calls issued on behalf of a request
    /// (metadata lookups, seeks).
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.kafka_message_timeout_ms))
    }
}

#[derive(Envconfig, Clone)]
pub struct ConsumerDefaults {
    #[envconfig(default = "100")]
    pub consumer_poll_timeout_ms: u64,
    // Unbounded when unset
    pub consumer_max_bytes: Option<usize>,
    #[envconfig(default = "500")]
    pub consumer_max_poll_records: usize,
}
