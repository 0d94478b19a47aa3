use std::time::Duration;

use metrics::{counter, gauge};
use rdkafka::consumer::{BaseConsumer, ConsumerContext};
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, Producer};
use rdkafka::util::Timeout;
use rdkafka::ClientConfig;
use serde::Deserialize;
use tracing::{debug, info};

use crate::config::KafkaConfig;

/// Producer construction pings the cluster and gives up after this long.
pub const PRODUCER_OPEN_TIMEOUT: Duration = Duration::from_secs(10);

pub type BridgeProducer = FutureProducer<KafkaContext>;
pub type BridgeConsumer = BaseConsumer<KafkaContext>;

pub struct KafkaContext {
    client: &'static str,
}

impl rdkafka::ClientContext for KafkaContext {
    fn stats(&self, stats: rdkafka::Statistics) {
        gauge!("bridge_kafka_callback_queue_depth", "client" => self.client)
            .set(stats.replyq as f64);
        gauge!("bridge_kafka_queue_depth", "client" => self.client).set(stats.msg_cnt as f64);
        gauge!("bridge_kafka_queue_depth_limit", "client" => self.client)
            .set(stats.msg_max as f64);

        for (_, stats) in stats.brokers {
            let id_string = format!("{}", stats.nodeid);
            gauge!(
                "bridge_kafka_broker_requests_pending",
                "client" => self.client,
                "broker" => id_string.clone()
            )
            .set(stats.outbuf_cnt as f64);
            gauge!(
                "bridge_kafka_broker_responses_awaiting",
                "client" => self.client,
                "broker" => id_string.clone()
            )
            .set(stats.waitresp_cnt as f64);
            counter!(
                "bridge_kafka_broker_tx_errors_total",
                "client" => self.client,
                "broker" => id_string.clone()
            )
            .absolute(stats.txerrs);
            counter!(
                "bridge_kafka_broker_rx_errors_total",
                "client" => self.client,
                "broker" => id_string
            )
            .absolute(stats.rxerrs);
        }
    }
}

impl ConsumerContext for KafkaContext {}

/// The two publish paths, each backed by its own producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Waits for the broker to acknowledge the write, with the configured acks level.
    Acknowledged,
    /// Fire and forget, acks=0.
    Unacknowledged,
}

impl DeliveryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryMode::Acknowledged => "acknowledged",
            DeliveryMode::Unacknowledged => "unacknowledged",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OffsetReset {
    Earliest,
    Latest,
}

impl OffsetReset {
    pub fn as_str(&self) -> &'static str {
        match self {
            OffsetReset::Earliest => "earliest",
            OffsetReset::Latest => "latest",
        }
    }
}

/// Consumer properties a client may override when creating its instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ConsumerSettings {
    #[serde(rename = "auto.offset.reset")]
    pub auto_offset_reset: Option<OffsetReset>,
    #[serde(rename = "enable.auto.commit")]
    pub enable_auto_commit: Option<bool>,
    #[serde(rename = "fetch.min.bytes")]
    pub fetch_min_bytes: Option<u32>,
}

fn client_config(config: &KafkaConfig) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &config.kafka_hosts)
        .set("statistics.interval.ms", "10000");

    if config.kafka_tls {
        client_config
            .set("security.protocol", "ssl")
            .set("enable.ssl.certificate.verification", "false");
    };

    client_config
}

pub fn create_producer(
    config: &KafkaConfig,
    mode: DeliveryMode,
) -> Result<BridgeProducer, KafkaError> {
    let acks = match mode {
        DeliveryMode::Acknowledged => config.kafka_producer_acks.as_str(),
        DeliveryMode::Unacknowledged => "0",
    };

    let mut client_config = client_config(config);
    client_config
        .set("acks", acks)
        .set("linger.ms", config.kafka_producer_linger_ms.to_string())
        .set(
            "message.timeout.ms",
            config.kafka_message_timeout_ms.to_string(),
        )
        .set("compression.codec", &config.kafka_compression_codec)
        .set(
            "allow.auto.create.topics",
            config.kafka_producer_auto_create_topics.to_string(),
        );

    debug!("rdkafka {} producer configuration: {:?}", mode.as_str(), client_config);
    let producer: BridgeProducer = client_config.create_with_context(KafkaContext {
        client: mode.as_str(),
    })?;

    // Ping the cluster to make sure we can reach brokers
    drop(
        producer
            .client()
            .fetch_metadata(None, Timeout::After(PRODUCER_OPEN_TIMEOUT))?,
    );
    info!("{} producer connected to Kafka brokers", mode.as_str());

    Ok(producer)
}

pub fn create_consumer(
    config: &KafkaConfig,
    group_id: &str,
    client_id: &str,
    settings: &ConsumerSettings,
) -> Result<BridgeConsumer, KafkaError> {
    let mut client_config = client_config(config);
    client_config
        .set("group.id", group_id)
        .set("client.id", client_id);

    if let Some(reset) = settings.auto_offset_reset {
        client_config.set("auto.offset.reset", reset.as_str());
    }
    if let Some(auto_commit) = settings.enable_auto_commit {
        client_config.set("enable.auto.commit", auto_commit.to_string());
    }
    if let Some(min_bytes) = settings.fetch_min_bytes {
        client_config.set("fetch.min.bytes", min_bytes.to_string());
    }

    debug!("rdkafka consumer configuration: {:?}", client_config);
    client_config.create_with_context(KafkaContext { client: "consumer" })
}
