use std::time::Duration;

use metrics::counter;
use rdkafka::error::KafkaError;
use rdkafka::producer::{DeliveryFuture, FutureRecord, Producer};
use tracing::{debug, error, info, instrument, warn};

use crate::api::BridgeError;
use crate::config::KafkaConfig;
use crate::endpoint::{BridgeEndpoint, CloseHandler};
use crate::kafka::{create_producer, BridgeProducer, DeliveryMode};
use crate::request::SourceRequest;
use crate::types::{ProducerRecord, RecordMetadata};

const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

struct Producers {
    acknowledged: BridgeProducer,
    unacknowledged: BridgeProducer,
}

impl Producers {
    fn get(&self, mode: DeliveryMode) -> &BridgeProducer {
        match mode {
            DeliveryMode::Acknowledged => &self.acknowledged,
            DeliveryMode::Unacknowledged => &self.unacknowledged,
        }
    }
}

/// Publishes records to Kafka. Holds one producer per delivery mode; both
/// are created on open and released together on close.
pub struct SourceEndpoint {
    config: KafkaConfig,
    producers: Option<Producers>,
    close_handler: Option<CloseHandler>,
}

impl SourceEndpoint {
    pub fn new(config: KafkaConfig) -> Self {
        Self {
            config,
            producers: None,
            close_handler: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.producers.is_some()
    }

    fn producer(&self, mode: DeliveryMode) -> Result<&BridgeProducer, BridgeError> {
        self.producers
            .as_ref()
            .map(|producers| producers.get(mode))
            .ok_or(BridgeError::EndpointClosed)
    }

    fn future_record(record: &ProducerRecord) -> FutureRecord<'_, [u8], [u8]> {
        FutureRecord {
            topic: record.topic.as_str(),
            partition: record.partition,
            payload: record.value.as_deref(),
            key: record.key.as_deref(),
            timestamp: None,
            headers: None,
        }
    }

    /// Publishes without waiting for the broker. Invalid topics or partitions
    /// are not reported back.
    pub fn write(&self, record: &ProducerRecord) -> Result<(), BridgeError> {
        let producer = self.producer(DeliveryMode::Unacknowledged)?;

        match producer.send_result(Self::future_record(record)) {
            Ok(_) => {
                counter!("bridge_records_produced_total", "mode" => "unacknowledged").increment(1);
            }
            Err((e, _)) => {
                counter!("bridge_produce_errors_total", "cause" => "enqueue").increment(1);
                warn!("failed to enqueue unacknowledged record: {}", e);
            }
        }
        Ok(())
    }

    /// Publishes and waits for the broker acknowledgment.
    pub async fn send(&self, record: &ProducerRecord) -> Result<RecordMetadata, BridgeError> {
        let ack = self.enqueue(record).await?;
        Self::process_ack(ack).await
    }

    /// Looks up the number of partitions of a topic.
    pub async fn partitions_for(&self, topic: &str) -> Result<usize, BridgeError> {
        let producer = self.producer(DeliveryMode::Acknowledged)?.clone();
        let timeout = self.config.operation_timeout();
        let name = topic.to_string();

        let lookup = tokio::task::spawn_blocking(move || -> Result<Option<usize>, KafkaError> {
            let metadata = producer.client().fetch_metadata(Some(name.as_str()), timeout)?;
            Ok(metadata
                .topics()
                .iter()
                .find(|t| t.name() == name)
                .filter(|t| t.error().is_none())
                .map(|t| t.partitions().len()))
        })
        .await
        .map_err(|_| BridgeError::OperationAborted)?;

        match lookup {
            Ok(Some(partitions)) if partitions > 0 => Ok(partitions),
            Ok(_) => Err(BridgeError::TopicNotFound(topic.to_string())),
            Err(e) => {
                warn!("failed to fetch metadata for topic {}: {}", topic, e);
                Err(BridgeError::TopicNotFound(topic.to_string()))
            }
        }
    }

    async fn enqueue(&self, record: &ProducerRecord) -> Result<DeliveryFuture, BridgeError> {
        debug!(
            "sending to topic {} at partition {:?}",
            record.topic, record.partition
        );

        // Writing to a partition that does not exist would only surface as a timeout
        let partitions = self.partitions_for(&record.topic).await?;
        if let Some(partition) = record.partition {
            if usize::try_from(partition).map_or(true, |p| p >= partitions) {
                counter!("bridge_produce_errors_total", "cause" => "partition_not_found")
                    .increment(1);
                return Err(BridgeError::PartitionNotFound {
                    topic: record.topic.clone(),
                    partition,
                });
            }
        }

        let producer = self.producer(DeliveryMode::Acknowledged)?;
        producer
            .send_result(Self::future_record(record))
            .map_err(|(e, _)| {
                counter!("bridge_produce_errors_total", "cause" => "enqueue").increment(1);
                error!("failed to produce record: {}", e);
                BridgeError::Kafka(e)
            })
    }

    async fn process_ack(delivery: DeliveryFuture) -> Result<RecordMetadata, BridgeError> {
        match delivery.await {
            Err(_) => {
                // Cancelled due to timeout while retrying
                counter!("bridge_produce_errors_total", "cause" => "canceled").increment(1);
                error!("failed to produce to Kafka before write timeout");
                Err(BridgeError::OperationAborted)
            }
            Ok(Err((err, _))) => {
                counter!("bridge_produce_errors_total", "cause" => "delivery").increment(1);
                error!("failed to produce to Kafka: {}", err);
                Err(BridgeError::Kafka(err))
            }
            Ok(Ok((partition, offset))) => {
                counter!("bridge_records_produced_total", "mode" => "acknowledged").increment(1);
                Ok(RecordMetadata { partition, offset })
            }
        }
    }

    /// Publishes every record of the request. Acknowledged requests get one
    /// result per record, in request order.
    #[instrument(skip_all, fields(records = request.records.len(), mode = request.mode.as_str()))]
    pub async fn handle(
        &self,
        request: SourceRequest,
    ) -> Result<Option<Vec<Result<RecordMetadata, BridgeError>>>, BridgeError> {
        match request.mode {
            DeliveryMode::Unacknowledged => {
                for record in &request.records {
                    self.write(record)?;
                }
                Ok(None)
            }
            DeliveryMode::Acknowledged => {
                if !self.is_open() {
                    return Err(BridgeError::EndpointClosed);
                }

                // Enqueue sequentially to keep the request order, then wait for the ACKs
                let mut pending = Vec::with_capacity(request.records.len());
                for record in &request.records {
                    pending.push(self.enqueue(record).await);
                }

                let mut results = Vec::with_capacity(pending.len());
                for ack in pending {
                    results.push(match ack {
                        Ok(delivery) => Self::process_ack(delivery).await,
                        Err(err) => Err(err),
                    });
                }
                Ok(Some(results))
            }
        }
    }
}

impl BridgeEndpoint for SourceEndpoint {
    fn open(&mut self) -> Result<(), BridgeError> {
        if self.is_open() {
            return Ok(());
        }

        info!("connecting to Kafka brokers at {}...", self.config.kafka_hosts);
        let acknowledged = create_producer(&self.config, DeliveryMode::Acknowledged)?;
        let unacknowledged = create_producer(&self.config, DeliveryMode::Unacknowledged)?;
        self.producers = Some(Producers {
            acknowledged,
            unacknowledged,
        });
        Ok(())
    }

    fn close(&mut self) {
        if let Some(producers) = self.producers.take() {
            // Fire and forget writes were already answered, they must not be dropped
            for mode in [DeliveryMode::Acknowledged, DeliveryMode::Unacknowledged] {
                if let Err(e) = producers.get(mode).flush(FLUSH_TIMEOUT) {
                    warn!("failed to flush {} producer: {}", mode.as_str(), e);
                }
            }
            info!("source endpoint closed");
        }

        if let Some(handler) = self.close_handler.take() {
            handler();
        }
    }

    fn close_handler(&mut self, handler: CloseHandler) {
        self.close_handler = Some(handler);
    }
}
