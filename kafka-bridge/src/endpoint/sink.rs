use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use rdkafka::consumer::{CommitMode, Consumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{Message, OwnedMessage};
use rdkafka::{Offset, TopicPartitionList};
use tokio::runtime::Handle;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::api::BridgeError;
use crate::config::{ConsumerDefaults, KafkaConfig};
use crate::converter::EmbeddedFormat;
use crate::endpoint::{BridgeEndpoint, CloseHandler};
use crate::kafka::{create_consumer, BridgeConsumer, ConsumerSettings};
use crate::request::{PollParams, SinkRequest, SubscribeRequest};
use crate::types::{OffsetAndMetadata, PartitionAssignment, TopicPartition};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subscription {
    Topics(Vec<String>),
    Pattern(String),
}

impl Subscription {
    fn from_request(request: SubscribeRequest) -> Result<Self, BridgeError> {
        match (request.topics, request.topic_pattern) {
            (Some(_), Some(_)) => Err(BridgeError::ConflictingSubscription),
            (Some(topics), None) if !topics.is_empty() => Ok(Subscription::Topics(topics)),
            (None, Some(pattern)) if !pattern.is_empty() => Ok(Subscription::Pattern(pattern)),
            _ => Err(BridgeError::MissingSubscription),
        }
    }

    /// Names as librdkafka expects them, patterns being told apart by a leading `^`.
    fn to_kafka(&self) -> Vec<String> {
        match self {
            Subscription::Topics(topics) => topics.clone(),
            Subscription::Pattern(pattern) if pattern.starts_with('^') => vec![pattern.clone()],
            Subscription::Pattern(pattern) => vec![format!("^{}", pattern)],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkState {
    Uninitialized,
    Subscribed(Subscription),
    Assigned(Vec<PartitionAssignment>),
    Closed,
}

#[derive(Debug, PartialEq, Eq)]
pub enum SinkResponse {
    NoContent,
    Committed,
    Records { format: EmbeddedFormat, body: Vec<u8> },
    Deleted,
}

/// One consumer instance: a session owning its own Kafka consumer.
pub struct SinkEndpoint {
    instance_id: String,
    group_id: String,
    format: EmbeddedFormat,
    settings: ConsumerSettings,
    kafka: KafkaConfig,

    poll_timeout: Duration,
    max_bytes: Option<usize>,
    max_poll_records: usize,

    consumer: Option<Arc<BridgeConsumer>>,
    state: SinkState,
    close_handler: Option<CloseHandler>,
}

impl SinkEndpoint {
    pub fn new(
        instance_id: String,
        group_id: String,
        format: EmbeddedFormat,
        settings: ConsumerSettings,
        kafka: KafkaConfig,
        defaults: &ConsumerDefaults,
    ) -> Self {
        Self {
            instance_id,
            group_id,
            format,
            settings,
            kafka,
            poll_timeout: Duration::from_millis(defaults.consumer_poll_timeout_ms),
            max_bytes: defaults.consumer_max_bytes,
            max_poll_records: defaults.consumer_max_poll_records,
            consumer: None,
            state: SinkState::Uninitialized,
            close_handler: None,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn state(&self) -> &SinkState {
        &self.state
    }

    fn consumer(&self) -> Result<Arc<BridgeConsumer>, BridgeError> {
        if self.state == SinkState::Closed {
            return Err(BridgeError::ConsumerNotFound);
        }
        self.consumer.clone().ok_or(BridgeError::EndpointClosed)
    }

    fn ensure_uninitialized(&self) -> Result<(), BridgeError> {
        match self.state {
            SinkState::Uninitialized => Ok(()),
            SinkState::Closed => Err(BridgeError::ConsumerNotFound),
            SinkState::Subscribed(_) | SinkState::Assigned(_) => {
                Err(BridgeError::AlreadySubscribed)
            }
        }
    }

    fn ensure_active(&self) -> Result<(), BridgeError> {
        match self.state {
            SinkState::Subscribed(_) | SinkState::Assigned(_) => Ok(()),
            SinkState::Uninitialized => Err(BridgeError::NotSubscribed),
            SinkState::Closed => Err(BridgeError::ConsumerNotFound),
        }
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T, BridgeError>
    where
        T: Send + 'static,
        F: FnOnce(&BridgeConsumer) -> Result<T, KafkaError> + Send + 'static,
    {
        let consumer = self.consumer()?;
        tokio::task::spawn_blocking(move || op(consumer.as_ref()))
            .await
            .map_err(|_| BridgeError::OperationAborted)?
            .map_err(BridgeError::from)
    }

    pub fn subscribe(&mut self, request: SubscribeRequest) -> Result<(), BridgeError> {
        let subscription = Subscription::from_request(request)?;
        self.ensure_uninitialized()?;

        let topics = subscription.to_kafka();
        let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer()?.subscribe(&topics)?;

        info!("subscribed to {:?}", subscription);
        self.state = SinkState::Subscribed(subscription);
        Ok(())
    }

    pub fn assign(&mut self, partitions: Vec<PartitionAssignment>) -> Result<(), BridgeError> {
        if partitions.is_empty() {
            return Err(BridgeError::MissingAssignment);
        }
        self.ensure_uninitialized()?;

        let mut assignment = TopicPartitionList::new();
        for entry in &partitions {
            // Without an explicit offset, start from the committed position
            let offset = entry.offset.map_or(Offset::Invalid, Offset::Offset);
            assignment.add_partition_offset(
                &entry.partition.topic,
                entry.partition.partition,
                offset,
            )?;
        }
        self.consumer()?.assign(&assignment)?;

        info!("assigned {} partitions", partitions.len());
        self.state = SinkState::Assigned(partitions);
        Ok(())
    }

    pub fn unsubscribe(&mut self) -> Result<(), BridgeError> {
        self.ensure_active()?;
        let consumer = self.consumer()?;

        match self.state {
            SinkState::Assigned(_) => consumer.assign(&TopicPartitionList::new())?,
            _ => consumer.unsubscribe(),
        }

        info!("subscription dropped");
        self.state = SinkState::Uninitialized;
        Ok(())
    }

    /// Returns the next batch serialized in the instance's format. Timeout and
    /// size limit given here stick for the following polls.
    pub async fn poll(&mut self, params: PollParams) -> Result<Vec<u8>, BridgeError> {
        self.ensure_active()?;
        if let Some(timeout) = params.timeout {
            self.poll_timeout = Duration::from_millis(timeout);
        }
        if let Some(max_bytes) = params.max_bytes {
            self.max_bytes = Some(max_bytes);
        }

        let timeout = self.poll_timeout;
        let max_records = self.max_poll_records;
        let messages = self
            .blocking(move |consumer| -> Result<Vec<OwnedMessage>, KafkaError> {
                let mut messages = Vec::new();
                let mut wait = timeout;

                while messages.len() < max_records {
                    match consumer.poll(wait) {
                        None => break,
                        Some(Ok(message)) => messages.push(message.detach()),
                        // Records already consumed must not be lost
                        Some(Err(e)) if !messages.is_empty() => {
                            warn!("stopping poll early: {}", e);
                            break;
                        }
                        Some(Err(e)) => return Err(e),
                    }
                    wait = Duration::ZERO;
                }
                Ok(messages)
            })
            .await?;

        let body = self.format.to_messages(&messages)?;
        if self.max_bytes.is_some_and(|max_bytes| body.len() > max_bytes) {
            warn!(
                "poll response of {} bytes exceeds the limit of {:?}",
                body.len(),
                self.max_bytes
            );
            return Err(BridgeError::ResponseTooLarge);
        }

        debug!(
            "polled {} records from {}",
            messages.len(),
            messages
                .first()
                .map(|message| message.topic())
                .unwrap_or_default()
        );
        counter!("bridge_records_polled_total").increment(messages.len() as u64);
        Ok(body)
    }

    /// Commits the given offsets, or the consumed positions when none is given.
    pub async fn commit(
        &self,
        offsets: Option<HashMap<TopicPartition, OffsetAndMetadata>>,
    ) -> Result<(), BridgeError> {
        self.ensure_active()?;

        let Some(offsets) = offsets else {
            return self
                .blocking(|consumer| {
                    match consumer.commit_consumer_state(CommitMode::Sync) {
                        // Nothing consumed since the last commit
                        Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => Ok(()),
                        result => result,
                    }
                })
                .await;
        };
        if offsets.is_empty() {
            return Ok(());
        }

        let mut commit = TopicPartitionList::new();
        for (partition, committed) in offsets {
            let mut elem = commit.add_partition(&partition.topic, partition.partition);
            elem.set_offset(Offset::Offset(committed.offset))?;
            if let Some(metadata) = committed.metadata {
                elem.set_metadata(metadata);
            }
        }
        self.blocking(move |consumer| consumer.commit(&commit, CommitMode::Sync))
            .await
    }

    /// Seeks every partition concurrently. Succeeds only if all of them do.
    async fn seek_all(&self, targets: Vec<(TopicPartition, Offset)>) -> Result<(), BridgeError> {
        self.ensure_active()?;
        let consumer = self.consumer()?;
        let timeout = self.kafka.operation_timeout();

        let mut seeks = JoinSet::new();
        for (partition, offset) in targets {
            let consumer = consumer.clone();
            seeks.spawn_blocking(move || {
                debug!(
                    "seeking {}/{} to {:?}",
                    partition.topic, partition.partition, offset
                );
                consumer
                    .seek(&partition.topic, partition.partition, offset, timeout)
                    .map_err(|e| (partition, e))
            });
        }

        let mut failure = None;
        while let Some(joined) = seeks.join_next().await {
            let outcome = match joined {
                Ok(Ok(())) => continue,
                Ok(Err((partition, e))) => {
                    warn!(
                        "failed to seek {}/{}: {}",
                        partition.topic, partition.partition, e
                    );
                    BridgeError::Kafka(e)
                }
                Err(_) => BridgeError::OperationAborted,
            };
            failure.get_or_insert(outcome);
        }

        failure.map_or(Ok(()), Err)
    }

    pub async fn seek(&self, offsets: Vec<(TopicPartition, i64)>) -> Result<(), BridgeError> {
        self.seek_all(
            offsets
                .into_iter()
                .map(|(partition, offset)| (partition, Offset::Offset(offset)))
                .collect(),
        )
        .await
    }

    pub async fn seek_to_beginning(
        &self,
        partitions: Vec<TopicPartition>,
    ) -> Result<(), BridgeError> {
        self.seek_all(
            partitions
                .into_iter()
                .map(|partition| (partition, Offset::Beginning))
                .collect(),
        )
        .await
    }

    pub async fn seek_to_end(&self, partitions: Vec<TopicPartition>) -> Result<(), BridgeError> {
        self.seek_all(
            partitions
                .into_iter()
                .map(|partition| (partition, Offset::End))
                .collect(),
        )
        .await
    }

    pub fn delete(&mut self) -> Result<(), BridgeError> {
        if self.state == SinkState::Closed {
            return Err(BridgeError::ConsumerNotFound);
        }
        self.close();
        Ok(())
    }

    #[instrument(skip_all, fields(instance = %self.instance_id, operation = request.name()))]
    pub async fn handle(&mut self, request: SinkRequest) -> Result<SinkResponse, BridgeError> {
        match request {
            SinkRequest::Subscribe(request) => {
                self.subscribe(request)?;
                Ok(SinkResponse::NoContent)
            }
            SinkRequest::Unsubscribe => {
                self.unsubscribe()?;
                Ok(SinkResponse::NoContent)
            }
            SinkRequest::Assign(partitions) => {
                self.assign(partitions)?;
                Ok(SinkResponse::NoContent)
            }
            SinkRequest::Poll(params) => {
                let body = self.poll(params).await?;
                Ok(SinkResponse::Records {
                    format: self.format,
                    body,
                })
            }
            SinkRequest::Commit(offsets) => {
                self.commit(offsets).await?;
                Ok(SinkResponse::Committed)
            }
            SinkRequest::Seek(offsets) => {
                self.seek(offsets).await?;
                Ok(SinkResponse::NoContent)
            }
            SinkRequest::SeekToBeginning(partitions) => {
                self.seek_to_beginning(partitions).await?;
                Ok(SinkResponse::NoContent)
            }
            SinkRequest::SeekToEnd(partitions) => {
                self.seek_to_end(partitions).await?;
                Ok(SinkResponse::NoContent)
            }
            SinkRequest::Delete => {
                self.delete()?;
                Ok(SinkResponse::Deleted)
            }
        }
    }
}

impl BridgeEndpoint for SinkEndpoint {
    fn open(&mut self) -> Result<(), BridgeError> {
        if self.consumer.is_some() {
            return Ok(());
        }

        let consumer = create_consumer(
            &self.kafka,
            &self.group_id,
            &self.instance_id,
            &self.settings,
        )?;
        self.consumer = Some(Arc::new(consumer));
        Ok(())
    }

    fn close(&mut self) {
        if let Some(consumer) = self.consumer.take() {
            // Leaving the group blocks until the broker answers
            match Handle::try_current() {
                Ok(handle) => {
                    drop(handle.spawn_blocking(move || drop(consumer)));
                }
                Err(_) => drop(consumer),
            }
        }

        if self.state != SinkState::Closed {
            info!("consumer instance {} closed", self.instance_id);
            self.state = SinkState::Closed;
        }

        if let Some(handler) = self.close_handler.take() {
            handler();
        }
    }

    fn close_handler(&mut self, handler: CloseHandler) {
        self.close_handler = Some(handler);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::{SinkEndpoint, SinkRequest, SinkResponse, SinkState, Subscription};
    use crate::api::BridgeError;
    use crate::config::{ConsumerDefaults, KafkaConfig};
    use crate::converter::EmbeddedFormat;
    use crate::endpoint::BridgeEndpoint;
    use crate::kafka::ConsumerSettings;
    use crate::request::{PollParams, SubscribeRequest};
    use crate::types::{PartitionAssignment, TopicPartition};

    fn unreachable_endpoint() -> SinkEndpoint {
        let kafka = KafkaConfig {
            kafka_hosts: "localhost:1".to_string(),
            kafka_tls: false,
            kafka_producer_acks: "all".to_string(),
            kafka_producer_linger_ms: 0,
            kafka_message_timeout_ms: 1000,
            kafka_compression_codec: "none".to_string(),
            kafka_producer_auto_create_topics: false,
        };
        let defaults = ConsumerDefaults {
            consumer_poll_timeout_ms: 10,
            consumer_max_bytes: None,
            consumer_max_poll_records: 10,
        };
        let mut endpoint = SinkEndpoint::new(
            "consumer-1".to_string(),
            "group-1".to_string(),
            EmbeddedFormat::Json,
            ConsumerSettings::default(),
            kafka,
            &defaults,
        );
        endpoint.open().expect("failed to create consumer");
        endpoint
    }

    fn topics(names: &[&str]) -> SubscribeRequest {
        SubscribeRequest {
            topics: Some(names.iter().map(|name| name.to_string()).collect()),
            topic_pattern: None,
        }
    }

    #[test]
    fn patterns_are_anchored() {
        assert_eq!(
            Subscription::Pattern("events.*".to_string()).to_kafka(),
            vec!["^events.*".to_string()]
        );
        assert_eq!(
            Subscription::Pattern("^events.*".to_string()).to_kafka(),
            vec!["^events.*".to_string()]
        );
    }

    #[tokio::test]
    async fn subscription_requires_exactly_one_target() {
        let mut endpoint = unreachable_endpoint();

        let both = SubscribeRequest {
            topics: Some(vec!["events".to_string()]),
            topic_pattern: Some("events.*".to_string()),
        };
        assert!(matches!(
            endpoint.handle(SinkRequest::Subscribe(both)).await,
            Err(BridgeError::ConflictingSubscription)
        ));
        assert!(matches!(
            endpoint
                .handle(SinkRequest::Subscribe(SubscribeRequest::default()))
                .await,
            Err(BridgeError::MissingSubscription)
        ));
        assert!(matches!(
            endpoint.handle(SinkRequest::Subscribe(topics(&[]))).await,
            Err(BridgeError::MissingSubscription)
        ));
        assert_eq!(endpoint.state(), &SinkState::Uninitialized);

        let response = endpoint
            .handle(SinkRequest::Subscribe(topics(&["events"])))
            .await
            .unwrap();
        assert_eq!(response, SinkResponse::NoContent);
        assert_eq!(
            endpoint.state(),
            &SinkState::Subscribed(Subscription::Topics(vec!["events".to_string()]))
        );
    }

    #[tokio::test]
    async fn subscription_and_assignment_are_exclusive() {
        let mut endpoint = unreachable_endpoint();
        endpoint.subscribe(topics(&["events"])).unwrap();

        assert!(matches!(
            endpoint.subscribe(topics(&["other"])),
            Err(BridgeError::AlreadySubscribed)
        ));
        assert!(matches!(
            endpoint.assign(vec![PartitionAssignment {
                partition: TopicPartition::new("events", 0),
                offset: None,
            }]),
            Err(BridgeError::AlreadySubscribed)
        ));

        endpoint.unsubscribe().unwrap();
        assert_eq!(endpoint.state(), &SinkState::Uninitialized);

        assert!(matches!(
            endpoint.assign(vec![]),
            Err(BridgeError::MissingAssignment)
        ));
        endpoint
            .assign(vec![PartitionAssignment {
                partition: TopicPartition::new("events", 0),
                offset: Some(3),
            }])
            .unwrap();
        assert!(matches!(endpoint.state(), SinkState::Assigned(_)));
    }

    #[tokio::test]
    async fn operations_need_a_subscription_first() {
        let mut endpoint = unreachable_endpoint();

        assert!(matches!(
            endpoint.poll(PollParams::default()).await,
            Err(BridgeError::NotSubscribed)
        ));
        assert!(matches!(
            endpoint.commit(None).await,
            Err(BridgeError::NotSubscribed)
        ));
        assert!(matches!(
            endpoint.seek(vec![(TopicPartition::new("events", 0), 1)]).await,
            Err(BridgeError::NotSubscribed)
        ));
        assert!(matches!(
            endpoint
                .seek_to_end(vec![TopicPartition::new("events", 0)])
                .await,
            Err(BridgeError::NotSubscribed)
        ));
        assert!(matches!(
            endpoint.unsubscribe(),
            Err(BridgeError::NotSubscribed)
        ));
    }

    #[tokio::test]
    async fn empty_seeks_succeed() {
        let mut endpoint = unreachable_endpoint();
        endpoint.subscribe(topics(&["events"])).unwrap();

        endpoint.seek(vec![]).await.unwrap();
        endpoint.seek_to_beginning(vec![]).await.unwrap();
    }

    #[tokio::test]
    async fn delete_closes_once() {
        let closed = Arc::new(AtomicUsize::new(0));
        let mut endpoint = unreachable_endpoint();
        let counter = closed.clone();
        endpoint.close_handler(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        assert_eq!(
            endpoint.handle(SinkRequest::Delete).await.unwrap(),
            SinkResponse::Deleted
        );
        assert_eq!(endpoint.state(), &SinkState::Closed);
        assert_eq!(closed.load(Ordering::SeqCst), 1);

        assert!(matches!(
            endpoint.handle(SinkRequest::Delete).await,
            Err(BridgeError::ConsumerNotFound)
        ));
        assert!(matches!(
            endpoint.subscribe(topics(&["events"])),
            Err(BridgeError::ConsumerNotFound)
        ));
        endpoint.close();
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }
}
