use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::{Offset, TopicPartitionList};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::connection::Connector;
use super::engine::CommitReceipt;
use super::models::{PartitionKey, SourceRecord};
use crate::config::ReplicatorConfig;
use crate::error::{Endpoint, ReplicatorError, Result};

/// Ordered, partitioned log with manual acknowledgment
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Up to `max_records` records, waiting at most `wait`; empty when nothing arrived
    async fn poll(&mut self, max_records: usize, wait: Duration) -> Result<Vec<SourceRecord>>;

    /// Record the receipt's positions as consumed.
    ///
    /// Only a receipt issued after a successful store commit exists, so nothing can
    /// be acknowledged ahead of its writes.
    async fn acknowledge(&mut self, receipt: &CommitReceipt) -> Result<()>;

    /// Restart delivery of each partition at the given offset
    async fn rewind(&mut self, positions: &[(PartitionKey, i64)]) -> Result<()>;
}

/// Kafka consumer settings
#[derive(Debug, Clone)]
pub struct KafkaSettings {
    pub brokers: String,
    pub group_id: String,
    /// Subscription; a leading `^` makes it a regex
    pub topic_pattern: String,
    pub session_timeout_ms: u32,
    pub heartbeat_interval_ms: u32,
    /// Bound on metadata probes, seeks and commits
    pub request_timeout: Duration,
}

impl KafkaSettings {
    pub fn from_config(config: &ReplicatorConfig) -> Self {
        Self {
            brokers: config.kafka_bootstrap.clone(),
            group_id: config.kafka_group_id.clone(),
            topic_pattern: config.kafka_topic_pattern.clone(),
            session_timeout_ms: config.kafka_session_timeout_ms,
            heartbeat_interval_ms: config.kafka_heartbeat_interval_ms,
            request_timeout: config.connect_timeout(),
        }
    }

    fn client_config(&self) -> ClientConfig {
        let mut client = ClientConfig::new();
        client
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", &self.group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", self.session_timeout_ms.to_string())
            .set("heartbeat.interval.ms", self.heartbeat_interval_ms.to_string());
        client
    }
}

pub struct KafkaEventSource {
    consumer: Arc<StreamConsumer>,
    request_timeout: Duration,
}

impl KafkaEventSource {
    /// Broker metadata round trip
    async fn fetch_metadata(&self) -> Result<usize> {
        let consumer = Arc::clone(&self.consumer);
        let timeout = self.request_timeout;

        let brokers = tokio::task::spawn_blocking(move || {
            consumer
                .fetch_metadata(None, timeout)
                .map(|metadata| metadata.brokers().len())
        })
        .await
        .map_err(|e| ReplicatorError::Unavailable {
            endpoint: Endpoint::Source,
            reason: format!("metadata task failed: {}", e),
        })??;
        Ok(brokers)
    }
}

#[async_trait]
impl EventSource for KafkaEventSource {
    async fn poll(&mut self, max_records: usize, wait: Duration) -> Result<Vec<SourceRecord>> {
        let deadline = tokio::time::Instant::now() + wait;
        let mut records = Vec::with_capacity(max_records);

        while records.len() < max_records {
            match tokio::time::timeout_at(deadline, self.consumer.recv()).await {
                Err(_) => break,
                Ok(Ok(message)) => records.push(SourceRecord {
                    topic: message.topic().to_string(),
                    partition: message.partition(),
                    offset: message.offset(),
                    payload: message.payload().map(|p| p.to_vec()),
                }),
                Ok(Err(e)) if records.is_empty() => {
                    error!(error = %e, "Kafka consumer error");
                    return Err(e.into());
                }
                Ok(Err(e)) => {
                    // Hand over what was already received; the error resurfaces next poll
                    warn!(
                        error = %e,
                        received = records.len(),
                        "Kafka consumer error mid-batch"
                    );
                    break;
                }
            }
        }

        Ok(records)
    }

    async fn acknowledge(&mut self, receipt: &CommitReceipt) -> Result<()> {
        let mut offsets = TopicPartitionList::new();
        for (key, next_offset) in receipt.positions() {
            offsets.add_partition_offset(&key.topic, key.partition, Offset::Offset(*next_offset))?;
        }

        let consumer = Arc::clone(&self.consumer);
        tokio::task::spawn_blocking(move || consumer.commit(&offsets, CommitMode::Sync))
            .await
            .map_err(|e| ReplicatorError::Unavailable {
                endpoint: Endpoint::Source,
                reason: format!("commit task failed: {}", e),
            })??;

        debug!(partitions = receipt.positions().len(), "Source offsets committed");
        Ok(())
    }

    async fn rewind(&mut self, positions: &[(PartitionKey, i64)]) -> Result<()> {
        let consumer = Arc::clone(&self.consumer);
        let positions = positions.to_vec();
        let timeout = self.request_timeout;

        tokio::task::spawn_blocking(move || -> Result<()> {
            for (key, offset) in &positions {
                consumer.seek(&key.topic, key.partition, Offset::Offset(*offset), timeout)?;
                debug!(partition_key = %key, offset, "Rewound partition");
            }
            Ok(())
        })
        .await
        .map_err(|e| ReplicatorError::Unavailable {
            endpoint: Endpoint::Source,
            reason: format!("seek task failed: {}", e),
        })?
    }
}

/// Creates consumers, subscribes them and checks that a broker answers
pub struct KafkaConnector {
    settings: KafkaSettings,
}

impl KafkaConnector {
    pub fn new(settings: KafkaSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl Connector for KafkaConnector {
    type Handle = KafkaEventSource;

    fn endpoint(&self) -> Endpoint {
        Endpoint::Source
    }

    fn describe(&self) -> String {
        self.settings.brokers.clone()
    }

    async fn connect(&self) -> Result<KafkaEventSource> {
        let consumer: StreamConsumer = self.settings.client_config().create()?;
        consumer.subscribe(&[self.settings.topic_pattern.as_str()])?;

        let source = KafkaEventSource {
            consumer: Arc::new(consumer),
            request_timeout: self.settings.request_timeout,
        };

        // Creating a consumer never touches the network; make sure a broker answers
        let brokers = source.fetch_metadata().await?;
        info!(
            brokers,
            group_id = %self.settings.group_id,
            pattern = %self.settings.topic_pattern,
            "Kafka consumer subscribed"
        );

        Ok(source)
    }

    async fn probe(&self, handle: &KafkaEventSource) -> Result<()> {
        handle.fetch_metadata().await.map(|_| ())
    }

    async fn release(&self, handle: KafkaEventSource) {
        handle.consumer.unsubscribe();
        debug!(brokers = %self.settings.brokers, "Kafka consumer unsubscribed");
    }
}
