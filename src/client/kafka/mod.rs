//! Kafka broker client implementation.
//!
//! Backs the client traits with rdkafka:
//! - `KafkaConsumerFactory`: `StreamConsumer` joined to a consumer group
//! - `KafkaSyncProducer`: `FutureProducer`, awaiting each delivery
//! - `KafkaAsyncProducer`: `FutureProducer`, reporting deliveries on shared streams
//!
//! Offsets are stored explicitly by `mark_offset` and committed by the
//! auto-commit timer, so a restarted group resumes after the last marked
//! message.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message as KafkaMessage;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    AsyncProducer, AsyncProducerHandle, ClientError, ConsumerFactory, ConsumerMessage,
    ConsumerSession, GroupConsumer, KafkaConfig, Partitioner, ProducerError, ProducerMessage,
    Result, SyncProducer,
};

/// Capacity of the consumer and async producer streams.
const STREAM_CAPACITY: usize = 1024;
/// Upper bound on flushing a producer while closing.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

impl KafkaConfig {
    /// Build a ClientConfig for producers.
    fn build_producer_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", self.bootstrap_servers());
        config.set("message.timeout.ms", self.message_timeout_ms.to_string());
        config.set("acks", "all");

        match self.partitioner {
            Partitioner::Hash => {
                config.set("partitioner", "murmur2_random");
            }
            Partitioner::Random => {
                config.set("partitioner", "random");
            }
            // Partition is set per record.
            Partitioner::Manual => {}
        }

        self.apply_common_config(&mut config);
        config
    }

    /// Build a ClientConfig for a consumer group member.
    fn build_consumer_config(&self, group_id: &str) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", self.bootstrap_servers());
        config.set("group.id", group_id);
        config.set("enable.auto.commit", "true");
        config.set("enable.auto.offset.store", "false");
        config.set("auto.offset.reset", "earliest");

        self.apply_common_config(&mut config);
        config
    }

    /// Apply debug and security settings to a ClientConfig.
    fn apply_common_config(&self, config: &mut ClientConfig) {
        if self.debug {
            config.set("debug", "broker,topic,msg");
        }

        if let Some(ref protocol) = self.security_protocol {
            config.set("security.protocol", protocol);
        }

        if let Some(ref mechanism) = self.sasl_mechanism {
            config.set("sasl.mechanism", mechanism);
        }

        if let Some(ref username) = self.sasl_username {
            config.set("sasl.username", username);
        }

        if let Some(ref password) = self.sasl_password {
            config.set("sasl.password", password);
        }

        if let Some(ref ca_location) = self.ssl_ca_location {
            config.set("ssl.ca.location", ca_location);
        }
    }

    fn message_timeout(&self) -> Duration {
        Duration::from_millis(self.message_timeout_ms)
    }
}

/// Convert an rdkafka message into a `ConsumerMessage`.
fn to_consumer_message<M: KafkaMessage>(message: &M) -> ConsumerMessage {
    ConsumerMessage {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message.key().map(Bytes::copy_from_slice),
        value: message
            .payload()
            .map(Bytes::copy_from_slice)
            .unwrap_or_default(),
        timestamp: message.timestamp().to_millis(),
    }
}

/// Build a record for `message`, pinned to the configured partition if any.
fn build_record<'a>(
    config: &KafkaConfig,
    topic: &'a str,
    key: Option<&'a Bytes>,
    value: &'a Bytes,
) -> FutureRecord<'a, [u8], [u8]> {
    let mut record = FutureRecord::to(topic).payload(&value[..]);

    if let Some(k) = key {
        record = record.key(&k[..]);
    }

    if let Some(partition) = config.fixed_partition() {
        record = record.partition(partition);
    }

    record
}

async fn flush(producer: FutureProducer) -> Result<()> {
    tokio::task::spawn_blocking(move || producer.flush(FLUSH_TIMEOUT))
        .await
        .map_err(|e| ClientError::Produce(format!("Flush task failed: {}", e)))?
        .map_err(|e| ClientError::Produce(format!("Failed to flush producer: {}", e)))
}

// ============================================================================
// Consumer
// ============================================================================

/// Creates rdkafka consumer-group members.
pub struct KafkaConsumerFactory {
    config: KafkaConfig,
}

impl KafkaConsumerFactory {
    pub fn new(config: KafkaConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ConsumerFactory for KafkaConsumerFactory {
    async fn create(&self, topics: &[String], group_id: &str) -> Result<ConsumerSession> {
        let consumer: StreamConsumer = self
            .config
            .build_consumer_config(group_id)
            .create()
            .map_err(|e| {
                ClientError::Connection(format!("Failed to create Kafka consumer: {}", e))
            })?;

        let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&topic_refs)
            .map_err(|e| ClientError::Consume(format!("Failed to subscribe to topics: {}", e)))?;

        info!(
            bootstrap_servers = %self.config.bootstrap_servers(),
            group_id = %group_id,
            topics = ?topics,
            "Subscribed to Kafka topics"
        );

        let consumer = Arc::new(consumer);
        let closed = CancellationToken::new();
        let (messages_tx, messages_rx) = mpsc::channel(STREAM_CAPACITY);
        let (errors_tx, errors_rx) = mpsc::channel(STREAM_CAPACITY);

        tokio::spawn(pump_consumer(
            Arc::clone(&consumer),
            messages_tx,
            errors_tx,
            closed.clone(),
        ));

        Ok(ConsumerSession {
            consumer: Arc::new(KafkaGroupConsumer { consumer, closed }),
            messages: messages_rx,
            errors: errors_rx,
        })
    }
}

/// Forward the rdkafka stream into the session channels until closed.
async fn pump_consumer(
    consumer: Arc<StreamConsumer>,
    messages: mpsc::Sender<ConsumerMessage>,
    errors: mpsc::Sender<ClientError>,
    closed: CancellationToken,
) {
    let mut stream = consumer.stream();

    loop {
        tokio::select! {
            _ = closed.cancelled() => break,
            next = stream.next() => {
                let Some(result) = next else {
                    break;
                };
                match result {
                    Ok(message) => {
                        debug!(
                            topic = %message.topic(),
                            partition = message.partition(),
                            offset = message.offset(),
                            "Received Kafka message"
                        );
                        if messages.send(to_consumer_message(&message)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        let error = ClientError::Consume(e.to_string());
                        if errors.try_send(error).is_err() {
                            warn!(error = %e, "Kafka consumer error dropped");
                        }
                    }
                }
            }
        }
    }

    debug!("Kafka consumer pump stopped");
}

/// rdkafka consumer-group member.
pub struct KafkaGroupConsumer {
    consumer: Arc<StreamConsumer>,
    closed: CancellationToken,
}

#[async_trait]
impl GroupConsumer for KafkaGroupConsumer {
    fn mark_offset(&self, message: &ConsumerMessage, _metadata: &str) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(ClientError::Closed);
        }

        // The stored offset is the next one to read.
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(
            &message.topic,
            message.partition,
            Offset::Offset(message.offset + 1),
        )
        .map_err(|e| ClientError::Commit(e.to_string()))?;

        self.consumer
            .store_offsets(&tpl)
            .map_err(|e| ClientError::Commit(e.to_string()))
    }

    async fn close(&self) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(ClientError::Closed);
        }
        self.closed.cancel();

        // Commit what was marked before leaving the group.
        let consumer = Arc::clone(&self.consumer);
        let committed =
            tokio::task::spawn_blocking(move || consumer.commit_consumer_state(CommitMode::Sync))
                .await;
        match committed {
            Ok(Ok(())) => debug!("Committed marked offsets"),
            Ok(Err(e)) => debug!(error = %e, "No offsets committed on close"),
            Err(e) => warn!(error = %e, "Offset commit task failed"),
        }

        self.consumer.unsubscribe();
        info!("Kafka consumer closed");
        Ok(())
    }

    fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }
}

// ============================================================================
// Producers
// ============================================================================

/// Producer awaiting the broker acknowledgement of every send.
pub struct KafkaSyncProducer {
    producer: FutureProducer,
    config: KafkaConfig,
    closed: CancellationToken,
}

impl KafkaSyncProducer {
    pub fn new(config: KafkaConfig) -> Result<Self> {
        let producer: FutureProducer = config.build_producer_config().create().map_err(|e| {
            ClientError::Connection(format!("Failed to create Kafka producer: {}", e))
        })?;

        info!(
            bootstrap_servers = %config.bootstrap_servers(),
            "Connected sync producer to Kafka"
        );

        Ok(Self {
            producer,
            config,
            closed: CancellationToken::new(),
        })
    }
}

#[async_trait]
impl SyncProducer for KafkaSyncProducer {
    async fn send(&self, topic: &str, key: Option<Bytes>, value: Bytes) -> Result<(i32, i64)> {
        if self.closed.is_cancelled() {
            return Err(ClientError::Closed);
        }

        let record = build_record(&self.config, topic, key.as_ref(), &value);
        let (partition, offset) = self
            .producer
            .send(record, self.config.message_timeout())
            .await
            .map_err(|(e, _)| ClientError::Produce(format!("Failed to publish: {}", e)))?;

        debug!(topic = %topic, partition, offset, "Published message to Kafka");
        Ok((partition, offset))
    }

    async fn close(&self) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(ClientError::Closed);
        }
        self.closed.cancel();
        flush(self.producer.clone()).await
    }
}

/// Producer that enqueues and reports deliveries on shared streams.
pub struct KafkaAsyncProducer {
    producer: FutureProducer,
    config: KafkaConfig,
    successes: mpsc::Sender<ProducerMessage>,
    errors: mpsc::Sender<ProducerError>,
    closed: CancellationToken,
}

impl KafkaAsyncProducer {
    /// Create the producer and the handle carrying its outcome streams.
    pub fn create(config: KafkaConfig) -> Result<AsyncProducerHandle> {
        let producer: FutureProducer = config.build_producer_config().create().map_err(|e| {
            ClientError::Connection(format!("Failed to create Kafka producer: {}", e))
        })?;

        info!(
            bootstrap_servers = %config.bootstrap_servers(),
            "Connected async producer to Kafka"
        );

        let (successes_tx, successes_rx) = mpsc::channel(STREAM_CAPACITY);
        let (errors_tx, errors_rx) = mpsc::channel(STREAM_CAPACITY);

        let producer = Arc::new(Self {
            producer,
            config,
            successes: successes_tx,
            errors: errors_tx,
            closed: CancellationToken::new(),
        });

        Ok(AsyncProducerHandle {
            producer,
            successes: successes_rx,
            errors: errors_rx,
        })
    }
}

#[async_trait]
impl AsyncProducer for KafkaAsyncProducer {
    fn send(&self, mut message: ProducerMessage) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(ClientError::Closed);
        }

        let record = build_record(
            &self.config,
            &message.topic,
            message.key.as_ref(),
            &message.value,
        );

        // The rejected record borrows `message`; keep only the error.
        let enqueued = self.producer.send_result(record).map_err(|(e, _)| e);
        let delivery = match enqueued {
            Ok(delivery) => delivery,
            Err(e) => {
                let failure = ProducerError {
                    message,
                    error: ClientError::Produce(format!("Failed to enqueue: {}", e)),
                };
                return self
                    .errors
                    .try_send(failure)
                    .map_err(|_| ClientError::Produce("Error stream full".to_string()));
            }
        };

        let successes = self.successes.clone();
        let errors = self.errors.clone();

        tokio::spawn(async move {
            let outcome = match delivery.await {
                Ok(Ok((partition, offset))) => {
                    message.partition = partition;
                    message.offset = offset;
                    successes.send(message).await.map_err(|_| ())
                }
                Ok(Err((e, _))) => errors
                    .send(ProducerError {
                        message,
                        error: ClientError::Produce(e.to_string()),
                    })
                    .await
                    .map_err(|_| ()),
                Err(_) => errors
                    .send(ProducerError {
                        message,
                        error: ClientError::Produce("Delivery cancelled".to_string()),
                    })
                    .await
                    .map_err(|_| ()),
            };

            if outcome.is_err() {
                error!("Async producer outcome stream closed, outcome lost");
            }
        });

        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(ClientError::Closed);
        }
        let flushed = flush(self.producer.clone()).await;
        self.closed.cancel();
        flushed
    }

    fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }
}
