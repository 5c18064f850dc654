//! Broker client boundary.
//!
//! This module contains:
//! - Message types exchanged with the broker (`ConsumerMessage`, `ProducerMessage`)
//! - `Metadata`: the routing slot carried by asynchronously produced messages
//! - Client traits: `ConsumerFactory`, `GroupConsumer`, `SyncProducer`, `AsyncProducer`
//! - Kafka connection settings
//! - Implementations: Kafka (rdkafka), Mock

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

// Implementation modules
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod mock;

// Re-exports
#[cfg(feature = "kafka")]
pub use kafka::{KafkaAsyncProducer, KafkaConsumerFactory, KafkaSyncProducer};
pub use mock::{MockAsyncProducer, MockConsumerFactory, MockSyncProducer};

// ============================================================================
// Errors
// ============================================================================

/// Result type for broker client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors reported by the broker client.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Produce failed: {0}")]
    Produce(String),

    #[error("Consume failed: {0}")]
    Consume(String),

    #[error("Offset commit failed: {0}")]
    Commit(String),

    #[error("Client already closed")]
    Closed,
}

// ============================================================================
// Messages
// ============================================================================

/// Opaque caller value attached to an asynchronous send.
pub type Opaque = Arc<dyn Any + Send + Sync>;

/// Message received from the consumer group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Bytes>,
    pub value: Bytes,
    /// Broker timestamp in milliseconds since the epoch, when available.
    pub timestamp: Option<i64>,
}

/// Routing slot of a produced message.
///
/// Only `Ack` is demultiplexed back to a caller; `None` and `Caller` outcomes
/// are logged and discarded by the multiplexer.
#[derive(Clone, Default)]
pub enum Metadata {
    #[default]
    None,
    /// Caller value, either attached outside a connection or restored after routing.
    Caller(Opaque),
    /// Per-send routing record created by a connection.
    Ack(AckMeta),
}

impl Metadata {
    /// Returns the caller value if present.
    pub fn caller(&self) -> Option<&Opaque> {
        match self {
            Metadata::Caller(value) => Some(value),
            Metadata::Ack(meta) => meta.user.as_ref(),
            Metadata::None => None,
        }
    }

    /// Downcast the caller value.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.caller().and_then(|v| v.downcast_ref::<T>())
    }
}

impl fmt::Debug for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Metadata::None => write!(f, "None"),
            Metadata::Caller(_) => write!(f, "Caller(..)"),
            Metadata::Ack(meta) => meta.fmt(f),
        }
    }
}

/// Correlates one asynchronous send with the caller that issued it.
#[derive(Clone, Default)]
pub struct AckMeta {
    pub success: Option<mpsc::Sender<ProducerMessage>>,
    pub error: Option<mpsc::Sender<ProducerError>>,
    pub user: Option<Opaque>,
}

impl AckMeta {
    /// Metadata to restore onto the outcome before handing it to the caller.
    pub(crate) fn restored(&self) -> Metadata {
        match &self.user {
            Some(value) => Metadata::Caller(Arc::clone(value)),
            None => Metadata::None,
        }
    }
}

impl fmt::Debug for AckMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AckMeta")
            .field("success", &self.success.is_some())
            .field("error", &self.error.is_some())
            .field("user", &self.user.is_some())
            .finish()
    }
}

/// Message handed to a producer, and echoed back as the async success outcome.
#[derive(Debug, Clone, Default)]
pub struct ProducerMessage {
    pub topic: String,
    pub key: Option<Bytes>,
    pub value: Bytes,
    /// Assigned partition. `-1` until the broker acknowledges.
    pub partition: i32,
    /// Assigned offset. `-1` until the broker acknowledges.
    pub offset: i64,
    pub metadata: Metadata,
}

impl ProducerMessage {
    pub fn new(topic: impl Into<String>, key: Option<Bytes>, value: Bytes) -> Self {
        Self {
            topic: topic.into(),
            key,
            value,
            partition: -1,
            offset: -1,
            metadata: Metadata::None,
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Failed asynchronous send.
#[derive(Debug, Clone)]
pub struct ProducerError {
    pub message: ProducerMessage,
    pub error: ClientError,
}

// ============================================================================
// Traits
// ============================================================================

/// Running consumer-group membership plus its message and error streams.
pub struct ConsumerSession {
    pub consumer: Arc<dyn GroupConsumer>,
    pub messages: mpsc::Receiver<ConsumerMessage>,
    pub errors: mpsc::Receiver<ClientError>,
}

/// Creates consumer-group clients bound to a fixed topic set.
#[async_trait]
pub trait ConsumerFactory: Send + Sync {
    /// Join `group_id` and start consuming `topics`.
    async fn create(&self, topics: &[String], group_id: &str) -> Result<ConsumerSession>;
}

/// Handle of a running consumer-group client.
#[async_trait]
pub trait GroupConsumer: Send + Sync {
    /// Mark `message` as consumed so the group resumes after it.
    fn mark_offset(&self, message: &ConsumerMessage, metadata: &str) -> Result<()>;

    /// Leave the group and stop the streams.
    async fn close(&self) -> Result<()>;

    /// Fires once the consumer has been closed.
    fn closed(&self) -> CancellationToken;
}

/// Producer whose send completes once the broker acknowledges.
#[async_trait]
pub trait SyncProducer: Send + Sync {
    /// Returns the `(partition, offset)` assigned to the message.
    async fn send(&self, topic: &str, key: Option<Bytes>, value: Bytes) -> Result<(i32, i64)>;

    async fn close(&self) -> Result<()>;
}

/// Producer whose send only enqueues.
///
/// Outcomes are reported on the shared streams of the `AsyncProducerHandle`
/// the producer was created with, one per enqueued message.
#[async_trait]
pub trait AsyncProducer: Send + Sync {
    fn send(&self, message: ProducerMessage) -> Result<()>;

    async fn close(&self) -> Result<()>;

    /// Fires once the producer has been closed.
    fn closed(&self) -> CancellationToken;
}

/// Asynchronous producer together with its shared outcome streams.
pub struct AsyncProducerHandle {
    pub producer: Arc<dyn AsyncProducer>,
    pub successes: mpsc::Receiver<ProducerMessage>,
    pub errors: mpsc::Receiver<ProducerError>,
}

// ============================================================================
// Configuration
// ============================================================================

/// Partitioning scheme used by the producers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Partitioner {
    /// Partition by key hash.
    #[default]
    Hash,
    /// Random partition per message.
    Random,
    /// Explicit partition taken from `KafkaConfig::partition`.
    Manual,
}

/// Kafka-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KafkaConfig {
    /// Kafka bootstrap servers.
    pub brokers: Vec<String>,
    /// Partitioning scheme for produced messages.
    pub partitioner: Partitioner,
    /// Partition used with `Partitioner::Manual`.
    pub partition: i32,
    /// Enable librdkafka debug contexts.
    pub debug: bool,
    /// Producer delivery timeout in milliseconds.
    pub message_timeout_ms: u64,
    /// SASL username (optional, for authenticated clusters).
    pub sasl_username: Option<String>,
    /// SASL password (optional, for authenticated clusters).
    pub sasl_password: Option<String>,
    /// SASL mechanism (PLAIN, SCRAM-SHA-256, SCRAM-SHA-512).
    pub sasl_mechanism: Option<String>,
    /// Security protocol (PLAINTEXT, SSL, SASL_PLAINTEXT, SASL_SSL).
    pub security_protocol: Option<String>,
    /// SSL CA certificate path (for SSL connections).
    pub ssl_ca_location: Option<String>,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: vec!["localhost:9092".to_string()],
            partitioner: Partitioner::Hash,
            partition: -1,
            debug: false,
            message_timeout_ms: 5000,
            sasl_username: None,
            sasl_password: None,
            sasl_mechanism: None,
            security_protocol: None,
            ssl_ca_location: None,
        }
    }
}

impl KafkaConfig {
    /// Create config for the given brokers.
    pub fn new<I, S>(brokers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            brokers: brokers.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Parse a comma separated broker list such as `KAFKA_PEERS`.
    pub fn from_peer_list(peers: &str) -> Self {
        Self::new(
            peers
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect::<Vec<_>>(),
        )
    }

    /// Add SASL authentication.
    pub fn with_sasl(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
        mechanism: impl Into<String>,
    ) -> Self {
        self.sasl_username = Some(username.into());
        self.sasl_password = Some(password.into());
        self.sasl_mechanism = Some(mechanism.into());
        self.security_protocol = Some("SASL_SSL".to_string());
        self
    }

    /// Set security protocol.
    pub fn with_security_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.security_protocol = Some(protocol.into());
        self
    }

    /// Set SSL CA certificate location.
    pub fn with_ssl_ca(mut self, ca_location: impl Into<String>) -> Self {
        self.ssl_ca_location = Some(ca_location.into());
        self
    }

    /// Set the partitioning scheme.
    pub fn with_partitioner(mut self, partitioner: Partitioner) -> Self {
        self.partitioner = partitioner;
        self
    }

    /// Produce every message to `partition`.
    pub fn with_manual_partition(mut self, partition: i32) -> Self {
        self.partitioner = Partitioner::Manual;
        self.partition = partition;
        self
    }

    /// Bootstrap servers joined for librdkafka.
    pub fn bootstrap_servers(&self) -> String {
        self.brokers.join(",")
    }

    /// Partition to pin produced records to, if any.
    pub fn fixed_partition(&self) -> Option<i32> {
        match self.partitioner {
            Partitioner::Manual if self.partition >= 0 => Some(self.partition),
            _ => None,
        }
    }
}
