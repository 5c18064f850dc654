//! Kafka connection multiplexer.
//!
//! This module contains:
//! - `Multiplexer`: owns one consumer-group client and one sync and one async
//!   producer, shared by any number of connections
//! - `Connection` / `ProtoConnection`: named handles for subscribing and sending
//! - The generic consumer loop (fan-out) and the acknowledgement router (fan-in)
//!
//! Subscriptions must be registered before `Multiplexer::start`; the consumer
//! group is created once, bound to the union of the subscribed topics.
//! Producers are usable immediately.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use crate::client::{
    AsyncProducer, AsyncProducerHandle, ClientError, ConsumerFactory, GroupConsumer,
    SyncProducer,
};
use crate::serializer::SerializeError;

mod ack_router;
mod connection;
mod consumer_loop;
mod delivery;

pub use connection::{Connection, ProtoConnection, ProtoMessage, ProtoReceiver, Subscription};
pub use delivery::DispatchOutcome;

use delivery::DeliveryMap;

/// Default bound on a single subscriber delivery.
pub const DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_secs(1);
/// Default capacity of each subscriber's delivery channel.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 32;

// ============================================================================
// Errors
// ============================================================================

/// Result type for multiplexer operations.
pub type Result<T> = std::result::Result<T, MuxError>;

/// Errors returned by the multiplexer and its connections.
#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    #[error("Multiplexer has been started already")]
    AlreadyStarted,

    #[error("Topic {topic} was not consumed by '{name}'")]
    NotSubscribed { topic: String, name: String },

    #[error("Failed to create consumer: {0}")]
    ConsumerCreation(#[source] ClientError),

    #[error("Producer error: {0}")]
    Producer(#[from] ClientError),

    #[error(transparent)]
    Serialize(#[from] SerializeError),

    #[error("Multiplexer is closed")]
    Closed,
}

// ============================================================================
// Options
// ============================================================================

/// Tuning and logging options for a multiplexer.
#[derive(Debug, Clone)]
pub struct MuxOptions {
    /// Bound on delivering one message to one subscriber.
    pub delivery_timeout: Duration,
    /// Capacity of each subscriber's delivery channel (at least 1).
    pub subscriber_capacity: usize,
    /// Span all multiplexer logging is recorded in.
    /// Defaults to an `info` span named `multiplexer`.
    pub span: Option<Span>,
}

impl Default for MuxOptions {
    fn default() -> Self {
        Self {
            delivery_timeout: DEFAULT_DELIVERY_TIMEOUT,
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
            span: None,
        }
    }
}

impl MuxOptions {
    pub fn with_delivery_timeout(mut self, timeout: Duration) -> Self {
        self.delivery_timeout = timeout;
        self
    }

    pub fn with_subscriber_capacity(mut self, capacity: usize) -> Self {
        self.subscriber_capacity = capacity.max(1);
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }
}

// ============================================================================
// Multiplexer
// ============================================================================

/// Shares one consumer group and two producers among many connections.
///
/// Must be created inside a tokio runtime: construction spawns the
/// acknowledgement router for the asynchronous producer.
pub struct Multiplexer {
    /// Consumer-group identity; committed offsets are stored under it.
    name: String,
    consumer_factory: Arc<dyn ConsumerFactory>,
    /// Set once `start` created the consumer group.
    consumer: Mutex<Option<Arc<dyn GroupConsumer>>>,
    sync_producer: Arc<dyn SyncProducer>,
    async_producer: Arc<dyn AsyncProducer>,
    deliveries: Arc<DeliveryMap>,
    subscriber_capacity: usize,
    shutdown: CancellationToken,
    closed: AtomicBool,
    span: Span,
}

impl Multiplexer {
    /// Create a multiplexer with default options.
    pub fn new(
        consumer_factory: Arc<dyn ConsumerFactory>,
        sync_producer: Arc<dyn SyncProducer>,
        async_producer: AsyncProducerHandle,
        name: impl Into<String>,
    ) -> Arc<Self> {
        Self::with_options(
            consumer_factory,
            sync_producer,
            async_producer,
            name,
            MuxOptions::default(),
        )
    }

    /// Create a multiplexer.
    pub fn with_options(
        consumer_factory: Arc<dyn ConsumerFactory>,
        sync_producer: Arc<dyn SyncProducer>,
        async_producer: AsyncProducerHandle,
        name: impl Into<String>,
        options: MuxOptions,
    ) -> Arc<Self> {
        let name = name.into();
        let span = options
            .span
            .unwrap_or_else(|| info_span!("multiplexer", name = %name));

        let AsyncProducerHandle {
            producer,
            successes,
            errors,
        } = async_producer;

        tokio::spawn(
            ack_router::run_ack_router(successes, errors, producer.closed())
                .instrument(span.clone()),
        );

        Arc::new(Self {
            name,
            consumer_factory,
            consumer: Mutex::new(None),
            sync_producer,
            async_producer: producer,
            deliveries: Arc::new(DeliveryMap::new(options.delivery_timeout)),
            subscriber_capacity: options.subscriber_capacity.max(1),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
            span,
        })
    }

    /// Consumer-group identity of this multiplexer.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether `start` has been called.
    pub async fn is_started(&self) -> bool {
        self.deliveries.read().await.started
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Distinct topics with at least one subscriber, sorted.
    pub async fn topics(&self) -> Vec<String> {
        self.deliveries.read().await.topics()
    }

    pub async fn subscriber_count(&self, topic: &str) -> usize {
        self.deliveries.read().await.subscriber_count(topic)
    }

    /// Create a connection identified by `name`.
    pub fn new_connection(self: &Arc<Self>, name: impl Into<String>) -> Connection {
        Connection::new(Arc::downgrade(self), name.into())
    }

    /// Create a connection that encodes payloads with `serializer`.
    pub fn new_proto_connection<S>(
        self: &Arc<Self>,
        name: impl Into<String>,
        serializer: S,
    ) -> ProtoConnection<S> {
        ProtoConnection::new(self.new_connection(name), serializer)
    }

    /// Start consuming every subscribed topic.
    ///
    /// Call once all connections have subscribed. Subscribing afterwards
    /// fails with `MuxError::AlreadyStarted`. Without any subscription no
    /// consumer group is created and only the producers are in use.
    ///
    /// If creating the consumer group fails the multiplexer stays started
    /// without consuming; producers remain usable.
    pub async fn start(&self) -> Result<()> {
        self.start_impl().instrument(self.span.clone()).await
    }

    async fn start_impl(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(MuxError::Closed);
        }

        let mut state = self.deliveries.write().await;
        if state.started {
            return Err(MuxError::AlreadyStarted);
        }

        // Block further subscriptions before the consumer exists.
        state.started = true;

        let topics = state.topics();
        if topics.is_empty() {
            debug!("No topics to be consumed");
            return Ok(());
        }

        debug!(topics = ?topics, "Consuming started");

        let session = self
            .consumer_factory
            .create(&topics, &self.name)
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to create consumer");
                MuxError::ConsumerCreation(e)
            })?;

        {
            let mut slot = self.consumer.lock().await;
            if self.shutdown.is_cancelled() {
                drop(slot);
                close_quietly("consumer", session.consumer.close().await);
                return Err(MuxError::Closed);
            }
            *slot = Some(Arc::clone(&session.consumer));
        }

        tokio::spawn(
            consumer_loop::run_consumer_loop(
                session,
                Arc::clone(&self.deliveries),
                self.shutdown.clone(),
            )
            .instrument(self.span.clone()),
        );

        Ok(())
    }

    /// Release the consumer group and both producers.
    ///
    /// Signals both background loops to stop but does not wait for them.
    /// Calling `close` more than once is a no-op. Dropping the last handle
    /// without calling `close` releases the same resources in a spawned task.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.shutdown.cancel();
        let consumer = self.consumer.lock().await.take();

        async {
            release_handles(
                consumer,
                Arc::clone(&self.sync_producer),
                Arc::clone(&self.async_producer),
            )
            .await;
            info!("Multiplexer closed");
        }
        .instrument(self.span.clone())
        .await
    }

    /// Register `(topic, name)` and return its delivery channel.
    ///
    /// A second registration of the same pair replaces the first; the earlier
    /// receiver sees its channel close.
    pub(crate) async fn new_subscription(&self, topic: &str, name: &str) -> Result<Subscription> {
        let (sender, receiver) = mpsc::channel(self.subscriber_capacity);

        let replaced = self.deliveries.write().await.insert(topic, name, sender)?;
        if replaced.is_some() {
            self.span.in_scope(|| {
                warn!(topic = %topic, subscriber = %name, "Replacing existing subscription");
            });
        }

        Ok(receiver)
    }

    /// Remove `(topic, name)`.
    ///
    /// Allowed after `start`: the subscriber stops receiving, while the
    /// consumer group keeps the topic.
    pub(crate) async fn stop_consuming(&self, topic: &str, name: &str) -> Result<()> {
        let mut state = self.deliveries.write().await;
        state.remove(topic, name)?;

        if state.started {
            self.span.in_scope(|| {
                info!(
                    topic = %topic,
                    subscriber = %name,
                    "Subscription removed after start, topic stays in consumer group"
                );
            });
        }
        Ok(())
    }

    pub(crate) fn sync_producer(&self) -> &Arc<dyn SyncProducer> {
        &self.sync_producer
    }

    pub(crate) fn async_producer(&self) -> &Arc<dyn AsyncProducer> {
        &self.async_producer
    }
}

impl Drop for Multiplexer {
    /// Releases the broker handles of a multiplexer dropped without `close`.
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();

        let release = release_handles(
            self.consumer.get_mut().take(),
            Arc::clone(&self.sync_producer),
            Arc::clone(&self.async_producer),
        );
        let _entered = self.span.enter();

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                warn!("Multiplexer dropped without close, releasing broker handles");
                runtime.spawn(release.instrument(self.span.clone()));
            }
            Err(_) => {
                error!("Multiplexer dropped outside a runtime, broker handles not closed");
            }
        }
    }
}

/// Close the consumer group (if any) and both producers.
async fn release_handles(
    consumer: Option<Arc<dyn GroupConsumer>>,
    sync_producer: Arc<dyn SyncProducer>,
    async_producer: Arc<dyn AsyncProducer>,
) {
    if let Some(consumer) = consumer {
        close_quietly("consumer", consumer.close().await);
    }
    close_quietly("sync producer", sync_producer.close().await);
    close_quietly("async producer", async_producer.close().await);
}

/// Close a broker handle, treating "already closed" as success.
fn close_quietly(what: &str, result: std::result::Result<(), ClientError>) {
    match result {
        Ok(()) => debug!(handle = what, "Closed"),
        Err(ClientError::Closed) => debug!(handle = what, "Already closed"),
        Err(e) => warn!(handle = what, error = %e, "Failed to close"),
    }
}
