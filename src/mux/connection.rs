//! Connection handles.
//!
//! A connection is a named view onto a shared `Multiplexer`. It owns no broker
//! resources; its name is the subscriber identity under every topic it
//! consumes. The back-reference is weak, so a connection outliving its
//! multiplexer fails with `MuxError::Closed`.

use std::marker::PhantomData;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;

use super::{Multiplexer, MuxError, Result};
use crate::client::{AckMeta, ConsumerMessage, Metadata, Opaque, ProducerError, ProducerMessage};
use crate::serializer::{SerializeError, Serializer};

/// Receiving half of a subscriber's delivery channel.
pub type Subscription = mpsc::Receiver<Arc<ConsumerMessage>>;

/// Named handle onto a multiplexer dealing in raw byte payloads.
#[derive(Clone)]
pub struct Connection {
    multiplexer: Weak<Multiplexer>,
    name: String,
}

impl Connection {
    pub(crate) fn new(multiplexer: Weak<Multiplexer>, name: String) -> Self {
        Self { multiplexer, name }
    }

    /// Subscriber identity of this connection.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn multiplexer(&self) -> Result<Arc<Multiplexer>> {
        self.multiplexer.upgrade().ok_or(MuxError::Closed)
    }

    fn open_multiplexer(&self) -> Result<Arc<Multiplexer>> {
        let multiplexer = self.multiplexer()?;
        if multiplexer.is_closed() {
            return Err(MuxError::Closed);
        }
        Ok(multiplexer)
    }

    /// Subscribe to `topic`.
    ///
    /// Fails with `MuxError::AlreadyStarted` once the multiplexer is started
    /// and with `MuxError::Closed` once it is closed.
    pub async fn consume_topic(&self, topic: &str) -> Result<Subscription> {
        self.open_multiplexer()?
            .new_subscription(topic, &self.name)
            .await
    }

    /// Stop receiving messages from `topic`.
    pub async fn stop_consuming(&self, topic: &str) -> Result<()> {
        self.multiplexer()?.stop_consuming(topic, &self.name).await
    }

    /// Send through the shared synchronous producer.
    ///
    /// Completes once the broker acknowledged; returns `(partition, offset)`.
    pub async fn send_sync_message(
        &self,
        topic: &str,
        key: Option<Bytes>,
        value: Bytes,
    ) -> Result<(i32, i64)> {
        let multiplexer = self.open_multiplexer()?;
        let (partition, offset) = multiplexer.sync_producer().send(topic, key, value).await?;

        debug!(
            connection = %self.name,
            topic = %topic,
            partition,
            offset,
            "Message sent synchronously"
        );
        Ok((partition, offset))
    }

    /// Enqueue on the shared asynchronous producer.
    ///
    /// The outcome arrives later on `success` or `error`, carrying `metadata`.
    /// Either channel may be omitted to ignore that outcome. Delivery to the
    /// channels never blocks; a full channel misses the notification.
    pub fn send_async_message(
        &self,
        topic: &str,
        key: Option<Bytes>,
        value: Bytes,
        metadata: Option<Opaque>,
        success: Option<mpsc::Sender<ProducerMessage>>,
        error: Option<mpsc::Sender<ProducerError>>,
    ) -> Result<()> {
        let multiplexer = self.open_multiplexer()?;
        let ack = AckMeta {
            success,
            error,
            user: metadata,
        };
        let message = ProducerMessage::new(topic, key, value).with_metadata(Metadata::Ack(ack));

        multiplexer.async_producer().send(message)?;
        Ok(())
    }
}

/// Named handle onto a multiplexer that encodes payloads with `S`.
pub struct ProtoConnection<S> {
    connection: Connection,
    serializer: Arc<S>,
}

impl<S> Clone for ProtoConnection<S> {
    fn clone(&self) -> Self {
        Self {
            connection: self.connection.clone(),
            serializer: Arc::clone(&self.serializer),
        }
    }
}

impl<S> ProtoConnection<S> {
    pub(crate) fn new(connection: Connection, serializer: S) -> Self {
        Self {
            connection,
            serializer: Arc::new(serializer),
        }
    }

    /// Subscriber identity of this connection.
    pub fn name(&self) -> &str {
        self.connection.name()
    }

    /// Subscribe to `topic`, decoding each payload as `M`.
    pub async fn consume_topic<M>(&self, topic: &str) -> Result<ProtoReceiver<M, S>>
    where
        S: Serializer<M>,
    {
        let inner = self.connection.consume_topic(topic).await?;
        Ok(ProtoReceiver {
            inner,
            serializer: Arc::clone(&self.serializer),
            _marker: PhantomData,
        })
    }

    /// Stop receiving messages from `topic`.
    pub async fn stop_consuming(&self, topic: &str) -> Result<()> {
        self.connection.stop_consuming(topic).await
    }

    /// Encode `value` and send it through the shared synchronous producer.
    pub async fn send_sync_message<M>(
        &self,
        topic: &str,
        key: Option<Bytes>,
        value: &M,
    ) -> Result<(i32, i64)>
    where
        S: Serializer<M>,
    {
        let payload = self.serializer.encode(value)?;
        self.connection.send_sync_message(topic, key, payload).await
    }

    /// Encode `value` and enqueue it on the shared asynchronous producer.
    pub fn send_async_message<M>(
        &self,
        topic: &str,
        key: Option<Bytes>,
        value: &M,
        metadata: Option<Opaque>,
        success: Option<mpsc::Sender<ProducerMessage>>,
        error: Option<mpsc::Sender<ProducerError>>,
    ) -> Result<()>
    where
        S: Serializer<M>,
    {
        let payload = self.serializer.encode(value)?;
        self.connection
            .send_async_message(topic, key, payload, metadata, success, error)
    }
}

/// Consumed message with its decoded payload.
#[derive(Debug, Clone)]
pub struct ProtoMessage<M> {
    pub message: Arc<ConsumerMessage>,
    pub value: M,
}

/// Delivery channel of a `ProtoConnection` subscription.
pub struct ProtoReceiver<M, S> {
    inner: Subscription,
    serializer: Arc<S>,
    _marker: PhantomData<fn() -> M>,
}

impl<M, S> ProtoReceiver<M, S>
where
    S: Serializer<M>,
{
    /// Wait for the next message.
    ///
    /// Returns `None` once the subscription is gone. A payload that fails to
    /// decode yields `Some(Err(_))` and the subscription continues.
    pub async fn recv(&mut self) -> Option<std::result::Result<ProtoMessage<M>, SerializeError>> {
        let message = self.inner.recv().await?;
        Some(self.decode(message))
    }

    /// Take a message if one is already waiting.
    pub fn try_recv(&mut self) -> Option<std::result::Result<ProtoMessage<M>, SerializeError>> {
        let message = self.inner.try_recv().ok()?;
        Some(self.decode(message))
    }

    fn decode(
        &self,
        message: Arc<ConsumerMessage>,
    ) -> std::result::Result<ProtoMessage<M>, SerializeError> {
        let value = self.serializer.decode(&message.value)?;
        Ok(ProtoMessage { message, value })
    }

    /// Unwrap into the raw delivery channel.
    pub fn into_inner(self) -> Subscription {
        self.inner
    }
}
