//! Mock broker client implementations for testing.
//!
//! Everything stays in memory. Tests drive the consumer side by pushing
//! messages into a `MockConsumer` and inspect what the multiplexer marked,
//! produced, and closed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{
    AsyncProducer, AsyncProducerHandle, ClientError, ConsumerFactory, ConsumerMessage,
    ConsumerSession, GroupConsumer, ProducerError, ProducerMessage, Result, SyncProducer,
};

/// Capacity of every mock stream.
const MOCK_CHANNEL_CAPACITY: usize = 1024;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Consumer
// ============================================================================

/// Mock consumer-group client.
pub struct MockConsumer {
    topics: Vec<String>,
    group_id: String,
    messages: mpsc::Sender<ConsumerMessage>,
    errors: mpsc::Sender<ClientError>,
    marked: Mutex<Vec<(String, i32, i64)>>,
    closed: CancellationToken,
}

impl MockConsumer {
    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Feed a message into the consumer stream.
    pub async fn push(&self, message: ConsumerMessage) -> Result<()> {
        self.messages
            .send(message)
            .await
            .map_err(|_| ClientError::Closed)
    }

    /// Feed a consumption error into the error stream.
    pub async fn push_error(&self, error: ClientError) -> Result<()> {
        self.errors.send(error).await.map_err(|_| ClientError::Closed)
    }

    /// `(topic, partition, offset)` of every marked message, in marking order.
    pub fn marked(&self) -> Vec<(String, i32, i64)> {
        lock(&self.marked).clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[async_trait]
impl GroupConsumer for MockConsumer {
    fn mark_offset(&self, message: &ConsumerMessage, _metadata: &str) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(ClientError::Closed);
        }
        lock(&self.marked).push((message.topic.clone(), message.partition, message.offset));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(ClientError::Closed);
        }
        self.closed.cancel();
        Ok(())
    }

    fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }
}

/// Mock consumer factory.
///
/// Records every `create` call and keeps the consumers it built.
#[derive(Default)]
pub struct MockConsumerFactory {
    consumers: Mutex<Vec<Arc<MockConsumer>>>,
    fail_on_create: AtomicBool,
}

impl MockConsumerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_on_create(&self, fail: bool) {
        self.fail_on_create.store(fail, Ordering::SeqCst);
    }

    /// Number of consumers created so far.
    pub fn created_count(&self) -> usize {
        lock(&self.consumers).len()
    }

    /// Most recently created consumer.
    pub fn last_consumer(&self) -> Option<Arc<MockConsumer>> {
        lock(&self.consumers).last().cloned()
    }
}

#[async_trait]
impl ConsumerFactory for MockConsumerFactory {
    async fn create(&self, topics: &[String], group_id: &str) -> Result<ConsumerSession> {
        if self.fail_on_create.load(Ordering::SeqCst) {
            return Err(ClientError::Connection(
                "Mock consumer creation failure".to_string(),
            ));
        }

        let (messages_tx, messages_rx) = mpsc::channel(MOCK_CHANNEL_CAPACITY);
        let (errors_tx, errors_rx) = mpsc::channel(MOCK_CHANNEL_CAPACITY);

        let consumer = Arc::new(MockConsumer {
            topics: topics.to_vec(),
            group_id: group_id.to_string(),
            messages: messages_tx,
            errors: errors_tx,
            marked: Mutex::new(Vec::new()),
            closed: CancellationToken::new(),
        });
        lock(&self.consumers).push(Arc::clone(&consumer));

        Ok(ConsumerSession {
            consumer,
            messages: messages_rx,
            errors: errors_rx,
        })
    }
}

// ============================================================================
// Producers
// ============================================================================

/// Per-topic offset counter shared by both mock producers.
#[derive(Default)]
struct OffsetLog {
    next: HashMap<String, i64>,
}

impl OffsetLog {
    fn assign(&mut self, topic: &str) -> i64 {
        let next = self.next.entry(topic.to_string()).or_insert(0);
        let offset = *next;
        *next += 1;
        offset
    }
}

/// Mock synchronous producer.
#[derive(Default)]
pub struct MockSyncProducer {
    sent: Mutex<Vec<ProducerMessage>>,
    offsets: Mutex<OffsetLog>,
    fail_on_send: AtomicBool,
    closed: AtomicBool,
}

impl MockSyncProducer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_on_send(&self, fail: bool) {
        self.fail_on_send.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<ProducerMessage> {
        lock(&self.sent).clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SyncProducer for MockSyncProducer {
    async fn send(&self, topic: &str, key: Option<Bytes>, value: Bytes) -> Result<(i32, i64)> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }
        if self.fail_on_send.load(Ordering::SeqCst) {
            return Err(ClientError::Produce("Mock send failure".to_string()));
        }

        let offset = lock(&self.offsets).assign(topic);
        let mut message = ProducerMessage::new(topic, key, value);
        message.partition = 0;
        message.offset = offset;
        lock(&self.sent).push(message);

        Ok((0, offset))
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }
        Ok(())
    }
}

/// Mock asynchronous producer.
///
/// Every accepted message yields exactly one outcome: an error while
/// `fail_on_send` is set, otherwise a success with partition 0 and the next
/// offset of its topic.
pub struct MockAsyncProducer {
    successes: mpsc::Sender<ProducerMessage>,
    errors: mpsc::Sender<ProducerError>,
    offsets: Mutex<OffsetLog>,
    sent_count: Mutex<usize>,
    fail_on_send: AtomicBool,
    closed: CancellationToken,
}

impl MockAsyncProducer {
    /// Create the producer and the handle the multiplexer takes ownership of.
    pub fn new() -> (Arc<Self>, AsyncProducerHandle) {
        let (successes_tx, successes_rx) = mpsc::channel(MOCK_CHANNEL_CAPACITY);
        let (errors_tx, errors_rx) = mpsc::channel(MOCK_CHANNEL_CAPACITY);

        let producer = Arc::new(Self {
            successes: successes_tx,
            errors: errors_tx,
            offsets: Mutex::new(OffsetLog::default()),
            sent_count: Mutex::new(0),
            fail_on_send: AtomicBool::new(false),
            closed: CancellationToken::new(),
        });

        let handle = AsyncProducerHandle {
            producer: Arc::clone(&producer) as Arc<dyn AsyncProducer>,
            successes: successes_rx,
            errors: errors_rx,
        };

        (producer, handle)
    }

    pub fn set_fail_on_send(&self, fail: bool) {
        self.fail_on_send.store(fail, Ordering::SeqCst);
    }

    pub fn sent_count(&self) -> usize {
        *lock(&self.sent_count)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[async_trait]
impl AsyncProducer for MockAsyncProducer {
    fn send(&self, mut message: ProducerMessage) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(ClientError::Closed);
        }
        *lock(&self.sent_count) += 1;

        let queued = if self.fail_on_send.load(Ordering::SeqCst) {
            self.errors
                .try_send(ProducerError {
                    message,
                    error: ClientError::Produce("Mock send failure".to_string()),
                })
                .is_ok()
        } else {
            message.partition = 0;
            message.offset = lock(&self.offsets).assign(&message.topic);
            self.successes.try_send(message).is_ok()
        };

        if queued {
            Ok(())
        } else {
            Err(ClientError::Produce("Mock outcome queue full".to_string()))
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(ClientError::Closed);
        }
        self.closed.cancel();
        Ok(())
    }

    fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }
}
