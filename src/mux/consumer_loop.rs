//! Generic consumer loop.
//!
//! Drains the shared consumer-group client, fans each message out through the
//! delivery map, then marks its offset. Marking always follows the dispatch
//! attempt, so a crash in between redelivers rather than loses the message.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::delivery::DeliveryMap;
use crate::client::ConsumerSession;

/// Run until the multiplexer or the consumer is closed, or the message
/// stream ends.
pub(crate) async fn run_consumer_loop(
    session: ConsumerSession,
    deliveries: Arc<DeliveryMap>,
    shutdown: CancellationToken,
) {
    let ConsumerSession {
        consumer,
        mut messages,
        mut errors,
    } = session;
    let consumer_closed = consumer.closed();
    let mut errors_open = true;

    debug!("Generic consumer started");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("Multiplexer closed, stopping generic consumer");
                break;
            }
            _ = consumer_closed.cancelled() => {
                debug!("Consumer closed, stopping generic consumer");
                break;
            }
            received = messages.recv() => {
                let Some(message) = received else {
                    info!("Consumer message stream ended");
                    break;
                };

                let message = Arc::new(message);
                debug!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    "Kafka message received"
                );

                let outcome = deliveries.dispatch(Arc::clone(&message)).await;
                if outcome.dropped > 0 {
                    debug!(
                        topic = %message.topic,
                        offset = message.offset,
                        delivered = outcome.delivered,
                        dropped = outcome.dropped,
                        "Message partially delivered"
                    );
                }

                // Resume after this message on restart.
                if let Err(e) = consumer.mark_offset(&message, "") {
                    error!(
                        topic = %message.topic,
                        partition = message.partition,
                        offset = message.offset,
                        error = %e,
                        "Failed to mark offset"
                    );
                }
            }
            received = errors.recv(), if errors_open => {
                match received {
                    Some(e) => error!(error = %e, "Received partition consumer error"),
                    None => errors_open = false,
                }
            }
        }
    }
}
