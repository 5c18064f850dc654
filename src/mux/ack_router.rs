//! Acknowledgement router.
//!
//! The shared asynchronous producer reports every outcome on one success
//! stream and one error stream. This task hands each outcome back to the
//! connection that issued the send, using the `AckMeta` attached to the
//! message, and restores the caller's own metadata first.

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::client::{Metadata, ProducerError, ProducerMessage};

/// What happened to a single outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Routed {
    /// Handed to the issuing caller's channel.
    Delivered,
    /// The caller's channel was full or closed.
    Dropped,
    /// Issued through a connection without a channel for this outcome.
    NoChannel,
    /// Not issued through a connection; logged only.
    Unrouted,
}

/// Run until the producer's close signal fires or both streams end.
///
/// Outcomes already queued when the producer closes are still routed.
pub(crate) async fn run_ack_router(
    mut successes: mpsc::Receiver<ProducerMessage>,
    mut errors: mpsc::Receiver<ProducerError>,
    producer_closed: CancellationToken,
) {
    let mut successes_open = true;
    let mut errors_open = true;

    while successes_open || errors_open {
        tokio::select! {
            _ = producer_closed.cancelled() => {
                debug!("Closing watch loop for async producer");
                while let Ok(failure) = errors.try_recv() {
                    route_error(failure);
                }
                while let Ok(success) = successes.try_recv() {
                    route_success(success);
                }
                return;
            }
            received = errors.recv(), if errors_open => match received {
                Some(failure) => {
                    route_error(failure);
                }
                None => errors_open = false,
            },
            received = successes.recv(), if successes_open => match received {
                Some(success) => {
                    route_success(success);
                }
                None => successes_open = false,
            },
        }
    }

    debug!("Async producer streams ended, stopping watch loop");
}

/// Route a failed send back to its caller's error channel.
pub(crate) fn route_error(failure: ProducerError) -> Routed {
    let ProducerError { mut message, error } = failure;
    error!(topic = %message.topic, error = %error, "Failed to produce message");

    let meta = match std::mem::take(&mut message.metadata) {
        Metadata::Ack(meta) => meta,
        _ => return Routed::Unrouted,
    };
    let Some(sender) = meta.error.as_ref() else {
        return Routed::NoChannel;
    };

    message.metadata = meta.restored();
    match sender.try_send(ProducerError { message, error }) {
        Ok(()) => Routed::Delivered,
        Err(TrySendError::Full(dropped)) => {
            warn!(topic = %dropped.message.topic, "Unable to send error notification");
            Routed::Dropped
        }
        Err(TrySendError::Closed(dropped)) => {
            warn!(
                topic = %dropped.message.topic,
                "Unable to send error notification, receiver dropped"
            );
            Routed::Dropped
        }
    }
}

/// Route a successful send back to its caller's success channel.
pub(crate) fn route_success(mut message: ProducerMessage) -> Routed {
    debug!(
        topic = %message.topic,
        partition = message.partition,
        offset = message.offset,
        "Message produced"
    );

    let meta = match std::mem::take(&mut message.metadata) {
        Metadata::Ack(meta) => meta,
        _ => return Routed::Unrouted,
    };
    let Some(sender) = meta.success.as_ref() else {
        return Routed::NoChannel;
    };

    message.metadata = meta.restored();
    match sender.try_send(message) {
        Ok(()) => Routed::Delivered,
        Err(TrySendError::Full(dropped)) => {
            warn!(topic = %dropped.topic, "Unable to send success notification");
            Routed::Dropped
        }
        Err(TrySendError::Closed(dropped)) => {
            warn!(
                topic = %dropped.topic,
                "Unable to send success notification, receiver dropped"
            );
            Routed::Dropped
        }
    }
}
