//! Bootstrap utilities for processes embedding the multiplexer.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LOG_ENV_VAR;

/// Initialize tracing with the KAFKA_MUX_LOG environment variable.
///
/// Defaults to "info" level if KAFKA_MUX_LOG is not set. Calling it again
/// after a subscriber is installed has no effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
