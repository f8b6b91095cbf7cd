//! Bootstrap utilities for courier binaries.

use std::future::Future;

use backon::BackoffBuilder;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use super::retry::connection_backoff;
use crate::config::LOG_ENV_VAR;

/// Initialize tracing with the COURIER_LOG environment variable.
///
/// Defaults to "info" level if COURIER_LOG is not set.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Run `connect` until it succeeds, backing off between attempts.
///
/// # Arguments
/// * `service` - Human-readable name for logging (e.g., "amqp")
/// * `connect` - Async function that attempts to establish a connection
///
/// # Returns
/// The connected value on success, or the last error once the backoff is
/// exhausted.
pub async fn connect_with_retry<T, E, F, Fut>(service: &str, connect: F) -> Result<T, E>
where
    E: std::fmt::Display,
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut backoff = connection_backoff().build();
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match connect().await {
            Ok(connected) => {
                info!(service, attempt, "Connected");
                return Ok(connected);
            }
            Err(e) => match backoff.next() {
                Some(delay) => {
                    warn!(
                        "Failed to connect to {} (attempt {}): {}. Retrying in {:?}...",
                        service, attempt, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    error!("Failed to connect to {} after {} attempts: {}", service, attempt, e);
                    return Err(e);
                }
            },
        }
    }
}
