//! Bootstrap utilities for tally binaries.
//!
//! Shared initialization code for the replicator and the aggregator.

use std::future::Future;

use backon::{ExponentialBuilder, Retryable};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LOG_ENV_VAR;

/// Initialize tracing with the TALLY_LOG environment variable.
///
/// Defaults to "info" level if TALLY_LOG is not set.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Connect to a backing service, retrying with `backoff`.
///
/// # Arguments
/// * `service_name` - Human-readable name for logging (e.g., "message bus")
/// * `backoff` - Retry schedule, usually [`super::retry::connection_backoff`]
/// * `connect` - Async function that attempts to establish a connection
///
/// # Returns
/// The connection on success, or the last error once retries run out.
pub async fn connect_with_retry<T, E, F, Fut>(
    service_name: &str,
    backoff: ExponentialBuilder,
    connect: F,
) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let result = connect
        .retry(backoff)
        .notify(|e: &E, delay| {
            warn!(service = %service_name, error = %e, ?delay, "Connection failed, retrying");
        })
        .await;

    match &result {
        Ok(_) => info!(service = %service_name, "Connected"),
        Err(e) => error!(service = %service_name, error = %e, "Giving up on connection"),
    }
    result
}
