//! Bootstrap utilities for switchboard services.
//!
//! Shared initialization code for service binaries.

use std::future::Future;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LOG_ENV_VAR;

/// Attempts made by [`connect_with_retry`] before giving up.
pub const CONNECT_ATTEMPTS: usize = 30;

/// Initialize tracing with the SWITCHBOARD_LOG environment variable.
///
/// Defaults to "info" level if SWITCHBOARD_LOG is not set. Safe to call more
/// than once; later calls keep the first subscriber.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

/// Backoff used while the broker is unreachable at startup.
///
/// - Min delay: 100ms
/// - Max delay: 5s
/// - Jitter enabled
pub fn connect_backoff(max_attempts: usize) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(max_attempts.saturating_sub(1))
        .with_jitter()
}

/// Run `connect` until it succeeds or `max_attempts` are spent.
///
/// # Arguments
/// * `endpoint` - Human-readable name for logging (e.g., "broker")
/// * `max_attempts` - Total attempts including the first
/// * `connect` - Async function that attempts to establish a connection
///
/// # Returns
/// The connection on success, or the last error after max retries.
pub async fn connect_with_retry<T, E, F, Fut>(
    endpoint: &str,
    max_attempts: usize,
    connect: F,
) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let connection = connect
        .retry(connect_backoff(max_attempts))
        .notify(|e: &E, dur: Duration| {
            warn!(endpoint = endpoint, error = %e, delay = ?dur, "Connection failed, retrying");
        })
        .await?;
    info!(endpoint = endpoint, "Connected");
    Ok(connection)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_connect_with_retry_succeeds_after_failures() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;

        let result: Result<&str, String> = connect_with_retry("broker", 5, move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err("refused".to_string())
            } else {
                Ok("connected")
            }
        })
        .await;

        assert_eq!(result.unwrap(), "connected");
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_connect_with_retry_returns_last_error() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;

        let result: Result<(), String> = connect_with_retry("broker", 2, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("refused".to_string())
        })
        .await;

        assert_eq!(result.unwrap_err(), "refused");
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_init_tracing_is_idempotent() {
        init_tracing();
        init_tracing();
    }
}
