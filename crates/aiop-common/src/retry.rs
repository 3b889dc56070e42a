//! Retry utilities with exponential backoff and jitter.
//!
//! Every cluster and HTTP call made from a reconcile pass goes through
//! [`retry_with_backoff`]. Only failures classified as transient are retried
//! in place; everything else returns immediately so the reconciler can turn
//! it into a NotYetReady or Fatal outcome.
//!
//! # Example
//!
//! ```ignore
//! use aiop_common::retry::{retry_with_backoff, RetryConfig};
//!
//! let run = retry_with_backoff(&RetryConfig::default(), "get_run", || async {
//!     pipelines.get_run_status(&run_id).await
//! })
//! .await?;
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

use crate::outcome::FailureKind;
use crate::Error;

/// Errors that know whether an in-place retry can help
pub trait RetryClassify: std::fmt::Display {
    /// True when the same call may succeed if repeated shortly
    fn should_retry(&self) -> bool;
}

// Conflicts are resolved by re-reading, not by resending the same write
impl RetryClassify for Error {
    fn should_retry(&self) -> bool {
        self.kind() == FailureKind::Transient && !self.is_conflict()
    }
}

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    // Bounded: longer outages are handled by requeueing the whole pass
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }
}

/// Execute an async operation with exponential backoff and jitter.
///
/// Retries while the error reports [`RetryClassify::should_retry`], up to
/// `max_attempts`. Jitter scales each delay by 0.5x to 1.5x.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: RetryClassify,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !e.should_retry() => return Err(e),
            Err(e) => {
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let jittered_delay = Duration::from_secs_f64(delay.as_secs_f64() * jitter);

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = jittered_delay.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(jittered_delay).await;

                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
        }
    }
}
