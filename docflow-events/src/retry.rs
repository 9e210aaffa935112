//! Exponential backoff for handler retries and broker reconnects.
//!
//! # Example
//!
//! ```rust,no_run
//! use docflow_events::retry::{retry_transient, RetryConfig};
//! use docflow_events::HandlerError;
//!
//! async fn example() -> Result<(), HandlerError> {
//!     retry_transient(&RetryConfig::default(), "index.document.create", || async {
//!         // call the search cluster
//!         Ok(())
//!     })
//!     .await
//! }
//! ```

use crate::error::HandlerError;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Retry schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,

    /// Delay before the second attempt
    pub initial_delay: Duration,

    /// Upper bound for any single delay
    pub max_delay: Duration,

    /// Growth factor between consecutive delays
    pub exponential_base: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            exponential_base: 2.0,
        }
    }
}

impl RetryConfig {
    /// Schedule used to re-establish a dropped broker connection.
    ///
    /// `max_attempts` is ignored by reconnect loops, which retry until stopped.
    pub fn reconnect() -> Self {
        Self {
            max_attempts: u32::MAX,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            exponential_base: 2.0,
        }
    }

    /// A single attempt, no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            exponential_base: 1.0,
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.exponential_base.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }

    /// Iterator over successive delays, unbounded.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (1..).map(move |attempt| self.delay_after(attempt))
    }
}

/// Run a handler operation, retrying transient failures with backoff.
///
/// Permanent and invalid-payload failures are returned immediately. After
/// `max_attempts` the last transient failure is returned.
pub async fn retry_transient<F, Fut>(
    config: &RetryConfig,
    event_type: &str,
    mut operation: F,
) -> Result<(), HandlerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), HandlerError>>,
{
    let mut attempt = 0;

    loop {
        attempt += 1;

        match operation().await {
            Ok(()) => {
                if attempt > 1 {
                    tracing::info!(event_type, attempts = attempt, "Handler succeeded after retry");
                }
                return Ok(());
            }
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) if attempt >= config.max_attempts => {
                tracing::error!(
                    event_type,
                    attempts = attempt,
                    error = %e,
                    "Handler retries exhausted"
                );
                return Err(e);
            }
            Err(e) => {
                let delay = config.delay_after(attempt);
                tracing::warn!(
                    event_type,
                    attempt,
                    max_attempts = config.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Handler failed, retrying"
                );
                sleep(delay).await;
            }
        }
    }
}
