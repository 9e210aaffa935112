//! Envelope dispatcher
//!
//! Glue between a consumer loop and the handler registry. For every decoded
//! envelope the dispatcher installs the envelope's correlation id as the
//! current scope, runs the handler and maps the [`HandlerOutcome`] to an
//! [`Acknowledgement`] using the stream's [`DeliveryPolicy`].
//!
//! [`HandlerOutcome`]: crate::error::HandlerOutcome

use crate::envelope::{with_correlation, Envelope};
use crate::error::{ConfigResult, ConfigurationError};
use crate::port::{Acknowledgement, EnvelopeCallback};
use crate::registry::{DispatchOutcome, HandlerRegistry};
use crate::retry::{retry_transient, RetryConfig};
use crate::stats::StatsRecorder;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::error;

/// Settlement after retries have been used up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exhausted {
    /// Drop the message.
    Ack,
    /// Move the message to the dead-letter path.
    DeadLetter,
}

/// What a stream does with a message whose handler failed.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryPolicy {
    /// Log the failure and acknowledge anyway.
    AckAlways,
    /// Retry transient failures in-process, then settle as `then`.
    ///
    /// Permanent and invalid-payload failures skip the retries.
    Retry {
        /// Backoff schedule.
        retry: RetryConfig,
        /// Settlement once retries are exhausted.
        then: Exhausted,
    },
    /// Dead-letter on the first failure.
    DeadLetter,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        DeliveryPolicy::AckAlways
    }
}

impl DeliveryPolicy {
    /// Retry with the default schedule, then dead-letter.
    pub fn retry_then_dead_letter() -> Self {
        DeliveryPolicy::Retry {
            retry: RetryConfig::default(),
            then: Exhausted::DeadLetter,
        }
    }

    /// Parse a policy name from configuration: `ack`, `retry`,
    /// `retry-then-ack` or `dead-letter`.
    pub fn parse(key: &str, value: &str) -> ConfigResult<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ack" | "ack-always" => Ok(DeliveryPolicy::AckAlways),
            "retry" | "retry-then-dead-letter" => Ok(DeliveryPolicy::retry_then_dead_letter()),
            "retry-then-ack" => Ok(DeliveryPolicy::Retry {
                retry: RetryConfig::default(),
                then: Exhausted::Ack,
            }),
            "dead-letter" | "dead_letter" | "dlq" => Ok(DeliveryPolicy::DeadLetter),
            other => Err(ConfigurationError::InvalidValue {
                key: key.to_string(),
                message: format!("unknown delivery policy '{}'", other),
            }),
        }
    }

    /// Acknowledgement for a handler that has finally failed.
    pub fn on_failure(&self) -> Acknowledgement {
        match self {
            DeliveryPolicy::AckAlways => Acknowledgement::Ack,
            DeliveryPolicy::DeadLetter => Acknowledgement::DeadLetter,
            DeliveryPolicy::Retry { then: Exhausted::Ack, .. } => Acknowledgement::Ack,
            DeliveryPolicy::Retry { then: Exhausted::DeadLetter, .. } => {
                Acknowledgement::DeadLetter
            }
        }
    }
}

impl fmt::Display for DeliveryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryPolicy::AckAlways => f.write_str("ack"),
            DeliveryPolicy::Retry { then: Exhausted::Ack, .. } => f.write_str("retry-then-ack"),
            DeliveryPolicy::Retry { then: Exhausted::DeadLetter, .. } => {
                f.write_str("retry-then-dead-letter")
            }
            DeliveryPolicy::DeadLetter => f.write_str("dead-letter"),
        }
    }
}

/// Per-stream callback that routes envelopes through the registry.
pub struct Dispatcher {
    stream: String,
    registry: Arc<HandlerRegistry>,
    policy: DeliveryPolicy,
    stats: StatsRecorder,
}

impl Dispatcher {
    /// Create a dispatcher for `stream`.
    pub fn new(stream: impl Into<String>, registry: Arc<HandlerRegistry>) -> Self {
        Self {
            stream: stream.into(),
            registry,
            policy: DeliveryPolicy::default(),
            stats: StatsRecorder::new(),
        }
    }

    /// Set the delivery policy.
    pub fn with_policy(mut self, policy: DeliveryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Record counters into a shared recorder.
    pub fn with_stats(mut self, stats: StatsRecorder) -> Self {
        self.stats = stats;
        self
    }

    /// Delivery policy in effect.
    pub fn policy(&self) -> &DeliveryPolicy {
        &self.policy
    }

    async fn run_handler(&self, envelope: &Envelope) -> DispatchOutcome {
        match &self.policy {
            DeliveryPolicy::Retry { retry, .. } => {
                let Some(handler) = self.registry.get(envelope.event_type()) else {
                    return self.registry.dispatch(envelope).await;
                };

                let result = retry_transient(retry, envelope.event_type(), || {
                    handler.handle(envelope)
                })
                .await;

                match result {
                    Ok(()) => DispatchOutcome::Handled,
                    Err(e) => DispatchOutcome::Failed(e),
                }
            }
            _ => self.registry.dispatch(envelope).await,
        }
    }
}

#[async_trait]
impl EnvelopeCallback for Dispatcher {
    async fn on_envelope(&self, envelope: Envelope) -> Acknowledgement {
        let correlation_id = envelope.correlation_id().to_string();
        let outcome = with_correlation(correlation_id, self.run_handler(&envelope)).await;

        match outcome {
            DispatchOutcome::Handled => {
                self.stats.handled();
                Acknowledgement::Ack
            }
            DispatchOutcome::NotFound => {
                self.stats.unroutable();
                Acknowledgement::Ack
            }
            DispatchOutcome::Failed(e) => {
                self.stats.handler_failed();
                let ack = self.policy.on_failure();
                error!(
                    stream = %self.stream,
                    event_type = %envelope.event_type(),
                    correlation_id = %envelope.correlation_id(),
                    policy = %self.policy,
                    ack = %ack,
                    error = %e,
                    "Handler failed"
                );
                ack
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::current_correlation_id;
    use crate::error::HandlerError;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    fn quick_retry(then: Exhausted) -> DeliveryPolicy {
        DeliveryPolicy::Retry {
            retry: RetryConfig {
                max_attempts: 3,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
                exponential_base: 2.0,
            },
            then,
        }
    }

    fn failing(error: HandlerError, calls: Arc<AtomicU32>) -> Arc<HandlerRegistry> {
        let registry = HandlerRegistry::builder()
            .register_fn("index.document.create", move |_envelope| {
                let calls = calls.clone();
                let error = error.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(error)
                }
            })
            .unwrap()
            .build();
        Arc::new(registry)
    }

    #[tokio::test]
    async fn test_ack_always_acks_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let stats = StatsRecorder::new();
        let dispatcher = Dispatcher::new(
            "search-index.document",
            failing(HandlerError::Transient("down".into()), calls.clone()),
        )
        .with_stats(stats.clone());

        let ack = dispatcher
            .on_envelope(Envelope::new("index.document.create", json!({})))
            .await;

        assert_eq!(ack, Acknowledgement::Ack);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(stats.snapshot().handler_failures, 1);
    }

    #[tokio::test]
    async fn test_retry_then_dead_letter() {
        let calls = Arc::new(AtomicU32::new(0));
        let dispatcher = Dispatcher::new(
            "search-index.document",
            failing(HandlerError::Transient("down".into()), calls.clone()),
        )
        .with_policy(quick_retry(Exhausted::DeadLetter));

        let ack = dispatcher
            .on_envelope(Envelope::new("index.document.create", json!({})))
            .await;

        assert_eq!(ack, Acknowledgement::DeadLetter);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_skips_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let dispatcher = Dispatcher::new(
            "search-index.document",
            failing(HandlerError::Permanent("bad mapping".into()), calls.clone()),
        )
        .with_policy(quick_retry(Exhausted::Ack));

        let ack = dispatcher
            .on_envelope(Envelope::new("index.document.create", json!({})))
            .await;

        assert_eq!(ack, Acknowledgement::Ack);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_type_is_acked_and_counted() {
        let stats = StatsRecorder::new();
        let dispatcher = Dispatcher::new("user-events", Arc::new(HandlerRegistry::default()))
            .with_policy(DeliveryPolicy::DeadLetter)
            .with_stats(stats.clone());

        let ack = dispatcher
            .on_envelope(Envelope::new("unknown.type", json!({})))
            .await;

        assert_eq!(ack, Acknowledgement::Ack);
        assert_eq!(stats.snapshot().events_unroutable, 1);
    }

    #[tokio::test]
    async fn test_handler_sees_envelope_correlation_scope() {
        let seen: Arc<Mutex<Option<String>>> = Arc::default();
        let sink = seen.clone();
        let registry = HandlerRegistry::builder()
            .register_fn("ocr.requested", move |_envelope| {
                let sink = sink.clone();
                async move {
                    let child = Envelope::new("ocr.completed", json!({}));
                    *sink.lock().unwrap() = Some(child.correlation_id().to_string());
                    assert!(current_correlation_id().is_some());
                    Ok(())
                }
            })
            .unwrap()
            .build();
        let dispatcher = Dispatcher::new("ocr-requests", Arc::new(registry));

        let incoming =
            Envelope::new("ocr.requested", json!({})).with_correlation_id("corr-42");
        assert_eq!(dispatcher.on_envelope(incoming).await, Acknowledgement::Ack);
        assert_eq!(seen.lock().unwrap().as_deref(), Some("corr-42"));
    }

    #[test]
    fn test_parse_policy() {
        assert_eq!(
            DeliveryPolicy::parse("K", "ack").unwrap(),
            DeliveryPolicy::AckAlways
        );
        assert_eq!(
            DeliveryPolicy::parse("K", "Dead-Letter").unwrap(),
            DeliveryPolicy::DeadLetter
        );
        assert_eq!(
            DeliveryPolicy::parse("K", "retry").unwrap(),
            DeliveryPolicy::retry_then_dead_letter()
        );
        assert_eq!(
            DeliveryPolicy::parse("K", "retry-then-ack").unwrap().on_failure(),
            Acknowledgement::Ack
        );
        assert!(matches!(
            DeliveryPolicy::parse("K", "sometimes"),
            Err(ConfigurationError::InvalidValue { .. })
        ));
    }
}
