//! Publishing front door
//!
//! [`Publisher`] is what producers hold. It builds the envelope, bounds the
//! broker call by the publish timeout and refuses new work once the
//! messaging subsystem has begun shutting down.

use crate::envelope::Envelope;
use crate::error::{PublishError, PublishResult};
use crate::port::BrokerPort;
use crate::stats::StatsRecorder;
use crate::types::DomainEvent;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Cloneable handle for publishing envelopes through the active broker.
#[derive(Clone)]
pub struct Publisher {
    broker: Arc<dyn BrokerPort>,
    timeout: Duration,
    accepting: Arc<AtomicBool>,
    stats: StatsRecorder,
}

impl fmt::Debug for Publisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publisher")
            .field("broker", &self.broker.kind())
            .field("timeout", &self.timeout)
            .field("accepting", &self.is_accepting())
            .finish()
    }
}

impl Publisher {
    /// Create a publisher over `broker`, bounding each publish by `timeout`.
    pub fn new(broker: Arc<dyn BrokerPort>, timeout: Duration) -> Self {
        Self {
            broker,
            timeout,
            accepting: Arc::new(AtomicBool::new(true)),
            stats: StatsRecorder::new(),
        }
    }

    /// Record counters into a shared recorder.
    pub fn with_stats(mut self, stats: StatsRecorder) -> Self {
        self.stats = stats;
        self
    }

    /// Publish `payload` as a new envelope of `event_type` on `stream`.
    pub async fn publish<T: Serialize>(
        &self,
        stream: &str,
        event_type: &str,
        payload: &T,
    ) -> PublishResult<()> {
        let envelope = Envelope::from_payload(event_type, payload)
            .map_err(|e| PublishError::Serialization(e.to_string()))?;
        self.publish_envelope(stream, &envelope).await
    }

    /// Publish a typed domain event on its own stream.
    pub async fn emit<E: DomainEvent>(&self, event: &E) -> PublishResult<()> {
        let envelope = event
            .to_envelope()
            .map_err(|e| PublishError::Serialization(e.to_string()))?;
        self.publish_envelope(event.stream(), &envelope).await
    }

    /// Publish a pre-built envelope on `stream`.
    pub async fn publish_envelope(&self, stream: &str, envelope: &Envelope) -> PublishResult<()> {
        if !self.is_accepting() {
            return Err(PublishError::ShuttingDown);
        }

        match tokio::time::timeout(self.timeout, self.broker.publish(stream, envelope)).await {
            Ok(Ok(())) => {
                self.stats.published();
                debug!(
                    stream,
                    event_type = %envelope.event_type(),
                    correlation_id = %envelope.correlation_id(),
                    "Event published"
                );
                Ok(())
            }
            Ok(Err(e)) => {
                warn!(
                    stream,
                    event_type = %envelope.event_type(),
                    correlation_id = %envelope.correlation_id(),
                    error = %e,
                    "Publish failed"
                );
                Err(e)
            }
            Err(_) => {
                warn!(
                    stream,
                    event_type = %envelope.event_type(),
                    correlation_id = %envelope.correlation_id(),
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Publish timed out"
                );
                Err(PublishError::Timeout(self.timeout))
            }
        }
    }

    /// Whether publishes are still accepted.
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Refuse all further publishes from this publisher and its clones.
    pub fn close(&self) {
        self.accepting.store(false, Ordering::Release);
    }

    /// The broker adapter behind this publisher.
    pub fn broker(&self) -> &Arc<dyn BrokerPort> {
        &self.broker
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SubscribeResult;
    use crate::port::Inbox;
    use crate::topology::BrokerKind;
    use crate::types::{IndexAction, IndexKind, IndexMutation};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Capture {
        published: Mutex<Vec<(String, Envelope)>>,
        stall: bool,
    }

    #[async_trait]
    impl BrokerPort for Capture {
        fn kind(&self) -> BrokerKind {
            BrokerKind::Amqp
        }

        async fn publish(&self, stream: &str, envelope: &Envelope) -> PublishResult<()> {
            if self.stall {
                std::future::pending::<()>().await;
            }
            self.published
                .lock()
                .unwrap()
                .push((stream.to_string(), envelope.clone()));
            Ok(())
        }

        async fn open(&self, _stream: &str) -> SubscribeResult<Box<dyn Inbox>> {
            unimplemented!("publish-only test broker")
        }
    }

    #[tokio::test]
    async fn test_publish_wraps_payload() {
        let broker = Arc::new(Capture::default());
        let publisher = Publisher::new(broker.clone(), Duration::from_secs(1));

        publisher
            .publish("user-events", "user.registered", &json!({"email": "a@b.com"}))
            .await
            .unwrap();

        let published = broker.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "user-events");
        assert_eq!(published[0].1.event_type(), "user.registered");
        assert_eq!(published[0].1.payload()["email"], "a@b.com");
        assert!(!published[0].1.correlation_id().is_empty());
    }

    #[tokio::test]
    async fn test_emit_uses_event_stream() {
        let broker = Arc::new(Capture::default());
        let publisher = Publisher::new(broker.clone(), Duration::from_secs(1));

        let mutation =
            IndexMutation::upsert(IndexKind::User, IndexAction::Create, "u1", json!({"name": "A"}));
        publisher.emit(&mutation).await.unwrap();

        let published = broker.published.lock().unwrap();
        assert_eq!(published[0].0, "search-index.user");
        assert_eq!(published[0].1.event_type(), "index.user.create");
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_is_bounded_by_timeout() {
        let broker = Arc::new(Capture {
            stall: true,
            ..Default::default()
        });
        let publisher = Publisher::new(broker, Duration::from_millis(250));

        let result = publisher
            .publish("user-events", "user.registered", &json!({}))
            .await;
        assert!(matches!(result, Err(PublishError::Timeout(d)) if d == Duration::from_millis(250)));
    }

    #[tokio::test]
    async fn test_closed_publisher_refuses() {
        let broker = Arc::new(Capture::default());
        let publisher = Publisher::new(broker.clone(), Duration::from_secs(1));
        let clone = publisher.clone();

        publisher.close();

        let result = clone.publish("team-events", "team.created", &json!({})).await;
        assert!(matches!(result, Err(PublishError::ShuttingDown)));
        assert!(broker.published.lock().unwrap().is_empty());
    }
}
