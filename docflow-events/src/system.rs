//! Messaging subsystem lifecycle.
//!
//! [`MessagingSystem`] is the one place where configuration, topology,
//! handler registry and broker adapter meet. Startup validates that every
//! registered event type routes to exactly one stream, opens one consumer
//! loop per subscribed stream and waits for all of them to run. Shutdown
//! stops accepting publishes, lets in-flight messages finish and abandons
//! loops that exceed the configured drain timeout.

use crate::config::{BrokerSelection, MessagingConfig};
use crate::consumer::{ConsumerHandle, ConsumerLoop, ConsumerState};
use crate::dispatcher::Dispatcher;
use crate::error::{ConfigurationError, StartError};
use crate::port::BrokerPort;
use crate::publisher::Publisher;
use crate::registry::HandlerRegistry;
use crate::stats::{MessagingStats, StatsRecorder};
use crate::topology::Topology;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, instrument, warn};

#[cfg(feature = "amqp")]
use crate::amqp::AmqpBroker;
#[cfg(feature = "kafka")]
use crate::kafka::KafkaBroker;
#[cfg(feature = "memory")]
use crate::memory::{MemoryLogBroker, MemoryQueueBroker};

/// Build the adapter selected by `config`.
///
/// Fails with [`ConfigurationError::AdapterUnavailable`] when the selected
/// adapter's cargo feature is not enabled.
pub async fn connect_broker(
    config: &MessagingConfig,
    topology: Arc<Topology>,
) -> Result<Arc<dyn BrokerPort>, StartError> {
    match config.broker {
        #[cfg(feature = "memory")]
        BrokerSelection::MemoryQueue => Ok(Arc::new(MemoryQueueBroker::new(topology))),
        #[cfg(feature = "memory")]
        BrokerSelection::MemoryLog => Ok(Arc::new(MemoryLogBroker::new(topology))),
        #[cfg(feature = "amqp")]
        BrokerSelection::Amqp => Ok(Arc::new(AmqpBroker::connect(&config.amqp, topology).await?)),
        #[cfg(feature = "kafka")]
        BrokerSelection::Kafka => Ok(Arc::new(KafkaBroker::connect(
            &config.kafka,
            topology,
            config.publish_timeout,
        )?)),
        #[allow(unreachable_patterns)]
        other => {
            drop(topology);
            Err(ConfigurationError::AdapterUnavailable(other.topology_kind()).into())
        }
    }
}

/// Running messaging subsystem: one publisher and a consumer loop per
/// subscribed stream.
pub struct MessagingSystem {
    broker: Arc<dyn BrokerPort>,
    topology: Arc<Topology>,
    publisher: Publisher,
    consumers: Vec<ConsumerHandle>,
    stats: StatsRecorder,
    shutdown_timeout: Duration,
}

impl fmt::Debug for MessagingSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessagingSystem")
            .field("broker", &self.broker.kind())
            .field("consumers", &self.consumers)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .finish()
    }
}

impl MessagingSystem {
    /// Connect the configured broker and start consuming.
    #[instrument(skip_all, fields(broker = %config.broker))]
    pub async fn start(
        config: &MessagingConfig,
        topology: Arc<Topology>,
        registry: Arc<HandlerRegistry>,
    ) -> Result<Self, StartError> {
        config.validate()?;
        let broker = connect_broker(config, topology.clone()).await?;
        Self::start_with_broker(broker, config, topology, registry).await
    }

    /// Start consuming on an already constructed broker.
    pub async fn start_with_broker(
        broker: Arc<dyn BrokerPort>,
        config: &MessagingConfig,
        topology: Arc<Topology>,
        registry: Arc<HandlerRegistry>,
    ) -> Result<Self, StartError> {
        let kind = broker.kind();
        config.validate_policies(&topology)?;
        registry.validate_against(&topology, kind)?;

        let stats = StatsRecorder::new();
        let mut consumers: Vec<ConsumerHandle> = Vec::new();

        for stream in registry.subscribed_streams(&topology, kind) {
            let inbox = match broker.open(&stream).await {
                Ok(inbox) => inbox,
                Err(e) => {
                    warn!(stream = %stream, error = %e, "Failed to open stream, aborting startup");
                    for consumer in consumers {
                        consumer.stop_within(config.shutdown_timeout).await;
                    }
                    return Err(e.into());
                }
            };

            let policy = config.policy_for(&stream);
            info!(stream = %stream, policy = %policy, "Subscribing");

            let dispatcher = Dispatcher::new(stream.clone(), registry.clone())
                .with_policy(policy)
                .with_stats(stats.clone());
            let handle = ConsumerLoop::new(stream, inbox, Arc::new(dispatcher))
                .with_stats(stats.clone())
                .spawn();
            consumers.push(handle);
        }

        for consumer in &consumers {
            let state = consumer.wait_for(ConsumerState::Running).await;
            if state != ConsumerState::Running {
                warn!(stream = %consumer.stream(), state = %state, "Consumer loop did not reach running");
            }
        }

        let publisher =
            Publisher::new(broker.clone(), config.publish_timeout).with_stats(stats.clone());

        info!(
            broker = %kind,
            consumers = consumers.len(),
            handlers = registry.len(),
            "Messaging started"
        );

        Ok(Self {
            broker,
            topology,
            publisher,
            consumers,
            stats,
            shutdown_timeout: config.shutdown_timeout,
        })
    }

    /// Publisher sharing this system's broker and counters.
    pub fn publisher(&self) -> Publisher {
        self.publisher.clone()
    }

    /// Broker adapter in use.
    pub fn broker(&self) -> &Arc<dyn BrokerPort> {
        &self.broker
    }

    /// Topology streams are resolved against.
    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    /// Counters across the publisher and every consumer loop.
    pub fn stats(&self) -> MessagingStats {
        self.stats.snapshot()
    }

    /// State of every consumer loop, by stream.
    pub fn consumer_states(&self) -> Vec<(String, ConsumerState)> {
        self.consumers
            .iter()
            .map(|c| (c.stream().to_string(), c.state()))
            .collect()
    }

    /// Consumer loop for `stream`, if one was started.
    pub fn consumer(&self, stream: &str) -> Option<&ConsumerHandle> {
        self.consumers.iter().find(|c| c.stream() == stream)
    }

    /// Stop publishing, drain consumers and wait at most the shutdown timeout.
    ///
    /// Returns `true` if every loop finished its in-flight message in time.
    pub async fn shutdown(self) -> bool {
        self.publisher.close();
        for consumer in &self.consumers {
            consumer.request_stop();
        }

        let deadline = Instant::now() + self.shutdown_timeout;
        let mut drained = true;
        for consumer in self.consumers {
            let remaining = deadline.saturating_duration_since(Instant::now());
            drained &= consumer.stop_within(remaining).await;
        }

        if drained {
            info!("Messaging stopped");
        } else {
            warn!(
                timeout_ms = self.shutdown_timeout.as_millis() as u64,
                "Messaging stopped with abandoned consumers"
            );
        }
        drained
    }
}

#[cfg(all(test, feature = "memory"))]
mod tests {
    use super::*;
    use crate::dispatcher::DeliveryPolicy;
    use crate::envelope::Envelope;
    use crate::error::PublishError;
    use crate::topology::streams;
    use serde_json::json;

    fn registry() -> Arc<HandlerRegistry> {
        Arc::new(
            HandlerRegistry::builder()
                .register_fn("team.created", |_| async { Ok(()) })
                .unwrap()
                .build(),
        )
    }

    #[tokio::test]
    async fn test_connect_memory_brokers() {
        let topology = Arc::new(Topology::platform());

        let mut config = MessagingConfig::default();
        let broker = connect_broker(&config, topology.clone()).await.unwrap();
        assert_eq!(broker.kind(), crate::topology::BrokerKind::Amqp);

        config.broker = BrokerSelection::MemoryLog;
        let broker = connect_broker(&config, topology).await.unwrap();
        assert_eq!(broker.kind(), crate::topology::BrokerKind::Kafka);
    }

    #[tokio::test]
    async fn test_starts_one_loop_per_subscribed_stream() {
        let system =
            MessagingSystem::start(&MessagingConfig::default(), Arc::new(Topology::platform()), registry())
                .await
                .unwrap();

        assert_eq!(
            system.consumer_states(),
            vec![(streams::TEAM_EVENTS.to_string(), ConsumerState::Running)]
        );
        assert!(system.consumer(streams::USER_EVENTS).is_none());
        assert!(system.shutdown().await);
    }

    #[tokio::test]
    async fn test_publish_rejected_after_shutdown() {
        let system =
            MessagingSystem::start(&MessagingConfig::default(), Arc::new(Topology::platform()), registry())
                .await
                .unwrap();
        let publisher = system.publisher();

        system.shutdown().await;

        let result = publisher
            .publish_envelope(streams::TEAM_EVENTS, &Envelope::new("team.created", json!({})))
            .await;
        assert!(matches!(result, Err(PublishError::ShuttingDown)));
    }

    #[tokio::test]
    async fn test_unroutable_registration_fails_startup() {
        let registry = Arc::new(
            HandlerRegistry::builder()
                .register_fn("billing.paid", |_| async { Ok(()) })
                .unwrap()
                .build(),
        );

        let result =
            MessagingSystem::start(&MessagingConfig::default(), Arc::new(Topology::platform()), registry)
                .await;
        assert!(matches!(
            result,
            Err(StartError::Configuration(ConfigurationError::UnroutableEventType { .. }))
        ));
    }

    #[tokio::test]
    async fn test_policy_override_for_unknown_stream_fails_startup() {
        let config = MessagingConfig::default().with_policy("search-index.invoice", DeliveryPolicy::AckAlways);

        let result = MessagingSystem::start(&config, Arc::new(Topology::platform()), registry()).await;

        assert!(matches!(
            result,
            Err(StartError::Configuration(ConfigurationError::UnknownStream(key)))
                if key == "MESSAGING_POLICY_SEARCH_INDEX_INVOICE"
        ));
    }
}
