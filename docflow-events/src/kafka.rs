//! Kafka adapter.
//!
//! Streams resolve to Kafka descriptors: a topic and a partition-key rule.
//! The key keeps related events (one user, one document, one team) in one
//! partition so their relative order survives. Envelopes are produced as the
//! JSON body with `eventType` and `correlationId` copied into headers.
//!
//! Consumers join the configured group with auto-commit disabled. An `Ack`
//! commits the offset after the message, `Requeue` seeks the partition back
//! to it and `DeadLetter` produces the message to `<topic>.dlq` before
//! committing.

use crate::config::KafkaSettings;
use crate::envelope::Envelope;
use crate::error::{PublishError, PublishResult, SettleError, SubscribeError, SubscribeResult};
use crate::port::{Acknowledgement, BrokerPort, Delivery, Inbox, Settle};
use crate::retry::RetryConfig;
use crate::topology::{BrokerKind, Topology};
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const HEADER_EVENT_TYPE: &str = "eventType";
const HEADER_CORRELATION_ID: &str = "correlationId";
const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

/// Kafka-backed broker.
pub struct KafkaBroker {
    settings: KafkaSettings,
    client_id: String,
    topology: Arc<Topology>,
    producer: FutureProducer,
    produce_timeout: Duration,
}

impl fmt::Debug for KafkaBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KafkaBroker")
            .field("brokers", &self.settings.brokers)
            .field("group_id", &self.settings.group_id)
            .field("client_id", &self.client_id)
            .finish()
    }
}

impl KafkaBroker {
    /// Create the shared producer.
    ///
    /// `produce_timeout` bounds librdkafka's internal queueing and delivery;
    /// it should not exceed the publish timeout.
    pub fn connect(
        settings: &KafkaSettings,
        topology: Arc<Topology>,
        produce_timeout: Duration,
    ) -> SubscribeResult<Self> {
        let client_id = settings.client_id.clone().unwrap_or_else(default_client_id);

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &settings.brokers)
            .set("client.id", &client_id)
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .set("message.timeout.ms", produce_timeout.as_millis().to_string())
            .create()
            .map_err(|e| SubscribeError::Connection(e.to_string()))?;

        info!(brokers = %settings.brokers, client_id = %client_id, "Kafka producer created");

        Ok(Self {
            settings: settings.clone(),
            client_id,
            topology,
            producer,
            produce_timeout,
        })
    }
}

fn default_client_id() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "docflow".to_string())
}

fn envelope_headers(event_type: &str, correlation_id: &str) -> OwnedHeaders {
    OwnedHeaders::new()
        .insert(Header {
            key: HEADER_EVENT_TYPE,
            value: Some(event_type),
        })
        .insert(Header {
            key: HEADER_CORRELATION_ID,
            value: Some(correlation_id),
        })
}

#[async_trait]
impl BrokerPort for KafkaBroker {
    fn kind(&self) -> BrokerKind {
        BrokerKind::Kafka
    }

    async fn publish(&self, stream: &str, envelope: &Envelope) -> PublishResult<()> {
        let binding = self.topology.topic_binding(stream)?;
        self.topology.check_routable(stream, envelope.event_type())?;

        let key = binding.partition_key.extract(envelope);
        let body = envelope
            .encode()
            .map_err(|e| PublishError::Serialization(e.to_string()))?;

        let record = FutureRecord::to(&binding.topic)
            .key(&key)
            .payload(&body)
            .headers(envelope_headers(envelope.event_type(), envelope.correlation_id()));

        match self
            .producer
            .send(record, Timeout::After(self.produce_timeout))
            .await
        {
            Ok((partition, offset)) => {
                debug!(stream, topic = %binding.topic, partition, offset, "Produced to Kafka");
                Ok(())
            }
            Err((KafkaError::MessageProduction(code), _)) => {
                Err(PublishError::Unreachable(format!("produce failed: {}", code)))
            }
            Err((e, _)) => Err(PublishError::Unreachable(e.to_string())),
        }
    }

    async fn open(&self, stream: &str) -> SubscribeResult<Box<dyn Inbox>> {
        let binding = self.topology.topic_binding(stream)?;

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.settings.brokers)
            .set("group.id", &self.settings.group_id)
            .set("client.id", &self.client_id)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", "earliest")
            .create()
            .map_err(|e| SubscribeError::Connection(e.to_string()))?;

        consumer
            .subscribe(&[binding.topic.as_str()])
            .map_err(|e| SubscribeError::Rejected(e.to_string()))?;

        info!(
            stream,
            topic = %binding.topic,
            group_id = %self.settings.group_id,
            "Kafka consumer subscribed"
        );

        Ok(Box::new(KafkaInbox {
            topic: binding.topic.clone(),
            dead_letter_topic: binding.dead_letter_topic(),
            consumer: Arc::new(consumer),
            producer: self.producer.clone(),
            produce_timeout: self.produce_timeout,
            backoff: RetryConfig::reconnect(),
            tracker: DeliveryTracker::default(),
        }))
    }
}

struct KafkaInbox {
    topic: String,
    dead_letter_topic: String,
    consumer: Arc<StreamConsumer>,
    producer: FutureProducer,
    produce_timeout: Duration,
    backoff: RetryConfig,
    tracker: DeliveryTracker,
}

/// Highest offset handed out per partition by this consumer.
///
/// Kafka has no redelivery flag. An offset at or below the high-water mark
/// was seen before, typically after a `Requeue` seek. Redeliveries after a
/// rebalance to another group member are not detected.
#[derive(Debug, Default)]
struct DeliveryTracker {
    delivered: HashMap<i32, i64>,
}

impl DeliveryTracker {
    /// Record a delivery; returns whether it was delivered before.
    fn observe(&mut self, partition: i32, offset: i64) -> bool {
        match self.delivered.get_mut(&partition) {
            Some(highest) if offset <= *highest => true,
            Some(highest) => {
                *highest = offset;
                false
            }
            None => {
                self.delivered.insert(partition, offset);
                false
            }
        }
    }
}

#[async_trait]
impl Inbox for KafkaInbox {
    async fn next(&mut self) -> Option<Delivery> {
        // librdkafka reconnects on its own; errors here are surfaced and retried
        let mut failures = 0;
        loop {
            let received = self.consumer.recv().await.map(|m| m.detach());
            match received {
                Ok(message) => {
                    let body = message.payload().map(<[u8]>::to_vec).unwrap_or_default();
                    let settle = KafkaSettle {
                        consumer: self.consumer.clone(),
                        producer: self.producer.clone(),
                        produce_timeout: self.produce_timeout,
                        topic: self.topic.clone(),
                        dead_letter_topic: self.dead_letter_topic.clone(),
                        partition: message.partition(),
                        offset: message.offset(),
                        key: message.key().map(<[u8]>::to_vec),
                        headers: message.headers().cloned(),
                        body: body.clone(),
                    };
                    let redelivered =
                        self.tracker.observe(message.partition(), message.offset());
                    return Some(Delivery::new(body, redelivered, Box::new(settle)));
                }
                Err(e) => {
                    failures += 1;
                    let delay = self.backoff.delay_after(failures);
                    warn!(
                        topic = %self.topic,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Kafka consumer error"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

struct KafkaSettle {
    consumer: Arc<StreamConsumer>,
    producer: FutureProducer,
    produce_timeout: Duration,
    topic: String,
    dead_letter_topic: String,
    partition: i32,
    offset: i64,
    key: Option<Vec<u8>>,
    headers: Option<OwnedHeaders>,
    body: Vec<u8>,
}

impl KafkaSettle {
    fn commit(&self) -> Result<(), SettleError> {
        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(&self.topic, self.partition, Offset::Offset(self.offset + 1))
            .map_err(|e| SettleError(e.to_string()))?;
        self.consumer
            .commit(&offsets, CommitMode::Async)
            .map_err(|e| SettleError(e.to_string()))
    }

    fn header(&self, name: &str) -> Option<String> {
        self.headers.as_ref()?.iter().find_map(|h| {
            (h.key == name)
                .then(|| h.value.map(|v| String::from_utf8_lossy(v).into_owned()))
                .flatten()
        })
    }
}

#[async_trait]
impl Settle for KafkaSettle {
    async fn settle(self: Box<Self>, ack: Acknowledgement) -> Result<(), SettleError> {
        match ack {
            Acknowledgement::Ack => self.commit(),
            Acknowledgement::Requeue => self
                .consumer
                .seek(
                    &self.topic,
                    self.partition,
                    Offset::Offset(self.offset),
                    Timeout::After(SEEK_TIMEOUT),
                )
                .map_err(|e| SettleError(e.to_string())),
            Acknowledgement::DeadLetter => {
                let event_type = self.header(HEADER_EVENT_TYPE).unwrap_or_default();
                let correlation_id = self.header(HEADER_CORRELATION_ID).unwrap_or_default();
                let key = self.key.clone().unwrap_or_default();

                let record = FutureRecord::to(&self.dead_letter_topic)
                    .key(&key)
                    .payload(&self.body)
                    .headers(envelope_headers(&event_type, &correlation_id));

                self.producer
                    .send(record, Timeout::After(self.produce_timeout))
                    .await
                    .map_err(|(e, _)| SettleError(format!("dead-letter produce failed: {}", e)))?;

                self.commit()
            }
        }
    }
}
