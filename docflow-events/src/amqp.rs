//! RabbitMQ adapter for distributed deployments.
//!
//! Streams resolve to AMQP descriptors: one durable topic exchange per
//! binding, a durable queue bound with the stream's routing pattern, and a
//! dead-letter exchange (`<exchange>.dlx`) feeding `<queue>.dlq`. Envelopes are
//! published with the event type as routing key, persistent delivery mode
//! and publisher confirms.

use crate::config::AmqpSettings;
use crate::envelope::Envelope;
use crate::error::{PublishError, PublishResult, SettleError, SubscribeError, SubscribeResult};
use crate::port::{Acknowledgement, BrokerPort, Delivery, Inbox, Settle};
use crate::retry::RetryConfig;
use crate::topology::{BrokerKind, QueueBinding, Topology};
use async_trait::async_trait;
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

const PERSISTENT: u8 = 2;
const CONTENT_TYPE: &str = "application/json";

/// RabbitMQ-backed broker.
///
/// # Example
///
/// ```rust,no_run
/// use docflow_events::amqp::AmqpBroker;
/// use docflow_events::config::MessagingConfig;
/// use docflow_events::Topology;
/// use std::sync::Arc;
///
/// async fn example() -> Result<(), Box<dyn std::error::Error>> {
///     let config = MessagingConfig::from_env()?;
///     let broker = AmqpBroker::connect(&config.amqp, Arc::new(Topology::platform())).await?;
///     Ok(())
/// }
/// ```
pub struct AmqpBroker {
    settings: AmqpSettings,
    topology: Arc<Topology>,
    /// Publishing connection, re-established lazily after a failure
    publisher: Mutex<Option<(Connection, Channel)>>,
}

impl fmt::Debug for AmqpBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AmqpBroker")
            .field("prefetch", &self.settings.prefetch)
            .finish()
    }
}

impl AmqpBroker {
    /// Connect and declare every queue binding in `topology`.
    pub async fn connect(settings: &AmqpSettings, topology: Arc<Topology>) -> SubscribeResult<Self> {
        let (connection, channel) = open_channel(&settings.url).await?;

        let bindings: Vec<&QueueBinding> =
            topology.streams().filter_map(|s| s.queue.as_ref()).collect();
        declare_all(&channel, &bindings).await?;

        info!(queues = bindings.len(), "AMQP topology declared");

        Ok(Self {
            settings: settings.clone(),
            topology,
            publisher: Mutex::new(Some((connection, channel))),
        })
    }

    async fn publish_channel(&self) -> PublishResult<Channel> {
        let mut slot = self.publisher.lock().await;

        if let Some((connection, channel)) = slot.as_ref() {
            if connection.status().connected() && channel.status().connected() {
                return Ok(channel.clone());
            }
        }

        let (connection, channel) = open_channel(&self.settings.url)
            .await
            .map_err(|e| PublishError::Unreachable(e.to_string()))?;
        let result = channel.clone();
        *slot = Some((connection, channel));
        Ok(result)
    }

    async fn reset_publisher(&self) {
        self.publisher.lock().await.take();
    }
}

#[async_trait]
impl BrokerPort for AmqpBroker {
    fn kind(&self) -> BrokerKind {
        BrokerKind::Amqp
    }

    async fn publish(&self, stream: &str, envelope: &Envelope) -> PublishResult<()> {
        let binding = self.topology.queue_binding(stream)?;
        self.topology.check_routable(stream, envelope.event_type())?;

        let body = envelope
            .encode()
            .map_err(|e| PublishError::Serialization(e.to_string()))?;

        let properties = BasicProperties::default()
            .with_delivery_mode(PERSISTENT)
            .with_content_type(CONTENT_TYPE.into())
            .with_correlation_id(envelope.correlation_id().into())
            .with_kind(envelope.event_type().into())
            .with_timestamp(envelope.timestamp().timestamp().max(0) as u64);

        let channel = self.publish_channel().await?;
        let options = BasicPublishOptions {
            mandatory: true,
            ..Default::default()
        };

        let confirm = match channel
            .basic_publish(
                &binding.exchange,
                envelope.event_type(),
                options,
                &body,
                properties,
            )
            .await
        {
            Ok(confirm) => confirm,
            Err(e) => {
                self.reset_publisher().await;
                return Err(PublishError::Unreachable(e.to_string()));
            }
        };

        match confirm.await {
            Ok(Confirmation::Ack(None)) | Ok(Confirmation::NotRequested) => {
                debug!(
                    stream,
                    exchange = %binding.exchange,
                    routing_key = %envelope.event_type(),
                    "Published to AMQP exchange"
                );
                Ok(())
            }
            Ok(Confirmation::Ack(Some(_))) => Err(PublishError::Unroutable {
                stream: stream.to_string(),
                event_type: envelope.event_type().to_string(),
            }),
            Ok(Confirmation::Nack(_)) => {
                Err(PublishError::Unreachable("broker rejected the message".to_string()))
            }
            Err(e) => {
                self.reset_publisher().await;
                Err(PublishError::Unreachable(e.to_string()))
            }
        }
    }

    async fn open(&self, stream: &str) -> SubscribeResult<Box<dyn Inbox>> {
        let binding = self.topology.queue_binding(stream)?.clone();
        let mut inbox = AmqpInbox {
            url: self.settings.url.clone(),
            prefetch: self.settings.prefetch,
            binding,
            session: None,
            backoff: RetryConfig::reconnect(),
        };

        // Fail fast at startup; later drops are handled inside `next`
        inbox.session = Some(inbox.consume().await?);
        Ok(Box::new(inbox))
    }
}

async fn open_channel(url: &str) -> SubscribeResult<(Connection, Channel)> {
    let connection = Connection::connect(url, ConnectionProperties::default())
        .await
        .map_err(|e| SubscribeError::Connection(e.to_string()))?;
    let channel = connection
        .create_channel()
        .await
        .map_err(|e| SubscribeError::Connection(e.to_string()))?;
    channel
        .confirm_select(ConfirmSelectOptions::default())
        .await
        .map_err(|e| SubscribeError::Connection(e.to_string()))?;
    Ok((connection, channel))
}

async fn declare_all(channel: &Channel, bindings: &[&QueueBinding]) -> SubscribeResult<()> {
    let mut exchanges = HashSet::new();
    for binding in bindings {
        if exchanges.insert(binding.exchange.as_str()) {
            declare_exchange(channel, &binding.exchange).await?;
            declare_exchange(channel, &binding.dead_letter_exchange()).await?;
        }
        declare_queue(channel, binding).await?;
    }
    Ok(())
}

async fn declare_exchange(channel: &Channel, name: &str) -> SubscribeResult<()> {
    channel
        .exchange_declare(
            name,
            ExchangeKind::Topic,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| SubscribeError::Rejected(format!("exchange {}: {}", name, e)))
}

async fn declare_queue(channel: &Channel, binding: &QueueBinding) -> SubscribeResult<()> {
    let options = || QueueDeclareOptions {
        durable: binding.durable,
        ..Default::default()
    };
    let rejected =
        |e: lapin::Error| SubscribeError::Rejected(format!("queue {}: {}", binding.queue, e));

    // Dead-lettered messages keep their routing key, so the DLQ reuses the pattern
    channel
        .queue_declare(&binding.dead_letter_queue(), options(), FieldTable::default())
        .await
        .map_err(rejected)?;
    channel
        .queue_bind(
            &binding.dead_letter_queue(),
            &binding.dead_letter_exchange(),
            &binding.routing_key_pattern,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(rejected)?;

    let mut arguments = FieldTable::default();
    arguments.insert(
        "x-dead-letter-exchange".into(),
        AMQPValue::LongString(binding.dead_letter_exchange().into()),
    );
    channel
        .queue_declare(&binding.queue, options(), arguments)
        .await
        .map_err(rejected)?;
    channel
        .queue_bind(
            &binding.queue,
            &binding.exchange,
            &binding.routing_key_pattern,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(rejected)?;

    Ok(())
}

struct Session {
    _connection: Connection,
    consumer: Consumer,
}

struct AmqpInbox {
    url: String,
    prefetch: u16,
    binding: QueueBinding,
    session: Option<Session>,
    backoff: RetryConfig,
}

impl AmqpInbox {
    async fn consume(&self) -> SubscribeResult<Session> {
        let (connection, channel) = open_channel(&self.url).await?;
        declare_all(&channel, &[&self.binding]).await?;

        channel
            .basic_qos(self.prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| SubscribeError::Rejected(e.to_string()))?;

        let tag = format!("{}-{}", self.binding.queue, Uuid::now_v7());
        let consumer = channel
            .basic_consume(
                &self.binding.queue,
                &tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| SubscribeError::Rejected(e.to_string()))?;

        info!(queue = %self.binding.queue, consumer_tag = %tag, "AMQP consumer started");
        Ok(Session {
            _connection: connection,
            consumer,
        })
    }

    async fn reconnect(&mut self) {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.consume().await {
                Ok(session) => {
                    info!(queue = %self.binding.queue, attempt, "AMQP consumer reconnected");
                    self.session = Some(session);
                    return;
                }
                Err(e) => {
                    let delay = self.backoff.delay_after(attempt);
                    warn!(
                        queue = %self.binding.queue,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "AMQP reconnect failed"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[async_trait]
impl Inbox for AmqpInbox {
    async fn next(&mut self) -> Option<Delivery> {
        loop {
            let Some(session) = self.session.as_mut() else {
                self.reconnect().await;
                continue;
            };

            match session.consumer.next().await {
                Some(Ok(delivery)) => {
                    let settle = AmqpSettle {
                        acker: delivery.acker,
                    };
                    return Some(Delivery::new(
                        delivery.data,
                        delivery.redelivered,
                        Box::new(settle),
                    ));
                }
                Some(Err(e)) => {
                    warn!(queue = %self.binding.queue, error = %e, "AMQP consumer error, reconnecting");
                    self.session = None;
                }
                None => {
                    warn!(queue = %self.binding.queue, "AMQP consumer cancelled, reconnecting");
                    self.session = None;
                }
            }
        }
    }
}

struct AmqpSettle {
    acker: Acker,
}

#[async_trait]
impl Settle for AmqpSettle {
    async fn settle(self: Box<Self>, ack: Acknowledgement) -> Result<(), SettleError> {
        let result = match ack {
            Acknowledgement::Ack => self.acker.ack(BasicAckOptions::default()).await,
            Acknowledgement::Requeue => {
                self.acker
                    .nack(BasicNackOptions {
                        requeue: true,
                        ..Default::default()
                    })
                    .await
            }
            // The queue's x-dead-letter-exchange takes it from here
            Acknowledgement::DeadLetter => {
                self.acker
                    .nack(BasicNackOptions {
                        requeue: false,
                        ..Default::default()
                    })
                    .await
            }
        };

        result.map(|_| ()).map_err(|e| SettleError(e.to_string()))
    }
}
