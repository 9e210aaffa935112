//! Broker port
//!
//! Producers and the dispatcher program against [`BrokerPort`]; one adapter
//! per broker technology implements it. Which adapter runs is decided once at
//! process start from configuration, never by business code.
//!
//! Receiving is split in two layers:
//!
//! - an adapter opens an [`Inbox`] for a stream: a pull interface yielding raw
//!   [`Delivery`] values that know how to settle themselves with the broker
//! - [`BrokerPort::subscribe`] drives that inbox with the shared
//!   [`ConsumerLoop`](crate::consumer::ConsumerLoop), so decode handling,
//!   panic containment and graceful stop behave identically on every broker

use crate::consumer::{ConsumerHandle, ConsumerLoop};
use crate::envelope::Envelope;
use crate::error::{PublishResult, SettleError, SubscribeResult};
use crate::topology::BrokerKind;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// How a consumed message is settled with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Acknowledgement {
    /// Remove the message (AMQP ack, Kafka offset commit).
    Ack,
    /// Make the message available again (AMQP nack+requeue, Kafka seek back).
    Requeue,
    /// Move the message to the overflow path (AMQP dead-letter exchange,
    /// Kafka `<topic>.dlq`).
    DeadLetter,
}

impl fmt::Display for Acknowledgement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Acknowledgement::Ack => f.write_str("ack"),
            Acknowledgement::Requeue => f.write_str("requeue"),
            Acknowledgement::DeadLetter => f.write_str("dead-letter"),
        }
    }
}

/// Settles one delivery with the broker that produced it.
#[async_trait]
pub trait Settle: Send {
    /// Apply `ack` to the delivery.
    async fn settle(self: Box<Self>, ack: Acknowledgement) -> Result<(), SettleError>;
}

/// A raw message pulled from a broker.
pub struct Delivery {
    /// Message body as received.
    pub body: Vec<u8>,
    /// Whether the broker has delivered this message before.
    pub redelivered: bool,
    settle: Box<dyn Settle>,
}

impl Delivery {
    /// Wrap a raw body with its settlement handle.
    pub fn new(body: Vec<u8>, redelivered: bool, settle: Box<dyn Settle>) -> Self {
        Self {
            body,
            redelivered,
            settle,
        }
    }

    /// Settle the delivery, consuming it.
    pub async fn settle(self, ack: Acknowledgement) -> Result<(), SettleError> {
        self.settle.settle(ack).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("len", &self.body.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

/// Pull side of a subscription.
///
/// Implementations own their reconnect discipline: a dropped connection must
/// lead to reconnect-and-resubscribe inside `next`, not to `None`.
#[async_trait]
pub trait Inbox: Send {
    /// Wait for the next message. `None` means the source is permanently closed.
    async fn next(&mut self) -> Option<Delivery>;
}

/// Callback invoked for each decoded envelope of a subscription.
#[async_trait]
pub trait EnvelopeCallback: Send + Sync {
    /// Process `envelope` and decide how the broker should settle it.
    async fn on_envelope(&self, envelope: Envelope) -> Acknowledgement;
}

/// Broker port implemented by every adapter.
#[async_trait]
pub trait BrokerPort: Send + Sync {
    /// Broker technology whose topology descriptors this adapter uses.
    fn kind(&self) -> BrokerKind;

    /// Serialize `envelope`, resolve `stream` and hand the message to the broker.
    ///
    /// The port never retries; the caller decides whether to retry, drop or
    /// escalate a [`PublishError`](crate::error::PublishError).
    async fn publish(&self, stream: &str, envelope: &Envelope) -> PublishResult<()>;

    /// Open a raw receive channel on `stream`.
    async fn open(&self, stream: &str) -> SubscribeResult<Box<dyn Inbox>>;

    /// Subscribe `callback` to `stream` with a supervised consumer loop.
    async fn subscribe(
        &self,
        stream: &str,
        callback: Arc<dyn EnvelopeCallback>,
    ) -> SubscribeResult<ConsumerHandle> {
        let inbox = self.open(stream).await?;
        Ok(ConsumerLoop::new(stream, inbox, callback).spawn())
    }
}
