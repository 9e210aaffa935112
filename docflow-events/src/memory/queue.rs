//! In-process topic-exchange broker.

use super::lock;
use crate::envelope::Envelope;
use crate::error::{PublishError, PublishResult, SettleError, SubscribeResult};
use crate::port::{Acknowledgement, BrokerPort, Delivery, Inbox, Settle};
use crate::topology::{BrokerKind, Topology};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::debug;

#[derive(Debug, Clone)]
struct Message {
    body: Vec<u8>,
    redelivered: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<Message>,
    unacked: usize,
    dead_letters: Vec<Vec<u8>>,
}

#[derive(Debug, Default)]
struct Queue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl Queue {
    fn push_back(&self, message: Message) {
        lock(&self.state).ready.push_back(message);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<Message> {
        let mut state = lock(&self.state);
        let message = state.ready.pop_front()?;
        state.unacked += 1;
        Some(message)
    }
}

/// Broker emulating an AMQP topic exchange with durable queues.
///
/// Each stream's queue binding becomes an in-memory FIFO queue, declared up
/// front so messages published before any consumer starts are retained.
/// Publishing routes the event type as routing key to every queue on the
/// stream's exchange whose pattern matches.
#[derive(Clone)]
pub struct MemoryQueueBroker {
    topology: Arc<Topology>,
    queues: Arc<HashMap<String, Arc<Queue>>>,
}

impl fmt::Debug for MemoryQueueBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.queues.keys().collect();
        names.sort();
        f.debug_struct("MemoryQueueBroker")
            .field("queues", &names)
            .finish()
    }
}

impl MemoryQueueBroker {
    /// Declare a queue for every AMQP binding in `topology`.
    pub fn new(topology: Arc<Topology>) -> Self {
        let queues = topology
            .streams()
            .filter_map(|s| s.queue.as_ref())
            .map(|binding| (binding.queue.clone(), Arc::new(Queue::default())))
            .collect();

        Self {
            topology,
            queues: Arc::new(queues),
        }
    }

    fn queue_for(&self, stream: &str) -> Option<&Arc<Queue>> {
        let binding = self.topology.queue_binding(stream).ok()?;
        self.queues.get(&binding.queue)
    }

    /// Messages waiting in the stream's queue.
    pub fn ready(&self, stream: &str) -> usize {
        self.queue_for(stream)
            .map(|q| lock(&q.state).ready.len())
            .unwrap_or(0)
    }

    /// Messages delivered from the stream's queue and not yet settled.
    pub fn unacked(&self, stream: &str) -> usize {
        self.queue_for(stream)
            .map(|q| lock(&q.state).unacked)
            .unwrap_or(0)
    }

    /// Raw bodies moved to the stream's dead-letter queue.
    pub fn dead_letters(&self, stream: &str) -> Vec<Vec<u8>> {
        self.queue_for(stream)
            .map(|q| lock(&q.state).dead_letters.clone())
            .unwrap_or_default()
    }

    /// Publish raw bytes on the stream's exchange, bypassing envelope checks.
    pub fn inject(&self, stream: &str, routing_key: &str, body: Vec<u8>) -> PublishResult<usize> {
        let binding = self.topology.queue_binding(stream)?;
        let mut routed = 0;

        for target in self.topology.matching_queues(&binding.exchange, routing_key) {
            if let Some(queue) = self.queues.get(&target.queue) {
                queue.push_back(Message {
                    body: body.clone(),
                    redelivered: false,
                });
                routed += 1;
            }
        }

        Ok(routed)
    }
}

#[async_trait]
impl BrokerPort for MemoryQueueBroker {
    fn kind(&self) -> BrokerKind {
        BrokerKind::Amqp
    }

    async fn publish(&self, stream: &str, envelope: &Envelope) -> PublishResult<()> {
        self.topology.check_routable(stream, envelope.event_type())?;

        let body = envelope
            .encode()
            .map_err(|e| PublishError::Serialization(e.to_string()))?;

        let routed = self.inject(stream, envelope.event_type(), body)?;
        if routed == 0 {
            return Err(PublishError::Unroutable {
                stream: stream.to_string(),
                event_type: envelope.event_type().to_string(),
            });
        }

        debug!(
            stream,
            routing_key = %envelope.event_type(),
            queues = routed,
            "Routed message to memory queues"
        );
        Ok(())
    }

    async fn open(&self, stream: &str) -> SubscribeResult<Box<dyn Inbox>> {
        let binding = self.topology.queue_binding(stream)?;
        let queue = self
            .queues
            .get(&binding.queue)
            .cloned()
            .unwrap_or_else(|| Arc::new(Queue::default()));

        Ok(Box::new(QueueInbox { queue }))
    }
}

struct QueueInbox {
    queue: Arc<Queue>,
}

#[async_trait]
impl Inbox for QueueInbox {
    async fn next(&mut self) -> Option<Delivery> {
        loop {
            if let Some(message) = self.queue.pop() {
                let settle = QueueSettle {
                    queue: self.queue.clone(),
                    body: message.body.clone(),
                };
                return Some(Delivery::new(message.body, message.redelivered, Box::new(settle)));
            }
            self.queue.notify.notified().await;
        }
    }
}

struct QueueSettle {
    queue: Arc<Queue>,
    body: Vec<u8>,
}

#[async_trait]
impl Settle for QueueSettle {
    async fn settle(self: Box<Self>, ack: Acknowledgement) -> Result<(), SettleError> {
        let QueueSettle { queue, body } = *self;
        let mut state = lock(&queue.state);
        state.unacked = state.unacked.saturating_sub(1);

        match ack {
            Acknowledgement::Ack => {}
            Acknowledgement::Requeue => {
                state.ready.push_front(Message {
                    body,
                    redelivered: true,
                });
                drop(state);
                queue.notify.notify_one();
            }
            Acknowledgement::DeadLetter => state.dead_letters.push(body),
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{streams, StreamDescriptor};
    use serde_json::json;
    use std::time::Duration;

    fn broker() -> MemoryQueueBroker {
        MemoryQueueBroker::new(Arc::new(Topology::platform()))
    }

    async fn next_envelope(inbox: &mut Box<dyn Inbox>) -> (Envelope, Delivery) {
        let delivery = tokio::time::timeout(Duration::from_secs(1), inbox.next())
            .await
            .expect("delivery in time")
            .expect("open inbox");
        (Envelope::decode(&delivery.body).unwrap(), delivery)
    }

    #[tokio::test]
    async fn test_messages_retained_until_consumed() {
        let broker = broker();
        broker
            .publish(streams::USER_EVENTS, &Envelope::new("user.registered", json!({"n": 1})))
            .await
            .unwrap();
        broker
            .publish(streams::USER_EVENTS, &Envelope::new("user.registered", json!({"n": 2})))
            .await
            .unwrap();
        assert_eq!(broker.ready(streams::USER_EVENTS), 2);

        let mut inbox = broker.open(streams::USER_EVENTS).await.unwrap();
        let (first, delivery) = next_envelope(&mut inbox).await;
        assert_eq!(first.payload()["n"], 1);
        assert_eq!(broker.unacked(streams::USER_EVENTS), 1);
        delivery.settle(Acknowledgement::Ack).await.unwrap();

        let (second, _) = next_envelope(&mut inbox).await;
        assert_eq!(second.payload()["n"], 2);
    }

    #[tokio::test]
    async fn test_routing_reaches_only_matching_queue() {
        let broker = broker();
        broker
            .publish(
                streams::SEARCH_INDEX_PAYMENT,
                &Envelope::new("index.payment.create", json!({"id": "p1"})),
            )
            .await
            .unwrap();

        assert_eq!(broker.ready(streams::SEARCH_INDEX_PAYMENT), 1);
        for other in [
            streams::SEARCH_INDEX_DOCUMENT,
            streams::SEARCH_INDEX_USER,
            streams::SEARCH_INDEX_SUBSCRIPTION,
            streams::USER_EVENTS,
        ] {
            assert_eq!(broker.ready(other), 0, "{}", other);
        }
    }

    #[tokio::test]
    async fn test_publish_outside_stream_pattern_is_unroutable() {
        let broker = broker();
        let result = broker
            .publish(streams::USER_EVENTS, &Envelope::new("team.created", json!({})))
            .await;
        assert!(matches!(result, Err(PublishError::Unroutable { .. })));
        assert_eq!(broker.ready(streams::TEAM_EVENTS), 0);
    }

    #[tokio::test]
    async fn test_unknown_stream_is_resolution_error() {
        let broker = broker();
        let result = broker
            .publish("billing-events", &Envelope::new("billing.paid", json!({})))
            .await;
        assert!(matches!(result, Err(PublishError::Resolution(_))));
    }

    #[tokio::test]
    async fn test_requeue_and_dead_letter() {
        let broker = broker();
        broker
            .publish(streams::TEAM_EVENTS, &Envelope::new("team.created", json!({"n": 1})))
            .await
            .unwrap();
        broker
            .publish(streams::TEAM_EVENTS, &Envelope::new("team.created", json!({"n": 2})))
            .await
            .unwrap();

        let mut inbox = broker.open(streams::TEAM_EVENTS).await.unwrap();
        let (_, delivery) = next_envelope(&mut inbox).await;
        assert!(!delivery.redelivered);
        delivery.settle(Acknowledgement::Requeue).await.unwrap();

        let (again, delivery) = next_envelope(&mut inbox).await;
        assert_eq!(again.payload()["n"], 1);
        assert!(delivery.redelivered);
        delivery.settle(Acknowledgement::DeadLetter).await.unwrap();

        assert_eq!(broker.dead_letters(streams::TEAM_EVENTS).len(), 1);
        assert_eq!(broker.ready(streams::TEAM_EVENTS), 1);
        assert_eq!(broker.unacked(streams::TEAM_EVENTS), 0);
    }

    #[tokio::test]
    async fn test_waiting_inbox_wakes_on_publish() {
        let broker = broker();
        let mut inbox = broker.open(streams::OCR_REQUESTS).await.unwrap();

        let waiter = tokio::spawn(async move { inbox.next().await.map(|d| d.body) });
        tokio::task::yield_now().await;

        broker
            .publish(streams::OCR_REQUESTS, &Envelope::new("ocr.requested", json!({})))
            .await
            .unwrap();

        let body = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(Envelope::decode(&body).unwrap().event_type(), "ocr.requested");
    }

    #[tokio::test]
    async fn test_fanout_to_overlapping_queues_on_other_exchanges_is_isolated() {
        let topology = Topology::builder()
            .stream(StreamDescriptor::new("a", "audit.#").with_queue("ex-a", "a.queue"))
            .stream(StreamDescriptor::new("b", "audit.*").with_queue("ex-b", "b.queue"))
            .build()
            .unwrap();
        let broker = MemoryQueueBroker::new(Arc::new(topology));

        broker
            .publish("a", &Envelope::new("audit.login", json!({})))
            .await
            .unwrap();

        assert_eq!(broker.ready("a"), 1);
        assert_eq!(broker.ready("b"), 0);
    }
}
