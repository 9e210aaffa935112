//! Topology descriptors
//!
//! A logical stream ("user events", "ocr requests", ...) is declared once at
//! startup with one physical descriptor per broker technology:
//!
//! - **AMQP**: exchange + durable queue + routing-key pattern
//! - **Kafka**: topic + partition-key rule
//!
//! ## Routing Patterns
//!
//! Routing keys are dot-separated event types (`user.registered`). Patterns
//! follow AMQP topic-exchange semantics exactly, because the broker-side
//! bindings already exist:
//!
//! - `*` matches exactly one segment
//! - `#` matches zero or more segments
//!
//! `user.*` matches `user.registered` but not `user.trial.expiring`;
//! `user.#` matches both, and also `user`.

use crate::envelope::Envelope;
use crate::error::{ConfigResult, ConfigurationError, PublishError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Well-known logical stream names.
pub mod streams {
    /// User lifecycle events (`user.*`).
    pub const USER_EVENTS: &str = "user-events";
    /// OCR requests and results (`ocr.*`).
    pub const OCR_REQUESTS: &str = "ocr-requests";
    /// Document search-index mutations (`index.document.*`).
    pub const SEARCH_INDEX_DOCUMENT: &str = "search-index.document";
    /// User search-index mutations (`index.user.*`).
    pub const SEARCH_INDEX_USER: &str = "search-index.user";
    /// Payment search-index mutations (`index.payment.*`).
    pub const SEARCH_INDEX_PAYMENT: &str = "search-index.payment";
    /// Subscription search-index mutations (`index.subscription.*`).
    pub const SEARCH_INDEX_SUBSCRIPTION: &str = "search-index.subscription";
    /// Team lifecycle events (`team.*`).
    pub const TEAM_EVENTS: &str = "team-events";
}

/// Shared topic exchange for all platform streams.
pub const PLATFORM_EXCHANGE: &str = "docflow.events";

/// Broker technology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    /// Exchange / queue / routing-key broker.
    Amqp,
    /// Topic / partition log broker.
    Kafka,
}

impl BrokerKind {
    /// Get the string representation of the broker kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            BrokerKind::Amqp => "amqp",
            BrokerKind::Kafka => "kafka",
        }
    }

    /// Parse from string representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "amqp" | "rabbitmq" => Some(BrokerKind::Amqp),
            "kafka" => Some(BrokerKind::Kafka),
            _ => None,
        }
    }
}

impl fmt::Display for BrokerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// AMQP addressing for a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueBinding {
    /// Topic exchange the producer publishes to.
    pub exchange: String,
    /// Queue the consumer reads from.
    pub queue: String,
    /// Binding pattern between exchange and queue.
    pub routing_key_pattern: String,
    /// Whether exchange and queue survive a broker restart.
    pub durable: bool,
}

impl QueueBinding {
    /// Exchange receiving messages rejected from this queue.
    pub fn dead_letter_exchange(&self) -> String {
        format!("{}.dlx", self.exchange)
    }

    /// Queue holding messages rejected from this queue.
    pub fn dead_letter_queue(&self) -> String {
        format!("{}.dlq", self.queue)
    }
}

/// How a Kafka partition key is derived from an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "field", rename_all = "snake_case")]
pub enum PartitionKey {
    /// Key by correlation id (spreads unrelated flows).
    CorrelationId,
    /// Key by event type (orders each type).
    EventType,
    /// Key by a top-level payload field, falling back to the correlation id.
    PayloadField(String),
}

impl PartitionKey {
    /// Extract the key for `envelope`.
    pub fn extract(&self, envelope: &Envelope) -> String {
        match self {
            PartitionKey::CorrelationId => envelope.correlation_id().to_string(),
            PartitionKey::EventType => envelope.event_type().to_string(),
            PartitionKey::PayloadField(field) => match envelope.payload().get(field) {
                Some(serde_json::Value::String(s)) => s.clone(),
                Some(serde_json::Value::Null) | None => envelope.correlation_id().to_string(),
                Some(other) => other.to_string(),
            },
        }
    }
}

/// Kafka addressing for a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicBinding {
    /// Topic name.
    pub topic: String,
    /// Partition-key extraction rule.
    pub partition_key: PartitionKey,
}

impl TopicBinding {
    /// Topic holding messages rejected from this topic.
    pub fn dead_letter_topic(&self) -> String {
        format!("{}.dlq", self.topic)
    }
}

/// Resolved physical address of a stream on one broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhysicalAddress {
    /// Exchange/queue/routing-key address.
    Queue(QueueBinding),
    /// Topic address.
    Topic(TopicBinding),
}

/// A logical stream and its per-broker descriptors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDescriptor {
    /// Logical stream name.
    pub name: String,
    /// Event types accepted by this stream, as a routing pattern.
    pub event_pattern: String,
    /// AMQP descriptor.
    pub queue: Option<QueueBinding>,
    /// Kafka descriptor.
    pub topic: Option<TopicBinding>,
}

impl StreamDescriptor {
    /// Create a stream accepting event types that match `event_pattern`.
    pub fn new(name: impl Into<String>, event_pattern: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            event_pattern: event_pattern.into(),
            queue: None,
            topic: None,
        }
    }

    /// Add a durable AMQP queue bound with the stream's event pattern.
    pub fn with_queue(mut self, exchange: impl Into<String>, queue: impl Into<String>) -> Self {
        self.queue = Some(QueueBinding {
            exchange: exchange.into(),
            queue: queue.into(),
            routing_key_pattern: self.event_pattern.clone(),
            durable: true,
        });
        self
    }

    /// Add an explicit AMQP binding.
    pub fn with_queue_binding(mut self, binding: QueueBinding) -> Self {
        self.queue = Some(binding);
        self
    }

    /// Add a Kafka topic.
    pub fn with_topic(mut self, topic: impl Into<String>, partition_key: PartitionKey) -> Self {
        self.topic = Some(TopicBinding {
            topic: topic.into(),
            partition_key,
        });
        self
    }

    /// Whether the stream has a descriptor for `kind`.
    pub fn supports(&self, kind: BrokerKind) -> bool {
        match kind {
            BrokerKind::Amqp => self.queue.is_some(),
            BrokerKind::Kafka => self.topic.is_some(),
        }
    }

    /// Whether an event of this type belongs on this stream.
    pub fn accepts(&self, event_type: &str) -> bool {
        routing_key_matches(&self.event_pattern, event_type)
    }
}

/// Immutable set of stream descriptors, declared once at startup.
#[derive(Debug, Clone)]
pub struct Topology {
    streams: HashMap<String, StreamDescriptor>,
}

impl Topology {
    /// Start declaring a topology.
    pub fn builder() -> TopologyBuilder {
        TopologyBuilder::default()
    }

    /// The deployed platform topology.
    ///
    /// Every stream is durable on both brokers. All AMQP bindings share the
    /// [`PLATFORM_EXCHANGE`] topic exchange.
    pub fn platform() -> Self {
        use streams::*;

        let index_stream = |name: &str, kind: &str| {
            StreamDescriptor::new(name, format!("index.{}.*", kind))
                .with_queue(PLATFORM_EXCHANGE, format!("search.{}.queue", kind))
                .with_topic(
                    format!("search-index-{}", kind),
                    PartitionKey::PayloadField("id".to_string()),
                )
        };

        Topology::builder()
            .stream(
                StreamDescriptor::new(USER_EVENTS, "user.*")
                    .with_queue(PLATFORM_EXCHANGE, "user.queue")
                    .with_topic("user-events", PartitionKey::PayloadField("email".to_string())),
            )
            .stream(
                StreamDescriptor::new(OCR_REQUESTS, "ocr.*")
                    .with_queue(PLATFORM_EXCHANGE, "ocr.queue")
                    .with_topic(
                        "ocr-requests",
                        PartitionKey::PayloadField("documentId".to_string()),
                    ),
            )
            .stream(index_stream(SEARCH_INDEX_DOCUMENT, "document"))
            .stream(index_stream(SEARCH_INDEX_USER, "user"))
            .stream(index_stream(SEARCH_INDEX_PAYMENT, "payment"))
            .stream(index_stream(SEARCH_INDEX_SUBSCRIPTION, "subscription"))
            .stream(
                StreamDescriptor::new(TEAM_EVENTS, "team.*")
                    .with_queue(PLATFORM_EXCHANGE, "team.queue")
                    .with_topic("team-events", PartitionKey::PayloadField("teamId".to_string())),
            )
            .build()
            .expect("platform topology is valid")
    }

    /// Look up a stream descriptor.
    pub fn stream(&self, name: &str) -> ConfigResult<&StreamDescriptor> {
        self.streams
            .get(name)
            .ok_or_else(|| ConfigurationError::UnknownStream(name.to_string()))
    }

    /// All declared streams.
    pub fn streams(&self) -> impl Iterator<Item = &StreamDescriptor> {
        self.streams.values()
    }

    /// Resolve a logical stream to its physical address on `kind`.
    pub fn resolve(&self, stream: &str, kind: BrokerKind) -> ConfigResult<PhysicalAddress> {
        let descriptor = self.stream(stream)?;
        let missing = || ConfigurationError::MissingDescriptor {
            stream: stream.to_string(),
            broker: kind,
        };

        match kind {
            BrokerKind::Amqp => descriptor
                .queue
                .clone()
                .map(PhysicalAddress::Queue)
                .ok_or_else(missing),
            BrokerKind::Kafka => descriptor
                .topic
                .clone()
                .map(PhysicalAddress::Topic)
                .ok_or_else(missing),
        }
    }

    /// Resolve the AMQP binding for `stream`.
    pub fn queue_binding(&self, stream: &str) -> ConfigResult<&QueueBinding> {
        self.stream(stream)?
            .queue
            .as_ref()
            .ok_or_else(|| ConfigurationError::MissingDescriptor {
                stream: stream.to_string(),
                broker: BrokerKind::Amqp,
            })
    }

    /// Resolve the Kafka binding for `stream`.
    pub fn topic_binding(&self, stream: &str) -> ConfigResult<&TopicBinding> {
        self.stream(stream)?
            .topic
            .as_ref()
            .ok_or_else(|| ConfigurationError::MissingDescriptor {
                stream: stream.to_string(),
                broker: BrokerKind::Kafka,
            })
    }

    /// Check that `event_type` may be published on `stream`.
    ///
    /// An event outside the stream's pattern would be silently dropped by an
    /// AMQP exchange, so both adapters refuse it up front.
    pub fn check_routable(&self, stream: &str, event_type: &str) -> Result<(), PublishError> {
        let descriptor = self.stream(stream)?;
        if descriptor.accepts(event_type) {
            Ok(())
        } else {
            Err(PublishError::Unroutable {
                stream: stream.to_string(),
                event_type: event_type.to_string(),
            })
        }
    }

    /// Streams on `kind` whose pattern accepts `event_type`.
    pub fn streams_for_event(&self, event_type: &str, kind: BrokerKind) -> Vec<&StreamDescriptor> {
        self.streams
            .values()
            .filter(|s| s.supports(kind) && s.accepts(event_type))
            .collect()
    }

    /// Queue bindings on `exchange` whose pattern matches `routing_key`.
    pub fn matching_queues<'a>(
        &'a self,
        exchange: &'a str,
        routing_key: &'a str,
    ) -> impl Iterator<Item = &'a QueueBinding> + 'a {
        self.streams.values().filter_map(move |s| {
            s.queue
                .as_ref()
                .filter(|q| q.exchange == exchange && routing_key_matches(&q.routing_key_pattern, routing_key))
        })
    }
}

/// Builder collecting stream declarations.
#[derive(Debug, Default)]
pub struct TopologyBuilder {
    streams: Vec<StreamDescriptor>,
}

impl TopologyBuilder {
    /// Declare a stream.
    pub fn stream(mut self, descriptor: StreamDescriptor) -> Self {
        self.streams.push(descriptor);
        self
    }

    /// Validate and freeze the topology.
    ///
    /// Fails on duplicate streams, invalid patterns, overlapping bindings on a
    /// shared exchange, or two streams sharing a Kafka topic.
    pub fn build(self) -> ConfigResult<Topology> {
        let mut streams: HashMap<String, StreamDescriptor> = HashMap::new();

        for descriptor in self.streams {
            validate_pattern(&descriptor.event_pattern)?;
            if let Some(ref queue) = descriptor.queue {
                validate_pattern(&queue.routing_key_pattern)?;
            }
            if streams.contains_key(&descriptor.name) {
                return Err(ConfigurationError::DuplicateStream(descriptor.name));
            }
            streams.insert(descriptor.name.clone(), descriptor);
        }

        let mut names: Vec<&String> = streams.keys().collect();
        names.sort();

        for (i, first_name) in names.iter().enumerate() {
            for second_name in &names[i + 1..] {
                let first = &streams[*first_name];
                let second = &streams[*second_name];

                if let (Some(a), Some(b)) = (&first.queue, &second.queue) {
                    if a.exchange == b.exchange
                        && a.queue != b.queue
                        && patterns_overlap(&a.routing_key_pattern, &b.routing_key_pattern)
                    {
                        return Err(ConfigurationError::OverlappingBindings {
                            exchange: a.exchange.clone(),
                            first_stream: first.name.clone(),
                            first: a.routing_key_pattern.clone(),
                            second_stream: second.name.clone(),
                            second: b.routing_key_pattern.clone(),
                        });
                    }
                }

                if let (Some(a), Some(b)) = (&first.topic, &second.topic) {
                    if a.topic == b.topic {
                        return Err(ConfigurationError::InvalidValue {
                            key: format!("topic {}", a.topic),
                            message: format!(
                                "shared by streams {} and {}",
                                first.name, second.name
                            ),
                        });
                    }
                }
            }
        }

        Ok(Topology { streams })
    }
}

/// Check a routing pattern: non-empty segments, wildcards only as whole segments.
pub fn validate_pattern(pattern: &str) -> ConfigResult<()> {
    let valid = !pattern.is_empty()
        && pattern.split('.').all(|segment| {
            !segment.is_empty()
                && (segment == "*"
                    || segment == "#"
                    || !segment.contains(|c| c == '*' || c == '#'))
        });

    if valid {
        Ok(())
    } else {
        Err(ConfigurationError::InvalidPattern(pattern.to_string()))
    }
}

/// Check if a routing key matches a topic-exchange pattern.
pub fn routing_key_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_segments(&pattern, &key)
}

fn match_segments(pattern: &[&str], key: &[&str]) -> bool {
    match (pattern.first(), key.first()) {
        (None, None) => true,
        (Some(&"#"), _) => {
            // Zero segments, or swallow one and try again
            match_segments(&pattern[1..], key)
                || (!key.is_empty() && match_segments(pattern, &key[1..]))
        }
        (Some(&"*"), Some(_)) => match_segments(&pattern[1..], &key[1..]),
        (Some(p), Some(k)) if p == k => match_segments(&pattern[1..], &key[1..]),
        _ => false,
    }
}

/// Check if some routing key exists that matches both patterns.
pub fn patterns_overlap(a: &str, b: &str) -> bool {
    let a: Vec<&str> = a.split('.').collect();
    let b: Vec<&str> = b.split('.').collect();
    overlap_segments(&a, &b)
}

fn overlap_segments(a: &[&str], b: &[&str]) -> bool {
    match (a.first(), b.first()) {
        (None, None) => true,
        (Some(&"#"), _) => {
            overlap_segments(&a[1..], b) || (!b.is_empty() && overlap_segments(a, &b[1..]))
        }
        (_, Some(&"#")) => {
            overlap_segments(a, &b[1..]) || (!a.is_empty() && overlap_segments(&a[1..], b))
        }
        (Some(x), Some(y)) if *x == "*" || *y == "*" || x == y => {
            overlap_segments(&a[1..], &b[1..])
        }
        _ => false,
    }
}
