//! In-process partitioned log broker.

use super::lock;
use crate::envelope::Envelope;
use crate::error::{PublishError, PublishResult, SettleError, SubscribeResult};
use crate::port::{Acknowledgement, BrokerPort, Delivery, Inbox, Settle};
use crate::topology::{BrokerKind, Topology};
use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::debug;

/// Partitions per topic unless configured otherwise.
pub const DEFAULT_PARTITIONS: usize = 4;

#[derive(Debug, Clone)]
struct Record {
    key: String,
    body: Vec<u8>,
}

#[derive(Debug)]
struct TopicState {
    partitions: Vec<Vec<Record>>,
    // Consumer group bookkeeping, one slot per partition
    positions: Vec<usize>,
    committed: Vec<usize>,
    fetched: Vec<usize>,
    cursor: usize,
}

impl TopicState {
    fn new(partitions: usize) -> Self {
        Self {
            partitions: vec![Vec::new(); partitions],
            positions: vec![0; partitions],
            committed: vec![0; partitions],
            fetched: vec![0; partitions],
            cursor: 0,
        }
    }

    fn fetch(&mut self) -> Option<(usize, usize, Record, bool)> {
        let count = self.partitions.len();

        for i in 0..count {
            let partition = (self.cursor + i) % count;
            let offset = self.positions[partition];

            if let Some(record) = self.partitions[partition].get(offset) {
                let record = record.clone();
                let redelivered = offset < self.fetched[partition];

                self.positions[partition] = offset + 1;
                self.fetched[partition] = self.fetched[partition].max(offset + 1);
                self.cursor = (partition + 1) % count;
                return Some((partition, offset, record, redelivered));
            }
        }

        None
    }

    fn commit(&mut self, partition: usize, next_offset: usize) {
        let committed = &mut self.committed[partition];
        *committed = (*committed).max(next_offset);
    }
}

#[derive(Debug)]
struct TopicLog {
    state: Mutex<TopicState>,
    notify: Notify,
}

impl TopicLog {
    fn new(partitions: usize) -> Self {
        Self {
            state: Mutex::new(TopicState::new(partitions.max(1))),
            notify: Notify::new(),
        }
    }

    fn append(&self, record: Record) -> (usize, usize) {
        let mut state = lock(&self.state);
        let partition = partition_for(&record.key, state.partitions.len());
        let log = &mut state.partitions[partition];
        log.push(record);
        let offset = log.len() - 1;
        drop(state);

        self.notify.notify_one();
        (partition, offset)
    }
}

fn partition_for(key: &str, partitions: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % partitions as u64) as usize
}

/// Broker emulating Kafka topics with a single consumer group.
///
/// Each stream's topic is split into partitions; the partition is chosen by
/// hashing the key produced by the stream's partition-key rule, so events
/// sharing a key stay ordered. Offsets advance on `Ack` and `DeadLetter`;
/// `Requeue` rewinds the partition to the message. Dead letters are appended
/// to `<topic>.dlq`.
#[derive(Clone)]
pub struct MemoryLogBroker {
    topology: Arc<Topology>,
    topics: Arc<HashMap<String, Arc<TopicLog>>>,
}

impl fmt::Debug for MemoryLogBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.topics.keys().collect();
        names.sort();
        f.debug_struct("MemoryLogBroker")
            .field("topics", &names)
            .finish()
    }
}

impl MemoryLogBroker {
    /// Create every topic in `topology` with [`DEFAULT_PARTITIONS`].
    pub fn new(topology: Arc<Topology>) -> Self {
        Self::with_partitions(topology, DEFAULT_PARTITIONS)
    }

    /// Create every topic in `topology` with `partitions` partitions.
    pub fn with_partitions(topology: Arc<Topology>, partitions: usize) -> Self {
        let mut topics = HashMap::new();
        for binding in topology.streams().filter_map(|s| s.topic.as_ref()) {
            topics.insert(binding.topic.clone(), Arc::new(TopicLog::new(partitions)));
            topics.insert(binding.dead_letter_topic(), Arc::new(TopicLog::new(1)));
        }

        Self {
            topology,
            topics: Arc::new(topics),
        }
    }

    fn topic_for(&self, stream: &str) -> Option<&Arc<TopicLog>> {
        let binding = self.topology.topic_binding(stream).ok()?;
        self.topics.get(&binding.topic)
    }

    fn dead_letter_topic_for(&self, stream: &str) -> Option<Arc<TopicLog>> {
        let binding = self.topology.topic_binding(stream).ok()?;
        self.topics.get(&binding.dead_letter_topic()).cloned()
    }

    /// Number of records per partition of the stream's topic.
    pub fn partition_sizes(&self, stream: &str) -> Vec<usize> {
        self.topic_for(stream)
            .map(|t| lock(&t.state).partitions.iter().map(Vec::len).collect())
            .unwrap_or_default()
    }

    /// Committed group offsets per partition of the stream's topic.
    pub fn committed_offsets(&self, stream: &str) -> Vec<usize> {
        self.topic_for(stream)
            .map(|t| lock(&t.state).committed.clone())
            .unwrap_or_default()
    }

    /// Raw bodies appended to the stream's dead-letter topic.
    pub fn dead_letters(&self, stream: &str) -> Vec<Vec<u8>> {
        self.dead_letter_topic_for(stream)
            .map(|t| {
                lock(&t.state)
                    .partitions
                    .iter()
                    .flatten()
                    .map(|r| r.body.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Append raw bytes to the stream's topic, bypassing envelope checks.
    pub fn inject(&self, stream: &str, key: &str, body: Vec<u8>) -> PublishResult<(usize, usize)> {
        let binding = self.topology.topic_binding(stream)?;
        let topic = self.topics.get(&binding.topic).ok_or_else(|| {
            PublishError::Unreachable(format!("topic {} does not exist", binding.topic))
        })?;

        Ok(topic.append(Record {
            key: key.to_string(),
            body,
        }))
    }
}

#[async_trait]
impl BrokerPort for MemoryLogBroker {
    fn kind(&self) -> BrokerKind {
        BrokerKind::Kafka
    }

    async fn publish(&self, stream: &str, envelope: &Envelope) -> PublishResult<()> {
        self.topology.check_routable(stream, envelope.event_type())?;

        let binding = self.topology.topic_binding(stream)?;
        let key = binding.partition_key.extract(envelope);
        let body = envelope
            .encode()
            .map_err(|e| PublishError::Serialization(e.to_string()))?;

        let (partition, offset) = self.inject(stream, &key, body)?;
        debug!(
            stream,
            topic = %binding.topic,
            partition,
            offset,
            "Appended message to memory log"
        );
        Ok(())
    }

    async fn open(&self, stream: &str) -> SubscribeResult<Box<dyn Inbox>> {
        let binding = self.topology.topic_binding(stream)?;
        let topic = self
            .topics
            .get(&binding.topic)
            .cloned()
            .unwrap_or_else(|| Arc::new(TopicLog::new(DEFAULT_PARTITIONS)));
        let dead_letters = self
            .topics
            .get(&binding.dead_letter_topic())
            .cloned()
            .unwrap_or_else(|| Arc::new(TopicLog::new(1)));

        Ok(Box::new(TopicInbox {
            topic,
            dead_letters,
        }))
    }
}

struct TopicInbox {
    topic: Arc<TopicLog>,
    dead_letters: Arc<TopicLog>,
}

#[async_trait]
impl Inbox for TopicInbox {
    async fn next(&mut self) -> Option<Delivery> {
        loop {
            let fetched = lock(&self.topic.state).fetch();
            if let Some((partition, offset, record, redelivered)) = fetched {
                let settle = TopicSettle {
                    topic: self.topic.clone(),
                    dead_letters: self.dead_letters.clone(),
                    partition,
                    offset,
                    record: record.clone(),
                };
                return Some(Delivery::new(record.body, redelivered, Box::new(settle)));
            }
            self.topic.notify.notified().await;
        }
    }
}

struct TopicSettle {
    topic: Arc<TopicLog>,
    dead_letters: Arc<TopicLog>,
    partition: usize,
    offset: usize,
    record: Record,
}

#[async_trait]
impl Settle for TopicSettle {
    async fn settle(self: Box<Self>, ack: Acknowledgement) -> Result<(), SettleError> {
        match ack {
            Acknowledgement::Ack => {
                lock(&self.topic.state).commit(self.partition, self.offset + 1);
            }
            Acknowledgement::Requeue => {
                {
                    let mut state = lock(&self.topic.state);
                    let position = &mut state.positions[self.partition];
                    *position = (*position).min(self.offset);
                }
                self.topic.notify.notify_one();
            }
            Acknowledgement::DeadLetter => {
                self.dead_letters.append(self.record.clone());
                lock(&self.topic.state).commit(self.partition, self.offset + 1);
            }
        }
        Ok(())
    }
}
