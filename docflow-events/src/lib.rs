//! # Docflow Events
//!
//! Broker-agnostic messaging for the Docflow document-processing platform.
//! Producers in the API tier and handlers in the worker tier exchange
//! versioned event envelopes over RabbitMQ or Kafka without knowing which.
//!
//! ## Overview
//!
//! The docflow-events crate handles:
//! - **Envelope**: the versioned wire format every event travels in
//! - **Topology**: logical stream names mapped to exchanges, queues and topics
//! - **Broker port**: publish/subscribe contract with one adapter per broker
//! - **Dispatch**: event type → handler routing with per-stream failure policy
//! - **Consumer loops**: supervised receive loops with graceful shutdown
//! - **Producers**: typed publishers for the platform's domain events
//!
//! ## Features
//!
//! - `memory` (default): in-process queue and log brokers
//! - `amqp`: RabbitMQ adapter backed by `lapin`
//! - `kafka`: Kafka adapter backed by `rdkafka`
//!
//! ## Streams
//!
//! | Stream                       | Event types               |
//! |------------------------------|---------------------------|
//! | `user-events`                | `user.*`                  |
//! | `ocr-requests`               | `ocr.*`                   |
//! | `search-index.document`      | `index.document.*`        |
//! | `search-index.user`          | `index.user.*`            |
//! | `search-index.payment`       | `index.payment.*`         |
//! | `search-index.subscription`  | `index.subscription.*`    |
//! | `team-events`                | `team.*`                  |
//!
//! Patterns use topic wildcards: `*` matches exactly one segment and `#`
//! matches zero or more.
//!
//! ## Usage
//!
//! ### Publishing Events
//!
//! ```rust,no_run
//! use docflow_events::producers::UserEventsProducer;
//! use docflow_events::types::UserRegistered;
//! use docflow_events::{MessagingConfig, MessagingSystem, HandlerRegistry, Topology};
//! use std::sync::Arc;
//!
//! async fn publish_example() {
//!     let config = MessagingConfig::from_env().unwrap();
//!     let system = MessagingSystem::start(
//!         &config,
//!         Arc::new(Topology::platform()),
//!         Arc::new(HandlerRegistry::default()),
//!     )
//!     .await
//!     .unwrap();
//!
//!     let users = UserEventsProducer::new(system.publisher());
//!     users
//!         .user_registered(&UserRegistered {
//!             email: "ada@example.com".to_string(),
//!             first_name: "Ada".to_string(),
//!             last_name: "Lovelace".to_string(),
//!             verification_token: "tok123".to_string(),
//!             expiration: chrono::Utc::now(),
//!         })
//!         .await
//!         .unwrap();
//! }
//! ```
//!
//! ### Handling Events
//!
//! ```rust,no_run
//! use docflow_events::{HandlerRegistry, MessagingConfig, MessagingSystem, Topology};
//! use std::sync::Arc;
//!
//! async fn consume_example() {
//!     let registry = HandlerRegistry::builder()
//!         .register_fn("team.created", |envelope| async move {
//!             println!("team created: {}", envelope.payload());
//!             Ok(())
//!         })
//!         .unwrap()
//!         .build();
//!
//!     let system = MessagingSystem::start(
//!         &MessagingConfig::default(),
//!         Arc::new(Topology::platform()),
//!         Arc::new(registry),
//!     )
//!     .await
//!     .unwrap();
//!
//!     // ... serve traffic ...
//!
//!     system.shutdown().await;
//! }
//! ```

pub mod config;
pub mod consumer;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod port;
pub mod producers;
pub mod publisher;
pub mod registry;
pub mod retry;
pub mod stats;
pub mod system;
pub mod topology;
pub mod types;

#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "amqp")]
pub mod amqp;

#[cfg(feature = "kafka")]
pub mod kafka;

// Re-export main types
pub use config::{AmqpSettings, BrokerSelection, KafkaSettings, MessagingConfig};
pub use consumer::{ConsumerHandle, ConsumerLoop, ConsumerState};
pub use dispatcher::{DeliveryPolicy, Dispatcher, Exhausted};
pub use envelope::{current_correlation_id, with_correlation, Envelope, SCHEMA_VERSION};
pub use error::{
    ConfigResult, ConfigurationError, DecodeError, HandlerError, HandlerOutcome, PublishError,
    PublishResult, SettleError, StartError, SubscribeError, SubscribeResult,
};
pub use port::{Acknowledgement, BrokerPort, Delivery, EnvelopeCallback, Inbox, Settle};
pub use publisher::Publisher;
pub use registry::{DispatchOutcome, EventHandler, FnHandler, HandlerRegistry, HandlerRegistryBuilder};
pub use retry::RetryConfig;
pub use stats::{MessagingStats, StatsRecorder};
pub use system::{connect_broker, MessagingSystem};
pub use topology::{streams, BrokerKind, PartitionKey, StreamDescriptor, Topology};
pub use types::DomainEvent;

#[cfg(feature = "memory")]
pub use memory::{MemoryLogBroker, MemoryQueueBroker};

#[cfg(feature = "amqp")]
pub use amqp::AmqpBroker;

#[cfg(feature = "kafka")]
pub use kafka::KafkaBroker;
