//! Error types for the messaging layer
//!
//! Each failure class has its own type so that callers can tell a startup
//! misconfiguration apart from a broker outage or a bad inbound message:
//!
//! - [`ConfigurationError`]: fatal at startup, the process must not serve traffic
//! - [`PublishError`]: returned synchronously to the producer's caller
//! - [`DecodeError`]: malformed inbound message, acknowledged and discarded
//! - [`HandlerError`]: a handler failed on a structurally valid envelope
//! - [`StartError`]: the subsystem could not be brought up

use crate::topology::BrokerKind;
use std::time::Duration;
use thiserror::Error;

/// Startup configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    /// No descriptor is declared for this logical stream
    #[error("Unknown stream: {0}")]
    UnknownStream(String),

    /// The stream exists but has no descriptor for the requested broker
    #[error("Stream {stream} has no {broker} descriptor")]
    MissingDescriptor {
        /// Logical stream name.
        stream: String,
        /// Broker technology that was requested.
        broker: BrokerKind,
    },

    /// The same logical stream was declared twice
    #[error("Stream declared twice: {0}")]
    DuplicateStream(String),

    /// Two handlers were registered for one event type
    #[error("Duplicate handler registration for event type: {0}")]
    DuplicateHandler(String),

    /// Two queue bindings on one exchange can match the same routing key
    #[error("Routing patterns {first} ({first_stream}) and {second} ({second_stream}) overlap on exchange {exchange}")]
    OverlappingBindings {
        /// Exchange shared by both bindings.
        exchange: String,
        /// First stream.
        first_stream: String,
        /// First routing pattern.
        first: String,
        /// Second stream.
        second_stream: String,
        /// Second routing pattern.
        second: String,
    },

    /// A routing pattern or event type is not a valid dot-segment key
    #[error("Invalid routing pattern: {0}")]
    InvalidPattern(String),

    /// A registered event type does not route to exactly one stream
    #[error("Event type {event_type} routes to {matches} streams on {broker}, expected exactly one")]
    UnroutableEventType {
        /// Event type tag.
        event_type: String,
        /// Active broker technology.
        broker: BrokerKind,
        /// Number of matching streams.
        matches: usize,
    },

    /// Invalid configuration value
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue {
        /// Configuration key.
        key: String,
        /// Error message.
        message: String,
    },

    /// The selected broker adapter was not compiled in
    #[error("Broker adapter not available in this build: {0}")]
    AdapterUnavailable(BrokerKind),
}

/// Errors returned to producers from `publish`.
#[derive(Debug, Error)]
pub enum PublishError {
    /// Broker could not be reached or refused the message
    #[error("Broker unreachable: {0}")]
    Unreachable(String),

    /// Envelope could not be serialized
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Stream could not be resolved to a physical address
    #[error("Address resolution failed: {0}")]
    Resolution(#[from] ConfigurationError),

    /// The stream's binding would drop this event type
    #[error("Event type {event_type} is not routable on stream {stream}")]
    Unroutable {
        /// Logical stream name.
        stream: String,
        /// Event type tag.
        event_type: String,
    },

    /// The broker did not confirm within the publish timeout
    #[error("Publish timed out after {0:?}")]
    Timeout(Duration),

    /// The messaging subsystem is shutting down
    #[error("Messaging subsystem is shutting down")]
    ShuttingDown,
}

impl PublishError {
    /// Whether a producer may reasonably retry this failure later.
    pub fn is_transient(&self) -> bool {
        matches!(self, PublishError::Unreachable(_) | PublishError::Timeout(_))
    }
}

/// Errors opening a consumer on a stream.
#[derive(Debug, Error)]
pub enum SubscribeError {
    /// Stream could not be resolved to a physical address
    #[error("Address resolution failed: {0}")]
    Resolution(#[from] ConfigurationError),

    /// Broker connection failed
    #[error("Connection error: {0}")]
    Connection(String),

    /// Broker rejected the subscription
    #[error("Failed to subscribe: {0}")]
    Rejected(String),
}

/// Errors bringing the messaging subsystem up.
#[derive(Debug, Error)]
pub enum StartError {
    /// Topology, registry or settings are inconsistent
    #[error("Messaging misconfigured: {0}")]
    Configuration(#[from] ConfigurationError),

    /// A broker connection or subscription could not be established
    #[error("Messaging startup failed: {0}")]
    Subscribe(#[from] SubscribeError),
}

/// Malformed inbound message.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Body is not a valid envelope document
    #[error("Malformed envelope: {0}")]
    Malformed(String),

    /// A required field is present but empty
    #[error("Envelope field {0} is empty")]
    EmptyField(&'static str),

    /// Produced by a newer schema than this consumer understands
    #[error("Unsupported schema version {found} (max {supported})")]
    UnsupportedSchemaVersion {
        /// Version found on the wire.
        found: u32,
        /// Highest version this build reads.
        supported: u32,
    },
}

/// Failure reported by an event handler.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandlerError {
    /// Downstream dependency failed; a later attempt may succeed
    #[error("Transient handler failure: {0}")]
    Transient(String),

    /// The event can never be processed successfully
    #[error("Permanent handler failure: {0}")]
    Permanent(String),

    /// Payload did not match the handler's expected shape
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
}

impl HandlerError {
    /// Whether retrying the same envelope may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, HandlerError::Transient(_))
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::InvalidPayload(err.to_string())
    }
}

impl From<PublishError> for HandlerError {
    fn from(err: PublishError) -> Self {
        if err.is_transient() {
            HandlerError::Transient(err.to_string())
        } else {
            HandlerError::Permanent(err.to_string())
        }
    }
}

/// Failure settling (acking / nacking) a delivery with the broker.
#[derive(Debug, Error)]
#[error("Failed to settle delivery: {0}")]
pub struct SettleError(pub String);

/// Result type for publish operations.
pub type PublishResult<T> = Result<T, PublishError>;

/// Result type for subscribe operations.
pub type SubscribeResult<T> = Result<T, SubscribeError>;

/// Result type for startup configuration.
pub type ConfigResult<T> = Result<T, ConfigurationError>;

/// Outcome of a single handler invocation.
pub type HandlerOutcome = Result<(), HandlerError>;
