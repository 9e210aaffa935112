//! Event envelope
//!
//! Every event crosses the broker wrapped in an [`Envelope`]: a type tag, a
//! JSON payload and delivery metadata. The wire shape is fixed for
//! interoperability with already-deployed producers and consumers:
//!
//! ```json
//! {
//!   "eventType": "user.registered",
//!   "payload": { "email": "a@b.com" },
//!   "correlationId": "0190c4e2-...",
//!   "timestamp": "2024-01-01T00:00:00.123456789Z",
//!   "schemaVersion": 1
//! }
//! ```
//!
//! ## Correlation
//!
//! While a handler runs, the dispatcher installs the incoming envelope's
//! correlation id in a task-local scope. Envelopes created inside that scope
//! reuse it, so side-effect events carry the original id forward without the
//! handler threading it through by hand. Work moved onto a freshly spawned
//! task leaves the scope; use [`Envelope::caused_by`] there.

use crate::error::DecodeError;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::future::Future;
use uuid::Uuid;

/// Schema version stamped on every envelope this build produces.
pub const SCHEMA_VERSION: u32 = 1;

tokio::task_local! {
    static CORRELATION_ID: String;
}

/// Correlation id of the envelope currently being handled on this task, if any.
pub fn current_correlation_id() -> Option<String> {
    CORRELATION_ID.try_with(|id| id.clone()).ok()
}

/// Run `fut` with `correlation_id` installed as the current correlation scope.
pub async fn with_correlation<F>(correlation_id: String, fut: F) -> F::Output
where
    F: Future,
{
    CORRELATION_ID.scope(correlation_id, fut).await
}

/// Immutable event envelope.
///
/// Fields are private: an envelope is created once by a producer and only
/// read afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    event_type: String,
    payload: serde_json::Value,
    correlation_id: String,
    timestamp: DateTime<Utc>,
    schema_version: u32,
}

impl Envelope {
    /// Create a new envelope.
    ///
    /// Stamps the current time and [`SCHEMA_VERSION`]. The correlation id is
    /// taken from the current handler scope when there is one, otherwise a
    /// fresh UUIDv7 is minted.
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        let correlation_id =
            current_correlation_id().unwrap_or_else(|| Uuid::now_v7().to_string());

        Self {
            event_type: event_type.into(),
            payload,
            correlation_id,
            timestamp: Utc::now(),
            schema_version: SCHEMA_VERSION,
        }
    }

    /// Create an envelope caused by `parent`, carrying its correlation id.
    pub fn caused_by(
        parent: &Envelope,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self::new(event_type, payload).with_correlation_id(parent.correlation_id.clone())
    }

    /// Create an envelope from a serializable payload.
    pub fn from_payload<T: Serialize>(
        event_type: impl Into<String>,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(event_type, serde_json::to_value(payload)?))
    }

    /// Override the correlation id during construction.
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    /// Event type tag.
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Raw JSON payload.
    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    /// Correlation id propagated across producer/consumer hops.
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Creation time.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Schema version of the producer.
    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    /// Parse the payload into a specific type.
    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }

    /// Serialize to the JSON wire format.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parse and validate an envelope from the JSON wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let envelope: Envelope =
            serde_json::from_slice(bytes).map_err(|e| DecodeError::Malformed(e.to_string()))?;

        if envelope.event_type.trim().is_empty() {
            return Err(DecodeError::EmptyField("eventType"));
        }
        if envelope.correlation_id.trim().is_empty() {
            return Err(DecodeError::EmptyField("correlationId"));
        }
        if envelope.schema_version > SCHEMA_VERSION {
            return Err(DecodeError::UnsupportedSchemaVersion {
                found: envelope.schema_version,
                supported: SCHEMA_VERSION,
            });
        }

        Ok(envelope)
    }
}
