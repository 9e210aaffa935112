//! Typed domain events
//!
//! Payload structs for every event the platform publishes. Each implements
//! [`DomainEvent`], which names its type tag and the logical stream it is
//! published on. Payload fields are camelCase on the wire.

use crate::envelope::Envelope;
use crate::topology::streams;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use uuid::Uuid;

/// A payload with a fixed type tag and stream.
pub trait DomainEvent: Serialize {
    /// Event type tag, e.g. `user.registered`.
    fn event_type(&self) -> Cow<'static, str>;

    /// Logical stream the event is published on.
    fn stream(&self) -> &'static str;

    /// Wrap the payload in a new envelope.
    fn to_envelope(&self) -> Result<Envelope, serde_json::Error>
    where
        Self: Sized,
    {
        Envelope::from_payload(self.event_type(), self)
    }
}

// ============================================================================
// User Events
// ============================================================================

/// A user signed up and must verify their email address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRegistered {
    /// Address to verify
    pub email: String,
    /// Given name
    pub first_name: String,
    /// Family name
    pub last_name: String,
    /// One-time verification token
    pub verification_token: String,
    /// When the token stops being accepted
    pub expiration: DateTime<Utc>,
}

impl UserRegistered {
    /// Event type tag.
    pub const EVENT_TYPE: &'static str = "user.registered";
}

impl DomainEvent for UserRegistered {
    fn event_type(&self) -> Cow<'static, str> {
        Cow::Borrowed(Self::EVENT_TYPE)
    }

    fn stream(&self) -> &'static str {
        streams::USER_EVENTS
    }
}

/// A user's trial is about to end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialExpiring {
    /// Account email
    pub email: String,
    /// Given name
    pub first_name: String,
    /// End of the trial period
    pub trial_ends_at: DateTime<Utc>,
    /// Whole days left
    pub days_remaining: u32,
}

impl TrialExpiring {
    /// Event type tag.
    pub const EVENT_TYPE: &'static str = "user.trial_expiring";
}

impl DomainEvent for TrialExpiring {
    fn event_type(&self) -> Cow<'static, str> {
        Cow::Borrowed(Self::EVENT_TYPE)
    }

    fn stream(&self) -> &'static str {
        streams::USER_EVENTS
    }
}

// ============================================================================
// OCR Pipeline Events
// ============================================================================

/// An uploaded document needs text extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OcrRequested {
    /// Document to process
    pub document_id: Uuid,
    /// Object storage key of the original file
    pub storage_key: String,
    /// MIME type of the original file
    pub mime_type: String,
    /// ISO 639-1 language hint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// User who uploaded the document
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_by: Option<Uuid>,
}

impl OcrRequested {
    /// Event type tag.
    pub const EVENT_TYPE: &'static str = "ocr.requested";
}

impl DomainEvent for OcrRequested {
    fn event_type(&self) -> Cow<'static, str> {
        Cow::Borrowed(Self::EVENT_TYPE)
    }

    fn stream(&self) -> &'static str {
        streams::OCR_REQUESTS
    }
}

/// Text extraction finished for a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OcrCompleted {
    /// Processed document
    pub document_id: Uuid,
    /// Extracted plain text
    pub text: String,
    /// Number of pages read
    pub page_count: u32,
    /// Mean recognition confidence in `[0, 1]`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

impl OcrCompleted {
    /// Event type tag.
    pub const EVENT_TYPE: &'static str = "ocr.completed";
}

impl DomainEvent for OcrCompleted {
    fn event_type(&self) -> Cow<'static, str> {
        Cow::Borrowed(Self::EVENT_TYPE)
    }

    fn stream(&self) -> &'static str {
        streams::OCR_REQUESTS
    }
}

/// AI classification assigned a category to a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentClassified {
    /// Classified document
    pub document_id: Uuid,
    /// Primary category, e.g. `invoice`
    pub category: String,
    /// Classifier confidence in `[0, 1]`
    pub confidence: f32,
    /// Secondary labels
    #[serde(default)]
    pub labels: Vec<String>,
}

impl DocumentClassified {
    /// Event type tag.
    pub const EVENT_TYPE: &'static str = "ocr.classified";
}

impl DomainEvent for DocumentClassified {
    fn event_type(&self) -> Cow<'static, str> {
        Cow::Borrowed(Self::EVENT_TYPE)
    }

    fn stream(&self) -> &'static str {
        streams::OCR_REQUESTS
    }
}

// ============================================================================
// Search Index Events
// ============================================================================

/// Search index a mutation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexKind {
    /// Documents and their extracted text
    Document,
    /// User accounts
    User,
    /// Payments
    Payment,
    /// Subscriptions
    Subscription,
}

impl IndexKind {
    /// All index kinds.
    pub const ALL: [IndexKind; 4] = [
        IndexKind::Document,
        IndexKind::User,
        IndexKind::Payment,
        IndexKind::Subscription,
    ];

    /// Segment used in event types and index names.
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexKind::Document => "document",
            IndexKind::User => "user",
            IndexKind::Payment => "payment",
            IndexKind::Subscription => "subscription",
        }
    }

    /// Parse from an event type segment.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == s)
    }

    /// Stream carrying mutations for this index.
    pub fn stream(&self) -> &'static str {
        match self {
            IndexKind::Document => streams::SEARCH_INDEX_DOCUMENT,
            IndexKind::User => streams::SEARCH_INDEX_USER,
            IndexKind::Payment => streams::SEARCH_INDEX_PAYMENT,
            IndexKind::Subscription => streams::SEARCH_INDEX_SUBSCRIPTION,
        }
    }
}

impl fmt::Display for IndexKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operation applied to an index entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexAction {
    /// Insert a new entry
    Create,
    /// Replace an existing entry
    Update,
    /// Remove an entry
    Delete,
}

impl IndexAction {
    /// All actions.
    pub const ALL: [IndexAction; 3] = [IndexAction::Create, IndexAction::Update, IndexAction::Delete];

    /// Segment used in event types.
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexAction::Create => "create",
            IndexAction::Update => "update",
            IndexAction::Delete => "delete",
        }
    }

    /// Parse from an event type segment.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|action| action.as_str() == s)
    }
}

impl fmt::Display for IndexAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A search index mutation, published as `index.<kind>.<action>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexMutation {
    /// Target index
    pub index: IndexKind,
    /// Operation
    pub action: IndexAction,
    /// Entry id within the index
    pub id: String,
    /// Entry body; absent for deletes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
}

impl IndexMutation {
    /// Create or replace an entry.
    pub fn upsert(
        index: IndexKind,
        action: IndexAction,
        id: impl Into<String>,
        body: serde_json::Value,
    ) -> Self {
        Self {
            index,
            action,
            id: id.into(),
            body: Some(body),
        }
    }

    /// Remove an entry.
    pub fn delete(index: IndexKind, id: impl Into<String>) -> Self {
        Self {
            index,
            action: IndexAction::Delete,
            id: id.into(),
            body: None,
        }
    }

    /// Event type for a kind and action.
    pub fn event_type_for(index: IndexKind, action: IndexAction) -> String {
        format!("index.{}.{}", index, action)
    }

    /// Split an `index.<kind>.<action>` event type.
    pub fn parse_event_type(event_type: &str) -> Option<(IndexKind, IndexAction)> {
        let mut segments = event_type.split('.');
        match (segments.next(), segments.next(), segments.next(), segments.next()) {
            (Some("index"), Some(kind), Some(action), None) => {
                Some((IndexKind::parse(kind)?, IndexAction::parse(action)?))
            }
            _ => None,
        }
    }
}

impl DomainEvent for IndexMutation {
    fn event_type(&self) -> Cow<'static, str> {
        Cow::Owned(Self::event_type_for(self.index, self.action))
    }

    fn stream(&self) -> &'static str {
        self.index.stream()
    }
}

// ============================================================================
// Team Events
// ============================================================================

/// A team was created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamCreated {
    /// New team
    pub team_id: Uuid,
    /// Display name
    pub team_name: String,
    /// Owner's email
    pub owner_email: String,
    /// Owner's display name
    pub owner_name: String,
}

impl TeamCreated {
    /// Event type tag.
    pub const EVENT_TYPE: &'static str = "team.created";
}

impl DomainEvent for TeamCreated {
    fn event_type(&self) -> Cow<'static, str> {
        Cow::Borrowed(Self::EVENT_TYPE)
    }

    fn stream(&self) -> &'static str {
        streams::TEAM_EVENTS
    }
}

/// Someone was invited to join a team.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamMemberInvited {
    /// Team
    pub team_id: Uuid,
    /// Team display name
    pub team_name: String,
    /// Invitee's email
    pub email: String,
    /// Display name of the inviting member
    pub invited_by: String,
    /// One-time invitation token
    pub invitation_token: String,
    /// When the invitation lapses
    pub expiration: DateTime<Utc>,
}

impl TeamMemberInvited {
    /// Event type tag.
    pub const EVENT_TYPE: &'static str = "team.member_invited";
}

impl DomainEvent for TeamMemberInvited {
    fn event_type(&self) -> Cow<'static, str> {
        Cow::Borrowed(Self::EVENT_TYPE)
    }

    fn stream(&self) -> &'static str {
        streams::TEAM_EVENTS
    }
}

/// A member was removed from a team.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamMemberRemoved {
    /// Team
    pub team_id: Uuid,
    /// Team display name
    pub team_name: String,
    /// Removed member's email
    pub email: String,
}

impl TeamMemberRemoved {
    /// Event type tag.
    pub const EVENT_TYPE: &'static str = "team.member_removed";
}

impl DomainEvent for TeamMemberRemoved {
    fn event_type(&self) -> Cow<'static, str> {
        Cow::Borrowed(Self::EVENT_TYPE)
    }

    fn stream(&self) -> &'static str {
        streams::TEAM_EVENTS
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{BrokerKind, Topology};
    use serde_json::json;

    #[test]
    fn test_user_registered_wire_shape() {
        let payload: UserRegistered = serde_json::from_value(json!({
            "email": "a@b.com",
            "firstName": "A",
            "lastName": "B",
            "verificationToken": "tok123",
            "expiration": "2024-01-01T00:00:00Z"
        }))
        .unwrap();

        assert_eq!(payload.verification_token, "tok123");

        let envelope = payload.to_envelope().unwrap();
        assert_eq!(envelope.event_type(), "user.registered");
        assert_eq!(envelope.payload()["firstName"], "A");
    }

    #[test]
    fn test_index_mutation_event_type() {
        let mutation = IndexMutation::upsert(
            IndexKind::Payment,
            IndexAction::Update,
            "pay_1",
            json!({"amount": 100}),
        );
        assert_eq!(mutation.event_type(), "index.payment.update");
        assert_eq!(mutation.stream(), streams::SEARCH_INDEX_PAYMENT);

        let delete = IndexMutation::delete(IndexKind::User, "u1");
        let value = serde_json::to_value(&delete).unwrap();
        assert_eq!(value, json!({"index": "user", "action": "delete", "id": "u1"}));
    }

    #[test]
    fn test_parse_index_event_type() {
        assert_eq!(
            IndexMutation::parse_event_type("index.subscription.delete"),
            Some((IndexKind::Subscription, IndexAction::Delete))
        );
        assert_eq!(IndexMutation::parse_event_type("index.invoice.create"), None);
        assert_eq!(IndexMutation::parse_event_type("index.user.create.extra"), None);
        assert_eq!(IndexMutation::parse_event_type("user.registered"), None);
    }

    #[test]
    fn test_every_event_routes_to_its_stream() {
        let topology = Topology::platform();
        let document_id = Uuid::now_v7();

        let events: Vec<(String, &'static str)> = vec![
            (UserRegistered::EVENT_TYPE.into(), streams::USER_EVENTS),
            (TrialExpiring::EVENT_TYPE.into(), streams::USER_EVENTS),
            (OcrRequested::EVENT_TYPE.into(), streams::OCR_REQUESTS),
            (OcrCompleted::EVENT_TYPE.into(), streams::OCR_REQUESTS),
            (DocumentClassified::EVENT_TYPE.into(), streams::OCR_REQUESTS),
            (TeamCreated::EVENT_TYPE.into(), streams::TEAM_EVENTS),
            (TeamMemberInvited::EVENT_TYPE.into(), streams::TEAM_EVENTS),
            (TeamMemberRemoved::EVENT_TYPE.into(), streams::TEAM_EVENTS),
            (
                IndexMutation::delete(IndexKind::Document, document_id.to_string())
                    .event_type()
                    .into_owned(),
                streams::SEARCH_INDEX_DOCUMENT,
            ),
        ];

        for (event_type, stream) in events {
            for kind in [BrokerKind::Amqp, BrokerKind::Kafka] {
                let matched: Vec<&str> = topology
                    .streams_for_event(&event_type, kind)
                    .into_iter()
                    .map(|d| d.name.as_str())
                    .collect();
                assert_eq!(matched, vec![stream], "{} on {}", event_type, kind);
            }
        }
    }
}
