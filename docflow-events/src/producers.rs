//! Typed producers for each business flow.
//!
//! Each producer builds a domain payload and publishes it through the shared
//! [`Publisher`]. A [`PublishError`](crate::error::PublishError) is returned to
//! the caller; producers never retry on their own.

use crate::error::PublishResult;
use crate::publisher::Publisher;
use crate::types::{
    DocumentClassified, IndexAction, IndexKind, IndexMutation, OcrCompleted, OcrRequested,
    TeamCreated, TeamMemberInvited, TeamMemberRemoved, TrialExpiring, UserRegistered,
};
use tracing::instrument;

/// Registration and account lifecycle.
#[derive(Debug, Clone)]
pub struct UserEventsProducer {
    publisher: Publisher,
}

impl UserEventsProducer {
    /// Create a producer.
    pub fn new(publisher: Publisher) -> Self {
        Self { publisher }
    }

    /// A user registered and needs to verify their email.
    #[instrument(skip(self, event), fields(email = %event.email))]
    pub async fn user_registered(&self, event: &UserRegistered) -> PublishResult<()> {
        self.publisher.emit(event).await
    }

    /// A user's trial ends soon.
    #[instrument(skip(self, event), fields(email = %event.email))]
    pub async fn trial_expiring(&self, event: &TrialExpiring) -> PublishResult<()> {
        self.publisher.emit(event).await
    }
}

/// OCR and classification pipeline.
#[derive(Debug, Clone)]
pub struct OcrProducer {
    publisher: Publisher,
}

impl OcrProducer {
    /// Create a producer.
    pub fn new(publisher: Publisher) -> Self {
        Self { publisher }
    }

    /// Request text extraction for an uploaded document.
    #[instrument(skip(self, event), fields(document_id = %event.document_id))]
    pub async fn request(&self, event: &OcrRequested) -> PublishResult<()> {
        self.publisher.emit(event).await
    }

    /// Report finished text extraction.
    #[instrument(skip(self, event), fields(document_id = %event.document_id))]
    pub async fn completed(&self, event: &OcrCompleted) -> PublishResult<()> {
        self.publisher.emit(event).await
    }

    /// Report a classification result.
    #[instrument(skip(self, event), fields(document_id = %event.document_id))]
    pub async fn classified(&self, event: &DocumentClassified) -> PublishResult<()> {
        self.publisher.emit(event).await
    }
}

/// Search index mutations.
#[derive(Debug, Clone)]
pub struct SearchIndexProducer {
    publisher: Publisher,
}

impl SearchIndexProducer {
    /// Create a producer.
    pub fn new(publisher: Publisher) -> Self {
        Self { publisher }
    }

    /// Publish an arbitrary mutation.
    #[instrument(skip(self, mutation), fields(index = %mutation.index, action = %mutation.action, id = %mutation.id))]
    pub async fn mutate(&self, mutation: &IndexMutation) -> PublishResult<()> {
        self.publisher.emit(mutation).await
    }

    /// Index a new entry.
    pub async fn create(
        &self,
        index: IndexKind,
        id: impl Into<String>,
        body: serde_json::Value,
    ) -> PublishResult<()> {
        self.mutate(&IndexMutation::upsert(index, IndexAction::Create, id, body))
            .await
    }

    /// Replace an existing entry.
    pub async fn update(
        &self,
        index: IndexKind,
        id: impl Into<String>,
        body: serde_json::Value,
    ) -> PublishResult<()> {
        self.mutate(&IndexMutation::upsert(index, IndexAction::Update, id, body))
            .await
    }

    /// Remove an entry.
    pub async fn delete(&self, index: IndexKind, id: impl Into<String>) -> PublishResult<()> {
        self.mutate(&IndexMutation::delete(index, id)).await
    }
}

/// Team lifecycle.
#[derive(Debug, Clone)]
pub struct TeamEventsProducer {
    publisher: Publisher,
}

impl TeamEventsProducer {
    /// Create a producer.
    pub fn new(publisher: Publisher) -> Self {
        Self { publisher }
    }

    /// A team was created.
    #[instrument(skip(self, event), fields(team_id = %event.team_id))]
    pub async fn created(&self, event: &TeamCreated) -> PublishResult<()> {
        self.publisher.emit(event).await
    }

    /// A member was invited.
    #[instrument(skip(self, event), fields(team_id = %event.team_id))]
    pub async fn member_invited(&self, event: &TeamMemberInvited) -> PublishResult<()> {
        self.publisher.emit(event).await
    }

    /// A member was removed.
    #[instrument(skip(self, event), fields(team_id = %event.team_id))]
    pub async fn member_removed(&self, event: &TeamMemberRemoved) -> PublishResult<()> {
        self.publisher.emit(event).await
    }
}
