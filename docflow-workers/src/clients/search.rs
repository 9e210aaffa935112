//! Search cluster client.
//!
//! Talks to an Elasticsearch-compatible REST API. Each [`IndexKind`] maps to
//! one index named `<prefix>-<kind>`. Entries are written with
//! `PUT /<index>/_doc/<id>`, merged with `POST /<index>/_update/<id>` and
//! removed with `DELETE /<index>/_doc/<id>`.

use crate::config::ServiceEndpoint;
use async_trait::async_trait;
use docflow_events::types::IndexKind;
use docflow_events::HandlerError;
use reqwest::{Client, StatusCode};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// Search client errors.
#[derive(Debug, Error)]
pub enum SearchError {
    /// HTTP request failed.
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    /// API returned an error response.
    #[error("API error ({status}): {message}")]
    ApiError {
        /// HTTP status code.
        status: u16,
        /// Error message from the API.
        message: String,
    },

    /// The mutation carried no document body.
    #[error("Missing document body for {0}")]
    MissingBody(String),
}

impl SearchError {
    /// Whether retrying the call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            SearchError::RequestFailed(_) => true,
            SearchError::ApiError { status, .. } => *status == 429 || *status >= 500,
            SearchError::MissingBody(_) => false,
        }
    }
}

impl From<SearchError> for HandlerError {
    fn from(err: SearchError) -> Self {
        match err {
            SearchError::MissingBody(_) => HandlerError::InvalidPayload(err.to_string()),
            _ if err.is_transient() => HandlerError::Transient(err.to_string()),
            _ => HandlerError::Permanent(err.to_string()),
        }
    }
}

/// Outbound port for search index writes.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Create or replace the entry `id` in `index`.
    async fn upsert(
        &self,
        index: IndexKind,
        id: &str,
        body: &serde_json::Value,
    ) -> Result<(), SearchError>;

    /// Merge `fields` into the entry `id`, creating it if absent.
    async fn update(
        &self,
        index: IndexKind,
        id: &str,
        fields: &serde_json::Value,
    ) -> Result<(), SearchError>;

    /// Remove the entry `id` from `index`. Removing a missing entry succeeds.
    async fn delete(&self, index: IndexKind, id: &str) -> Result<(), SearchError>;
}

/// Search index backed by an Elasticsearch-compatible cluster.
#[derive(Clone)]
pub struct HttpSearchIndex {
    /// HTTP client instance.
    client: Client,

    /// Cluster endpoint configuration.
    endpoint: ServiceEndpoint,

    /// Index name prefix.
    prefix: String,
}

impl HttpSearchIndex {
    /// Create a new search client.
    pub fn new(
        endpoint: ServiceEndpoint,
        prefix: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, SearchError> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            endpoint,
            prefix: prefix.into(),
        })
    }

    /// Physical index name for `kind`.
    pub fn index_name(&self, kind: IndexKind) -> String {
        format!("{}-{}", self.prefix, kind)
    }

    fn doc_url(&self, kind: IndexKind, id: &str) -> String {
        self.endpoint
            .url(&format!("/{}/_doc/{}", self.index_name(kind), id))
    }

    async fn check(response: reqwest::Response) -> Result<(), SearchError> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let message = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
        warn!("Search API error ({}): {}", status.as_u16(), message);
        Err(SearchError::ApiError {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl SearchIndex for HttpSearchIndex {
    #[instrument(skip(self, body))]
    async fn upsert(
        &self,
        index: IndexKind,
        id: &str,
        body: &serde_json::Value,
    ) -> Result<(), SearchError> {
        debug!("Indexing {} into {}", id, self.index_name(index));

        let url = self.doc_url(index, id);
        let request = self.endpoint.authorize(self.client.put(&url).json(body));

        let response = request.send().await?;
        Self::check(response).await
    }

    #[instrument(skip(self, fields))]
    async fn update(
        &self,
        index: IndexKind,
        id: &str,
        fields: &serde_json::Value,
    ) -> Result<(), SearchError> {
        debug!("Updating {} in {}", id, self.index_name(index));

        let url = self
            .endpoint
            .url(&format!("/{}/_update/{}", self.index_name(index), id));
        let body = json!({ "doc": fields, "doc_as_upsert": true });
        let request = self.endpoint.authorize(self.client.post(&url).json(&body));

        let response = request.send().await?;
        Self::check(response).await
    }

    #[instrument(skip(self))]
    async fn delete(&self, index: IndexKind, id: &str) -> Result<(), SearchError> {
        debug!("Removing {} from {}", id, self.index_name(index));

        let url = self.doc_url(index, id);
        let request = self.endpoint.authorize(self.client.delete(&url));

        let response = request.send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!("Entry {} already absent", id);
            return Ok(());
        }
        Self::check(response).await
    }
}
