//! Transactional email client.
//!
//! Emails are rendered provider-side from named templates; the worker only
//! sends the template id and its variables.

use crate::config::ServiceEndpoint;
use async_trait::async_trait;
use docflow_events::HandlerError;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, instrument, warn};

/// Email client errors.
#[derive(Debug, Error)]
pub enum EmailError {
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

    /// Authentication failed.
    #[error("Authentication failed")]
    AuthenticationFailed,
}

impl EmailError {
    /// Whether sending again later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            EmailError::RequestFailed(_) => true,
            EmailError::ApiError { status, .. } => *status == 429 || *status >= 500,
            EmailError::AuthenticationFailed => false,
        }
    }
}

impl From<EmailError> for HandlerError {
    fn from(err: EmailError) -> Self {
        if err.is_transient() {
            HandlerError::Transient(err.to_string())
        } else {
            HandlerError::Permanent(err.to_string())
        }
    }
}

/// A templated email addressed to one recipient.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundEmail {
    /// Recipient address.
    pub to: String,

    /// Subject line.
    pub subject: String,

    /// Provider template id.
    pub template: String,

    /// Template variables.
    pub variables: serde_json::Value,
}

/// Outbound port for sending email.
#[async_trait]
pub trait EmailSender: Send + Sync {
    /// Send one email.
    async fn send(&self, email: &OutboundEmail) -> Result<(), EmailError>;
}

#[derive(Serialize)]
struct SendRequest<'a> {
    from: &'a str,
    #[serde(flatten)]
    email: &'a OutboundEmail,
}

/// Email sender backed by a provider's JSON API.
#[derive(Clone)]
pub struct HttpEmailSender {
    /// HTTP client instance.
    client: Client,

    /// Provider endpoint configuration.
    endpoint: ServiceEndpoint,

    /// Sender address.
    from: String,
}

impl HttpEmailSender {
    /// Create a new email sender.
    pub fn new(
        endpoint: ServiceEndpoint,
        from: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, EmailError> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            endpoint,
            from: from.into(),
        })
    }
}

#[async_trait]
impl EmailSender for HttpEmailSender {
    #[instrument(skip(self, email), fields(template = %email.template))]
    async fn send(&self, email: &OutboundEmail) -> Result<(), EmailError> {
        debug!("Sending {} email", email.template);

        let url = self.endpoint.url("/v1/send");
        let body = SendRequest {
            from: &self.from,
            email,
        };
        let request = self.endpoint.authorize(self.client.post(&url).json(&body));

        let response = request.send().await?;
        let status = response.status();

        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            error!("Email provider authentication failed");
            return Err(EmailError::AuthenticationFailed);
        }

        if !status.is_success() {
            let message = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            warn!("Email API error ({}): {}", status.as_u16(), message);
            return Err(EmailError::ApiError {
                status: status.as_u16(),
                message,
            });
        }

        Ok(())
    }
}
