//! Worker configuration.
//!
//! Outbound provider endpoints, API keys and timeouts for the handlers.
//! Configuration is loaded from environment variables with defaults for
//! local development.

use docflow_events::HandlerError;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Missing required environment variable.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    /// Invalid configuration value.
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue {
        /// Configuration key.
        key: String,
        /// Error message.
        message: String,
    },
}

impl From<ConfigError> for HandlerError {
    fn from(err: ConfigError) -> Self {
        HandlerError::Permanent(err.to_string())
    }
}

/// Configuration for the worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Public base URL of the web app, used for links in emails.
    pub app_base_url: String,

    /// Transactional email provider.
    pub email: ServiceEndpoint,

    /// Sender address for outgoing email.
    pub email_from: String,

    /// Search cluster.
    pub search: ServiceEndpoint,

    /// Prefix prepended to every search index name.
    pub search_index_prefix: String,

    /// Outbound HTTP timeout in seconds.
    pub http_timeout_secs: u64,
}

impl Default for WorkerConfig {
    /// Returns default configuration suitable for local development.
    fn default() -> Self {
        Self {
            app_base_url: "http://localhost:3000".to_string(),
            email: ServiceEndpoint {
                base_url: "http://localhost:8025".to_string(),
                api_key: None,
            },
            email_from: "Docflow <no-reply@docflow.local>".to_string(),
            search: ServiceEndpoint {
                base_url: "http://localhost:9200".to_string(),
                api_key: None,
            },
            search_index_prefix: "docflow".to_string(),
            http_timeout_secs: 10,
        }
    }
}

impl WorkerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `APP_BASE_URL`: web app URL (default: http://localhost:3000)
    /// - `EMAIL_API_URL`: email provider URL (default: http://localhost:8025)
    /// - `EMAIL_API_KEY`: email provider API key
    /// - `EMAIL_FROM`: sender address
    /// - `SEARCH_URL`: search cluster URL (default: http://localhost:9200)
    /// - `SEARCH_API_KEY`: search cluster API key
    /// - `SEARCH_INDEX_PREFIX`: index name prefix (default: docflow)
    /// - `WORKER_HTTP_TIMEOUT_SECS`: outbound timeout in seconds (default: 10)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(std::env::vars().collect())
    }

    /// Load configuration from an explicit variable map.
    pub fn from_vars(vars: HashMap<String, String>) -> Result<Self, ConfigError> {
        let default = Self::default();

        let http_timeout_secs = match vars.get("WORKER_HTTP_TIMEOUT_SECS") {
            Some(value) => value.parse().map_err(|_| ConfigError::InvalidValue {
                key: "WORKER_HTTP_TIMEOUT_SECS".to_string(),
                message: format!("'{}' is not a number of seconds", value),
            })?,
            None => default.http_timeout_secs,
        };

        let config = Self {
            app_base_url: vars
                .get("APP_BASE_URL")
                .cloned()
                .unwrap_or(default.app_base_url),
            email: ServiceEndpoint {
                base_url: vars
                    .get("EMAIL_API_URL")
                    .cloned()
                    .unwrap_or(default.email.base_url),
                api_key: vars.get("EMAIL_API_KEY").cloned(),
            },
            email_from: vars.get("EMAIL_FROM").cloned().unwrap_or(default.email_from),
            search: ServiceEndpoint {
                base_url: vars
                    .get("SEARCH_URL")
                    .cloned()
                    .unwrap_or(default.search.base_url),
                api_key: vars.get("SEARCH_API_KEY").cloned(),
            },
            search_index_prefix: vars
                .get("SEARCH_INDEX_PREFIX")
                .cloned()
                .unwrap_or(default.search_index_prefix),
            http_timeout_secs,
        };
        config.validate()?;
        Ok(config)
    }

    /// Outbound HTTP timeout as a Duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    /// Link a new user follows to verify their address.
    pub fn verification_url(&self, token: &str) -> Result<String, ConfigError> {
        self.app_link("auth/verify-email", token)
    }

    /// Link an invitee follows to join a team.
    pub fn invitation_url(&self, token: &str) -> Result<String, ConfigError> {
        self.app_link("teams/join", token)
    }

    fn app_link(&self, path: &str, token: &str) -> Result<String, ConfigError> {
        let base = format!("{}/{}", self.app_base_url.trim_end_matches('/'), path);
        let url = Url::parse_with_params(&base, &[("token", token)]).map_err(|e| {
            ConfigError::InvalidValue {
                key: "APP_BASE_URL".to_string(),
                message: e.to_string(),
            }
        })?;
        Ok(url.into())
    }

    /// Check values every deployment needs: a parseable app URL and a
    /// non-zero outbound timeout.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.http_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "WORKER_HTTP_TIMEOUT_SECS".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        Url::parse(&self.app_base_url).map_err(|e| ConfigError::InvalidValue {
            key: "APP_BASE_URL".to_string(),
            message: e.to_string(),
        })?;
        Ok(())
    }

    /// Validate that all required configuration is present for production.
    pub fn validate_for_production(&self) -> Result<(), ConfigError> {
        self.validate()?;
        if self.email.api_key.is_none() {
            return Err(ConfigError::MissingEnvVar("EMAIL_API_KEY".to_string()));
        }
        Ok(())
    }
}

/// Configuration for a single outbound HTTP endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    /// Base URL for the service (e.g., "https://api.mailer.example").
    pub base_url: String,

    /// API key sent as a bearer token.
    pub api_key: Option<String>,
}

impl ServiceEndpoint {
    /// Build a full URL by appending a path to the base URL.
    pub fn url(&self, path: &str) -> String {
        let base = self.base_url.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        format!("{}/{}", base, path)
    }

    /// Attach the bearer token, if any.
    pub fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(api_key) => request.bearer_auth(api_key),
            None => request,
        }
    }
}
