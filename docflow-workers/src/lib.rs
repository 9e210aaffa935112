//! # Docflow Workers
//!
//! Event handlers for the Docflow worker tier, built on `docflow-events`.
//!
//! ## Overview
//!
//! The docflow-workers crate handles:
//! - **Email**: verification, trial expiry and team notifications
//! - **Search**: applying index mutations to the search cluster
//! - **OCR**: text extraction and indexing of results and classifications
//!
//! Handlers reach the outside world only through ports ([`EmailSender`],
//! [`SearchIndex`], [`OcrEngine`]), so each can be exercised without network
//! access. HTTP implementations for email and search are provided.
//!
//! ## Handled Events
//!
//! | Event type              | Handler                        |
//! |-------------------------|--------------------------------|
//! | `user.registered`       | `VerificationEmailHandler`     |
//! | `user.trial_expiring`   | `TrialExpiryEmailHandler`      |
//! | `team.created`          | `TeamWelcomeEmailHandler`      |
//! | `team.member_invited`   | `TeamInvitationEmailHandler`   |
//! | `team.member_removed`   | `TeamRemovalEmailHandler`      |
//! | `ocr.requested`         | `OcrRequestHandler`            |
//! | `ocr.completed`         | `OcrCompletedHandler`          |
//! | `ocr.classified`        | `DocumentClassifiedHandler`    |
//! | `index.<kind>.<action>` | `IndexMutationHandler`         |
//!
//! ## Usage
//!
//! ```rust,no_run
//! use docflow_events::MessagingConfig;
//! use docflow_workers::{start_workers, WorkerConfig};
//!
//! async fn run() {
//!     let messaging = MessagingConfig::from_env().unwrap();
//!     let worker = WorkerConfig::from_env().unwrap();
//!
//!     let system = start_workers(&messaging, worker, None).await.unwrap();
//!
//!     // ... wait for a termination signal ...
//!
//!     system.shutdown().await;
//! }
//! ```

pub mod clients;
pub mod composition;
pub mod config;
pub mod handlers;

// Re-export main types
pub use clients::{
    EmailError, EmailSender, HttpEmailSender, HttpSearchIndex, OcrEngine, OcrError, OcrOutput,
    OutboundEmail, SearchError, SearchIndex,
};
pub use composition::{build_registry, start_workers, WorkerDeps, WorkerError};
pub use config::{ConfigError, ServiceEndpoint, WorkerConfig};
