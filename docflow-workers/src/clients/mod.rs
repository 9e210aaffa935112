//! Outbound ports used by the handlers.
//!
//! - Email: transactional email provider
//! - Search: Elasticsearch-compatible search cluster
//! - OCR: text extraction engine
//!
//! Each port is a trait so handlers can be tested without the network; the
//! HTTP implementations share [`ServiceEndpoint`](crate::config::ServiceEndpoint)
//! for URLs and bearer authentication.

pub mod email;
pub mod ocr;
pub mod search;

pub use email::{EmailError, EmailSender, HttpEmailSender, OutboundEmail};
pub use ocr::{OcrEngine, OcrError, OcrOutput};
pub use search::{HttpSearchIndex, SearchError, SearchIndex};
