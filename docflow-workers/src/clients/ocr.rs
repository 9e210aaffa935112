//! OCR engine port.

use async_trait::async_trait;
use docflow_events::types::OcrRequested;
use docflow_events::HandlerError;
use thiserror::Error;

/// OCR engine errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OcrError {
    /// Engine is down or overloaded.
    #[error("OCR engine unavailable: {0}")]
    Unavailable(String),

    /// The document cannot be read (format, encryption, corruption).
    #[error("Unreadable document: {0}")]
    Unreadable(String),
}

impl From<OcrError> for HandlerError {
    fn from(err: OcrError) -> Self {
        match err {
            OcrError::Unavailable(_) => HandlerError::Transient(err.to_string()),
            OcrError::Unreadable(_) => HandlerError::Permanent(err.to_string()),
        }
    }
}

/// Text extracted from a document.
#[derive(Debug, Clone, PartialEq)]
pub struct OcrOutput {
    /// Plain text.
    pub text: String,
    /// Pages read.
    pub page_count: u32,
    /// Mean recognition confidence in `[0, 1]`, if reported.
    pub confidence: Option<f32>,
}

/// Outbound port for text extraction.
#[async_trait]
pub trait OcrEngine: Send + Sync {
    /// Extract the text of the requested document.
    async fn extract(&self, request: &OcrRequested) -> Result<OcrOutput, OcrError>;
}
