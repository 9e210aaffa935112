//! OCR pipeline handlers.
//!
//! `ocr.requested` runs text extraction and publishes `ocr.completed`.
//! Completion and classification results are folded into the document's
//! search entry with `index.document.update`. Follow-up events are created
//! inside the dispatch scope, so they carry the triggering correlation id.

use crate::clients::OcrEngine;
use async_trait::async_trait;
use docflow_events::producers::{OcrProducer, SearchIndexProducer};
use docflow_events::types::{DocumentClassified, IndexKind, OcrCompleted, OcrRequested};
use docflow_events::{Envelope, EventHandler, HandlerOutcome};
use serde_json::json;
use std::sync::Arc;
use tracing::info;

/// Extracts text for `ocr.requested`.
pub struct OcrRequestHandler {
    engine: Arc<dyn OcrEngine>,
    ocr: OcrProducer,
}

impl OcrRequestHandler {
    /// Create the handler.
    pub fn new(engine: Arc<dyn OcrEngine>, ocr: OcrProducer) -> Self {
        Self { engine, ocr }
    }
}

#[async_trait]
impl EventHandler for OcrRequestHandler {
    fn event_type(&self) -> &str {
        OcrRequested::EVENT_TYPE
    }

    async fn handle(&self, envelope: &Envelope) -> HandlerOutcome {
        let request: OcrRequested = envelope.parse_payload()?;
        let output = self.engine.extract(&request).await?;

        info!(
            document_id = %request.document_id,
            pages = output.page_count,
            "Text extracted"
        );

        self.ocr
            .completed(&OcrCompleted {
                document_id: request.document_id,
                text: output.text,
                page_count: output.page_count,
                confidence: output.confidence,
            })
            .await?;
        Ok(())
    }
}

/// Stores extracted text in the document index for `ocr.completed`.
pub struct OcrCompletedHandler {
    search: SearchIndexProducer,
}

impl OcrCompletedHandler {
    /// Create the handler.
    pub fn new(search: SearchIndexProducer) -> Self {
        Self { search }
    }
}

#[async_trait]
impl EventHandler for OcrCompletedHandler {
    fn event_type(&self) -> &str {
        OcrCompleted::EVENT_TYPE
    }

    async fn handle(&self, envelope: &Envelope) -> HandlerOutcome {
        let event: OcrCompleted = envelope.parse_payload()?;

        self.search
            .update(
                IndexKind::Document,
                event.document_id.to_string(),
                json!({
                    "content": event.text,
                    "pageCount": event.page_count,
                    "ocrConfidence": event.confidence,
                    "ocrStatus": "completed",
                }),
            )
            .await?;
        Ok(())
    }
}

/// Stores the classification in the document index for `ocr.classified`.
pub struct DocumentClassifiedHandler {
    search: SearchIndexProducer,
}

impl DocumentClassifiedHandler {
    /// Create the handler.
    pub fn new(search: SearchIndexProducer) -> Self {
        Self { search }
    }
}

#[async_trait]
impl EventHandler for DocumentClassifiedHandler {
    fn event_type(&self) -> &str {
        DocumentClassified::EVENT_TYPE
    }

    async fn handle(&self, envelope: &Envelope) -> HandlerOutcome {
        let event: DocumentClassified = envelope.parse_payload()?;

        self.search
            .update(
                IndexKind::Document,
                event.document_id.to_string(),
                json!({
                    "category": event.category,
                    "labels": event.labels,
                    "classificationConfidence": event.confidence,
                }),
            )
            .await?;
        Ok(())
    }
}
