//! Composition root.
//!
//! Wires outbound clients, producers and handlers into a
//! [`HandlerRegistry`] and starts the messaging subsystem around it. This is
//! the only place that knows which concrete implementation backs each port.

use crate::clients::{
    EmailError, EmailSender, HttpEmailSender, HttpSearchIndex, OcrEngine, SearchError, SearchIndex,
};
use crate::config::{ConfigError, WorkerConfig};
use crate::handlers::{
    DocumentClassifiedHandler, IndexMutationHandler, OcrCompletedHandler, OcrRequestHandler,
    TeamInvitationEmailHandler, TeamRemovalEmailHandler, TeamWelcomeEmailHandler,
    TrialExpiryEmailHandler, VerificationEmailHandler,
};
use docflow_events::producers::{OcrProducer, SearchIndexProducer};
use docflow_events::{
    connect_broker, ConfigResult, EventHandler, HandlerRegistry, MessagingConfig, MessagingSystem,
    Publisher, StartError, Topology,
};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// Errors bringing the workers up.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Worker configuration is invalid.
    #[error("Worker configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Messaging subsystem failed to start.
    #[error(transparent)]
    Start(#[from] StartError),

    /// Email client could not be built.
    #[error("Email client error: {0}")]
    Email(#[from] EmailError),

    /// Search client could not be built.
    #[error("Search client error: {0}")]
    Search(#[from] SearchError),
}

/// Everything the handlers depend on.
#[derive(Clone)]
pub struct WorkerDeps {
    /// Worker settings.
    pub config: Arc<WorkerConfig>,
    /// Email port.
    pub email: Arc<dyn EmailSender>,
    /// Search port.
    pub search: Arc<dyn SearchIndex>,
    /// OCR port; without it `ocr.requested` is left to another deployment.
    pub ocr: Option<Arc<dyn OcrEngine>>,
    /// Publisher for follow-up events.
    pub publisher: Publisher,
}

/// Build the registry of every worker handler.
pub fn build_registry(deps: &WorkerDeps) -> ConfigResult<HandlerRegistry> {
    let email = &deps.email;
    let config = &deps.config;

    let mut handlers: Vec<Arc<dyn EventHandler>> = vec![
        Arc::new(VerificationEmailHandler::new(email.clone(), config.clone())),
        Arc::new(TrialExpiryEmailHandler::new(email.clone(), config.clone())),
        Arc::new(TeamWelcomeEmailHandler::new(email.clone())),
        Arc::new(TeamInvitationEmailHandler::new(email.clone(), config.clone())),
        Arc::new(TeamRemovalEmailHandler::new(email.clone())),
        Arc::new(OcrCompletedHandler::new(SearchIndexProducer::new(
            deps.publisher.clone(),
        ))),
        Arc::new(DocumentClassifiedHandler::new(SearchIndexProducer::new(
            deps.publisher.clone(),
        ))),
    ];

    if let Some(engine) = &deps.ocr {
        handlers.push(Arc::new(OcrRequestHandler::new(
            engine.clone(),
            OcrProducer::new(deps.publisher.clone()),
        )));
    }

    handlers.extend(IndexMutationHandler::all(deps.search.clone()));

    Ok(HandlerRegistry::builder().register_all(handlers)?.build())
}

/// Connect the broker, build the HTTP clients and start every handler.
pub async fn start_workers(
    messaging: &MessagingConfig,
    worker: WorkerConfig,
    ocr: Option<Arc<dyn OcrEngine>>,
) -> Result<MessagingSystem, WorkerError> {
    messaging.validate().map_err(StartError::from)?;
    worker.validate()?;

    let topology = Arc::new(Topology::platform());
    let broker = connect_broker(messaging, topology.clone()).await?;

    let email = HttpEmailSender::new(worker.email.clone(), worker.email_from.clone(), worker.timeout())?;
    let search = HttpSearchIndex::new(
        worker.search.clone(),
        worker.search_index_prefix.clone(),
        worker.timeout(),
    )?;

    let deps = WorkerDeps {
        config: Arc::new(worker),
        email: Arc::new(email),
        search: Arc::new(search),
        ocr,
        publisher: Publisher::new(broker.clone(), messaging.publish_timeout),
    };
    let registry = build_registry(&deps).map_err(StartError::from)?;

    info!(handlers = registry.len(), "Worker handlers registered");

    let system =
        MessagingSystem::start_with_broker(broker, messaging, topology, Arc::new(registry)).await?;
    Ok(system)
}
