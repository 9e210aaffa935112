//! Handler registry
//!
//! Maps each event type tag to the one handler responsible for it. The
//! registry is assembled once by the composition root and is immutable
//! afterwards, so consumer loops share it through an `Arc` without locking.
//!
//! ```rust,no_run
//! use docflow_events::{Envelope, EventHandler, HandlerOutcome, HandlerRegistry};
//! use async_trait::async_trait;
//! use std::sync::Arc;
//!
//! struct AuditLogger;
//!
//! #[async_trait]
//! impl EventHandler for AuditLogger {
//!     fn event_type(&self) -> &str {
//!         "team.created"
//!     }
//!
//!     async fn handle(&self, envelope: &Envelope) -> HandlerOutcome {
//!         println!("team created: {}", envelope.payload());
//!         Ok(())
//!     }
//! }
//!
//! fn compose() -> Result<HandlerRegistry, docflow_events::ConfigurationError> {
//!     Ok(HandlerRegistry::builder()
//!         .register(Arc::new(AuditLogger))?
//!         .build())
//! }
//! ```

use crate::envelope::Envelope;
use crate::error::{ConfigResult, ConfigurationError, HandlerError, HandlerOutcome};
use crate::topology::{validate_pattern, BrokerKind, Topology};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// Business handler for exactly one event type.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Event type this handler is responsible for.
    fn event_type(&self) -> &str;

    /// Handle one envelope.
    async fn handle(&self, envelope: &Envelope) -> HandlerOutcome;
}

/// Result of routing an envelope through the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The handler completed successfully.
    Handled,
    /// The handler reported a failure.
    Failed(HandlerError),
    /// No handler is registered for the event type.
    NotFound,
}

/// Closure-backed handler.
pub struct FnHandler<F> {
    event_type: String,
    handler: F,
}

impl<F, Fut> FnHandler<F>
where
    F: Fn(Envelope) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerOutcome> + Send,
{
    /// Create a handler for `event_type` from an async closure.
    pub fn new(event_type: impl Into<String>, handler: F) -> Self {
        Self {
            event_type: event_type.into(),
            handler,
        }
    }
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Envelope) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerOutcome> + Send,
{
    fn event_type(&self) -> &str {
        &self.event_type
    }

    async fn handle(&self, envelope: &Envelope) -> HandlerOutcome {
        (self.handler)(envelope.clone()).await
    }
}

/// Immutable event-type → handler map.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn EventHandler>>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("event_types", &self.event_types())
            .finish()
    }
}

impl HandlerRegistry {
    /// Start assembling a registry.
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::default()
    }

    /// Registered event types, sorted.
    pub fn event_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Handler for `event_type`, if any.
    pub fn get(&self, event_type: &str) -> Option<&Arc<dyn EventHandler>> {
        self.handlers.get(event_type)
    }

    /// Route `envelope` to its handler.
    ///
    /// An unregistered event type yields [`DispatchOutcome::NotFound`]; it is
    /// logged here and is never fatal.
    pub async fn dispatch(&self, envelope: &Envelope) -> DispatchOutcome {
        let Some(handler) = self.handlers.get(envelope.event_type()) else {
            warn!(
                event_type = %envelope.event_type(),
                correlation_id = %envelope.correlation_id(),
                "No handler registered for event type, dropping"
            );
            return DispatchOutcome::NotFound;
        };

        match handler.handle(envelope).await {
            Ok(()) => {
                debug!(
                    event_type = %envelope.event_type(),
                    correlation_id = %envelope.correlation_id(),
                    "Event handled"
                );
                DispatchOutcome::Handled
            }
            Err(e) => DispatchOutcome::Failed(e),
        }
    }

    /// Check every registered type routes to exactly one stream on `broker`.
    pub fn validate_against(&self, topology: &Topology, broker: BrokerKind) -> ConfigResult<()> {
        for event_type in self.event_types() {
            let matches = topology.streams_for_event(event_type, broker).len();
            if matches != 1 {
                return Err(ConfigurationError::UnroutableEventType {
                    event_type: event_type.to_string(),
                    broker,
                    matches,
                });
            }
        }
        Ok(())
    }

    /// Streams on `broker` that carry at least one registered event type, sorted.
    pub fn subscribed_streams(&self, topology: &Topology, broker: BrokerKind) -> Vec<String> {
        let streams: BTreeSet<String> = self
            .handlers
            .keys()
            .flat_map(|event_type| topology.streams_for_event(event_type, broker))
            .map(|descriptor| descriptor.name.clone())
            .collect();
        streams.into_iter().collect()
    }
}

/// Collects handlers and rejects duplicates.
#[derive(Default)]
pub struct HandlerRegistryBuilder {
    handlers: HashMap<String, Arc<dyn EventHandler>>,
}

impl HandlerRegistryBuilder {
    /// Register a handler under its own event type.
    ///
    /// Registering a second handler for the same type is a
    /// [`ConfigurationError::DuplicateHandler`].
    pub fn register(mut self, handler: Arc<dyn EventHandler>) -> ConfigResult<Self> {
        let event_type = handler.event_type().to_string();

        validate_pattern(&event_type)?;
        if event_type.contains(|c| c == '*' || c == '#') {
            return Err(ConfigurationError::InvalidPattern(event_type));
        }
        if self.handlers.contains_key(&event_type) {
            return Err(ConfigurationError::DuplicateHandler(event_type));
        }

        self.handlers.insert(event_type, handler);
        Ok(self)
    }

    /// Register several handlers.
    pub fn register_all<I>(self, handlers: I) -> ConfigResult<Self>
    where
        I: IntoIterator<Item = Arc<dyn EventHandler>>,
    {
        handlers
            .into_iter()
            .try_fold(self, |builder, handler| builder.register(handler))
    }

    /// Register an async closure for `event_type`.
    pub fn register_fn<F, Fut>(self, event_type: impl Into<String>, handler: F) -> ConfigResult<Self>
    where
        F: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerOutcome> + Send + 'static,
    {
        self.register(Arc::new(FnHandler::new(event_type, handler)))
    }

    /// Freeze the registry.
    pub fn build(self) -> HandlerRegistry {
        HandlerRegistry {
            handlers: self.handlers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{streams, StreamDescriptor};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        event_type: &'static str,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl EventHandler for Counting {
        fn event_type(&self) -> &str {
            self.event_type
        }

        async fn handle(&self, _envelope: &Envelope) -> HandlerOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn counting(event_type: &'static str) -> (Arc<dyn EventHandler>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Arc::new(Counting {
                event_type,
                calls: calls.clone(),
            }),
            calls,
        )
    }

    #[tokio::test]
    async fn test_dispatch_routes_to_exactly_one_handler() {
        let (registered, registered_calls) = counting("user.registered");
        let (expiring, expiring_calls) = counting("user.trial_expiring");

        let registry = HandlerRegistry::builder()
            .register(registered)
            .unwrap()
            .register(expiring)
            .unwrap()
            .build();

        let outcome = registry
            .dispatch(&Envelope::new("user.registered", json!({})))
            .await;

        assert_eq!(outcome, DispatchOutcome::Handled);
        assert_eq!(registered_calls.load(Ordering::SeqCst), 1);
        assert_eq!(expiring_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dispatch_unknown_type() {
        let registry = HandlerRegistry::builder().build();
        let outcome = registry
            .dispatch(&Envelope::new("unknown.type", json!({})))
            .await;
        assert_eq!(outcome, DispatchOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_dispatch_reports_handler_failure() {
        let registry = HandlerRegistry::builder()
            .register_fn("ocr.requested", |_envelope| async {
                Err(HandlerError::Transient("ocr engine down".into()))
            })
            .unwrap()
            .build();

        let outcome = registry
            .dispatch(&Envelope::new("ocr.requested", json!({})))
            .await;
        assert_eq!(
            outcome,
            DispatchOutcome::Failed(HandlerError::Transient("ocr engine down".into()))
        );
    }

    #[test]
    fn test_duplicate_registration_is_configuration_error() {
        let (first, _) = counting("user.registered");
        let (second, _) = counting("user.registered");

        let result = HandlerRegistry::builder()
            .register(first)
            .unwrap()
            .register(second);

        assert_eq!(
            result.err(),
            Some(ConfigurationError::DuplicateHandler("user.registered".into()))
        );
    }

    #[test]
    fn test_wildcard_event_type_rejected() {
        let (handler, _) = counting("user.*");
        assert!(matches!(
            HandlerRegistry::builder().register(handler),
            Err(ConfigurationError::InvalidPattern(_))
        ));
    }

    #[test]
    fn test_validate_against_topology() {
        let topology = Topology::platform();
        let (handler, _) = counting("user.registered");
        let registry = HandlerRegistry::builder().register(handler).unwrap().build();

        assert!(registry.validate_against(&topology, BrokerKind::Amqp).is_ok());
        assert_eq!(
            registry.subscribed_streams(&topology, BrokerKind::Kafka),
            vec![streams::USER_EVENTS.to_string()]
        );

        let (orphan, _) = counting("billing.invoice_paid");
        let registry = HandlerRegistry::builder().register(orphan).unwrap().build();
        assert!(matches!(
            registry.validate_against(&topology, BrokerKind::Amqp),
            Err(ConfigurationError::UnroutableEventType { matches: 0, .. })
        ));
    }

    #[test]
    fn test_validate_against_topology_without_descriptor() {
        let topology = Topology::builder()
            .stream(StreamDescriptor::new("team-events", "team.*").with_queue("x", "q"))
            .build()
            .unwrap();
        let (handler, _) = counting("team.created");
        let registry = HandlerRegistry::builder().register(handler).unwrap().build();

        assert!(registry.validate_against(&topology, BrokerKind::Amqp).is_ok());
        assert!(registry.validate_against(&topology, BrokerKind::Kafka).is_err());
    }
}
