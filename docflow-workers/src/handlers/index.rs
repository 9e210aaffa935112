//! Search index handlers.

use crate::clients::{SearchError, SearchIndex};
use async_trait::async_trait;
use docflow_events::types::{IndexAction, IndexKind, IndexMutation};
use docflow_events::{Envelope, EventHandler, HandlerError, HandlerOutcome};
use std::sync::Arc;
use tracing::debug;

/// Applies `index.<kind>.<action>` mutations to the search cluster.
///
/// One instance is registered per kind and action so that each event type
/// has exactly one handler.
pub struct IndexMutationHandler {
    event_type: String,
    index: IndexKind,
    action: IndexAction,
    search: Arc<dyn SearchIndex>,
}

impl IndexMutationHandler {
    /// Create the handler for one kind and action.
    pub fn new(index: IndexKind, action: IndexAction, search: Arc<dyn SearchIndex>) -> Self {
        Self {
            event_type: IndexMutation::event_type_for(index, action),
            index,
            action,
            search,
        }
    }

    /// Handlers for every kind and action.
    pub fn all(search: Arc<dyn SearchIndex>) -> Vec<Arc<dyn EventHandler>> {
        IndexKind::ALL
            .into_iter()
            .flat_map(|index| {
                IndexAction::ALL
                    .into_iter()
                    .map(move |action| (index, action))
            })
            .map(|(index, action)| {
                Arc::new(Self::new(index, action, search.clone())) as Arc<dyn EventHandler>
            })
            .collect()
    }
}

#[async_trait]
impl EventHandler for IndexMutationHandler {
    fn event_type(&self) -> &str {
        &self.event_type
    }

    async fn handle(&self, envelope: &Envelope) -> HandlerOutcome {
        let mutation: IndexMutation = envelope.parse_payload()?;

        if mutation.index != self.index || mutation.action != self.action {
            return Err(HandlerError::InvalidPayload(format!(
                "payload describes index.{}.{} but arrived as {}",
                mutation.index, mutation.action, self.event_type
            )));
        }

        match self.action {
            IndexAction::Create => {
                let body = mutation
                    .body
                    .as_ref()
                    .ok_or_else(|| SearchError::MissingBody(self.event_type.clone()))?;
                self.search.upsert(self.index, &mutation.id, body).await?;
            }
            IndexAction::Update => {
                let fields = mutation
                    .body
                    .as_ref()
                    .ok_or_else(|| SearchError::MissingBody(self.event_type.clone()))?;
                self.search.update(self.index, &mutation.id, fields).await?;
            }
            IndexAction::Delete => {
                self.search.delete(self.index, &mutation.id).await?;
            }
        }

        debug!(index = %self.index, action = %self.action, id = %mutation.id, "Search index updated");
        Ok(())
    }
}
