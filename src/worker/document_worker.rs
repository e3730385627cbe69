use std::sync::Arc;

use crate::document::{Document, DocumentId};
use crate::error::ProjectionError;
use crate::event::{max_position, EventWithPosition, Position, ProjectionEvent};
use crate::handlers::ProjectionHandlers;
use crate::response::ProjectResponse;
use crate::storage::{ProjectionStorage, ProjectionStorageExt, StoreIntent};

/// In-memory state of a document worker.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerState<D> {
    /// Nothing read from storage yet.
    Unloaded,
    /// The document as last persisted (after reset), or None when absent.
    Loaded(Option<D>),
}

/// State machine that applies batches of events to one document.
///
/// The worker is not shared: whoever owns it processes one batch at a time.
/// A failed batch is retried from the same input document; after
/// `max_retries` retries the batch is rejected and the worker forgets its
/// document, so the next batch starts from storage again.
pub struct DocumentWorker<I, D, E> {
    projection: Arc<str>,
    id: I,
    id_string: String,
    state: WorkerState<D>,
    handlers: ProjectionHandlers<I, D, E>,
    storage: Arc<dyn ProjectionStorage>,
    max_retries: u32,
}

impl<I, D, E> DocumentWorker<I, D, E>
where
    I: DocumentId,
    D: Document,
    E: ProjectionEvent,
{
    pub fn new(
        projection: Arc<str>,
        id: I,
        handlers: ProjectionHandlers<I, D, E>,
        storage: Arc<dyn ProjectionStorage>,
        max_retries: u32,
    ) -> Self {
        let id_string = id.to_id_string();
        Self {
            projection,
            id,
            id_string,
            state: WorkerState::Unloaded,
            handlers,
            storage,
            max_retries,
        }
    }

    pub fn id(&self) -> &I {
        &self.id
    }

    pub fn state(&self) -> &WorkerState<D> {
        &self.state
    }

    /// Apply a batch and persist the result.
    pub async fn process(&mut self, events: &[EventWithPosition<E>]) -> ProjectResponse {
        if events.is_empty() {
            return ProjectResponse::Acknowledge(None);
        }

        let mut retries = 0;
        loop {
            let error = match self.apply(events).await {
                Ok(position) => return ProjectResponse::Acknowledge(position),
                Err(error) => error,
            };

            if error.is_configuration() || retries >= self.max_retries {
                tracing::error!(
                    projection = %self.projection,
                    id = %self.id_string,
                    retries,
                    error = %error,
                    "Failed handling {} events for {}, giving up",
                    events.len(),
                    self.id_string
                );
                self.state = WorkerState::Unloaded;
                return ProjectResponse::Reject(error);
            }

            retries += 1;
            tracing::warn!(
                projection = %self.projection,
                id = %self.id_string,
                attempt = retries,
                error = %error,
                "Failed handling {} events for {}, retrying (tries: {})",
                events.len(),
                self.id_string,
                retries
            );
        }
    }

    async fn apply(&mut self, events: &[EventWithPosition<E>]) -> Result<Option<Position>, ProjectionError> {
        let existing = match &self.state {
            WorkerState::Loaded(document) => document.clone(),
            WorkerState::Unloaded => {
                let document = self.storage.load_document::<D>(&self.id_string).await?;
                self.state = WorkerState::Loaded(document.clone());
                document
            }
        };
        let existed = existing.is_some();

        let mut document = existing;
        for event in events {
            document = self.handlers.handle(document, event).await?;
        }

        match document {
            Some(document) => {
                let intent = StoreIntent::new().upsert_document(&self.id_string, &document)?;
                self.storage.store(intent).await?;
                self.state = WorkerState::Loaded(Some(document.reset()));
            }
            None if existed => {
                let intent = StoreIntent::new().delete_document::<D>(&self.id_string);
                self.storage.store(intent).await?;
                self.state = WorkerState::Loaded(None);
            }
            None => {}
        }

        Ok(max_position(events))
    }
}
