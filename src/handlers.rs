//! Handler table: which document an event belongs to and how it changes it.

use futures::future::{self, BoxFuture, FutureExt};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use crate::document::{Document, DocumentId};
use crate::error::ProjectionError;
use crate::event::{EventWithPosition, Position, ProjectionEvent};

type ExtractId<I, E> = Arc<dyn Fn(&E) -> I + Send + Sync>;

type ApplyEvent<D, E> = Arc<
    dyn Fn(E, Option<D>, Option<Position>) -> BoxFuture<'static, Result<Option<D>, ProjectionError>>
        + Send
        + Sync,
>;

struct Handler<I, D, E> {
    extract_id: ExtractId<I, E>,
    apply: ApplyEvent<D, E>,
}

impl<I, D, E> Clone for Handler<I, D, E> {
    fn clone(&self) -> Self {
        Self {
            extract_id: Arc::clone(&self.extract_id),
            apply: Arc::clone(&self.apply),
        }
    }
}

/// Event handlers of one projection, keyed by event type.
///
/// A handler receives the event, the current document (`None` when absent)
/// and the event position, and returns the new document. Returning `None`
/// deletes a previously stored document.
///
/// ## Example
///
/// ```ignore
/// let handlers = ProjectionHandlers::<String, OrderView, OrderEvent>::new()
///     .on("OrderPlaced", |e| e.order_id(), |e, doc, _position| {
///         let mut view = doc.unwrap_or_default();
///         view.lines.push(e.line().to_string());
///         Ok(Some(view))
///     })
///     .on("OrderArchived", |e| e.order_id(), |_, _, _| Ok(None));
/// ```
pub struct ProjectionHandlers<I, D, E> {
    handlers: HashMap<String, Handler<I, D, E>>,
}

impl<I, D, E> Clone for ProjectionHandlers<I, D, E> {
    fn clone(&self) -> Self {
        Self {
            handlers: self.handlers.clone(),
        }
    }
}

impl<I, D, E> Default for ProjectionHandlers<I, D, E> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl<I, D, E> ProjectionHandlers<I, D, E>
where
    I: DocumentId,
    D: Document,
    E: ProjectionEvent,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a synchronous handler for an event type.
    ///
    /// Registering the same event type twice replaces the earlier handler.
    pub fn on<F, H>(mut self, event_type: impl Into<String>, get_id: F, handler: H) -> Self
    where
        F: Fn(&E) -> I + Send + Sync + 'static,
        H: Fn(&E, Option<D>, Option<Position>) -> Result<Option<D>, ProjectionError>
            + Send
            + Sync
            + 'static,
    {
        let apply: ApplyEvent<D, E> = Arc::new(move |event, document, position| {
            future::ready(handler(&event, document, position)).boxed()
        });
        self.handlers.insert(
            event_type.into(),
            Handler {
                extract_id: Arc::new(get_id),
                apply,
            },
        );
        self
    }

    /// Register an asynchronous handler for an event type.
    pub fn on_async<F, H, Fut>(mut self, event_type: impl Into<String>, get_id: F, handler: H) -> Self
    where
        F: Fn(&E) -> I + Send + Sync + 'static,
        H: Fn(E, Option<D>, Option<Position>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<D>, ProjectionError>> + Send + 'static,
    {
        let apply: ApplyEvent<D, E> =
            Arc::new(move |event, document, position| handler(event, document, position).boxed());
        self.handlers.insert(
            event_type.into(),
            Handler {
                extract_id: Arc::new(get_id),
                apply,
            },
        );
        self
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether a handler is registered for the event type.
    pub fn handles(&self, event_type: &str) -> bool {
        self.handlers.contains_key(event_type)
    }

    /// Identity of the document an event belongs to.
    pub fn extract_id(&self, event: &E) -> Result<I, ProjectionError> {
        let handler = self.handler_for(event)?;
        Ok((handler.extract_id)(event))
    }

    /// Apply one event to the current document.
    pub async fn handle(
        &self,
        document: Option<D>,
        event: &EventWithPosition<E>,
    ) -> Result<Option<D>, ProjectionError> {
        let handler = self.handler_for(&event.event)?;
        (handler.apply)(event.event.clone(), document, event.position).await
    }

    fn handler_for(&self, event: &E) -> Result<&Handler<I, D, E>, ProjectionError> {
        let event_type = event.event_type();
        self.handlers
            .get(event_type)
            .ok_or_else(|| ProjectionError::NoHandler(event_type.to_string()))
    }
}
