use futures::stream::{self, BoxStream, StreamExt};
use std::sync::{Arc, RwLock};

use crate::error::ProjectionError;
use crate::event::{EventWithPosition, Position, ProjectionEvent};

/// Produces the ordered events a projection consumes.
///
/// The stream is pulled by the driver, so a source only has to produce
/// events as fast as they are consumed. Ending the stream completes the
/// projection; an `Err` item fails the current run.
pub trait EventSource<E>: Send + Sync {
    /// Events positioned strictly after `after`, or every event when `after` is None.
    fn start_from(&self, after: Option<Position>) -> BoxStream<'static, Result<EventWithPosition<E>, ProjectionError>>;
}

/// A finite, append-only source held in memory.
///
/// Positions are assigned on append, starting at 1. Each call to
/// `start_from` streams a snapshot of the events appended so far.
pub struct InMemoryEventSource<E> {
    events: Arc<RwLock<Vec<EventWithPosition<E>>>>,
}

impl<E> Clone for InMemoryEventSource<E> {
    fn clone(&self) -> Self {
        Self {
            events: Arc::clone(&self.events),
        }
    }
}

impl<E> Default for InMemoryEventSource<E> {
    fn default() -> Self {
        Self {
            events: Arc::new(RwLock::new(Vec::new())),
        }
    }
}

impl<E: ProjectionEvent> InMemoryEventSource<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append events in order.
    pub fn with_events(self, events: impl IntoIterator<Item = E>) -> Result<Self, ProjectionError> {
        for event in events {
            self.append(event)?;
        }
        Ok(self)
    }

    /// Append an event and return its position.
    pub fn append(&self, event: E) -> Result<Position, ProjectionError> {
        let mut events = self
            .events
            .write()
            .map_err(|_| ProjectionError::LockPoisoned("event source".into()))?;
        let position = events.len() as Position + 1;
        events.push(EventWithPosition::new(event, position));
        Ok(position)
    }

    pub fn len(&self) -> usize {
        self.events.read().map(|events| events.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E: ProjectionEvent> EventSource<E> for InMemoryEventSource<E> {
    fn start_from(&self, after: Option<Position>) -> BoxStream<'static, Result<EventWithPosition<E>, ProjectionError>> {
        let snapshot = match self.events.read() {
            Ok(events) => events
                .iter()
                .filter(|event| match (after, event.position) {
                    (Some(after), Some(position)) => position > after,
                    _ => true,
                })
                .cloned()
                .map(Ok)
                .collect::<Vec<_>>(),
            Err(_) => vec![Err(ProjectionError::LockPoisoned("event source".into()))],
        };
        stream::iter(snapshot).boxed()
    }
}
