use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Ordinal of an event in the stream a projection consumes.
pub type Position = u64;

/// Trait for events that can be projected into documents.
///
/// The event type selects the handler; the serde bounds let events cross
/// node boundaries when a projection is sharded.
pub trait ProjectionEvent: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Name used to look up the handler for this event (e.g. "OrderPlaced").
    fn event_type(&self) -> &str;
}

/// An event together with its position in the source stream.
///
/// Synthetic or replayed events carry no position and never move the
/// stored cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventWithPosition<E> {
    pub event: E,
    pub position: Option<Position>,
}

impl<E> EventWithPosition<E> {
    pub fn new(event: E, position: Position) -> Self {
        Self {
            event,
            position: Some(position),
        }
    }

    /// An event that must not advance the stored cursor.
    pub fn unpositioned(event: E) -> Self {
        Self {
            event,
            position: None,
        }
    }
}

/// Highest position in a batch, ignoring unpositioned events.
pub fn max_position<E>(events: &[EventWithPosition<E>]) -> Option<Position> {
    events.iter().filter_map(|e| e.position).max()
}
