use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;
use std::time::Duration;

use crate::storage::StorageError;

/// Error type for everything that can go wrong while projecting events.
///
/// Variants group into four families:
/// - transient processing failures (`Handler`, `Storage`), retried by the
///   document worker before they surface as a reject;
/// - routing failures (`Routing`, `WorkerStopped`, `Timeout`, `Codec`),
///   surfaced to the caller as a reject;
/// - stream failures (`Source`, `RestartBudgetExhausted`), handled by the
///   restart policy of the stream driver;
/// - configuration errors (`NoHandler`, `UnknownProjection`, `NotStarted`,
///   `InvalidId`, `InvalidConfiguration`), which fail fast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProjectionError {
    /// An event handler failed.
    Handler(String),
    /// Loading or storing a document failed.
    Storage(StorageError),
    /// An operation did not finish in time.
    Timeout { target: String, after: Duration },
    /// The worker owning a document went away before answering.
    WorkerStopped(String),
    /// No node currently owns the partition of a document.
    Routing(String),
    /// A request or response could not be encoded for transport.
    Codec(String),
    /// The event source failed.
    Source(String),
    /// A continuous projection failed more often than its restart policy allows.
    RestartBudgetExhausted {
        projection: String,
        restarts: usize,
        last_error: Box<ProjectionError>,
    },
    /// No handler is registered for an event type.
    NoHandler(String),
    /// No projection is registered under a name.
    UnknownProjection(String),
    /// A projection is registered but `start` has not spawned it yet.
    NotStarted(String),
    /// A document id could not be parsed from its string form.
    InvalidId(String),
    /// A projection was configured with invalid settings.
    InvalidConfiguration(String),
    /// Bookkeeping state was poisoned by a panicking thread.
    LockPoisoned(String),
}

impl ProjectionError {
    /// Build a handler error from any displayable cause.
    pub fn handler(cause: impl fmt::Display) -> Self {
        ProjectionError::Handler(cause.to_string())
    }

    /// Build a source error from any displayable cause.
    pub fn source_failed(cause: impl fmt::Display) -> Self {
        ProjectionError::Source(cause.to_string())
    }

    /// Configuration errors are never retried.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            ProjectionError::NoHandler(_)
                | ProjectionError::UnknownProjection(_)
                | ProjectionError::NotStarted(_)
                | ProjectionError::InvalidId(_)
                | ProjectionError::InvalidConfiguration(_)
        )
    }
}

impl fmt::Display for ProjectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProjectionError::Handler(msg) => write!(f, "event handler failed: {}", msg),
            ProjectionError::Storage(e) => write!(f, "storage error: {}", e),
            ProjectionError::Timeout { target, after } => {
                write!(f, "{} did not finish within {:?}", target, after)
            }
            ProjectionError::WorkerStopped(id) => {
                write!(f, "document worker for {} stopped before answering", id)
            }
            ProjectionError::Routing(msg) => write!(f, "routing failed: {}", msg),
            ProjectionError::Codec(msg) => write!(f, "codec error: {}", msg),
            ProjectionError::Source(msg) => write!(f, "event source failed: {}", msg),
            ProjectionError::RestartBudgetExhausted {
                projection,
                restarts,
                last_error,
            } => write!(
                f,
                "projection {} gave up after {} restarts: {}",
                projection, restarts, last_error
            ),
            ProjectionError::NoHandler(event_type) => {
                write!(f, "no handler registered for event type {}", event_type)
            }
            ProjectionError::UnknownProjection(name) => {
                write!(f, "no projection registered with name {}", name)
            }
            ProjectionError::NotStarted(name) => {
                write!(f, "projection {} is registered but not started", name)
            }
            ProjectionError::InvalidId(msg) => write!(f, "invalid document id: {}", msg),
            ProjectionError::InvalidConfiguration(msg) => {
                write!(f, "invalid projection configuration: {}", msg)
            }
            ProjectionError::LockPoisoned(what) => write!(f, "{} lock poisoned", what),
        }
    }
}

impl Error for ProjectionError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ProjectionError::Storage(e) => Some(e),
            ProjectionError::RestartBudgetExhausted { last_error, .. } => Some(last_error.as_ref()),
            _ => None,
        }
    }
}

impl From<StorageError> for ProjectionError {
    fn from(err: StorageError) -> Self {
        ProjectionError::Storage(err)
    }
}
