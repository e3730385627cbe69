use serde::{Deserialize, Serialize};

use crate::error::ProjectionError;
use crate::event::Position;

/// Outcome of submitting a batch of events for one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProjectResponse {
    /// The batch was applied and persisted. Carries the highest position in
    /// the batch, or None when no event had one.
    Acknowledge(Option<Position>),
    /// The batch was not applied.
    Reject(ProjectionError),
}

impl ProjectResponse {
    pub fn is_acknowledged(&self) -> bool {
        matches!(self, ProjectResponse::Acknowledge(_))
    }

    /// Acknowledged position, if any.
    pub fn position(&self) -> Option<Position> {
        match self {
            ProjectResponse::Acknowledge(position) => *position,
            ProjectResponse::Reject(_) => None,
        }
    }

    pub fn into_result(self) -> Result<Option<Position>, ProjectionError> {
        match self {
            ProjectResponse::Acknowledge(position) => Ok(position),
            ProjectResponse::Reject(error) => Err(error),
        }
    }
}
