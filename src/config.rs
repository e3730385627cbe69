//! Tunables for stream batching, restarts and worker passivation.
//!
//! Every settings type has a `Default` carrying production defaults and
//! consuming `with_*` builders. The serializable ones encode durations as
//! milliseconds so they can be loaded from JSON:
//!
//! ```ignore
//! let stream: ProjectionStreamConfiguration =
//!     serde_json::from_str(r#"{ "batch_size": 50, "batch_window": 250 }"#)?;
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ProjectionError;

// ============================================================================
// Stream batching
// ============================================================================

/// How the stream driver groups events and bounds document processing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectionStreamConfiguration {
    /// Maximum events pulled into one chunk before routing.
    pub batch_size: usize,
    /// Maximum time to wait for a chunk to fill up.
    #[serde(with = "duration_ms")]
    pub batch_window: Duration,
    /// Retries of a failed batch after the first attempt.
    pub max_projection_retries: u32,
    /// Upper bound for one identity batch, including queueing behind earlier batches.
    #[serde(with = "duration_ms")]
    pub project_document_timeout: Duration,
    /// Identity batches of one chunk submitted concurrently.
    pub parallelism: usize,
}

impl Default for ProjectionStreamConfiguration {
    fn default() -> Self {
        Self {
            batch_size: 100,
            batch_window: Duration::from_millis(500),
            max_projection_retries: 5,
            project_document_timeout: Duration::from_secs(10),
            parallelism: 10,
        }
    }
}

impl ProjectionStreamConfiguration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_batch_window(mut self, batch_window: Duration) -> Self {
        self.batch_window = batch_window;
        self
    }

    pub fn with_max_projection_retries(mut self, retries: u32) -> Self {
        self.max_projection_retries = retries;
        self
    }

    pub fn with_project_document_timeout(mut self, timeout: Duration) -> Self {
        self.project_document_timeout = timeout;
        self
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), ProjectionError> {
        if self.batch_size == 0 {
            return Err(ProjectionError::InvalidConfiguration(
                "batch_size must be greater than zero".into(),
            ));
        }
        if self.parallelism == 0 {
            return Err(ProjectionError::InvalidConfiguration(
                "parallelism must be greater than zero".into(),
            ));
        }
        if self.batch_window.is_zero() || self.project_document_timeout.is_zero() {
            return Err(ProjectionError::InvalidConfiguration(
                "batch_window and project_document_timeout must be positive".into(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Restart policy
// ============================================================================

/// Backoff and budget for restarting a continuous projection's subscription.
///
/// The delay before restart `n` (zero based) is `min_backoff * 2^n` capped at
/// `max_backoff`, stretched by up to `random_factor`. More than
/// `max_restarts` restarts within `max_restarts_within` is terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartSettings {
    #[serde(with = "duration_ms")]
    pub min_backoff: Duration,
    #[serde(with = "duration_ms")]
    pub max_backoff: Duration,
    pub random_factor: f64,
    pub max_restarts: usize,
    #[serde(with = "duration_ms")]
    pub max_restarts_within: Duration,
}

impl Default for RestartSettings {
    fn default() -> Self {
        Self {
            min_backoff: Duration::from_secs(3),
            max_backoff: Duration::from_secs(60),
            random_factor: 0.2,
            max_restarts: 5,
            max_restarts_within: Duration::from_secs(15 * 60),
        }
    }
}

impl RestartSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backoff(mut self, min_backoff: Duration, max_backoff: Duration) -> Self {
        self.min_backoff = min_backoff;
        self.max_backoff = max_backoff;
        self
    }

    pub fn with_random_factor(mut self, random_factor: f64) -> Self {
        self.random_factor = random_factor;
        self
    }

    pub fn with_max_restarts(mut self, max_restarts: usize, within: Duration) -> Self {
        self.max_restarts = max_restarts;
        self.max_restarts_within = within;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), ProjectionError> {
        if self.min_backoff > self.max_backoff {
            return Err(ProjectionError::InvalidConfiguration(
                "min_backoff must not exceed max_backoff".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.random_factor) {
            return Err(ProjectionError::InvalidConfiguration(format!(
                "random_factor {} must be within 0.0..=1.0",
                self.random_factor
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Passivation
// ============================================================================

/// Memory bound for the projector pool of one projection on one node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PassivationSettings {
    /// Maximum simultaneously resident workers; `None` or 0 means unbounded.
    pub max_resident: Option<usize>,
    /// Idle time after which a worker tears itself down.
    #[serde(with = "option_duration_ms")]
    pub passivate_after: Option<Duration>,
}

impl PassivationSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_resident(mut self, max_resident: usize) -> Self {
        self.max_resident = Some(max_resident);
        self
    }

    pub fn with_passivate_after(mut self, idle: Duration) -> Self {
        self.passivate_after = Some(idle);
        self
    }

    /// The effective capacity, if any.
    pub fn capacity(&self) -> Option<usize> {
        self.max_resident.filter(|max| *max > 0)
    }
}

// ============================================================================
// Serde helpers
// ============================================================================

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod option_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&(duration.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
    }
}
