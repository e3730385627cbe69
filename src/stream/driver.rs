use std::sync::Arc;
use tokio_stream::StreamExt;

use super::restart::RestartBackoff;
use super::source::EventSource;
use super::submit::project_chunk;
use crate::config::{ProjectionStreamConfiguration, RestartSettings};
use crate::document::DocumentId;
use crate::error::ProjectionError;
use crate::event::{EventWithPosition, Position, ProjectionEvent};
use crate::proxy::ProjectorProxy;
use crate::storage::PositionStorage;

/// How a projection consumes its source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProjectionMode {
    /// Follow the source and restart under the restart policy on failure.
    #[default]
    Continuous,
    /// Consume the source once and complete. Starts after `start_from`, or
    /// after the stored position when None. Failures are not restarted.
    OneTime { start_from: Option<Position> },
}

/// Pulls a projection's events, routes them and advances its cursor.
pub struct StreamDriver<I, E> {
    projection: String,
    source: Arc<dyn EventSource<E>>,
    proxy: Arc<dyn ProjectorProxy<I, E>>,
    positions: Arc<dyn PositionStorage>,
    stream: ProjectionStreamConfiguration,
    restart: RestartSettings,
    mode: ProjectionMode,
}

impl<I, E> StreamDriver<I, E>
where
    I: DocumentId,
    E: ProjectionEvent,
{
    pub fn new(
        projection: impl Into<String>,
        source: Arc<dyn EventSource<E>>,
        proxy: Arc<dyn ProjectorProxy<I, E>>,
        positions: Arc<dyn PositionStorage>,
    ) -> Self {
        Self {
            projection: projection.into(),
            source,
            proxy,
            positions,
            stream: ProjectionStreamConfiguration::default(),
            restart: RestartSettings::default(),
            mode: ProjectionMode::default(),
        }
    }

    pub fn with_stream(mut self, stream: ProjectionStreamConfiguration) -> Self {
        self.stream = stream;
        self
    }

    pub fn with_restart_settings(mut self, restart: RestartSettings) -> Self {
        self.restart = restart;
        self
    }

    pub fn with_mode(mut self, mode: ProjectionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Run until the source completes, a configuration error occurs, or the
    /// restart budget is exhausted.
    pub async fn run(&self) -> Result<(), ProjectionError> {
        match self.mode {
            ProjectionMode::OneTime { start_from } => {
                let mut progressed = false;
                let result = self.run_once(start_from, &mut progressed).await;
                match &result {
                    Ok(()) => tracing::info!(projection = %self.projection, "one-time projection completed"),
                    Err(error) => tracing::error!(
                        projection = %self.projection,
                        error = %error,
                        "one-time projection failed"
                    ),
                }
                result
            }
            ProjectionMode::Continuous => self.run_continuous().await,
        }
    }

    async fn run_continuous(&self) -> Result<(), ProjectionError> {
        let mut backoff = RestartBackoff::new(self.restart.clone());

        loop {
            let mut progressed = false;
            let error = match self.run_once(None, &mut progressed).await {
                Ok(()) => {
                    tracing::info!(projection = %self.projection, "projection source completed");
                    return Ok(());
                }
                Err(error) => error,
            };

            if error.is_configuration() {
                tracing::error!(
                    projection = %self.projection,
                    error = %error,
                    "projection misconfigured, not restarting"
                );
                return Err(error);
            }

            if progressed {
                backoff.reset();
            }

            let Some(delay) = backoff.next_delay() else {
                tracing::error!(
                    projection = %self.projection,
                    restarts = backoff.restarts(),
                    error = %error,
                    "projection exhausted its restart budget"
                );
                return Err(ProjectionError::RestartBudgetExhausted {
                    projection: self.projection.clone(),
                    restarts: backoff.restarts(),
                    last_error: Box::new(error),
                });
            };

            tracing::warn!(
                projection = %self.projection,
                restarts = backoff.restarts(),
                error = %error,
                "projection stream failed, restarting in {:?}",
                delay
            );
            tokio::time::sleep(delay).await;
            tracing::info!(projection = %self.projection, "restarting projection stream");
        }
    }

    /// One subscription: from the start position until the source ends or fails.
    async fn run_once(
        &self,
        start_from: Option<Position>,
        progressed: &mut bool,
    ) -> Result<(), ProjectionError> {
        let start = match start_from {
            Some(position) => Some(position),
            None => self.positions.load_latest(&self.projection).await?,
        };
        tracing::info!(projection = %self.projection, start = ?start, "starting projection stream");

        let mut cursor = start;
        let chunks = self
            .source
            .start_from(start)
            .chunks_timeout(self.stream.batch_size, self.stream.batch_window);
        tokio::pin!(chunks);

        while let Some(chunk) = chunks.next().await {
            let (events, failure) = split_at_failure(chunk);

            if !events.is_empty() {
                let count = events.len();
                let acknowledged = project_chunk(self.proxy.as_ref(), events, self.stream.parallelism).await?;
                *progressed = true;

                if let Some(position) = acknowledged {
                    if cursor.map_or(true, |current| position > current) {
                        self.positions.store_latest(&self.projection, position).await?;
                        cursor = Some(position);
                    }
                }
                tracing::debug!(projection = %self.projection, events = count, cursor = ?cursor, "chunk projected");
            }

            if let Some(error) = failure {
                return Err(error);
            }
        }

        Ok(())
    }
}

/// Events before the first error in a chunk, and that error.
fn split_at_failure<E>(
    chunk: Vec<Result<EventWithPosition<E>, ProjectionError>>,
) -> (Vec<EventWithPosition<E>>, Option<ProjectionError>) {
    let mut events = Vec::with_capacity(chunk.len());
    for item in chunk {
        match item {
            Ok(event) => events.push(event),
            Err(error) => return (events, Some(error)),
        }
    }
    (events, None)
}
