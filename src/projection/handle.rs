use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use super::configuration::RunProjection;
use crate::error::ProjectionError;

/// Lifecycle of a started projection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectionStatus {
    Running,
    /// The source completed and every event was acknowledged.
    Completed,
    /// The projection failed terminally.
    Failed(ProjectionError),
    /// The projection was stopped through its handle.
    Stopped,
}

impl ProjectionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProjectionStatus::Running)
    }
}

/// Observes and controls one running projection. Clones share the projection.
#[derive(Clone)]
pub struct ProjectionHandle {
    name: Arc<str>,
    status: watch::Receiver<ProjectionStatus>,
    stop: Arc<watch::Sender<bool>>,
}

impl ProjectionHandle {
    /// Spawn the projection's driver on the current runtime.
    pub(crate) fn spawn(projection: &dyn RunProjection) -> Self {
        let name: Arc<str> = Arc::from(projection.name());
        let run = projection.run();
        let (status_tx, status_rx) = watch::channel(ProjectionStatus::Running);
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let task_name = Arc::clone(&name);
        tokio::spawn(async move {
            let status = tokio::select! {
                result = run => match result {
                    Ok(()) => ProjectionStatus::Completed,
                    Err(error) => ProjectionStatus::Failed(error),
                },
                Ok(_) = stop_rx.wait_for(|stop| *stop) => ProjectionStatus::Stopped,
            };
            tracing::info!(projection = %task_name, status = ?status, "projection finished");
            status_tx.send_replace(status);
        });

        Self {
            name,
            status: status_rx,
            stop: Arc::new(stop_tx),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> ProjectionStatus {
        self.status.borrow().clone()
    }

    /// Wait until the projection completes, fails or is stopped.
    ///
    /// Stopped and completed projections return `Ok`; a failed one returns
    /// its error. With a timeout, gives up with `Timeout` if the projection
    /// is still running by then.
    pub async fn wait_for_completion(&self, timeout: Option<Duration>) -> Result<(), ProjectionError> {
        let status = match timeout {
            Some(after) => tokio::time::timeout(after, self.terminal_status())
                .await
                .map_err(|_| ProjectionError::Timeout {
                    target: format!("projection {}", self.name),
                    after,
                })??,
            None => self.terminal_status().await?,
        };

        match status {
            ProjectionStatus::Failed(error) => Err(error),
            _ => Ok(()),
        }
    }

    /// Ask the projection to stop. In-flight batches are abandoned and the
    /// stored position stays at the last acknowledged chunk.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    async fn terminal_status(&self) -> Result<ProjectionStatus, ProjectionError> {
        let mut status = self.status.clone();
        let terminal = status
            .wait_for(ProjectionStatus::is_terminal)
            .await
            .map_err(|_| ProjectionError::WorkerStopped(format!("projection {}", self.name)))?;
        Ok((*terminal).clone())
    }
}

impl std::fmt::Debug for ProjectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectionHandle")
            .field("name", &self.name)
            .field("status", &*self.status.borrow())
            .finish()
    }
}
