use std::collections::HashMap;

use super::configuration::RunProjection;
use super::handle::ProjectionHandle;
use crate::error::ProjectionError;

/// Registry of named projections and their running drivers.
///
/// Projections are registered first and spawned by [`start`](Self::start);
/// registering after `start` queues the projection for the next call.
#[derive(Default)]
pub struct ProjectionsCoordinator {
    pending: Vec<Box<dyn RunProjection>>,
    handles: HashMap<String, ProjectionHandle>,
    order: Vec<String>,
}

impl ProjectionsCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a projection. Names must be unique.
    pub fn register(&mut self, projection: impl RunProjection) -> Result<(), ProjectionError> {
        let name = projection.name().to_string();
        if self.order.iter().any(|registered| *registered == name) {
            return Err(ProjectionError::InvalidConfiguration(format!(
                "projection {} is already registered",
                name
            )));
        }
        self.order.push(name);
        self.pending.push(Box::new(projection));
        Ok(())
    }

    /// Spawn one stream driver per registered projection not yet started.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&mut self) {
        for projection in self.pending.drain(..) {
            tracing::info!(projection = %projection.name(), "starting projection");
            let handle = ProjectionHandle::spawn(projection.as_ref());
            self.handles.insert(projection.name().to_string(), handle);
        }
    }

    /// Handle of a started projection.
    ///
    /// Handles exist once [`start`](Self::start) has spawned the projection;
    /// before that a registered name yields `NotStarted`.
    pub fn get_projection(&self, name: &str) -> Result<ProjectionHandle, ProjectionError> {
        if let Some(handle) = self.handles.get(name) {
            return Ok(handle.clone());
        }
        if self.pending.iter().any(|projection| projection.name() == name) {
            return Err(ProjectionError::NotStarted(name.to_string()));
        }
        Err(ProjectionError::UnknownProjection(name.to_string()))
    }

    /// Handles of every started projection, in registration order.
    pub fn get_all(&self) -> Vec<ProjectionHandle> {
        self.order
            .iter()
            .filter_map(|name| self.handles.get(name).cloned())
            .collect()
    }

    /// Ask every started projection to stop.
    pub fn stop_all(&self) {
        for handle in self.handles.values() {
            handle.stop();
        }
    }
}
