use futures::future::{BoxFuture, FutureExt};
use std::sync::Arc;

use crate::config::{ProjectionStreamConfiguration, RestartSettings};
use crate::document::{Document, DocumentId};
use crate::error::ProjectionError;
use crate::event::ProjectionEvent;
use crate::handlers::ProjectionHandlers;
use crate::proxy::Distribution;
use crate::storage::{
    InMemoryPositionStorage, InMemoryProjectionStorage, PositionStorage, ProjectionStorage,
    StorageBatching,
};
use crate::stream::{EventSource, ProjectionMode, StreamDriver};

/// A projection the coordinator can run without knowing its types.
pub trait RunProjection: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Drive the projection until it completes or fails.
    fn run(&self) -> BoxFuture<'static, Result<(), ProjectionError>>;
}

/// Collects everything one named projection needs.
///
/// Storage and position storage default to fresh in-memory backends; every
/// other setting defaults as documented on its type.
///
/// ## Example
///
/// ```ignore
/// let projection = ProjectionConfiguration::new("order_views", handlers, source)
///     .with_storage(storage.clone())
///     .with_storage_batching(StorageBatching::batched(50, Duration::from_millis(20)))
///     .with_distribution(Distribution::Local(PassivationSettings::new().with_max_resident(1_000)))
///     .build()?;
///
/// coordinator.register(projection)?;
/// ```
pub struct ProjectionConfiguration<I, D, E> {
    name: String,
    handlers: ProjectionHandlers<I, D, E>,
    source: Arc<dyn EventSource<E>>,
    storage: Arc<dyn ProjectionStorage>,
    positions: Arc<dyn PositionStorage>,
    stream: ProjectionStreamConfiguration,
    restart: RestartSettings,
    batching: StorageBatching,
    distribution: Distribution,
    mode: ProjectionMode,
}

impl<I, D, E> ProjectionConfiguration<I, D, E>
where
    I: DocumentId,
    D: Document,
    E: ProjectionEvent,
{
    pub fn new(
        name: impl Into<String>,
        handlers: ProjectionHandlers<I, D, E>,
        source: impl EventSource<E> + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            handlers,
            source: Arc::new(source),
            storage: Arc::new(InMemoryProjectionStorage::new()),
            positions: Arc::new(InMemoryPositionStorage::new()),
            stream: ProjectionStreamConfiguration::default(),
            restart: RestartSettings::default(),
            batching: StorageBatching::default(),
            distribution: Distribution::default(),
            mode: ProjectionMode::default(),
        }
    }

    pub fn with_storage(mut self, storage: impl ProjectionStorage + 'static) -> Self {
        self.storage = Arc::new(storage);
        self
    }

    pub fn with_positions(mut self, positions: impl PositionStorage + 'static) -> Self {
        self.positions = Arc::new(positions);
        self
    }

    pub fn with_stream(mut self, stream: ProjectionStreamConfiguration) -> Self {
        self.stream = stream;
        self
    }

    pub fn with_restart_settings(mut self, restart: RestartSettings) -> Self {
        self.restart = restart;
        self
    }

    pub fn with_storage_batching(mut self, batching: StorageBatching) -> Self {
        self.batching = batching;
        self
    }

    pub fn with_distribution(mut self, distribution: Distribution) -> Self {
        self.distribution = distribution;
        self
    }

    pub fn with_mode(mut self, mode: ProjectionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Validate the configuration.
    pub fn build(self) -> Result<Projection<I, D, E>, ProjectionError> {
        if self.name.trim().is_empty() {
            return Err(ProjectionError::InvalidConfiguration(
                "projection name must not be empty".into(),
            ));
        }
        if self.handlers.is_empty() {
            return Err(ProjectionError::InvalidConfiguration(format!(
                "projection {} has no event handlers",
                self.name
            )));
        }
        self.stream.validate()?;
        self.restart.validate()?;

        if let StorageBatching::Batched { max_batch, window } = self.batching {
            if max_batch == 0 || window.is_zero() {
                return Err(ProjectionError::InvalidConfiguration(
                    "storage batching needs a positive max_batch and window".into(),
                ));
            }
        }

        #[cfg(feature = "sharding")]
        if let Distribution::Sharded(settings) = &self.distribution {
            if settings.number_of_partitions == 0 {
                return Err(ProjectionError::InvalidConfiguration(
                    "number_of_partitions must be greater than zero".into(),
                ));
            }
        }

        Ok(Projection {
            name: self.name,
            handlers: self.handlers,
            source: self.source,
            storage: self.storage,
            positions: self.positions,
            stream: self.stream,
            restart: self.restart,
            batching: self.batching,
            distribution: self.distribution,
            mode: self.mode,
        })
    }
}

/// A validated projection, ready to be registered with a coordinator.
pub struct Projection<I, D, E> {
    name: String,
    handlers: ProjectionHandlers<I, D, E>,
    source: Arc<dyn EventSource<E>>,
    storage: Arc<dyn ProjectionStorage>,
    positions: Arc<dyn PositionStorage>,
    stream: ProjectionStreamConfiguration,
    restart: RestartSettings,
    batching: StorageBatching,
    distribution: Distribution,
    mode: ProjectionMode,
}

impl<I, D, E> Clone for Projection<I, D, E> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            handlers: self.handlers.clone(),
            source: Arc::clone(&self.source),
            storage: Arc::clone(&self.storage),
            positions: Arc::clone(&self.positions),
            stream: self.stream.clone(),
            restart: self.restart.clone(),
            batching: self.batching,
            distribution: self.distribution.clone(),
            mode: self.mode,
        }
    }
}

impl<I, D, E> Projection<I, D, E>
where
    I: DocumentId,
    D: Document,
    E: ProjectionEvent,
{
    pub fn mode(&self) -> ProjectionMode {
        self.mode
    }

    async fn execute(self) -> Result<(), ProjectionError> {
        let storage = self.batching.apply(self.storage);
        let proxy = self
            .distribution
            .create_proxy(&self.name, self.handlers, storage, &self.stream)?;

        StreamDriver::new(self.name, self.source, proxy, self.positions)
            .with_stream(self.stream)
            .with_restart_settings(self.restart)
            .with_mode(self.mode)
            .run()
            .await
    }
}

impl<I, D, E> RunProjection for Projection<I, D, E>
where
    I: DocumentId,
    D: Document,
    E: ProjectionEvent,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self) -> BoxFuture<'static, Result<(), ProjectionError>> {
        self.clone().execute().boxed()
    }
}
