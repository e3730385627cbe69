//! Distribution proxy - One `submit` contract, local or sharded.
//!
//! The stream driver only ever sees `Arc<dyn ProjectorProxy<I, E>>`; whether
//! batches land in a pool in this process or on the node owning the
//! document's partition is decided by [`Distribution`].

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::{PassivationSettings, ProjectionStreamConfiguration};
use crate::document::{Document, DocumentId};
use crate::error::ProjectionError;
use crate::event::{EventWithPosition, ProjectionEvent};
use crate::handlers::ProjectionHandlers;
use crate::pool::ProjectorPool;
use crate::response::ProjectResponse;
use crate::storage::ProjectionStorage;

#[cfg(feature = "sharding")]
use crate::sharding::{ShardedProxy, ShardingSettings};

/// Uniform request/response contract for projecting batches.
#[async_trait]
pub trait ProjectorProxy<I, E>: Send + Sync
where
    I: DocumentId,
    E: ProjectionEvent,
{
    /// Apply a batch to the document `id`.
    async fn submit(&self, id: I, events: Vec<EventWithPosition<E>>) -> ProjectResponse;

    /// Identity of the document an event belongs to.
    fn extract_id(&self, event: &E) -> Result<I, ProjectionError>;
}

/// Delegates to a projector pool in this process.
pub struct LocalProxy<I, D, E> {
    pool: ProjectorPool<I, D, E>,
}

impl<I, D, E> LocalProxy<I, D, E>
where
    I: DocumentId,
    D: Document,
    E: ProjectionEvent,
{
    pub fn new(pool: ProjectorPool<I, D, E>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &ProjectorPool<I, D, E> {
        &self.pool
    }
}

#[async_trait]
impl<I, D, E> ProjectorProxy<I, E> for LocalProxy<I, D, E>
where
    I: DocumentId,
    D: Document,
    E: ProjectionEvent,
{
    async fn submit(&self, id: I, events: Vec<EventWithPosition<E>>) -> ProjectResponse {
        self.pool.submit(id, events).await
    }

    fn extract_id(&self, event: &E) -> Result<I, ProjectionError> {
        self.pool.handlers().extract_id(event)
    }
}

/// Where the document workers of a projection live.
#[derive(Clone)]
pub enum Distribution {
    /// A single projector pool in this process.
    Local(PassivationSettings),
    /// One pool per cluster node, each owning a share of the partitions.
    #[cfg(feature = "sharding")]
    Sharded(ShardingSettings),
}

impl Default for Distribution {
    fn default() -> Self {
        Distribution::Local(PassivationSettings::default())
    }
}

impl Distribution {
    /// Build the proxy for one projection.
    pub fn create_proxy<I, D, E>(
        &self,
        projection: &str,
        handlers: ProjectionHandlers<I, D, E>,
        storage: Arc<dyn ProjectionStorage>,
        stream: &ProjectionStreamConfiguration,
    ) -> Result<Arc<dyn ProjectorProxy<I, E>>, ProjectionError>
    where
        I: DocumentId,
        D: Document,
        E: ProjectionEvent,
    {
        match self {
            Distribution::Local(passivation) => {
                let pool = ProjectorPool::new(projection, handlers, storage, stream, passivation.clone());
                Ok(Arc::new(LocalProxy::new(pool)))
            }
            #[cfg(feature = "sharding")]
            Distribution::Sharded(settings) => {
                let name = projection.to_string();
                let stream = stream.clone();
                let passivation = settings.passivation.clone();
                let pool_handlers = handlers.clone();
                let proxy = ShardedProxy::start(
                    projection,
                    settings.cluster.clone(),
                    settings.number_of_partitions,
                    handlers,
                    move |node: &str| {
                        tracing::debug!(projection = %name, node, "starting shard region");
                        ProjectorPool::new(
                            name.clone(),
                            pool_handlers.clone(),
                            Arc::clone(&storage),
                            &stream,
                            passivation.clone(),
                        )
                    },
                )?;
                Ok(Arc::new(proxy))
            }
        }
    }
}
