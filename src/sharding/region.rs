use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::sync::Arc;

use super::cluster::{Handoff, InMemoryCluster, NodeId, PartitionTable, RegionEndpoint, WeakCluster};
use super::partition::{partition_for, PartitionId};
use crate::document::{Document, DocumentId};
use crate::error::ProjectionError;
use crate::event::{EventWithPosition, ProjectionEvent};
use crate::pool::ProjectorPool;
use crate::proxy::ProjectorProxy;
use crate::response::ProjectResponse;
use crate::worker::StopWatch;

/// A batch addressed to a document on another node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(deserialize = "E: serde::de::DeserializeOwned"))]
pub(crate) struct ShardEnvelope<E> {
    pub partition: PartitionId,
    pub id: String,
    pub events: Vec<EventWithPosition<E>>,
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProjectionError> {
    bitcode::serialize(value).map_err(|e| ProjectionError::Codec(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProjectionError> {
    bitcode::deserialize(bytes).map_err(|e| ProjectionError::Codec(e.to_string()))
}

/// The projector pool of one projection on one node.
///
/// A region only creates workers for partitions its node owns, and checks
/// that while holding the partition table. When the table moves a
/// partition away, the cluster releases the region's workers for it.
pub struct ShardRegion<I, D, E> {
    node: NodeId,
    pool: ProjectorPool<I, D, E>,
    cluster: WeakCluster,
    number_of_partitions: u32,
}

impl<I, D, E> ShardRegion<I, D, E>
where
    I: DocumentId,
    D: Document,
    E: ProjectionEvent,
{
    pub fn new(
        node: impl Into<String>,
        pool: ProjectorPool<I, D, E>,
        cluster: WeakCluster,
        number_of_partitions: u32,
    ) -> Self {
        Self {
            node: node.into(),
            pool,
            cluster,
            number_of_partitions,
        }
    }

    pub fn pool(&self) -> &ProjectorPool<I, D, E> {
        &self.pool
    }

    async fn handle(&self, partition: PartitionId, payload: &[u8]) -> ProjectResponse {
        let envelope: ShardEnvelope<E> = match decode(payload) {
            Ok(envelope) => envelope,
            Err(error) => return ProjectResponse::Reject(error),
        };

        let id = match I::parse_id(&envelope.id) {
            Ok(id) => id,
            Err(error) => return ProjectResponse::Reject(error),
        };

        let checked_out = if envelope.partition == partition {
            self.cluster
                .upgrade()
                .and_then(|cluster| cluster.while_owned(&self.node, partition, || self.pool.checkout(&id)))
        } else {
            None
        };

        match checked_out {
            Some(Ok(worker)) => self.pool.project_on(id, worker, envelope.events).await,
            Some(Err(error)) => ProjectResponse::Reject(error),
            None => ProjectResponse::Reject(ProjectionError::Routing(format!(
                "node {} does not own partition {}",
                self.node, partition
            ))),
        }
    }
}

#[async_trait]
impl<I, D, E> RegionEndpoint for ShardRegion<I, D, E>
where
    I: DocumentId,
    D: Document,
    E: ProjectionEvent,
{
    async fn deliver(&self, partition: PartitionId, payload: Vec<u8>) -> Result<Vec<u8>, ProjectionError> {
        let response = self.handle(partition, &payload).await;
        encode(&response)
    }

    fn release_unowned(&self, table: &PartitionTable) -> Vec<Handoff> {
        let partitions = self.number_of_partitions;
        let owned = |id: &I| table.owner(partition_for(&id.to_id_string(), partitions)) == Some(self.node.as_str());

        let released = self.pool.release_where(|id| !owned(id));
        if !released.is_empty() {
            tracing::debug!(
                projection = %self.pool.projection(),
                node = %self.node,
                epoch = table.epoch(),
                documents = released.len(),
                "handing off documents of reassigned partitions"
            );
        }

        released
            .into_iter()
            .map(|(id, predecessor)| {
                let id = id.to_id_string();
                Handoff {
                    partition: partition_for(&id, partitions),
                    id,
                    predecessor,
                }
            })
            .collect()
    }

    fn adopt(&self, id: &str, predecessor: StopWatch) {
        match I::parse_id(id) {
            Ok(id) => self.pool.adopt(id, predecessor),
            Err(error) => tracing::warn!(
                projection = %self.pool.projection(),
                node = %self.node,
                error = %error,
                "could not adopt handed off document"
            ),
        }
    }
}

/// Routes batches to the node owning the document's partition.
pub struct ShardedProxy<I, D, E> {
    projection: String,
    cluster: InMemoryCluster,
    number_of_partitions: u32,
    handlers: crate::handlers::ProjectionHandlers<I, D, E>,
    _document: PhantomData<fn() -> D>,
}

impl<I, D, E> ShardedProxy<I, D, E>
where
    I: DocumentId,
    D: Document,
    E: ProjectionEvent,
{
    /// Host the projection on every member of `cluster` and route to it.
    ///
    /// `pool_for_node` builds the projector pool of a node's region.
    pub fn start<F>(
        projection: impl Into<String>,
        cluster: InMemoryCluster,
        number_of_partitions: u32,
        handlers: crate::handlers::ProjectionHandlers<I, D, E>,
        pool_for_node: F,
    ) -> Result<Self, ProjectionError>
    where
        F: Fn(&str) -> ProjectorPool<I, D, E> + Send + Sync + 'static,
    {
        if number_of_partitions == 0 {
            return Err(ProjectionError::InvalidConfiguration(
                "number_of_partitions must be greater than zero".into(),
            ));
        }

        let projection = projection.into();
        let weak = cluster.downgrade();
        cluster.register_projection(
            &projection,
            Arc::new(move |node: &str| -> Arc<dyn RegionEndpoint> {
                Arc::new(ShardRegion::new(
                    node,
                    pool_for_node(node),
                    weak.clone(),
                    number_of_partitions,
                ))
            }),
        )?;

        Ok(Self {
            projection,
            cluster,
            number_of_partitions,
            handlers,
            _document: PhantomData,
        })
    }

    pub fn partition_of(&self, id: &I) -> PartitionId {
        partition_for(&id.to_id_string(), self.number_of_partitions)
    }
}

#[async_trait]
impl<I, D, E> ProjectorProxy<I, E> for ShardedProxy<I, D, E>
where
    I: DocumentId,
    D: Document,
    E: ProjectionEvent,
{
    async fn submit(&self, id: I, events: Vec<EventWithPosition<E>>) -> ProjectResponse {
        let id = id.to_id_string();
        let partition = partition_for(&id, self.number_of_partitions);
        let envelope = ShardEnvelope {
            partition,
            id,
            events,
        };

        let payload = match encode(&envelope) {
            Ok(payload) => payload,
            Err(error) => return ProjectResponse::Reject(error),
        };

        match self.cluster.deliver(&self.projection, partition, payload).await {
            Ok(reply) => decode(&reply).unwrap_or_else(ProjectResponse::Reject),
            Err(error) => {
                tracing::warn!(
                    projection = %self.projection,
                    partition,
                    error = %error,
                    "could not route batch"
                );
                ProjectResponse::Reject(error)
            }
        }
    }

    fn extract_id(&self, event: &E) -> Result<I, ProjectionError> {
        self.handlers.extract_id(event)
    }
}
