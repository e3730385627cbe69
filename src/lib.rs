extern crate self as sourced_projections;

mod config;
mod document;
mod error;
mod event;
mod handlers;
mod pool;
mod projection;
mod proxy;
mod response;
#[cfg(feature = "sharding")]
pub mod sharding;
mod storage;
mod stream;
mod worker;

pub use config::{PassivationSettings, ProjectionStreamConfiguration, RestartSettings};
pub use document::{Document, DocumentId};
pub use error::ProjectionError;
pub use event::{max_position, EventWithPosition, Position, ProjectionEvent};
pub use handlers::ProjectionHandlers;
pub use pool::ProjectorPool;
pub use projection::{
    Projection, ProjectionConfiguration, ProjectionHandle, ProjectionStatus, ProjectionsCoordinator,
    RunProjection,
};
pub use proxy::{Distribution, LocalProxy, ProjectorProxy};
pub use response::ProjectResponse;
pub use storage::{
    BatchingStorageSession, DocumentToDelete, DocumentToStore, InMemoryPositionStorage,
    InMemoryProjectionStorage, PositionStorage, ProjectionStorage, ProjectionStorageExt,
    StorageBatching, StorageError, StoreIntent,
};
pub use stream::{EventSource, InMemoryEventSource, ProjectionMode, RestartBackoff, StreamDriver};
pub use worker::{DocumentWorker, StopWatch, WorkerHandle, WorkerState, WorkerUnavailable};

#[cfg(feature = "sharding")]
pub use sharding::{InMemoryCluster, ShardingSettings};

// Re-export the derive macro so users only need one dependency
pub use sourced_projections_macros::Document;
