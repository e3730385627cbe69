use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use sourced_projections::{
    EventSource, EventWithPosition, InMemoryProjectionStorage, Position, ProjectionError,
    ProjectionStorage, StorageError, StoreIntent,
};

use crate::views::OrderEvent;

/// In-memory storage whose next `failures` stores fail.
#[derive(Clone, Default)]
pub struct FlakyStorage {
    pub inner: InMemoryProjectionStorage,
    failures: Arc<AtomicUsize>,
}

impl FlakyStorage {
    pub fn failing(failures: usize) -> Self {
        Self {
            inner: InMemoryProjectionStorage::new(),
            failures: Arc::new(AtomicUsize::new(failures)),
        }
    }
}

#[async_trait]
impl ProjectionStorage for FlakyStorage {
    async fn load(&self, collection: &str, id: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.inner.load(collection, id).await
    }

    async fn store(&self, intent: StoreIntent) -> Result<(), StorageError> {
        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failed {
            return Err(StorageError::Backend("connection reset".into()));
        }
        self.inner.store(intent).await
    }
}

/// A source that fails on every subscription.
#[derive(Clone, Default)]
pub struct BrokenSource {
    pub subscriptions: Arc<AtomicUsize>,
}

impl BrokenSource {
    pub fn subscriptions(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }
}

impl EventSource<OrderEvent> for BrokenSource {
    fn start_from(
        &self,
        _after: Option<Position>,
    ) -> BoxStream<'static, Result<EventWithPosition<OrderEvent>, ProjectionError>> {
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        stream::iter(vec![Err(ProjectionError::source_failed("broker unavailable"))]).boxed()
    }
}
