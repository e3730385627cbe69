//! Batching storage session - Coalesces concurrent store calls into windowed flushes.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout_at, Instant};

use super::{DocumentToDelete, DocumentToStore, ProjectionStorage, StorageError, StoreIntent};

/// How store calls reach the storage backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StorageBatching {
    /// Every store call goes straight to the backend.
    #[default]
    None,
    /// Store calls are buffered and flushed together once `max_batch`
    /// intents are pending or `window` has elapsed since the first one.
    Batched { max_batch: usize, window: Duration },
}

impl StorageBatching {
    pub fn batched(max_batch: usize, window: Duration) -> Self {
        StorageBatching::Batched { max_batch, window }
    }

    /// Wrap a backend according to this strategy.
    ///
    /// The batched strategy spawns its flush task, so it must be applied
    /// from within a tokio runtime.
    pub fn apply(&self, storage: Arc<dyn ProjectionStorage>) -> Arc<dyn ProjectionStorage> {
        match *self {
            StorageBatching::None => storage,
            StorageBatching::Batched { max_batch, window } => {
                Arc::new(BatchingStorageSession::spawn(storage, max_batch, window))
            }
        }
    }
}

struct PendingWrite {
    intent: StoreIntent,
    reply: oneshot::Sender<Result<(), StorageError>>,
}

/// A [`ProjectionStorage`] that buffers writes from many workers.
///
/// One background task owns the buffer and performs every flush, so flushes
/// never overlap. Within one flush the last write per document wins, in
/// submission order. A failed flush fails every caller that contributed to
/// it. Loads bypass the buffer; a caller's own write is always flushed
/// before its `store` returns.
pub struct BatchingStorageSession {
    storage: Arc<dyn ProjectionStorage>,
    sender: mpsc::Sender<PendingWrite>,
}

impl BatchingStorageSession {
    pub fn spawn(storage: Arc<dyn ProjectionStorage>, max_batch: usize, window: Duration) -> Self {
        let max_batch = max_batch.max(1);
        let (sender, receiver) = mpsc::channel(max_batch);
        tokio::spawn(run_session(Arc::clone(&storage), receiver, max_batch, window));
        Self { storage, sender }
    }
}

#[async_trait]
impl ProjectionStorage for BatchingStorageSession {
    async fn load(&self, collection: &str, id: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.storage.load(collection, id).await
    }

    async fn store(&self, intent: StoreIntent) -> Result<(), StorageError> {
        if intent.is_empty() {
            return Ok(());
        }

        let (reply, response) = oneshot::channel();
        self.sender
            .send(PendingWrite { intent, reply })
            .await
            .map_err(|_| StorageError::Backend("batching session closed".into()))?;

        response
            .await
            .map_err(|_| StorageError::Backend("batching session dropped the write".into()))?
    }
}

async fn run_session(
    storage: Arc<dyn ProjectionStorage>,
    mut receiver: mpsc::Receiver<PendingWrite>,
    max_batch: usize,
    window: Duration,
) {
    while let Some(first) = receiver.recv().await {
        let deadline = Instant::now() + window;
        let mut pending = vec![first];

        while pending.len() < max_batch {
            match timeout_at(deadline, receiver.recv()).await {
                Ok(Some(write)) => pending.push(write),
                Ok(None) | Err(_) => break,
            }
        }

        flush(storage.as_ref(), pending).await;
    }
}

async fn flush(storage: &dyn ProjectionStorage, pending: Vec<PendingWrite>) {
    let mut replies = Vec::with_capacity(pending.len());
    let mut intents = Vec::with_capacity(pending.len());
    for write in pending {
        replies.push(write.reply);
        intents.push(write.intent);
    }

    let merged = coalesce(intents);
    tracing::debug!(
        callers = replies.len(),
        upserts = merged.upserts.len(),
        deletes = merged.deletes.len(),
        "flushing batched store"
    );

    let result = storage.store(merged).await;
    if let Err(e) = &result {
        tracing::warn!(callers = replies.len(), error = %e, "batched store failed");
    }

    for reply in replies {
        // A caller that stopped waiting is not an error.
        let _ = reply.send(result.clone());
    }
}

enum Write {
    Upsert(DocumentToStore),
    Delete(DocumentToDelete),
}

/// Merge intents so that only the last write per document survives.
fn coalesce(intents: Vec<StoreIntent>) -> StoreIntent {
    let mut order: Vec<(String, String)> = Vec::new();
    let mut latest: HashMap<(String, String), Write> = HashMap::new();

    let mut record = |key: (String, String), write: Write| {
        if latest.insert(key.clone(), write).is_none() {
            order.push(key);
        }
    };

    for intent in intents {
        for upsert in intent.upserts {
            record((upsert.collection.clone(), upsert.id.clone()), Write::Upsert(upsert));
        }
        for delete in intent.deletes {
            record((delete.collection.clone(), delete.id.clone()), Write::Delete(delete));
        }
    }

    let mut merged = StoreIntent::new();
    for key in order {
        match latest.remove(&key) {
            Some(Write::Upsert(upsert)) => merged.upserts.push(upsert),
            Some(Write::Delete(delete)) => merged.deletes.push(delete),
            None => {}
        }
    }
    merged
}
