//! ProjectionStorage - Abstract document storage used by document workers.

use async_trait::async_trait;
use std::sync::Arc;

use super::{decode_document, StorageError, StoreIntent};
use crate::document::Document;

/// Abstract storage for projected documents.
///
/// Implementations must apply a whole `StoreIntent` or none of it. Callers
/// bound every call with the per-batch timeout; dropping the returned future
/// cancels the call.
#[async_trait]
pub trait ProjectionStorage: Send + Sync {
    /// Load the raw bytes of a document. Returns None if not found.
    async fn load(&self, collection: &str, id: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Apply upserts and deletes.
    async fn store(&self, intent: StoreIntent) -> Result<(), StorageError>;
}

#[async_trait]
impl<S: ProjectionStorage + ?Sized> ProjectionStorage for Arc<S> {
    async fn load(&self, collection: &str, id: &str) -> Result<Option<Vec<u8>>, StorageError> {
        (**self).load(collection, id).await
    }

    async fn store(&self, intent: StoreIntent) -> Result<(), StorageError> {
        (**self).store(intent).await
    }
}

/// Typed helpers on top of [`ProjectionStorage`].
#[async_trait]
pub trait ProjectionStorageExt: ProjectionStorage {
    /// Load and decode a document.
    async fn load_document<D: Document>(&self, id: &str) -> Result<Option<D>, StorageError> {
        match self.load(D::COLLECTION, id).await? {
            Some(bytes) => decode_document(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Upsert a single document.
    async fn upsert_document<D: Document>(&self, id: &str, document: &D) -> Result<(), StorageError> {
        let intent = StoreIntent::new().upsert_document(id, document)?;
        self.store(intent).await
    }

    /// Delete a single document.
    async fn delete_document<D: Document>(&self, id: &str) -> Result<(), StorageError> {
        self.store(StoreIntent::new().delete_document::<D>(id)).await
    }
}

impl<S: ProjectionStorage + ?Sized> ProjectionStorageExt for S {}
