//! InMemoryProjectionStorage - HashMap-backed document storage for testing and development.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use super::{decode_document, ProjectionStorage, StorageError, StoreIntent};
use crate::document::Document;

/// Internal stored representation of a document.
struct StoredDocument {
    bytes: Vec<u8>,
    version: u64,
}

/// In-memory document storage backed by a HashMap.
///
/// Storage key is `"collection:id"`. Clone-friendly via Arc.
#[derive(Clone, Default)]
pub struct InMemoryProjectionStorage {
    documents: Arc<RwLock<HashMap<String, StoredDocument>>>,
    store_calls: Arc<AtomicUsize>,
}

impl InMemoryProjectionStorage {
    /// Create a new empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    fn make_key(collection: &str, id: &str) -> String {
        format!("{}:{}", collection, id)
    }

    /// Number of stored documents across all collections.
    pub fn len(&self) -> usize {
        self.documents.read().map(|docs| docs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// How many times `store` has been called.
    pub fn store_calls(&self) -> usize {
        self.store_calls.load(Ordering::SeqCst)
    }

    /// Version of a stored document; bumped on every upsert.
    pub fn version_of<D: Document>(&self, id: &str) -> Option<u64> {
        let key = Self::make_key(D::COLLECTION, id);
        self.documents
            .read()
            .ok()
            .and_then(|docs| docs.get(&key).map(|stored| stored.version))
    }

    /// Decode every document of one collection.
    pub fn load_all<D: Document>(&self) -> Result<Vec<D>, StorageError> {
        let documents = self
            .documents
            .read()
            .map_err(|_| StorageError::LockPoisoned("documents".into()))?;

        let prefix = format!("{}:", D::COLLECTION);
        documents
            .iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .map(|(_, stored)| decode_document(&stored.bytes))
            .collect()
    }
}

#[async_trait]
impl ProjectionStorage for InMemoryProjectionStorage {
    async fn load(&self, collection: &str, id: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let documents = self
            .documents
            .read()
            .map_err(|_| StorageError::LockPoisoned("documents".into()))?;

        Ok(documents
            .get(&Self::make_key(collection, id))
            .map(|stored| stored.bytes.clone()))
    }

    async fn store(&self, intent: StoreIntent) -> Result<(), StorageError> {
        self.store_calls.fetch_add(1, Ordering::SeqCst);

        let mut documents = self
            .documents
            .write()
            .map_err(|_| StorageError::LockPoisoned("documents".into()))?;

        for upsert in intent.upserts {
            let key = Self::make_key(&upsert.collection, &upsert.id);
            let version = documents.get(&key).map(|s| s.version + 1).unwrap_or(1);
            documents.insert(
                key,
                StoredDocument {
                    bytes: upsert.data,
                    version,
                },
            );
        }

        for delete in intent.deletes {
            documents.remove(&Self::make_key(&delete.collection, &delete.id));
        }

        Ok(())
    }
}
