//! Storage - Where projected documents and stream positions live.
//!
//! Storage is type-erased: documents travel as JSON bytes keyed by
//! collection and id, so one backend (and one batching session) can serve
//! any number of document types.
//!
//! ## Example
//!
//! ```ignore
//! use sourced_projections::{InMemoryProjectionStorage, ProjectionStorage, ProjectionStorageExt, StoreIntent};
//!
//! let storage = InMemoryProjectionStorage::new();
//! storage.store(StoreIntent::new().upsert_document("order-1", &view)?).await?;
//! let loaded: Option<OrderView> = storage.load_document("order-1").await?;
//! ```

mod batching;
mod in_memory;
mod position;
mod store;

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::document::Document;

/// Error type for document and position storage operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageError {
    /// Serialization/deserialization error.
    Serde(String),
    /// Storage-level error.
    Backend(String),
    /// A storage lock was poisoned.
    LockPoisoned(String),
    /// The operation was cancelled before it completed.
    Cancelled(String),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Serde(msg) => write!(f, "document serialization error: {}", msg),
            StorageError::Backend(msg) => write!(f, "storage backend error: {}", msg),
            StorageError::LockPoisoned(what) => write!(f, "storage lock poisoned: {}", what),
            StorageError::Cancelled(msg) => write!(f, "storage operation cancelled: {}", msg),
        }
    }
}

impl std::error::Error for StorageError {}

/// A document to insert or overwrite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentToStore {
    pub collection: String,
    pub id: String,
    pub data: Vec<u8>,
}

/// A document to remove.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentToDelete {
    pub collection: String,
    pub id: String,
}

/// Upserts and deletes applied together by one `store` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreIntent {
    pub upserts: Vec<DocumentToStore>,
    pub deletes: Vec<DocumentToDelete>,
}

impl StoreIntent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a serialized document to upsert.
    pub fn upsert_document<D: Document>(mut self, id: &str, document: &D) -> Result<Self, StorageError> {
        let data = serde_json::to_vec(document).map_err(|e| StorageError::Serde(e.to_string()))?;
        self.upserts.push(DocumentToStore {
            collection: D::COLLECTION.to_string(),
            id: id.to_string(),
            data,
        });
        Ok(self)
    }

    /// Add a document to delete.
    pub fn delete_document<D: Document>(mut self, id: &str) -> Self {
        self.deletes.push(DocumentToDelete {
            collection: D::COLLECTION.to_string(),
            id: id.to_string(),
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.deletes.is_empty()
    }

    /// Number of documents touched by this intent.
    pub fn len(&self) -> usize {
        self.upserts.len() + self.deletes.len()
    }
}

/// Decode a stored document.
pub fn decode_document<D: Document>(bytes: &[u8]) -> Result<D, StorageError> {
    serde_json::from_slice(bytes).map_err(|e| StorageError::Serde(e.to_string()))
}

pub use batching::{BatchingStorageSession, StorageBatching};
pub use in_memory::InMemoryProjectionStorage;
pub use position::{InMemoryPositionStorage, PositionStorage};
pub use store::{ProjectionStorage, ProjectionStorageExt};
