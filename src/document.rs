//! Documents and their identities.
//!
//! A document is the read model a projection maintains for one identity.
//! Documents are stored as JSON under `"collection:id"`.
//!
//! ## Example
//!
//! ```ignore
//! use sourced_projections::Document;
//!
//! #[derive(Clone, Serialize, Deserialize, Document)]
//! #[document(collection = "order_views")]
//! struct OrderView {
//!     pub lines: Vec<String>,
//! }
//! ```

use serde::{de::DeserializeOwned, Serialize};
use std::fmt;
use std::hash::Hash;

use crate::error::ProjectionError;

/// Trait for types that can be maintained as projected documents.
pub trait Document: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// The collection name for this document type.
    /// Maps to a table in SQL, a collection in MongoDB, a key prefix in KV stores, etc.
    const COLLECTION: &'static str;

    /// Called with the persisted value right after a successful store; the
    /// returned value becomes the in-memory state for the next batch.
    ///
    /// Lets a document drop accumulation-only fields (windowed counters,
    /// pending notifications) without losing its identity. No-op by default.
    fn reset(self) -> Self {
        self
    }
}

/// Identity of a document.
///
/// The string form is used as the storage key, for partition hashing, and to
/// address a document on another node.
pub trait DocumentId: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {
    fn to_id_string(&self) -> String;

    fn parse_id(value: &str) -> Result<Self, ProjectionError>;
}

impl DocumentId for String {
    fn to_id_string(&self) -> String {
        self.clone()
    }

    fn parse_id(value: &str) -> Result<Self, ProjectionError> {
        Ok(value.to_string())
    }
}

macro_rules! numeric_document_ids {
    ($($ty:ty),* $(,)?) => {
        $(
            impl DocumentId for $ty {
                fn to_id_string(&self) -> String {
                    self.to_string()
                }

                fn parse_id(value: &str) -> Result<Self, ProjectionError> {
                    value.parse().map_err(|_| {
                        ProjectionError::InvalidId(format!(
                            "{:?} is not a valid {}",
                            value,
                            stringify!($ty)
                        ))
                    })
                }
            }
        )*
    };
}

numeric_document_ids!(u32, u64, i32, i64);
