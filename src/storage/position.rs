//! Position storage - The last acknowledged stream position per projection.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::StorageError;
use crate::event::Position;

/// Storage for the cursor of each projection.
#[async_trait]
pub trait PositionStorage: Send + Sync {
    /// Last stored position of a projection, None when it never stored one.
    async fn load_latest(&self, projection: &str) -> Result<Option<Position>, StorageError>;

    async fn store_latest(&self, projection: &str, position: Position) -> Result<(), StorageError>;
}

/// In-memory position storage.
///
/// Keeps the highest position ever stored for a projection, so a late or
/// duplicate write can never move a cursor backwards.
#[derive(Clone, Default)]
pub struct InMemoryPositionStorage {
    positions: Arc<RwLock<HashMap<String, Position>>>,
}

impl InMemoryPositionStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PositionStorage for InMemoryPositionStorage {
    async fn load_latest(&self, projection: &str) -> Result<Option<Position>, StorageError> {
        let positions = self
            .positions
            .read()
            .map_err(|_| StorageError::LockPoisoned("positions".into()))?;
        Ok(positions.get(projection).copied())
    }

    async fn store_latest(&self, projection: &str, position: Position) -> Result<(), StorageError> {
        let mut positions = self
            .positions
            .write()
            .map_err(|_| StorageError::LockPoisoned("positions".into()))?;

        let current = positions.entry(projection.to_string()).or_insert(position);
        if position > *current {
            *current = position;
        }
        Ok(())
    }
}
