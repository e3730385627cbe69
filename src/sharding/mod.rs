//! Sharding - Distributing projector pools over a cluster.
//!
//! Each document id hashes to one of `number_of_partitions` partitions. The
//! cluster coordinator, elected through a [`LeaderElector`], assigns every
//! partition to a live node; batches travel to the owner as bitcode-encoded
//! envelopes and are handled by that node's [`ShardRegion`], which hosts a
//! regular [`ProjectorPool`](crate::ProjectorPool).
//!
//! ## Example
//!
//! ```ignore
//! use sourced_projections::{Distribution, InMemoryCluster, ShardingSettings};
//!
//! let cluster = InMemoryCluster::new();
//! cluster.join("node-a").await?;
//! cluster.join("node-b").await?;
//!
//! let config = ProjectionConfiguration::new("orders", handlers, source)
//!     .with_distribution(Distribution::Sharded(ShardingSettings::new(cluster.clone())));
//! ```

mod cluster;
mod leader;
mod partition;
mod region;

pub use cluster::{
    Handoff, InMemoryCluster, NodeId, PartitionTable, RegionEndpoint, RegionFactory, WeakCluster,
    COORDINATOR_LOCK,
};
pub use leader::{InMemoryLeaderElector, LeaderElector, LeadershipResult, RenewalResult};
pub use partition::{hash_partition_key, partition_for, PartitionId};
pub use region::{ShardRegion, ShardedProxy};

use crate::config::PassivationSettings;

/// Where and how a sharded projection runs.
#[derive(Clone)]
pub struct ShardingSettings {
    pub cluster: InMemoryCluster,
    pub number_of_partitions: u32,
    /// Passivation of the pool inside each node's region.
    pub passivation: PassivationSettings,
}

impl ShardingSettings {
    pub fn new(cluster: InMemoryCluster) -> Self {
        Self {
            cluster,
            number_of_partitions: 100,
            passivation: PassivationSettings::default(),
        }
    }

    pub fn with_number_of_partitions(mut self, number_of_partitions: u32) -> Self {
        self.number_of_partitions = number_of_partitions;
        self
    }

    pub fn with_passivation(mut self, passivation: PassivationSettings) -> Self {
        self.passivation = passivation;
        self
    }
}
