//! In-process cluster membership, coordinator election and partition ownership.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;
use tokio::time::Instant;

use super::leader::{InMemoryLeaderElector, LeaderElector, LeadershipResult, RenewalResult};
use super::partition::PartitionId;
use crate::error::ProjectionError;
use crate::worker::StopWatch;

/// Lock key of the cluster-wide coordinator singleton.
pub const COORDINATOR_LOCK: &str = "projections-coordinator";

pub type NodeId = String;

/// Something on a node that accepts encoded requests for one projection.
#[async_trait]
pub trait RegionEndpoint: Send + Sync {
    /// Handle an encoded request and return the encoded response.
    async fn deliver(&self, partition: PartitionId, payload: Vec<u8>) -> Result<Vec<u8>, ProjectionError>;

    /// Tear down the workers of documents `table` assigns to another node.
    fn release_unowned(&self, _table: &PartitionTable) -> Vec<Handoff> {
        Vec::new()
    }

    /// The next worker for `id` waits until `predecessor` has stopped.
    fn adopt(&self, _id: &str, _predecessor: StopWatch) {}
}

/// A document whose worker moved away from a node.
pub struct Handoff {
    pub id: String,
    pub partition: PartitionId,
    /// Stops once the released worker has finished its queue.
    pub predecessor: StopWatch,
}

/// Builds the region hosting a projection on a node.
pub type RegionFactory = Arc<dyn Fn(&str) -> Arc<dyn RegionEndpoint> + Send + Sync>;

/// Partition ownership computed by the coordinator.
///
/// Partitions are spread round-robin over the sorted live members. The
/// epoch increases with every membership change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionTable {
    epoch: u64,
    members: Vec<NodeId>,
}

impl PartitionTable {
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn members(&self) -> &[NodeId] {
        &self.members
    }

    pub fn owner(&self, partition: PartitionId) -> Option<&str> {
        if self.members.is_empty() {
            return None;
        }
        let index = partition as usize % self.members.len();
        self.members.get(index).map(String::as_str)
    }
}

struct Coordinator {
    node: NodeId,
    lease_token: String,
    expires_at: Instant,
}

type HostedRegion = ((NodeId, String), Arc<dyn RegionEndpoint>);

#[derive(Default)]
struct ClusterState {
    members: BTreeSet<NodeId>,
    coordinator: Option<Coordinator>,
    table: PartitionTable,
    regions: HashMap<(NodeId, String), Arc<dyn RegionEndpoint>>,
    factories: HashMap<String, RegionFactory>,
    renewing: bool,
}

struct ClusterInner {
    elector: Arc<dyn LeaderElector>,
    state: RwLock<ClusterState>,
}

/// A cluster of projection nodes living in one process.
///
/// Nodes join and leave explicitly. Every membership change elects the
/// coordinator (if the old one is gone) through the [`LeaderElector`], and
/// the coordinator publishes a new [`PartitionTable`]. With the table, every
/// region releases the workers of partitions it lost and the new owners
/// wait for them to stop before serving those documents. A background task
/// renews the coordinator lease while the cluster is alive.
///
/// ## Example
///
/// ```ignore
/// let cluster = InMemoryCluster::new();
/// cluster.join("node-a").await?;
/// cluster.join("node-b").await?;
///
/// let owner = cluster.owner_of(partition_for("order-1", 100));
/// cluster.leave("node-a").await?; // node-b takes over
/// ```
#[derive(Clone)]
pub struct InMemoryCluster {
    inner: Arc<ClusterInner>,
}

/// Non-owning reference to a cluster, held by regions.
#[derive(Clone)]
pub struct WeakCluster {
    inner: Weak<ClusterInner>,
}

impl WeakCluster {
    pub fn upgrade(&self) -> Option<InMemoryCluster> {
        self.inner.upgrade().map(|inner| InMemoryCluster { inner })
    }
}

impl Default for InMemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::with_elector(Arc::new(InMemoryLeaderElector::default()))
    }

    pub fn with_elector(elector: Arc<dyn LeaderElector>) -> Self {
        Self {
            inner: Arc::new(ClusterInner {
                elector,
                state: RwLock::new(ClusterState::default()),
            }),
        }
    }

    pub fn downgrade(&self) -> WeakCluster {
        WeakCluster {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Add a node and start regions for every registered projection on it.
    pub async fn join(&self, node: impl Into<String>) -> Result<(), ProjectionError> {
        let node = node.into();
        {
            let mut state = self.write()?;
            if !state.members.insert(node.clone()) {
                return Ok(());
            }
            let factories: Vec<(String, RegionFactory)> = state
                .factories
                .iter()
                .map(|(projection, factory)| (projection.clone(), Arc::clone(factory)))
                .collect();
            for (projection, factory) in factories {
                state
                    .regions
                    .insert((node.clone(), projection), factory(&node));
            }
        }
        tracing::info!(node = %node, "node joined cluster");
        self.rebalance(Vec::new()).await
    }

    /// Remove a node. Its regions hand their documents to the new owners;
    /// a coordinator that leaves hands its lease back so another member
    /// takes over.
    pub async fn leave(&self, node: &str) -> Result<(), ProjectionError> {
        let (departed, released) = {
            let mut state = self.write()?;
            if !state.members.remove(node) {
                return Ok(());
            }
            let keys: Vec<(NodeId, String)> = state
                .regions
                .keys()
                .filter(|(owner, _)| owner == node)
                .cloned()
                .collect();
            let departed: Vec<HostedRegion> = keys
                .into_iter()
                .filter_map(|key| state.regions.remove(&key).map(|region| (key, region)))
                .collect();
            let released = match state.coordinator.take() {
                Some(coordinator) if coordinator.node == node => Some(coordinator.lease_token),
                other => {
                    state.coordinator = other;
                    None
                }
            };
            (departed, released)
        };

        if let Some(token) = released {
            self.inner.elector.release(COORDINATOR_LOCK, &token).await?;
        }
        tracing::info!(node = %node, "node left cluster");
        self.rebalance(departed).await
    }

    pub fn members(&self) -> Vec<NodeId> {
        self.read()
            .map(|state| state.members.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// The node currently acting as cluster coordinator, if its lease is
    /// still valid.
    pub fn coordinator(&self) -> Option<NodeId> {
        let now = Instant::now();
        self.read().ok().and_then(|state| {
            state
                .coordinator
                .as_ref()
                .filter(|c| c.expires_at > now)
                .map(|c| c.node.clone())
        })
    }

    /// Renew the coordinator lease, electing a new coordinator if it was lost.
    pub async fn renew_coordinator(&self) -> Result<Option<NodeId>, ProjectionError> {
        let current = self.read()?.coordinator.as_ref().map(|c| c.lease_token.clone());
        let renewed = match current {
            Some(token) => Some(self.inner.elector.renew(COORDINATOR_LOCK, &token).await?),
            None => None,
        };

        match renewed {
            Some(RenewalResult::Renewed { lease_duration }) => {
                let mut state = self.write()?;
                if let Some(coordinator) = state.coordinator.as_mut() {
                    coordinator.expires_at = Instant::now() + lease_duration;
                }
            }
            Some(lost) => {
                tracing::warn!(renewal = ?lost, "coordinator lease lost, electing again");
                self.elect().await?;
            }
            None => self.elect().await?,
        }
        Ok(self.coordinator())
    }

    /// Run `f` while `node` owns `partition`. The partition table cannot
    /// change until `f` returns.
    pub fn while_owned<T>(&self, node: &str, partition: PartitionId, f: impl FnOnce() -> T) -> Option<T> {
        let state = self.read().ok()?;
        (state.table.owner(partition) == Some(node)).then(f)
    }

    pub fn partition_table(&self) -> PartitionTable {
        self.read().map(|state| state.table.clone()).unwrap_or_default()
    }

    pub fn owner_of(&self, partition: PartitionId) -> Option<NodeId> {
        self.read()
            .ok()
            .and_then(|state| state.table.owner(partition).map(str::to_string))
    }

    pub fn owns(&self, node: &str, partition: PartitionId) -> bool {
        self.read()
            .map(|state| state.table.owner(partition) == Some(node))
            .unwrap_or(false)
    }

    /// Host `projection` on every current and future member.
    pub fn register_projection(&self, projection: &str, factory: RegionFactory) -> Result<(), ProjectionError> {
        let mut state = self.write()?;
        if state.factories.contains_key(projection) {
            return Err(ProjectionError::InvalidConfiguration(format!(
                "projection {} is already sharded on this cluster",
                projection
            )));
        }
        let members: Vec<NodeId> = state.members.iter().cloned().collect();
        for node in members {
            let region = factory(&node);
            state.regions.insert((node, projection.to_string()), region);
        }
        state.factories.insert(projection.to_string(), factory);
        Ok(())
    }

    /// Route an encoded request to the owner of `partition`.
    pub async fn deliver(
        &self,
        projection: &str,
        partition: PartitionId,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, ProjectionError> {
        let (owner, region) = {
            let state = self.read()?;
            let owner = state.table.owner(partition).map(str::to_string).ok_or_else(|| {
                ProjectionError::Routing(format!("no node owns partition {}", partition))
            })?;
            let region = state
                .regions
                .get(&(owner.clone(), projection.to_string()))
                .cloned()
                .ok_or_else(|| {
                    ProjectionError::Routing(format!(
                        "node {} does not host projection {}",
                        owner, projection
                    ))
                })?;
            (owner, region)
        };

        tracing::trace!(projection, partition, node = %owner, "delivering to shard region");
        region.deliver(partition, payload).await
    }

    /// Make sure a live coordinator exists, then let it publish a new table
    /// and move the documents of reassigned partitions.
    async fn rebalance(&self, departed: Vec<HostedRegion>) -> Result<(), ProjectionError> {
        self.renew_coordinator().await?;

        let mut state = self.write()?;
        let members: Vec<NodeId> = state.members.iter().cloned().collect();
        let epoch = state.table.epoch + 1;
        state.table = PartitionTable { epoch, members };
        let moved = hand_off(&state, departed);
        if let Some(coordinator) = &state.coordinator {
            tracing::info!(
                coordinator = %coordinator.node,
                epoch,
                members = state.table.members.len(),
                moved,
                "partition table published"
            );
        }
        Ok(())
    }

    /// Renew the coordinator lease in the background while the cluster lives.
    fn keep_lease(&self, lease_duration: Duration) {
        let cluster = self.downgrade();
        let period = (lease_duration / 3).max(Duration::from_millis(1));

        tokio::spawn(async move {
            let mut ticks = tokio::time::interval(period);
            ticks.tick().await;
            loop {
                ticks.tick().await;
                let Some(cluster) = cluster.upgrade() else {
                    return;
                };
                if let Err(error) = cluster.renew_coordinator().await {
                    tracing::warn!(error = %error, "could not renew coordinator lease");
                }
            }
        });
    }

    async fn elect(&self) -> Result<(), ProjectionError> {
        let candidates = self.members();
        for candidate in candidates {
            let result = self
                .inner
                .elector
                .try_acquire(COORDINATOR_LOCK, &candidate)
                .await?;
            if let LeadershipResult::Acquired {
                lease_token,
                lease_duration,
            } = result
            {
                tracing::info!(node = %candidate, "elected cluster coordinator");
                let mut state = self.write()?;
                // The candidate may have left while the election ran.
                if state.members.contains(&candidate) {
                    state.coordinator = Some(Coordinator {
                        node: candidate,
                        lease_token,
                        expires_at: Instant::now() + lease_duration,
                    });
                    let start_renewal = !std::mem::replace(&mut state.renewing, true);
                    drop(state);
                    if start_renewal {
                        self.keep_lease(lease_duration);
                    }
                    return Ok(());
                }
            }
        }

        self.write()?.coordinator = None;
        Ok(())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, ClusterState>, ProjectionError> {
        self.inner
            .state
            .read()
            .map_err(|_| ProjectionError::LockPoisoned("cluster state".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, ClusterState>, ProjectionError> {
        self.inner
            .state
            .write()
            .map_err(|_| ProjectionError::LockPoisoned("cluster state".into()))
    }
}

/// Release the workers of reassigned partitions and point their new owners
/// at them. Returns how many documents moved.
fn hand_off(state: &ClusterState, departed: Vec<HostedRegion>) -> usize {
    let hosted: Vec<HostedRegion> = state
        .regions
        .iter()
        .map(|(key, region)| (key.clone(), Arc::clone(region)))
        .chain(departed)
        .collect();

    let mut moved = 0;
    for ((_, projection), region) in hosted {
        for handoff in region.release_unowned(&state.table) {
            let successor = state
                .table
                .owner(handoff.partition)
                .and_then(|owner| state.regions.get(&(owner.to_string(), projection.clone())));
            if let Some(successor) = successor {
                successor.adopt(&handoff.id, handoff.predecessor);
                moved += 1;
            }
        }
    }
    moved
}
