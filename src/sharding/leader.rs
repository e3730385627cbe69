//! Lease-based leader election for the cluster-wide coordinator.
//!
//! Leaders hold time-bounded leases that they renew, and release them on an
//! orderly leave so another member can take over immediately.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::ProjectionError;

/// Result of a leadership acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeadershipResult {
    Acquired {
        /// Token that must be presented to renew or release the lease.
        lease_token: String,
        lease_duration: Duration,
    },
    NotLeader {
        current_leader: Option<String>,
    },
}

impl LeadershipResult {
    pub fn is_leader(&self) -> bool {
        matches!(self, LeadershipResult::Acquired { .. })
    }

    pub fn lease_token(&self) -> Option<&str> {
        match self {
            LeadershipResult::Acquired { lease_token, .. } => Some(lease_token),
            LeadershipResult::NotLeader { .. } => None,
        }
    }
}

/// Result of a lease renewal attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewalResult {
    Renewed { lease_duration: Duration },
    /// The lease expired or was taken by another instance.
    Lost,
    InvalidToken,
}

impl RenewalResult {
    pub fn is_renewed(&self) -> bool {
        matches!(self, RenewalResult::Renewed { .. })
    }
}

/// Leader election keyed by lock name.
#[async_trait]
pub trait LeaderElector: Send + Sync {
    async fn try_acquire(&self, lock_key: &str, instance_id: &str) -> Result<LeadershipResult, ProjectionError>;

    async fn renew(&self, lock_key: &str, lease_token: &str) -> Result<RenewalResult, ProjectionError>;

    /// Give up leadership. Returns false if the lease was not held with this token.
    async fn release(&self, lock_key: &str, lease_token: &str) -> Result<bool, ProjectionError>;

    async fn current_leader(&self, lock_key: &str) -> Result<Option<String>, ProjectionError>;
}

#[derive(Debug, Clone)]
struct Lease {
    instance_id: String,
    token: String,
    expires_at: Instant,
}

/// Single-process leader elector.
#[derive(Debug)]
pub struct InMemoryLeaderElector {
    leases: RwLock<HashMap<String, Lease>>,
    lease_duration: Duration,
    next_token: AtomicU64,
}

impl Default for InMemoryLeaderElector {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl InMemoryLeaderElector {
    pub fn new(lease_duration: Duration) -> Self {
        Self {
            leases: RwLock::new(HashMap::new()),
            lease_duration,
            next_token: AtomicU64::new(1),
        }
    }

    fn generate_token(&self, instance_id: &str) -> String {
        let n = self.next_token.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", instance_id, n)
    }

    fn poisoned() -> ProjectionError {
        ProjectionError::LockPoisoned("leader leases".into())
    }
}

#[async_trait]
impl LeaderElector for InMemoryLeaderElector {
    async fn try_acquire(&self, lock_key: &str, instance_id: &str) -> Result<LeadershipResult, ProjectionError> {
        let mut leases = self.leases.write().map_err(|_| Self::poisoned())?;
        let now = Instant::now();

        if let Some(lease) = leases.get(lock_key) {
            if lease.expires_at > now && lease.instance_id != instance_id {
                return Ok(LeadershipResult::NotLeader {
                    current_leader: Some(lease.instance_id.clone()),
                });
            }
        }

        let lease = Lease {
            instance_id: instance_id.to_string(),
            token: self.generate_token(instance_id),
            expires_at: now + self.lease_duration,
        };
        let token = lease.token.clone();
        leases.insert(lock_key.to_string(), lease);

        Ok(LeadershipResult::Acquired {
            lease_token: token,
            lease_duration: self.lease_duration,
        })
    }

    async fn renew(&self, lock_key: &str, lease_token: &str) -> Result<RenewalResult, ProjectionError> {
        let mut leases = self.leases.write().map_err(|_| Self::poisoned())?;
        let now = Instant::now();

        let Some(lease) = leases.get_mut(lock_key) else {
            return Ok(RenewalResult::Lost);
        };
        if lease.token != lease_token {
            return Ok(RenewalResult::InvalidToken);
        }
        if lease.expires_at <= now {
            return Ok(RenewalResult::Lost);
        }

        lease.expires_at = now + self.lease_duration;
        Ok(RenewalResult::Renewed {
            lease_duration: self.lease_duration,
        })
    }

    async fn release(&self, lock_key: &str, lease_token: &str) -> Result<bool, ProjectionError> {
        let mut leases = self.leases.write().map_err(|_| Self::poisoned())?;

        match leases.get(lock_key) {
            Some(lease) if lease.token == lease_token => {
                leases.remove(lock_key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn current_leader(&self, lock_key: &str) -> Result<Option<String>, ProjectionError> {
        let leases = self.leases.read().map_err(|_| Self::poisoned())?;
        let now = Instant::now();

        Ok(leases
            .get(lock_key)
            .filter(|lease| lease.expires_at > now)
            .map(|lease| lease.instance_id.clone()))
    }
}
