//! Cluster membership and node leases.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::cluster::{NodeCapabilities, NodeDirectory, NodeId, NodeInfo, NodeLease, NodeStatus};
use crate::error::LeaseError;
use crate::time::Clock;

const MAX_UPDATE_ATTEMPTS: u32 = 16;

/// Membership service shared by every node of a cluster.
///
/// Nodes join, renew their lease before it runs out and update their own
/// record through optimistic compare-and-set. A node whose lease expired is
/// ignored for placement right away and purged by [`tick`](Self::tick) once
/// it has been dead for a whole lease duration.
pub struct ClusterManager {
    directory: Arc<dyn NodeDirectory>,
    clock: Arc<dyn Clock>,
    lease_duration: Duration,
}

impl ClusterManager {
    pub fn new(directory: Arc<dyn NodeDirectory>, clock: Arc<dyn Clock>, lease_duration: Duration) -> Self {
        Self {
            directory,
            clock,
            lease_duration,
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn lease_duration(&self) -> Duration {
        self.lease_duration
    }

    fn fresh_lease(&self, challenge_token: String) -> NodeLease {
        let now = self.clock.now();
        NodeLease {
            challenge_token,
            expires_at: now + self.lease_duration,
            renew_at: now + self.lease_duration / 2,
        }
    }

    async fn visible_nodes(&self, except: &NodeId) -> BTreeSet<NodeId> {
        let now = self.clock.now();
        self.directory
            .entries()
            .await
            .into_iter()
            .filter(|info| &info.id != except && info.is_alive(now))
            .map(|info| info.id)
            .collect()
    }

    /// Register a new node in `namespace` with a fresh identity and lease.
    ///
    /// The node starts in [`NodeStatus::Starting`]; it becomes a placement
    /// candidate once it flips itself to `Active`.
    pub async fn join_cluster(
        &self,
        namespace: &str,
        capabilities: NodeCapabilities,
    ) -> Result<NodeInfo, LeaseError> {
        for _ in 0..MAX_UPDATE_ATTEMPTS {
            let id = NodeId::generate(namespace);
            let info = NodeInfo {
                visible_nodes: self.visible_nodes(&id).await,
                id,
                capabilities: capabilities.clone(),
                lease: self.fresh_lease(Uuid::new_v4().to_string()),
                status: NodeStatus::Starting,
                version: 0,
            };

            if self.directory.insert_new(info.clone()).await {
                tracing::info!(
                    node = %info.id,
                    expires_at = %info.lease.expires_at,
                    "node joined cluster"
                );
                return Ok(info);
            }
        }

        Err(LeaseError::UpdateConflict {
            node: NodeId::new("<unassigned>", namespace),
            attempts: MAX_UPDATE_ATTEMPTS,
        })
    }

    /// Extend a node's lease.
    ///
    /// Fails with [`LeaseError::InvalidChallenge`] if `challenge_token` is not
    /// the stored one and with [`LeaseError::LeaseExpired`] if the lease
    /// already ran out; neither failure changes the stored record. The new
    /// expiry never moves backwards.
    pub async fn renew_lease(
        &self,
        node: &NodeId,
        challenge_token: &str,
        capabilities: NodeCapabilities,
    ) -> Result<NodeInfo, LeaseError> {
        let visible = self.visible_nodes(node).await;
        let lease_duration = self.lease_duration;

        let renewed = self
            .update_node(node, |info| {
                let now = self.clock.now();
                if info.lease.challenge_token != challenge_token {
                    return Err(LeaseError::InvalidChallenge { node: node.clone() });
                }
                if info.lease.is_expired(now) {
                    return Err(LeaseError::LeaseExpired { node: node.clone() });
                }

                info.lease.expires_at = info.lease.expires_at.max(now + lease_duration);
                info.lease.renew_at = now + lease_duration / 2;
                info.capabilities = capabilities.clone();
                info.visible_nodes = visible.clone();
                Ok(())
            })
            .await?;

        tracing::debug!(
            node = %node,
            expires_at = %renewed.lease.expires_at,
            "node lease renewed"
        );
        Ok(renewed)
    }

    /// Atomic read-modify-write of one node's record.
    ///
    /// `mutate` runs against a fresh copy on every attempt and may be called
    /// several times if concurrent writers win the compare-and-set.
    pub async fn update_node<F>(&self, node: &NodeId, mut mutate: F) -> Result<NodeInfo, LeaseError>
    where
        F: FnMut(&mut NodeInfo) -> Result<(), LeaseError> + Send,
    {
        for _ in 0..MAX_UPDATE_ATTEMPTS {
            let current = self
                .directory
                .get(node)
                .await
                .ok_or_else(|| LeaseError::NodeNotFound { node: node.clone() })?;

            let mut updated = current.clone();
            mutate(&mut updated)?;

            if let Some(stored) = self.directory.compare_and_set(&current, updated).await {
                return Ok(stored);
            }
            tracing::debug!(node = %node, "node update conflicted, retrying");
        }

        Err(LeaseError::UpdateConflict {
            node: node.clone(),
            attempts: MAX_UPDATE_ATTEMPTS,
        })
    }

    /// Set a node's status.
    pub async fn set_status(&self, node: &NodeId, status: NodeStatus) -> Result<NodeInfo, LeaseError> {
        let info = self
            .update_node(node, |info| {
                info.status = status;
                Ok(())
            })
            .await?;
        tracing::info!(node = %node, status = ?status, "node status changed");
        Ok(info)
    }

    pub async fn node(&self, node: &NodeId) -> Option<NodeInfo> {
        self.directory.get(node).await
    }

    pub async fn nodes(&self) -> Vec<NodeInfo> {
        self.directory.entries().await
    }

    /// Whether `node` is a member with a live lease that has not stopped.
    pub async fn is_alive(&self, node: &NodeId) -> bool {
        let now = self.clock.now();
        self.directory
            .get(node)
            .await
            .is_some_and(|info| info.is_alive(now))
    }

    /// Placement candidates for `addressable_type`, sorted by id.
    pub async fn eligible_nodes(&self, addressable_type: &str, exclude: &[NodeId]) -> Vec<NodeInfo> {
        let now = self.clock.now();
        let mut candidates: Vec<NodeInfo> = self
            .directory
            .entries()
            .await
            .into_iter()
            .filter(|info| info.is_eligible(addressable_type, now) && !exclude.contains(&info.id))
            .collect();
        candidates.sort_by(|a, b| a.id.cmp(&b.id));
        candidates
    }

    /// Purge nodes whose lease expired more than one lease duration ago.
    ///
    /// Returns the purged ids so their addressable leases can be dropped.
    pub async fn tick(&self) -> Vec<NodeId> {
        let now = self.clock.now();
        let mut purged = Vec::new();

        for info in self.directory.entries().await {
            let dead_for = now.saturating_duration_since(info.lease.expires_at);
            if info.lease.is_expired(now) && dead_for >= self.lease_duration {
                if self.directory.remove(&info.id).await.is_some() {
                    tracing::info!(node = %info.id, dead_for = ?dead_for, "purged expired node");
                    purged.push(info.id);
                }
            }
        }

        purged
    }
}

impl fmt::Debug for ClusterManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterManager")
            .field("directory", &self.directory)
            .field("lease_duration", &self.lease_duration)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::InMemoryNodeDirectory;
    use crate::time::{ManualClock, Timestamp};

    fn capabilities(types: &[&str]) -> NodeCapabilities {
        NodeCapabilities {
            addressable_types: types.iter().map(|t| t.to_string()).collect(),
        }
    }

    fn manager() -> (ClusterManager, ManualClock) {
        let clock = ManualClock::new(Timestamp::from_millis(10_000));
        let manager = ClusterManager::new(
            Arc::new(InMemoryNodeDirectory::new()),
            Arc::new(clock.clone()),
            Duration::from_secs(10),
        );
        (manager, clock)
    }

    #[tokio::test]
    async fn test_join_issues_lease_with_renew_before_expiry() {
        let (manager, _clock) = manager();

        let info = manager
            .join_cluster("default", capabilities(&["Counter"]))
            .await
            .expect("join");

        assert_eq!(info.status, NodeStatus::Starting);
        assert_eq!(info.lease.expires_at, Timestamp::from_millis(20_000));
        assert_eq!(info.lease.renew_at, Timestamp::from_millis(15_000));
        assert!(info.lease.renew_at <= info.lease.expires_at);
    }

    #[tokio::test]
    async fn test_second_node_sees_first() {
        let (manager, _clock) = manager();
        let first = manager.join_cluster("default", capabilities(&[])).await.expect("join");
        let second = manager.join_cluster("default", capabilities(&[])).await.expect("join");

        assert!(second.visible_nodes.contains(&first.id));
        assert!(!second.visible_nodes.contains(&second.id));
    }

    #[tokio::test]
    async fn test_renewal_never_moves_expiry_backwards() {
        let (manager, clock) = manager();
        let info = manager.join_cluster("default", capabilities(&[])).await.expect("join");
        let token = info.lease.challenge_token.clone();

        clock.advance(Duration::from_secs(6));
        let renewed = manager
            .renew_lease(&info.id, &token, capabilities(&["Counter"]))
            .await
            .expect("renew");
        assert_eq!(renewed.lease.expires_at, Timestamp::from_millis(26_000));
        assert!(renewed.capabilities.supports("Counter"));

        // Clock stepping backwards must not shorten the lease.
        clock.set(Timestamp::from_millis(12_000));
        let again = manager
            .renew_lease(&info.id, &token, capabilities(&["Counter"]))
            .await
            .expect("renew");
        assert_eq!(again.lease.expires_at, Timestamp::from_millis(26_000));
    }

    #[tokio::test]
    async fn test_invalid_challenge_does_not_mutate() {
        let (manager, clock) = manager();
        let info = manager.join_cluster("default", capabilities(&[])).await.expect("join");

        clock.advance(Duration::from_secs(5));
        let result = manager
            .renew_lease(&info.id, "forged", capabilities(&["Counter"]))
            .await;

        assert_eq!(result, Err(LeaseError::InvalidChallenge { node: info.id.clone() }));
        let stored = manager.node(&info.id).await.expect("still a member");
        assert_eq!(stored, info);
    }

    #[tokio::test]
    async fn test_expired_lease_cannot_be_renewed() {
        let (manager, clock) = manager();
        let info = manager.join_cluster("default", capabilities(&[])).await.expect("join");

        clock.advance(Duration::from_secs(10));
        let result = manager
            .renew_lease(&info.id, &info.lease.challenge_token, capabilities(&[]))
            .await;

        assert_eq!(result, Err(LeaseError::LeaseExpired { node: info.id }));
    }

    #[tokio::test]
    async fn test_eligibility_filters_status_capability_and_exclusions() {
        let (manager, _clock) = manager();
        let a = manager.join_cluster("default", capabilities(&["T"])).await.expect("join");
        let b = manager.join_cluster("default", capabilities(&["T"])).await.expect("join");
        let c = manager.join_cluster("default", capabilities(&["U"])).await.expect("join");
        for node in [&a.id, &b.id, &c.id] {
            manager.set_status(node, NodeStatus::Active).await.expect("activate");
        }
        manager.set_status(&b.id, NodeStatus::Draining).await.expect("drain");

        let eligible: Vec<NodeId> = manager
            .eligible_nodes("T", &[])
            .await
            .into_iter()
            .map(|info| info.id)
            .collect();
        assert_eq!(eligible, vec![a.id.clone()]);

        assert!(manager.eligible_nodes("T", &[a.id.clone()]).await.is_empty());
        assert!(manager.is_alive(&b.id).await, "draining nodes are still alive");
    }

    #[tokio::test]
    async fn test_tick_purges_nodes_dead_for_a_lease_duration() {
        let (manager, clock) = manager();
        let info = manager.join_cluster("default", capabilities(&[])).await.expect("join");

        clock.advance(Duration::from_secs(15));
        assert!(manager.tick().await.is_empty(), "expired but not yet long enough");
        assert!(!manager.is_alive(&info.id).await);

        clock.advance(Duration::from_secs(5));
        assert_eq!(manager.tick().await, vec![info.id.clone()]);
        assert!(manager.node(&info.id).await.is_none());
    }

    #[tokio::test]
    async fn test_update_missing_node() {
        let (manager, _clock) = manager();
        let ghost = NodeId::new("ghost", "default");

        let result = manager.set_status(&ghost, NodeStatus::Active).await;

        assert_eq!(result, Err(LeaseError::NodeNotFound { node: ghost }));
    }
}
