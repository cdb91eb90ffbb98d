//! Resolving the hosting node of an addressable.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::addressable::AddressableReference;
use crate::cluster::{ClusterManager, NodeId};
use crate::directory::AddressableDirectory;
use crate::error::PlacementError;

/// Combines cluster membership with the addressable directory.
///
/// When no node qualifies, placement is retried with exponential backoff
/// so a node that just joined (or just renewed) can still be picked up.
pub struct Placement {
    cluster: Arc<ClusterManager>,
    directory: Arc<dyn AddressableDirectory>,
    attempts: u32,
    backoff: Duration,
}

impl Placement {
    pub fn new(
        cluster: Arc<ClusterManager>,
        directory: Arc<dyn AddressableDirectory>,
        attempts: u32,
        backoff: Duration,
    ) -> Self {
        Self {
            cluster,
            directory,
            attempts: attempts.max(1),
            backoff,
        }
    }

    pub fn cluster(&self) -> &Arc<ClusterManager> {
        &self.cluster
    }

    pub fn directory(&self) -> &Arc<dyn AddressableDirectory> {
        &self.directory
    }

    pub async fn locate(&self, reference: &AddressableReference) -> Option<NodeId> {
        self.directory.locate(reference).await
    }

    /// Current holder, or a freshly placed one.
    pub async fn locate_or_place(
        &self,
        reference: &AddressableReference,
        exclude: &[NodeId],
    ) -> Result<NodeId, PlacementError> {
        let mut delay = self.backoff;

        for attempt in 1..=self.attempts {
            let candidates = self
                .cluster
                .eligible_nodes(&reference.addressable_type, exclude)
                .await;

            match self.directory.locate_or_place(reference, &candidates).await {
                Ok(lease) => return Ok(lease.node_id),
                Err(PlacementError::NoAvailableNode { .. }) if attempt < self.attempts => {
                    tracing::debug!(
                        reference = %reference,
                        attempt,
                        delay = ?delay,
                        "no node available for placement, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                }
                Err(error) => {
                    tracing::warn!(
                        reference = %reference,
                        attempts = attempt,
                        "placement failed: {}",
                        error
                    );
                    return Err(error);
                }
            }
        }

        Err(PlacementError::NoAvailableNode {
            reference: reference.clone(),
        })
    }
}

impl fmt::Debug for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Placement")
            .field("attempts", &self.attempts)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{InMemoryNodeDirectory, NodeCapabilities, NodeStatus};
    use crate::directory::{InMemoryAddressableDirectory, RandomRouting};
    use crate::time::{Clock, ManualClock, Timestamp};

    fn placement(attempts: u32) -> (Placement, Arc<ClusterManager>) {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Timestamp::from_millis(1_000)));
        let cluster = Arc::new(ClusterManager::new(
            Arc::new(InMemoryNodeDirectory::new()),
            clock.clone(),
            Duration::from_secs(10),
        ));
        let directory = Arc::new(InMemoryAddressableDirectory::new(
            Arc::new(RandomRouting::seeded(3)),
            clock,
            Duration::from_secs(60),
        ));
        (
            Placement::new(cluster.clone(), directory, attempts, Duration::from_millis(10)),
            cluster,
        )
    }

    fn counter_capable() -> NodeCapabilities {
        NodeCapabilities {
            addressable_types: ["Counter".to_string()].into_iter().collect(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_bounded_attempts() {
        let (placement, _cluster) = placement(5);
        let reference = AddressableReference::new("Counter", "a");

        let started = tokio::time::Instant::now();
        let result = placement.locate_or_place(&reference, &[]).await;

        assert_eq!(
            result,
            Err(PlacementError::NoAvailableNode {
                reference: reference.clone()
            })
        );
        // 10 + 20 + 40 + 80 ms of backoff between five attempts.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(150), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_millis(300), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_node_activated_during_backoff_is_used() {
        let (placement, cluster) = placement(5);
        let node = cluster
            .join_cluster("default", counter_capable())
            .await
            .expect("join");
        let reference = AddressableReference::new("Counter", "a");

        let activate = {
            let cluster = cluster.clone();
            let id = node.id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(15)).await;
                cluster.set_status(&id, NodeStatus::Active).await
            })
        };

        let placed = placement.locate_or_place(&reference, &[]).await.expect("placed");
        activate.await.expect("task").expect("activated");

        assert_eq!(placed, node.id);
    }

    #[tokio::test]
    async fn test_excluded_node_is_skipped() {
        let (placement, cluster) = placement(1);
        let node = cluster
            .join_cluster("default", counter_capable())
            .await
            .expect("join");
        cluster.set_status(&node.id, NodeStatus::Active).await.expect("activate");

        let result = placement
            .locate_or_place(&AddressableReference::new("Counter", "a"), &[node.id.clone()])
            .await;

        assert!(result.is_err());
    }
}
