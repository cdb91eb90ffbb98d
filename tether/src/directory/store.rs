//! The addressable directory: who hosts which addressable.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::addressable::AddressableReference;
use crate::cluster::{NodeId, NodeInfo};
use crate::directory::{AddressableLease, RoutingStrategy};
use crate::error::{LeaseError, PlacementError};
use crate::time::Clock;

/// Cluster-wide map from addressable reference to its lease holder.
///
/// Holds at most one unexpired [`AddressableLease`] per reference. All
/// writes are atomic per reference, so concurrent placements of the same
/// reference agree on a single winner.
#[async_trait]
pub trait AddressableDirectory: Send + Sync + fmt::Debug {
    /// Current holder of an unexpired lease.
    async fn locate(&self, reference: &AddressableReference) -> Option<NodeId>;

    /// Current unexpired lease.
    async fn lease(&self, reference: &AddressableReference) -> Option<AddressableLease>;

    /// Return the existing unexpired lease, or place the reference on one
    /// of `candidates` and lease it there.
    ///
    /// Candidates that are not eligible for the reference's type are
    /// ignored. Concurrent callers all observe the same winner.
    async fn locate_or_place(
        &self,
        reference: &AddressableReference,
        candidates: &[NodeInfo],
    ) -> Result<AddressableLease, PlacementError>;

    /// Lease `reference` to `node` if it is free, expired, or already
    /// held by `node`.
    async fn acquire(&self, reference: &AddressableReference, node: &NodeId) -> Result<AddressableLease, LeaseError>;

    /// Extend `node`'s lease on `reference`.
    ///
    /// Fails with [`LeaseError::NotHolder`] if the lease is gone or another
    /// node holds it now.
    async fn renew(&self, reference: &AddressableReference, node: &NodeId) -> Result<AddressableLease, LeaseError>;

    /// Release the lease if `node` still holds it. Returns whether it did.
    async fn remove(&self, reference: &AddressableReference, node: &NodeId) -> bool;

    /// Release every lease held by `node`.
    async fn remove_node_leases(&self, node: &NodeId) -> Vec<AddressableReference>;
}

/// Process-local [`AddressableDirectory`].
pub struct InMemoryAddressableDirectory {
    leases: DashMap<AddressableReference, AddressableLease>,
    routing: Arc<dyn RoutingStrategy>,
    clock: Arc<dyn Clock>,
    lease_duration: Duration,
}

impl InMemoryAddressableDirectory {
    pub fn new(routing: Arc<dyn RoutingStrategy>, clock: Arc<dyn Clock>, lease_duration: Duration) -> Self {
        Self {
            leases: DashMap::new(),
            routing,
            clock,
            lease_duration,
        }
    }

    fn new_lease(&self, reference: &AddressableReference, node: NodeId) -> AddressableLease {
        let now = self.clock.now();
        AddressableLease {
            reference: reference.clone(),
            node_id: node,
            expires_at: now + self.lease_duration,
            renew_at: now + self.lease_duration / 2,
        }
    }

    fn extend(&self, lease: &mut AddressableLease) {
        let now = self.clock.now();
        lease.expires_at = lease.expires_at.max(now + self.lease_duration);
        lease.renew_at = now + self.lease_duration / 2;
    }

    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }
}

impl fmt::Debug for InMemoryAddressableDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryAddressableDirectory")
            .field("leases", &self.leases.len())
            .field("routing", &self.routing)
            .field("lease_duration", &self.lease_duration)
            .finish()
    }
}

#[async_trait]
impl AddressableDirectory for InMemoryAddressableDirectory {
    async fn locate(&self, reference: &AddressableReference) -> Option<NodeId> {
        self.lease(reference).await.map(|lease| lease.node_id)
    }

    async fn lease(&self, reference: &AddressableReference) -> Option<AddressableLease> {
        let now = self.clock.now();
        self.leases
            .get(reference)
            .filter(|lease| !lease.is_expired(now))
            .map(|lease| lease.value().clone())
    }

    async fn locate_or_place(
        &self,
        reference: &AddressableReference,
        candidates: &[NodeInfo],
    ) -> Result<AddressableLease, PlacementError> {
        let now = self.clock.now();
        let eligible: Vec<NodeInfo> = candidates
            .iter()
            .filter(|info| info.is_eligible(&reference.addressable_type, now))
            .cloned()
            .collect();

        let no_node = || PlacementError::NoAvailableNode {
            reference: reference.clone(),
        };

        match self.leases.entry(reference.clone()) {
            Entry::Occupied(mut slot) => {
                if !slot.get().is_expired(now) {
                    return Ok(slot.get().clone());
                }
                let node = self.routing.select(reference, &eligible).ok_or_else(no_node)?;
                let lease = self.new_lease(reference, node);
                tracing::debug!(
                    reference = %reference,
                    previous = %slot.get().node_id,
                    node = %lease.node_id,
                    "replaced expired addressable lease"
                );
                slot.insert(lease.clone());
                Ok(lease)
            }
            Entry::Vacant(slot) => {
                let node = self.routing.select(reference, &eligible).ok_or_else(no_node)?;
                let lease = self.new_lease(reference, node);
                tracing::debug!(reference = %reference, node = %lease.node_id, "placed addressable");
                slot.insert(lease.clone());
                Ok(lease)
            }
        }
    }

    async fn acquire(&self, reference: &AddressableReference, node: &NodeId) -> Result<AddressableLease, LeaseError> {
        let now = self.clock.now();
        match self.leases.entry(reference.clone()) {
            Entry::Occupied(mut slot) => {
                let current = slot.get_mut();
                if &current.node_id == node {
                    self.extend(current);
                    Ok(current.clone())
                } else if current.is_expired(now) {
                    let lease = self.new_lease(reference, node.clone());
                    slot.insert(lease.clone());
                    Ok(lease)
                } else {
                    Err(LeaseError::NotHolder {
                        reference: reference.clone(),
                        holder: Some(current.node_id.clone()),
                    })
                }
            }
            Entry::Vacant(slot) => {
                let lease = self.new_lease(reference, node.clone());
                slot.insert(lease.clone());
                Ok(lease)
            }
        }
    }

    async fn renew(&self, reference: &AddressableReference, node: &NodeId) -> Result<AddressableLease, LeaseError> {
        let mut current = self.leases.get_mut(reference).ok_or_else(|| LeaseError::NotHolder {
            reference: reference.clone(),
            holder: None,
        })?;

        if &current.node_id != node {
            return Err(LeaseError::NotHolder {
                reference: reference.clone(),
                holder: Some(current.node_id.clone()),
            });
        }

        self.extend(&mut current);
        Ok(current.clone())
    }

    async fn remove(&self, reference: &AddressableReference, node: &NodeId) -> bool {
        self.leases
            .remove_if(reference, |_, lease| &lease.node_id == node)
            .is_some()
    }

    async fn remove_node_leases(&self, node: &NodeId) -> Vec<AddressableReference> {
        let mut removed = Vec::new();
        self.leases.retain(|reference, lease| {
            if &lease.node_id == node {
                removed.push(reference.clone());
                false
            } else {
                true
            }
        });
        if !removed.is_empty() {
            tracing::info!(node = %node, count = removed.len(), "released leases of node");
        }
        removed
    }
}
