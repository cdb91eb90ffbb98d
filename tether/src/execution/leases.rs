//! Node-local cache of the addressable leases this node holds.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::addressable::AddressableReference;
use crate::cluster::NodeId;
use crate::directory::{AddressableDirectory, AddressableLease};
use crate::error::LeaseError;
use crate::time::Clock;

type Slot = Arc<Mutex<Option<AddressableLease>>>;
type SlotGuard = OwnedMutexGuard<Option<AddressableLease>>;

/// Leases held by one node, fronting the [`AddressableDirectory`].
///
/// Directory calls for one reference are single-flight: concurrent
/// callers serialize on the reference's slot, and whoever comes second
/// finds the lease the first one fetched.
pub struct ExecutionLeases {
    node_id: NodeId,
    directory: Arc<dyn AddressableDirectory>,
    clock: Arc<dyn Clock>,
    cache: DashMap<AddressableReference, Slot>,
}

impl ExecutionLeases {
    pub fn new(node_id: NodeId, directory: Arc<dyn AddressableDirectory>, clock: Arc<dyn Clock>) -> Self {
        Self {
            node_id,
            directory,
            clock,
            cache: DashMap::new(),
        }
    }

    fn slot(&self, reference: &AddressableReference) -> Slot {
        Arc::clone(&*self.cache.entry(reference.clone()).or_default())
    }

    /// Whether `slot` is still the live slot for `reference`.
    ///
    /// `abandon_lease` removes slots from the map; a caller that waited on
    /// a removed slot must start over with a fresh one.
    fn is_current(&self, reference: &AddressableReference, slot: &Slot) -> bool {
        self.cache
            .get(reference)
            .is_some_and(|current| Arc::ptr_eq(current.value(), slot))
    }

    /// Lock the live slot for `reference`, creating it if needed.
    async fn lock_slot(&self, reference: &AddressableReference) -> (Slot, SlotGuard) {
        loop {
            let slot = self.slot(reference);
            let guard = Arc::clone(&slot).lock_owned().await;
            if self.is_current(reference, &slot) {
                return (slot, guard);
            }
        }
    }

    /// The cached lease if still valid, otherwise a renewed or newly
    /// acquired one.
    pub async fn get_or_renew_lease(&self, reference: &AddressableReference) -> Result<AddressableLease, LeaseError> {
        self.with_lease(reference, |lease| lease.clone()).await
    }

    /// Run `f` against a valid lease while holding the reference's slot.
    ///
    /// The lease cannot be abandoned while `f` runs, so whatever `f`
    /// registers is covered by it.
    pub(crate) async fn with_lease<R>(
        &self,
        reference: &AddressableReference,
        f: impl FnOnce(&AddressableLease) -> R,
    ) -> Result<R, LeaseError> {
        let (slot, mut cached) = self.lock_slot(reference).await;

        let now = self.clock.now();
        if let Some(lease) = cached.as_ref().filter(|lease| !lease.is_expired(now)) {
            return Ok(f(lease));
        }

        let fetched = match cached.as_ref() {
            Some(_) => self.directory.renew(reference, &self.node_id).await,
            None => self.directory.acquire(reference, &self.node_id).await,
        };
        match fetched {
            Ok(lease) => {
                let result = f(&lease);
                *cached = Some(lease);
                Ok(result)
            }
            Err(error) => {
                *cached = None;
                drop(cached);
                self.cache.remove_if(reference, |_, current| Arc::ptr_eq(current, &slot));
                Err(error)
            }
        }
    }

    /// Renew the lease with the directory if it is due.
    ///
    /// Concurrent renewals of one reference collapse into a single
    /// directory call. Fails if nothing is cached.
    pub async fn renew_lease(&self, reference: &AddressableReference) -> Result<AddressableLease, LeaseError> {
        let not_held = || LeaseError::NotHolder {
            reference: reference.clone(),
            holder: None,
        };
        let slot = self
            .cache
            .get(reference)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(not_held)?;

        let mut cached = slot.lock().await;
        let current = cached.clone().ok_or_else(not_held)?;
        if !current.needs_renewal(self.clock.now()) {
            return Ok(current);
        }

        match self.directory.renew(reference, &self.node_id).await {
            Ok(lease) => {
                tracing::trace!(reference = %reference, expires_at = %lease.expires_at, "lease renewed");
                *cached = Some(lease.clone());
                Ok(lease)
            }
            Err(error) => {
                *cached = None;
                Err(error)
            }
        }
    }

    /// The cached lease, without contacting the directory.
    pub async fn cached(&self, reference: &AddressableReference) -> Option<AddressableLease> {
        let slot = self.cache.get(reference).map(|entry| Arc::clone(entry.value()))?;
        let cached = slot.lock().await;
        cached.clone()
    }

    /// Give the lease back to the directory and forget it.
    ///
    /// Returns whether the directory still had this node as holder.
    pub async fn abandon_lease(&self, reference: &AddressableReference) -> bool {
        self.abandon_lease_if(reference, || true).await
    }

    /// Like [`abandon_lease`](Self::abandon_lease), but only if `owns`
    /// returns `true`. `owns` runs while the slot is held, so no
    /// [`with_lease`](Self::with_lease) call can interleave with it.
    pub(crate) async fn abandon_lease_if(&self, reference: &AddressableReference, owns: impl FnOnce() -> bool) -> bool {
        let (slot, mut cached) = self.lock_slot(reference).await;
        if !owns() {
            if cached.is_none() {
                drop(cached);
                self.cache.remove_if(reference, |_, current| Arc::ptr_eq(current, &slot));
            }
            return false;
        }

        let released = self.directory.remove(reference, &self.node_id).await;
        *cached = None;
        drop(cached);
        self.cache.remove_if(reference, |_, current| Arc::ptr_eq(current, &slot));
        tracing::debug!(reference = %reference, released, "lease abandoned");
        released
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

impl fmt::Debug for ExecutionLeases {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionLeases")
            .field("node_id", &self.node_id)
            .field("cached", &self.cache.len())
            .finish()
    }
}
